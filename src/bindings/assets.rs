//! Static assets binding: URL → file resolution with HTML handling modes,
//! not-found modes, `_headers` rules, and weak validator ETags.
//!
//! Every resolved path is checked to stay inside the configured root; `..`
//! in any form is rejected before the filesystem is consulted.

use std::path::{Path, PathBuf};

use anyhow::Result;
use http::StatusCode;

use crate::http_types::{Body, WorkerRequest, WorkerResponse};
use crate::trace::BindingTracer;

const MAX_HEADER_RULES: usize = 100;
const MAX_HEADER_LINE: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HtmlHandling {
    None,
    #[default]
    AutoTrailingSlash,
    ForceTrailingSlash,
    DropTrailingSlash,
}

impl HtmlHandling {
    pub fn parse(s: &str) -> Self {
        match s {
            "none" => HtmlHandling::None,
            "force-trailing-slash" => HtmlHandling::ForceTrailingSlash,
            "drop-trailing-slash" => HtmlHandling::DropTrailingSlash,
            _ => HtmlHandling::AutoTrailingSlash,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotFoundHandling {
    #[default]
    None,
    NotFoundPage,
    SinglePageApplication,
}

impl NotFoundHandling {
    pub fn parse(s: &str) -> Self {
        match s {
            "404-page" => NotFoundHandling::NotFoundPage,
            "single-page-application" => NotFoundHandling::SinglePageApplication,
            _ => NotFoundHandling::None,
        }
    }
}

#[derive(Clone)]
pub struct AssetsBinding {
    root: PathBuf,
    html_handling: HtmlHandling,
    not_found_handling: NotFoundHandling,
    tracer: BindingTracer,
}

impl AssetsBinding {
    pub fn new(
        root: PathBuf,
        html_handling: HtmlHandling,
        not_found_handling: NotFoundHandling,
        tracer: BindingTracer,
    ) -> Self {
        Self {
            root,
            html_handling,
            not_found_handling,
            tracer,
        }
    }

    /// Serve a request against the asset root.
    pub async fn fetch(&self, req: &WorkerRequest) -> Result<WorkerResponse> {
        let _span = self.tracer.span("fetch", Some(req.path()));
        let raw_path = percent_decode(req.path());

        // Traversal guard: reject before touching the filesystem.
        if raw_path.split(['/', '\\']).any(|seg| seg == "..") {
            return Ok(WorkerResponse::text(StatusCode::NOT_FOUND, "Not Found"));
        }

        match self.resolve(&raw_path).await {
            Resolution::File(path) => self.serve_file(req, &raw_path, &path).await,
            Resolution::Redirect(location) => {
                let mut resp = WorkerResponse::new(StatusCode::TEMPORARY_REDIRECT);
                resp.set_header("location", &location);
                Ok(resp)
            }
            Resolution::NotFound => self.not_found(req, &raw_path).await,
        }
    }

    async fn resolve(&self, url_path: &str) -> Resolution {
        let relative = url_path.trim_start_matches('/');
        let has_trailing_slash = url_path.ends_with('/') && url_path != "/";

        if matches!(self.html_handling, HtmlHandling::DropTrailingSlash) && has_trailing_slash {
            return Resolution::Redirect(url_path.trim_end_matches('/').to_string());
        }

        let base = if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        };

        // Exact file match first.
        if is_file(&base).await && self.contained(&base) {
            return Resolution::File(base);
        }

        if matches!(self.html_handling, HtmlHandling::None) {
            return Resolution::NotFound;
        }

        // Implicit `.html`.
        if !relative.is_empty() && !has_trailing_slash {
            let html = self.root.join(format!("{relative}.html"));
            if is_file(&html).await && self.contained(&html) {
                return Resolution::File(html);
            }
        }

        // Implicit `index.html` for directories.
        let index = base.join("index.html");
        if is_file(&index).await && self.contained(&index) {
            if matches!(self.html_handling, HtmlHandling::ForceTrailingSlash)
                && !has_trailing_slash
                && !relative.is_empty()
            {
                return Resolution::Redirect(format!("{url_path}/"));
            }
            return Resolution::File(index);
        }

        Resolution::NotFound
    }

    async fn not_found(&self, req: &WorkerRequest, url_path: &str) -> Result<WorkerResponse> {
        match self.not_found_handling {
            NotFoundHandling::None => {
                Ok(WorkerResponse::text(StatusCode::NOT_FOUND, "Not Found"))
            }
            NotFoundHandling::SinglePageApplication => {
                let index = self.root.join("index.html");
                if is_file(&index).await {
                    self.serve_file(req, "/index.html", &index).await
                } else {
                    Ok(WorkerResponse::text(StatusCode::NOT_FOUND, "Not Found"))
                }
            }
            NotFoundHandling::NotFoundPage => {
                // Walk upward from the request's directory to the nearest
                // 404.html.
                let mut dir = Path::new(url_path.trim_start_matches('/'))
                    .parent()
                    .map(|p| p.to_path_buf())
                    .unwrap_or_default();
                loop {
                    let candidate = self.root.join(&dir).join("404.html");
                    if is_file(&candidate).await && self.contained(&candidate) {
                        let body = tokio::fs::read(&candidate).await?;
                        let mut resp = WorkerResponse::new(StatusCode::NOT_FOUND);
                        resp.set_header("content-type", "text/html; charset=utf-8");
                        resp.body = Body::from_bytes(body);
                        return Ok(resp);
                    }
                    if !dir.pop() {
                        break;
                    }
                }
                let candidate = self.root.join("404.html");
                if is_file(&candidate).await {
                    let body = tokio::fs::read(&candidate).await?;
                    let mut resp = WorkerResponse::new(StatusCode::NOT_FOUND);
                    resp.set_header("content-type", "text/html; charset=utf-8");
                    resp.body = Body::from_bytes(body);
                    return Ok(resp);
                }
                Ok(WorkerResponse::text(StatusCode::NOT_FOUND, "Not Found"))
            }
        }
    }

    async fn serve_file(
        &self,
        req: &WorkerRequest,
        url_path: &str,
        path: &Path,
    ) -> Result<WorkerResponse> {
        let metadata = tokio::fs::metadata(path).await?;
        let mtime = metadata
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let etag = format!("\"{}-{}\"", to_base36(mtime), to_base36(metadata.len() as u128));

        let mut resp = WorkerResponse::new(StatusCode::OK);
        resp.set_header("etag", &etag);
        resp.set_header("cache-control", "public, max-age=0, must-revalidate");
        resp.set_header("content-type", content_type_for(path));
        for (name, value) in self.matching_headers(url_path).await {
            resp.set_header(&name, &value);
        }

        if let Some(if_none_match) = req.header("if-none-match") {
            if if_none_match
                .split(',')
                .any(|candidate| candidate.trim() == etag)
            {
                resp.status = StatusCode::NOT_MODIFIED;
                return Ok(resp);
            }
        }

        resp.body = Body::from_bytes(tokio::fs::read(path).await?);
        Ok(resp)
    }

    async fn matching_headers(&self, url_path: &str) -> Vec<(String, String)> {
        let rules_path = self.root.join("_headers");
        let Ok(content) = tokio::fs::read_to_string(&rules_path).await else {
            return Vec::new();
        };
        let rules = parse_header_rules(&content);
        let mut out = Vec::new();
        for rule in &rules {
            if pattern_matches(&rule.pattern, url_path) {
                out.extend(rule.headers.iter().cloned());
            }
        }
        out
    }

    fn contained(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }
}

enum Resolution {
    File(PathBuf),
    Redirect(String),
    NotFound,
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

// ─── _headers rules ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HeaderRule {
    pub pattern: String,
    pub headers: Vec<(String, String)>,
}

/// Parse a `_headers` file: a pattern line followed by indented
/// `Header: value` lines. Oversized lines and rules past the cap are
/// dropped.
pub fn parse_header_rules(content: &str) -> Vec<HeaderRule> {
    let mut rules: Vec<HeaderRule> = Vec::new();
    for line in content.lines() {
        if line.len() > MAX_HEADER_LINE || line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }
        let indented = line.starts_with(' ') || line.starts_with('\t');
        if indented {
            if let Some(rule) = rules.last_mut() {
                if let Some((name, value)) = line.trim().split_once(':') {
                    rule.headers
                        .push((name.trim().to_string(), value.trim().to_string()));
                }
            }
        } else {
            if rules.len() >= MAX_HEADER_RULES {
                break;
            }
            rules.push(HeaderRule {
                pattern: line.trim().to_string(),
                headers: Vec::new(),
            });
        }
    }
    rules
}

/// Match a rule pattern against a URL path. `*` is a splat (matches across
/// segments); `:name` matches exactly one segment.
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        return path.starts_with(prefix);
    }
    let pattern_segments: Vec<&str> = pattern.split('/').collect();
    let path_segments: Vec<&str> = path.split('/').collect();
    if pattern_segments.len() != path_segments.len() {
        return false;
    }
    pattern_segments
        .iter()
        .zip(&path_segments)
        .all(|(p, s)| p.starts_with(':') && !s.is_empty() || p == s)
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn to_base36(mut value: u128) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits")
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}

fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
        .as_str()
    {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        "xml" => "application/xml",
        "map" => "application/json",
        _ => "application/octet-stream",
    }
}
