//! Error rendering for failed `fetch` invocations: an HTML page when the
//! client accepts HTML, plain text otherwise. Env values are masked by
//! key-substring heuristics and secret-shaped value detection before they
//! reach the page.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::bindings::{Binding, Env};
use crate::http_types::{Body, WorkerRequest, WorkerResponse};

/// Key substrings whose values are always masked.
const SECRET_KEY_HINTS: [&str; 8] = [
    "secret", "token", "password", "api_key", "apikey", "auth", "private", "credential",
];

/// Value shapes that are masked regardless of key name.
static SECRET_VALUE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"^sk-[A-Za-z0-9\-_]{20,}").expect("regex: sk- key"),
        Regex::new(r"^ghp_[A-Za-z0-9]{36}").expect("regex: ghp token"),
        Regex::new(r"^AKIA[0-9A-Z]{16}").expect("regex: aws key"),
        Regex::new(r"(?i)^bearer\s+\S+").expect("regex: bearer"),
    ]
});

/// Mask a single env var for display.
pub fn mask_env_value(key: &str, value: &str) -> String {
    let lower = key.to_ascii_lowercase();
    let key_is_secret = SECRET_KEY_HINTS.iter().any(|hint| lower.contains(hint));
    let value_is_secret = SECRET_VALUE_PATTERNS.iter().any(|p| p.is_match(value));
    if key_is_secret || value_is_secret {
        "••••••••".to_string()
    } else {
        value.to_string()
    }
}

/// Does the request prefer an HTML error page?
pub fn accepts_html(req: &WorkerRequest) -> bool {
    req.header("accept")
        .map(|accept| accept.contains("text/html") || accept.contains("*/*") && accept.contains("html"))
        .unwrap_or(false)
}

/// Render the 500 response for a failed fetch.
pub fn render_error(req: &WorkerRequest, env: &Env, error: &anyhow::Error) -> WorkerResponse {
    let mut resp = WorkerResponse::new(http::StatusCode::INTERNAL_SERVER_ERROR);
    if accepts_html(req) {
        resp.set_header("content-type", "text/html; charset=utf-8");
        resp.body = Body::from_bytes(render_html(req, env, error).into_bytes());
    } else {
        resp.set_header("content-type", "text/plain; charset=utf-8");
        resp.body = Body::from_bytes(render_text(req, error).into_bytes());
    }
    resp
}

fn render_text(req: &WorkerRequest, error: &anyhow::Error) -> String {
    let mut out = format!("Error: {error}\n\n{} {}\n", req.method, req.url());
    for cause in error.chain().skip(1) {
        out.push_str(&format!("caused by: {cause}\n"));
    }
    out
}

fn render_html(req: &WorkerRequest, env: &Env, error: &anyhow::Error) -> String {
    let mut causes = String::new();
    for cause in error.chain().skip(1) {
        causes.push_str(&format!(
            "<li><code>{}</code></li>",
            escape_html(&cause.to_string())
        ));
    }

    let mut headers = String::new();
    for (name, value) in req.headers.iter() {
        headers.push_str(&format!(
            "<tr><td>{}</td><td>{}</td></tr>",
            escape_html(name.as_str()),
            escape_html(&String::from_utf8_lossy(value.as_bytes())),
        ));
    }

    let mut env_rows = String::new();
    let mut binding_rows = String::new();
    for (slot, kind) in env.slot_names() {
        match env.get(slot) {
            Some(Binding::Var(value)) => {
                env_rows.push_str(&format!(
                    "<tr><td>{}</td><td>{}</td></tr>",
                    escape_html(slot),
                    escape_html(&mask_env_value(slot, value)),
                ));
            }
            Some(Binding::Json(_)) => {
                env_rows.push_str(&format!(
                    "<tr><td>{}</td><td><em>json</em></td></tr>",
                    escape_html(slot)
                ));
            }
            _ => {
                binding_rows.push_str(&format!(
                    "<tr><td>{}</td><td>{}</td></tr>",
                    escape_html(slot),
                    kind
                ));
            }
        }
    }

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Worker threw an error</title>
<style>
  body {{ font-family: ui-monospace, monospace; margin: 2rem; background: #1a1a1a; color: #eee; }}
  h1 {{ color: #ff6b6b; }}
  table {{ border-collapse: collapse; margin: 1rem 0; }}
  td {{ border: 1px solid #444; padding: 4px 10px; }}
  code {{ color: #ffd166; }}
</style>
</head>
<body>
<h1>Worker threw an error</h1>
<p><code>{error}</code></p>
<ul>{causes}</ul>
<h2>Request</h2>
<p><code>{method} {url}</code></p>
<table>{headers}</table>
<h2>Environment</h2>
<table>{env_rows}</table>
<h2>Bindings</h2>
<table>{binding_rows}</table>
</body>
</html>"#,
        error = escape_html(&error.to_string()),
        causes = causes,
        method = req.method,
        url = escape_html(&req.url()),
        headers = headers,
        env_rows = env_rows,
        binding_rows = binding_rows,
    )
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
