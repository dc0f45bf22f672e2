//! Streaming HTML rewriting: CSS-selector handlers over a chunked
//! tokenizer, in the shape of the platform's `HTMLRewriter`.
//!
//! The tokenizer consumes as much of the buffered input as forms complete
//! tokens and carries the partial tail across chunks, so `transform` can
//! rewrite a response body without buffering it whole.

mod selector;
mod tokenizer;

pub use selector::Selector;
pub use tokenizer::{Token, Tokenizer};

use anyhow::Result;
use bytes::Bytes;
use futures_util::StreamExt;

use crate::http_types::{Body, WorkerResponse};

// ─── Content API ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoveMode {
    Keep,
    RemoveAll,
    RemoveKeepContent,
}

/// A matched start tag plus its pending mutations.
pub struct Element {
    tag_name: String,
    attrs: Vec<(String, String)>,
    self_closing: bool,
    before: String,
    after: String,
    prepend: String,
    append: String,
    replacement: Option<String>,
    inner_content: Option<String>,
    remove: RemoveMode,
    attrs_dirty: bool,
    on_end: Option<EndTagFn>,
}

/// The matching end tag, handed to `on_end_tag` callbacks.
pub struct EndTag {
    name: String,
    before: String,
    after: String,
    removed: bool,
}

impl EndTag {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn before(&mut self, content: &str) {
        self.before.push_str(content);
    }

    pub fn after(&mut self, content: &str) {
        self.after.push_str(content);
    }

    pub fn remove(&mut self) {
        self.removed = true;
    }
}

impl Element {
    pub fn tag_name(&self) -> &str {
        &self.tag_name
    }

    pub fn get_attribute(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.get_attribute(name).is_some()
    }

    pub fn set_attribute(&mut self, name: &str, value: &str) {
        self.attrs_dirty = true;
        if let Some(attr) = self
            .attrs
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            attr.1 = value.to_string();
        } else {
            self.attrs.push((name.to_string(), value.to_string()));
        }
    }

    pub fn remove_attribute(&mut self, name: &str) {
        self.attrs_dirty = true;
        self.attrs.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn before(&mut self, content: &str) {
        self.before.push_str(content);
    }

    pub fn after(&mut self, content: &str) {
        self.after.push_str(content);
    }

    pub fn prepend(&mut self, content: &str) {
        self.prepend.push_str(content);
    }

    pub fn append(&mut self, content: &str) {
        self.append.push_str(content);
    }

    /// Replace the whole element (tag and content) with `content`.
    pub fn replace(&mut self, content: &str) {
        self.replacement = Some(content.to_string());
    }

    /// Replace the element's children, keeping the tag.
    pub fn set_inner_content(&mut self, content: &str) {
        self.inner_content = Some(content.to_string());
    }

    pub fn remove(&mut self) {
        self.remove = RemoveMode::RemoveAll;
    }

    pub fn remove_and_keep_content(&mut self) {
        self.remove = RemoveMode::RemoveKeepContent;
    }

    /// Register a callback invoked when the matching end tag is reached.
    pub fn on_end_tag(&mut self, f: impl FnOnce(&mut EndTag) + Send + 'static) {
        self.on_end = Some(Box::new(f));
    }

    fn render_start_tag(&self, raw: &str) -> String {
        if !self.attrs_dirty {
            return raw.to_string();
        }
        let mut out = format!("<{}", self.tag_name);
        for (name, value) in &self.attrs {
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            out.push_str(&value.replace('"', "&quot;"));
            out.push('"');
        }
        if self.self_closing {
            out.push_str(" /");
        }
        out.push('>');
        out
    }
}

/// A text run between tags.
pub struct TextChunk {
    text: String,
    last_in_text_node: bool,
    before: String,
    after: String,
    replacement: Option<String>,
}

impl TextChunk {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn last_in_text_node(&self) -> bool {
        self.last_in_text_node
    }

    pub fn before(&mut self, content: &str) {
        self.before.push_str(content);
    }

    pub fn after(&mut self, content: &str) {
        self.after.push_str(content);
    }

    pub fn replace(&mut self, content: &str) {
        self.replacement = Some(content.to_string());
    }

    pub fn remove(&mut self) {
        self.replacement = Some(String::new());
    }
}

pub struct Comment {
    text: String,
    replacement: Option<String>,
    removed: bool,
}

impl Comment {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn set_text(&mut self, text: &str) {
        self.text = text.to_string();
    }

    /// Replace the comment with arbitrary markup.
    pub fn replace(&mut self, content: &str) {
        self.replacement = Some(content.to_string());
    }

    pub fn remove(&mut self) {
        self.removed = true;
    }
}

pub struct Doctype {
    raw: String,
}

impl Doctype {
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

/// Passed to `end` document handlers; appended content lands after the last
/// byte of the document.
pub struct DocumentEnd {
    appended: String,
}

impl DocumentEnd {
    pub fn append(&mut self, content: &str) {
        self.appended.push_str(content);
    }
}

// ─── Handler tables ───────────────────────────────────────────────────────────

type ElementFn = Box<dyn FnMut(&mut Element) + Send>;
type EndTagFn = Box<dyn FnOnce(&mut EndTag) + Send>;
type TextFn = Box<dyn FnMut(&mut TextChunk) + Send>;
type CommentFn = Box<dyn FnMut(&mut Comment) + Send>;
type DoctypeFn = Box<dyn FnMut(&Doctype) + Send>;
type EndFn = Box<dyn FnMut(&mut DocumentEnd) + Send>;

#[derive(Default)]
pub struct ElementContentHandlers {
    pub element: Option<ElementFn>,
    pub text: Option<TextFn>,
    pub comments: Option<CommentFn>,
}

impl ElementContentHandlers {
    pub fn element(mut self, f: impl FnMut(&mut Element) + Send + 'static) -> Self {
        self.element = Some(Box::new(f));
        self
    }

    pub fn text(mut self, f: impl FnMut(&mut TextChunk) + Send + 'static) -> Self {
        self.text = Some(Box::new(f));
        self
    }

    pub fn comments(mut self, f: impl FnMut(&mut Comment) + Send + 'static) -> Self {
        self.comments = Some(Box::new(f));
        self
    }
}

#[derive(Default)]
pub struct DocumentContentHandlers {
    pub doctype: Option<DoctypeFn>,
    pub text: Option<TextFn>,
    pub comments: Option<CommentFn>,
    pub end: Option<EndFn>,
}

impl DocumentContentHandlers {
    pub fn doctype(mut self, f: impl FnMut(&Doctype) + Send + 'static) -> Self {
        self.doctype = Some(Box::new(f));
        self
    }

    pub fn text(mut self, f: impl FnMut(&mut TextChunk) + Send + 'static) -> Self {
        self.text = Some(Box::new(f));
        self
    }

    pub fn comments(mut self, f: impl FnMut(&mut Comment) + Send + 'static) -> Self {
        self.comments = Some(Box::new(f));
        self
    }

    pub fn end(mut self, f: impl FnMut(&mut DocumentEnd) + Send + 'static) -> Self {
        self.end = Some(Box::new(f));
        self
    }
}

// ─── Rewriter ─────────────────────────────────────────────────────────────────

pub struct HtmlRewriter {
    selectors: Vec<(Selector, ElementContentHandlers)>,
    document: Vec<DocumentContentHandlers>,
}

impl HtmlRewriter {
    pub fn new() -> Self {
        Self {
            selectors: Vec::new(),
            document: Vec::new(),
        }
    }

    /// Register element handlers for a selector. Returns the rewriter for
    /// chaining.
    pub fn on(mut self, selector: &str, handlers: ElementContentHandlers) -> Result<Self> {
        self.selectors.push((Selector::parse(selector)?, handlers));
        Ok(self)
    }

    pub fn on_document(mut self, handlers: DocumentContentHandlers) -> Self {
        self.document.push(handlers);
        self
    }

    /// Rewrite a response, streaming the transformed body.
    pub fn transform(self, response: WorkerResponse) -> WorkerResponse {
        let mut out = WorkerResponse::new(response.status);
        out.headers = response.headers;
        // The rewritten length is unknowable up front.
        out.headers.remove(http::header::CONTENT_LENGTH);

        let (tx, body) = Body::channel(16);
        out.body = body;
        let input = response.body;
        tokio::spawn(async move {
            let mut machine = Machine::new(self.selectors, self.document);
            let mut forward = |piece: String| {
                let tx = tx.clone();
                async move {
                    if !piece.is_empty() {
                        let _ = tx.send(Ok(Bytes::from(piece.into_bytes()))).await;
                    }
                }
            };
            match input {
                Body::Empty => {
                    forward(machine.end()).await;
                }
                Body::Bytes(bytes) => {
                    forward(machine.write(&String::from_utf8_lossy(&bytes))).await;
                    forward(machine.end()).await;
                }
                Body::Stream(mut stream) => {
                    while let Some(chunk) = stream.next().await {
                        match chunk {
                            Ok(bytes) => {
                                forward(machine.write(&String::from_utf8_lossy(&bytes))).await;
                            }
                            Err(e) => {
                                let _ = tx.send(Err(e)).await;
                                return;
                            }
                        }
                    }
                    forward(machine.end()).await;
                }
            }
        });
        out
    }

    /// Convenience for tests and non-streaming callers.
    pub fn rewrite_str(self, html: &str) -> String {
        let mut machine = Machine::new(self.selectors, self.document);
        let mut out = machine.write(html);
        out.push_str(&machine.end());
        out
    }
}

impl Default for HtmlRewriter {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Rewriting state machine ──────────────────────────────────────────────────

/// Content suppression reasons, tracked against the open-element stack.
struct Suppression {
    /// Stack depth of the element that started the suppression.
    depth: usize,
    /// Emit the matching end tag (inner-content replacement keeps the tag).
    keep_end_tag: bool,
}

/// Text/comment handler scope opened by a matched element.
struct Scope {
    depth: usize,
    selector_index: usize,
}

struct Machine {
    selectors: Vec<(Selector, ElementContentHandlers)>,
    document: Vec<DocumentContentHandlers>,
    tokenizer: Tokenizer,
    stack: Vec<String>,
    scopes: Vec<Scope>,
    suppression: Option<Suppression>,
    pending_ends: Vec<PendingEnd>,
    /// Depths whose end tags are dropped (`remove_and_keep_content`).
    dropped_tags: Vec<usize>,
    ended: bool,
}

const VOID_ELEMENTS: [&str; 14] = [
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

fn is_void(tag: &str) -> bool {
    VOID_ELEMENTS.contains(&tag)
}

impl Machine {
    fn new(
        selectors: Vec<(Selector, ElementContentHandlers)>,
        document: Vec<DocumentContentHandlers>,
    ) -> Self {
        Self {
            selectors,
            document,
            tokenizer: Tokenizer::new(),
            stack: Vec::new(),
            scopes: Vec::new(),
            suppression: None,
            pending_ends: Vec::new(),
            dropped_tags: Vec::new(),
            ended: false,
        }
    }

    fn write(&mut self, chunk: &str) -> String {
        let tokens = self.tokenizer.write(chunk);
        let mut out = String::new();
        for token in tokens {
            self.token(token, &mut out);
        }
        out
    }

    fn end(&mut self) -> String {
        if self.ended {
            return String::new();
        }
        self.ended = true;
        let mut out = String::new();
        for token in self.tokenizer.finish() {
            self.token(token, &mut out);
        }
        let mut end = DocumentEnd {
            appended: String::new(),
        };
        for handlers in &mut self.document {
            if let Some(f) = handlers.end.as_mut() {
                f(&mut end);
            }
        }
        out.push_str(&end.appended);
        out
    }

    fn suppressed(&self) -> bool {
        self.suppression.is_some()
    }

    fn token(&mut self, token: Token, out: &mut String) {
        match token {
            Token::Doctype(raw) => {
                let doctype = Doctype { raw: raw.clone() };
                for handlers in &mut self.document {
                    if let Some(f) = handlers.doctype.as_mut() {
                        f(&doctype);
                    }
                }
                if !self.suppressed() {
                    out.push_str(&raw);
                }
            }
            Token::Text(text) => self.text_token(text, out),
            Token::Comment(text, raw) => self.comment_token(text, raw, out),
            Token::StartTag {
                name,
                attrs,
                self_closing,
                raw,
            } => self.start_tag(name, attrs, self_closing, raw, out),
            Token::EndTag { name, raw } => self.end_tag(name, raw, out),
        }
    }

    fn text_token(&mut self, text: String, out: &mut String) {
        let mut chunk = TextChunk {
            text,
            last_in_text_node: true,
            before: String::new(),
            after: String::new(),
            replacement: None,
        };
        for handlers in &mut self.document {
            if let Some(f) = handlers.text.as_mut() {
                f(&mut chunk);
            }
        }
        for scope in &self.scopes {
            if let Some(f) = self.selectors[scope.selector_index].1.text.as_mut() {
                f(&mut chunk);
            }
        }
        if self.suppressed() {
            return;
        }
        out.push_str(&chunk.before);
        out.push_str(chunk.replacement.as_deref().unwrap_or(&chunk.text));
        out.push_str(&chunk.after);
    }

    fn comment_token(&mut self, text: String, raw: String, out: &mut String) {
        let mut comment = Comment {
            text,
            replacement: None,
            removed: false,
        };
        for handlers in &mut self.document {
            if let Some(f) = handlers.comments.as_mut() {
                f(&mut comment);
            }
        }
        for scope in &self.scopes {
            if let Some(f) = self.selectors[scope.selector_index].1.comments.as_mut() {
                f(&mut comment);
            }
        }
        if self.suppressed() || comment.removed {
            return;
        }
        let _ = raw;
        match comment.replacement {
            Some(replacement) => out.push_str(&replacement),
            // The text may have been rewritten in place.
            None => out.push_str(&format!("<!--{}-->", comment.text)),
        }
    }

    fn start_tag(
        &mut self,
        name: String,
        attrs: Vec<(String, String)>,
        self_closing: bool,
        raw: String,
        out: &mut String,
    ) {
        let effectively_void = self_closing || is_void(&name);
        if self.suppressed() {
            if !effectively_void {
                self.stack.push(name);
            }
            return;
        }

        let mut element = Element {
            tag_name: name.clone(),
            attrs,
            self_closing,
            before: String::new(),
            after: String::new(),
            prepend: String::new(),
            append: String::new(),
            replacement: None,
            inner_content: None,
            remove: RemoveMode::Keep,
            attrs_dirty: false,
            on_end: None,
        };

        let mut matched: Vec<usize> = Vec::new();
        for (i, (selector, _)) in self.selectors.iter().enumerate() {
            if selector.matches(&element.tag_name, &element.attrs) {
                matched.push(i);
            }
        }
        for &i in &matched {
            if let Some(f) = self.selectors[i].1.element.as_mut() {
                f(&mut element);
            }
        }

        out.push_str(&element.before);

        if let Some(replacement) = element.replacement.take() {
            // The replacement stands in for the whole element.
            out.push_str(&replacement);
            out.push_str(&element.after);
            if !effectively_void {
                self.stack.push(name);
                self.suppression = Some(Suppression {
                    depth: self.stack.len(),
                    keep_end_tag: false,
                });
            }
            return;
        }
        match element.remove {
            RemoveMode::RemoveAll => {
                out.push_str(&element.after);
                if !effectively_void {
                    self.stack.push(name);
                    self.suppression = Some(Suppression {
                        depth: self.stack.len(),
                        keep_end_tag: false,
                    });
                }
                return;
            }
            RemoveMode::RemoveKeepContent => {
                // Children flow through; only the tags disappear.
                if effectively_void {
                    out.push_str(&element.after);
                    return;
                }
                self.stack.push(name.clone());
                self.open_scopes(&matched);
                self.note_tag_dropped(self.stack.len());
                out.push_str(&element.prepend);
                self.pending_ends.push(PendingEnd {
                    depth: self.stack.len(),
                    tag_name: name,
                    append: element.append,
                    after: element.after,
                    on_end: element.on_end,
                });
                return;
            }
            RemoveMode::Keep => {}
        }

        out.push_str(&element.render_start_tag(&raw));
        if effectively_void {
            out.push_str(&element.after);
            return;
        }
        self.stack.push(name.clone());
        out.push_str(&element.prepend);

        if let Some(inner) = &element.inner_content {
            out.push_str(inner);
            self.suppression = Some(Suppression {
                depth: self.stack.len(),
                keep_end_tag: true,
            });
        } else {
            self.open_scopes(&matched);
        }
        // Deferred append/after are attached to the end tag by depth.
        self.pending_ends.push(PendingEnd {
            depth: self.stack.len(),
            tag_name: name,
            append: element.append,
            after: element.after,
            on_end: element.on_end,
        });
    }

    fn end_tag(&mut self, name: String, raw: String, out: &mut String) {
        // Pop to the nearest matching open tag (lenient recovery).
        let Some(position) = self.stack.iter().rposition(|open| *open == name) else {
            if !self.suppressed() {
                out.push_str(&raw);
            }
            return;
        };
        let depth = position + 1;

        if let Some((sup_depth, keep_end_tag)) = self
            .suppression
            .as_ref()
            .map(|s| (s.depth, s.keep_end_tag))
        {
            if depth < sup_depth {
                // Closing an ancestor of the suppressed subtree.
                self.suppression = None;
            } else if depth == sup_depth {
                self.suppression = None;
                self.close_to(depth, out, keep_end_tag.then_some(raw.as_str()));
                return;
            } else {
                self.stack.truncate(position);
                return;
            }
        }
        self.close_to(depth, out, Some(raw.as_str()));
    }

    fn close_to(&mut self, depth: usize, out: &mut String, raw_end: Option<&str>) {
        self.scopes.retain(|scope| scope.depth < depth);
        let mut dropped_tag = false;
        self.dropped_tags.retain(|d| {
            if *d == depth {
                dropped_tag = true;
                false
            } else {
                *d < depth
            }
        });
        // Take the matching deferred entry; deeper stale entries die with
        // their subtree.
        let mut pending = None;
        let mut kept = Vec::with_capacity(self.pending_ends.len());
        for entry in self.pending_ends.drain(..) {
            if entry.depth == depth {
                pending = Some(entry);
            } else if entry.depth < depth {
                kept.push(entry);
            }
        }
        self.pending_ends = kept;
        self.stack.truncate(depth - 1);

        let Some(pending) = pending else {
            if !dropped_tag {
                if let Some(raw) = raw_end {
                    out.push_str(raw);
                }
            }
            return;
        };
        out.push_str(&pending.append);
        let mut end_tag = EndTag {
            name: pending.tag_name,
            before: String::new(),
            after: String::new(),
            removed: false,
        };
        if let Some(on_end) = pending.on_end {
            on_end(&mut end_tag);
        }
        out.push_str(&end_tag.before);
        if !dropped_tag && !end_tag.removed {
            if let Some(raw) = raw_end {
                out.push_str(raw);
            }
        }
        out.push_str(&end_tag.after);
        out.push_str(&pending.after);
    }

    fn open_scopes(&mut self, matched: &[usize]) {
        for &i in matched {
            let has_content_handlers =
                self.selectors[i].1.text.is_some() || self.selectors[i].1.comments.is_some();
            if has_content_handlers {
                self.scopes.push(Scope {
                    depth: self.stack.len(),
                    selector_index: i,
                });
            }
        }
    }

    fn note_tag_dropped(&mut self, depth: usize) {
        self.dropped_tags.push(depth);
    }
}

/// Deferred end-tag mutations, keyed by open-stack depth.
struct PendingEnd {
    depth: usize,
    tag_name: String,
    append: String,
    after: String,
    on_end: Option<EndTagFn>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn attribute_rewriting() {
        let out = HtmlRewriter::new()
            .on(
                "a",
                ElementContentHandlers::default().element(|el| {
                    if let Some(href) = el.get_attribute("href").map(|h| h.to_string()) {
                        el.set_attribute("href", &href.replace("http:", "https:"));
                    }
                    el.set_attribute("rel", "noopener");
                }),
            )
            .unwrap()
            .rewrite_str("<p><a href=\"http://x.dev/\">x</a></p>");
        assert_eq!(
            out,
            "<p><a href=\"https://x.dev/\" rel=\"noopener\">x</a></p>"
        );
    }

    #[test]
    fn selector_variants_match() {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let record = |tag: &'static str, hits: &Arc<Mutex<Vec<&'static str>>>| {
            let hits = Arc::clone(hits);
            ElementContentHandlers::default().element(move |_el| {
                hits.lock().unwrap().push(tag);
            })
        };
        let html = "<div class=\"a\"><span id=\"s\"></span><p data-k=\"v\"></p></div>";
        HtmlRewriter::new()
            .on(".a", record("class", &hits))
            .unwrap()
            .on("#s", record("id", &hits))
            .unwrap()
            .on("[data-k=v]", record("attr", &hits))
            .unwrap()
            .on("*", record("star", &hits))
            .unwrap()
            .rewrite_str(html);
        let seen = hits.lock().unwrap();
        assert_eq!(
            *seen,
            vec!["class", "star", "id", "star", "attr", "star"]
        );
    }

    #[test]
    fn content_insertion_points() {
        let out = HtmlRewriter::new()
            .on(
                "main",
                ElementContentHandlers::default().element(|el| {
                    el.before("<!-- b -->");
                    el.prepend("<header>");
                    el.append("</footer-less>");
                    el.after("<!-- a -->");
                }),
            )
            .unwrap()
            .rewrite_str("<main>body</main>");
        assert_eq!(
            out,
            "<!-- b --><main><header>body</footer-less></main><!-- a -->"
        );
    }

    #[test]
    fn set_inner_content_replaces_children() {
        let out = HtmlRewriter::new()
            .on(
                "div#target",
                ElementContentHandlers::default().element(|el| {
                    el.set_inner_content("<b>new</b>");
                }),
            )
            .unwrap()
            .rewrite_str("<div id=\"target\">old <span>stuff</span></div><div>keep</div>");
        assert_eq!(out, "<div id=\"target\"><b>new</b></div><div>keep</div>");
    }

    #[test]
    fn remove_and_remove_keep_content() {
        let out = HtmlRewriter::new()
            .on(
                ".ads",
                ElementContentHandlers::default().element(|el| el.remove()),
            )
            .unwrap()
            .on(
                "wrapper",
                ElementContentHandlers::default().element(|el| el.remove_and_keep_content()),
            )
            .unwrap()
            .rewrite_str(
                "<div class=\"ads\"><img src=\"x\"></div><wrapper><i>kept</i></wrapper>",
            );
        assert_eq!(out, "<i>kept</i>");
    }

    #[test]
    fn replace_whole_element() {
        let out = HtmlRewriter::new()
            .on(
                "iframe",
                ElementContentHandlers::default().element(|el| el.replace("<p>blocked</p>")),
            )
            .unwrap()
            .rewrite_str("<iframe src=\"x\">inner</iframe>tail");
        assert_eq!(out, "<p>blocked</p>tail");
    }

    #[test]
    fn scoped_text_handlers() {
        let out = HtmlRewriter::new()
            .on(
                "em",
                ElementContentHandlers::default().text(|t| {
                    let upper = t.text().to_ascii_uppercase();
                    t.replace(&upper);
                }),
            )
            .unwrap()
            .rewrite_str("<p>plain <em>loud</em> plain</p>");
        assert_eq!(out, "<p>plain <em>LOUD</em> plain</p>");
    }

    #[test]
    fn on_end_tag_runs_at_the_closing_tag() {
        let out = HtmlRewriter::new()
            .on(
                "section",
                ElementContentHandlers::default().element(|el| {
                    el.on_end_tag(|end| {
                        assert_eq!(end.name(), "section");
                        end.before("<hr>");
                    });
                }),
            )
            .unwrap()
            .rewrite_str("<section>body</section>");
        assert_eq!(out, "<section>body<hr></section>");
    }

    #[test]
    fn comment_handlers() {
        let out = HtmlRewriter::new()
            .on_document(DocumentContentHandlers::default().comments(|c| {
                if c.text().contains("secret") {
                    c.remove();
                } else {
                    c.set_text(" audited ");
                }
            }))
            .rewrite_str("<!-- secret token --><p>x</p><!-- note -->");
        assert_eq!(out, "<p>x</p><!-- audited -->");
    }

    #[test]
    fn document_handlers_fire() {
        let saw_doctype = Arc::new(Mutex::new(false));
        let saw = Arc::clone(&saw_doctype);
        let out = HtmlRewriter::new()
            .on_document(
                DocumentContentHandlers::default()
                    .doctype(move |d| {
                        assert!(d.raw().to_ascii_lowercase().contains("doctype"));
                        *saw.lock().unwrap() = true;
                    })
                    .end(|end| end.append("<!-- appended -->")),
            )
            .rewrite_str("<!DOCTYPE html><p>x</p>");
        assert!(*saw_doctype.lock().unwrap());
        assert!(out.ends_with("<!-- appended -->"));
    }

    #[tokio::test]
    async fn transform_streams_a_response() {
        let mut input = crate::http_types::WorkerResponse::ok("<p>hello <b>world</b></p>");
        input.set_header("content-type", "text/html");
        let rewriter = HtmlRewriter::new()
            .on(
                "b",
                ElementContentHandlers::default().element(|el| el.remove_and_keep_content()),
            )
            .unwrap();
        let out = rewriter.transform(input);
        let body = out.bytes().await.unwrap();
        assert_eq!(body.as_ref(), b"<p>hello world</p>");
    }
}
