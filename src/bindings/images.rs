//! Images binding: a passthrough in the emulator. Transform options are
//! parsed and echoed as headers so callers can see what would have applied,
//! but the bytes are returned untouched.

use std::collections::HashMap;

use anyhow::Result;
use bytes::Bytes;

use crate::http_types::{Body, WorkerResponse};
use crate::trace::BindingTracer;

#[derive(Debug, Clone, Default)]
pub struct ImageTransform {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<String>,
    pub quality: Option<u8>,
}

impl ImageTransform {
    /// Parse a `cf-image-options`-style header: `width=100,format=webp`.
    pub fn from_header(value: &str) -> Self {
        let mut options: HashMap<&str, &str> = HashMap::new();
        for pair in value.split(',') {
            if let Some((k, v)) = pair.split_once('=') {
                options.insert(k.trim(), v.trim());
            }
        }
        Self {
            width: options.get("width").and_then(|v| v.parse().ok()),
            height: options.get("height").and_then(|v| v.parse().ok()),
            format: options.get("format").map(|v| v.to_string()),
            quality: options.get("quality").and_then(|v| v.parse().ok()),
        }
    }
}

#[derive(Clone)]
pub struct ImagesBinding {
    tracer: BindingTracer,
}

impl ImagesBinding {
    pub fn new(tracer: BindingTracer) -> Self {
        Self { tracer }
    }

    /// Passthrough transform: the input bytes come back unchanged, with the
    /// requested options reflected in response headers.
    pub async fn transform(
        &self,
        input: Bytes,
        transform: ImageTransform,
    ) -> Result<WorkerResponse> {
        let _span = self.tracer.span("input", None);
        let mut resp = WorkerResponse::new(http::StatusCode::OK);
        if let Some(format) = &transform.format {
            resp.set_header("content-type", &format!("image/{format}"));
        }
        if let Some(width) = transform.width {
            resp.set_header("x-bunflare-resize-width", &width.to_string());
        }
        if let Some(height) = transform.height {
            resp.set_header("x-bunflare-resize-height", &height.to_string());
        }
        resp.body = Body::from_bytes(input);
        Ok(resp)
    }
}
