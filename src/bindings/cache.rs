//! Cache binding: request/response cache keyed by URL plus Vary headers,
//! persisted in `cache_entries` with optional max-age expiration.

use anyhow::Result;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use sqlx::SqlitePool;

use crate::http_types::{Body, WorkerRequest, WorkerResponse};
use crate::storage::now_ms;
use crate::trace::BindingTracer;

#[derive(Clone)]
pub struct CacheBinding {
    pool: SqlitePool,
    name: String,
    tracer: BindingTracer,
}

impl CacheBinding {
    pub fn new(pool: SqlitePool, name: impl Into<String>, tracer: BindingTracer) -> Self {
        Self {
            pool,
            name: name.into(),
            tracer,
        }
    }

    /// The `caches.default` instance.
    pub fn default_cache(pool: SqlitePool, tracer: BindingTracer) -> Self {
        Self::new(pool, "default", tracer)
    }

    /// Store `response` under the request URL. A `Cache-Control: max-age=N`
    /// response header sets the absolute expiration.
    pub async fn put(&self, request: &WorkerRequest, response: WorkerResponse) -> Result<()> {
        let _span = self.tracer.span("put", Some(&request.url()));
        let url = request.url();
        let status = response.status.as_u16() as i64;
        let headers = serialize_headers(&response.headers);
        let expires_at = max_age(&response.headers).map(|secs| now_ms() + secs * 1000);

        // Record the request header values named by Vary so `match` can
        // compare them later.
        let vary_keys = response
            .header("vary")
            .map(|vary| {
                let pairs: Vec<(String, String)> = vary
                    .split(',')
                    .map(|name| {
                        let name = name.trim().to_ascii_lowercase();
                        let value = request.header(&name).unwrap_or_default();
                        (name, value)
                    })
                    .collect();
                serde_json::to_string(&pairs)
            })
            .transpose()?;

        let body = response.body.into_bytes().await?;
        sqlx::query(
            "INSERT INTO cache_entries (cache_name, url, status, headers, body, vary_keys, expires_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(cache_name, url) DO UPDATE SET
               status = excluded.status,
               headers = excluded.headers,
               body = excluded.body,
               vary_keys = excluded.vary_keys,
               expires_at = excluded.expires_at",
        )
        .bind(&self.name)
        .bind(&url)
        .bind(status)
        .bind(&headers)
        .bind(body.as_ref())
        .bind(vary_keys)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Look up a cached response. Expired rows are filtered out and lazily
    /// deleted; a `Vary` mismatch is a miss.
    pub async fn cache_match(&self, request: &WorkerRequest) -> Result<Option<WorkerResponse>> {
        let _span = self.tracer.span("match", Some(&request.url()));
        let row: Option<(i64, String, Vec<u8>, Option<String>, Option<i64>)> = sqlx::query_as(
            "SELECT status, headers, body, vary_keys, expires_at
             FROM cache_entries WHERE cache_name = ? AND url = ?",
        )
        .bind(&self.name)
        .bind(request.url())
        .fetch_optional(&self.pool)
        .await?;

        let Some((status, headers, body, vary_keys, expires_at)) = row else {
            return Ok(None);
        };
        if let Some(exp) = expires_at {
            if exp <= now_ms() {
                self.delete(request).await?;
                return Ok(None);
            }
        }
        if let Some(vary_json) = vary_keys {
            let pairs: Vec<(String, String)> = serde_json::from_str(&vary_json)?;
            for (name, value) in &pairs {
                if name == "*" {
                    return Ok(None);
                }
                if request.header(name).unwrap_or_default() != *value {
                    return Ok(None);
                }
            }
        }

        let mut response = WorkerResponse::new(StatusCode::from_u16(status as u16)?);
        response.headers = deserialize_headers(&headers)?;
        response.body = Body::from_bytes(Bytes::from(body));
        Ok(Some(response))
    }

    /// Remove a cached response; reports whether anything matched.
    pub async fn delete(&self, request: &WorkerRequest) -> Result<bool> {
        let _span = self.tracer.span("delete", Some(&request.url()));
        let result = sqlx::query("DELETE FROM cache_entries WHERE cache_name = ? AND url = ?")
            .bind(&self.name)
            .bind(request.url())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn serialize_headers(headers: &HeaderMap) -> String {
    let pairs: Vec<(String, String)> = headers
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                String::from_utf8_lossy(v.as_bytes()).to_string(),
            )
        })
        .collect();
    serde_json::to_string(&pairs).unwrap_or_else(|_| "[]".to_string())
}

fn deserialize_headers(json: &str) -> Result<HeaderMap> {
    let pairs: Vec<(String, String)> = serde_json::from_str(json)?;
    let mut map = HeaderMap::new();
    for (k, v) in pairs {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::from_bytes(k.as_bytes()),
            http::header::HeaderValue::from_str(&v),
        ) {
            map.append(name, value);
        }
    }
    Ok(map)
}

/// Parse `max-age=N` out of a Cache-Control header.
fn max_age(headers: &HeaderMap) -> Option<i64> {
    let cc = headers.get("cache-control")?.to_str().ok()?;
    cc.split(',').find_map(|directive| {
        let directive = directive.trim();
        directive
            .strip_prefix("max-age=")
            .and_then(|v| v.parse().ok())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    async fn cache(dir: &std::path::Path) -> CacheBinding {
        let storage = Storage::open(dir).await.unwrap();
        CacheBinding::default_cache(storage.pool(), BindingTracer::disabled("cache"))
    }

    fn response_with(body: &str, headers: &[(&str, &str)]) -> WorkerResponse {
        let mut resp = WorkerResponse::ok(body.as_bytes().to_vec());
        for (k, v) in headers {
            resp.set_header(k, v);
        }
        resp
    }

    #[tokio::test]
    async fn put_match_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let c = cache(dir.path()).await;
        let req = WorkerRequest::get("http://localhost/page");
        c.put(&req, response_with("cached body", &[("x-custom", "1")]))
            .await
            .unwrap();

        let hit = c.cache_match(&req).await.unwrap().unwrap();
        assert_eq!(hit.status, StatusCode::OK);
        assert_eq!(hit.header("x-custom").as_deref(), Some("1"));
        assert_eq!(hit.bytes().await.unwrap().as_ref(), b"cached body");
    }

    #[tokio::test]
    async fn expired_entries_are_misses() {
        let dir = tempfile::tempdir().unwrap();
        let c = cache(dir.path()).await;
        let req = WorkerRequest::get("http://localhost/ttl");
        c.put(&req, response_with("x", &[("cache-control", "max-age=0")]))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(c.cache_match(&req).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn vary_header_mismatch_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let c = cache(dir.path()).await;
        let mut req = WorkerRequest::get("http://localhost/v");
        req.headers
            .insert("accept-encoding", "gzip".parse().unwrap());
        c.put(&req, response_with("x", &[("vary", "Accept-Encoding")]))
            .await
            .unwrap();

        // Same header value: hit.
        assert!(c.cache_match(&req).await.unwrap().is_some());

        // Different header value: miss.
        let mut other = WorkerRequest::get("http://localhost/v");
        other.headers.insert("accept-encoding", "br".parse().unwrap());
        assert!(c.cache_match(&other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_reports_match() {
        let dir = tempfile::tempdir().unwrap();
        let c = cache(dir.path()).await;
        let req = WorkerRequest::get("http://localhost/d");
        c.put(&req, response_with("x", &[])).await.unwrap();
        assert!(c.delete(&req).await.unwrap());
        assert!(!c.delete(&req).await.unwrap());
    }
}
