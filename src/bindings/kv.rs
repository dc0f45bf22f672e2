//! KV namespace binding: namespaced key/value rows with TTL and listing.

use anyhow::Result;
use base64::Engine as _;
use bytes::Bytes;
use serde_json::Value;
use sqlx::SqlitePool;

use crate::storage::now_ms;
use crate::trace::BindingTracer;

/// Platform caps enforced on the dev emulator too.
const MAX_KEY_BYTES: usize = 512;
const MAX_LIST_LIMIT: i64 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("KV key too long ({0} bytes, max {MAX_KEY_BYTES})")]
    KeyTooLong(usize),
    #[error("KV put() requires either expiration or expirationTtl, not both")]
    ConflictingExpiration,
}

/// How `get` should interpret the stored bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvType {
    Text,
    Json,
    ArrayBuffer,
    Stream,
}

/// A value returned from `get`, already converted to the requested type.
#[derive(Debug, Clone, PartialEq)]
pub enum KvValue {
    Text(String),
    Json(Value),
    Bytes(Bytes),
}

impl KvValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            KvValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct KvPutOptions {
    pub metadata: Option<Value>,
    /// Relative TTL in seconds from now.
    pub expiration_ttl: Option<i64>,
    /// Absolute expiration, seconds since epoch.
    pub expiration: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct KvListOptions {
    pub prefix: Option<String>,
    pub limit: Option<i64>,
    pub cursor: Option<String>,
    pub reverse: bool,
}

#[derive(Debug, Clone)]
pub struct KvListKey {
    pub name: String,
    /// Absolute expiration in epoch seconds, if set.
    pub expiration: Option<i64>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct KvListResult {
    pub keys: Vec<KvListKey>,
    pub list_complete: bool,
    pub cursor: Option<String>,
}

#[derive(Clone)]
pub struct KvNamespace {
    pool: SqlitePool,
    namespace: String,
    tracer: BindingTracer,
}

impl KvNamespace {
    pub fn new(pool: SqlitePool, namespace: impl Into<String>, tracer: BindingTracer) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
            tracer,
        }
    }

    pub async fn put(&self, key: &str, value: impl AsRef<[u8]>, opts: KvPutOptions) -> Result<()> {
        let mut span = self.tracer.span("put", Some(key));
        let result = self.put_inner(key, value.as_ref(), opts).await;
        if let Err(ref e) = result {
            span.fail(e);
        }
        result
    }

    async fn put_inner(&self, key: &str, value: &[u8], opts: KvPutOptions) -> Result<()> {
        if key.len() > MAX_KEY_BYTES {
            return Err(KvError::KeyTooLong(key.len()).into());
        }
        if opts.expiration.is_some() && opts.expiration_ttl.is_some() {
            return Err(KvError::ConflictingExpiration.into());
        }
        // Stored as epoch millis; the API speaks epoch seconds.
        let expiration_ms = match (opts.expiration, opts.expiration_ttl) {
            (Some(abs), _) => Some(abs * 1000),
            (None, Some(ttl)) => Some(now_ms() + ttl * 1000),
            (None, None) => None,
        };
        let metadata = opts
            .metadata
            .map(|m| serde_json::to_vec(&m))
            .transpose()?;
        sqlx::query(
            "INSERT INTO kv (namespace, key, value, metadata, expiration)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(namespace, key) DO UPDATE SET
               value = excluded.value,
               metadata = excluded.metadata,
               expiration = excluded.expiration",
        )
        .bind(&self.namespace)
        .bind(key)
        .bind(value)
        .bind(metadata)
        .bind(expiration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, key: &str, kv_type: KvType) -> Result<Option<KvValue>> {
        Ok(self.get_with_metadata(key, kv_type).await?.map(|(v, _)| v))
    }

    /// Returns `(value, metadata)` or `None` when missing or expired.
    /// Expired rows are deleted in the same read.
    pub async fn get_with_metadata(
        &self,
        key: &str,
        kv_type: KvType,
    ) -> Result<Option<(KvValue, Option<Value>)>> {
        let _span = self.tracer.span("get", Some(key));
        let row: Option<(Vec<u8>, Option<Vec<u8>>, Option<i64>)> = sqlx::query_as(
            "SELECT value, metadata, expiration FROM kv WHERE namespace = ? AND key = ?",
        )
        .bind(&self.namespace)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some((value, metadata, expiration)) = row else {
            return Ok(None);
        };
        if let Some(exp) = expiration {
            if exp <= now_ms() {
                // Ghosted entry: lazy-delete on read.
                self.delete_row(key).await?;
                return Ok(None);
            }
        }
        let metadata = metadata
            .map(|m| serde_json::from_slice(&m))
            .transpose()?;
        let converted = match kv_type {
            KvType::Text => KvValue::Text(String::from_utf8_lossy(&value).to_string()),
            KvType::Json => KvValue::Json(serde_json::from_slice(&value)?),
            KvType::ArrayBuffer | KvType::Stream => KvValue::Bytes(Bytes::from(value)),
        };
        Ok(Some((converted, metadata)))
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let _span = self.tracer.span("delete", Some(key));
        self.delete_row(key).await
    }

    async fn delete_row(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv WHERE namespace = ? AND key = ?")
            .bind(&self.namespace)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// List keys in lexicographic order (descending when `reverse`). The
    /// cursor is an opaque offset token; pagination is complete when fewer
    /// than `limit` keys come back. Expired keys are removed and omitted.
    pub async fn list(&self, opts: KvListOptions) -> Result<KvListResult> {
        let _span = self.tracer.span("list", opts.prefix.as_deref());
        let limit = opts.limit.unwrap_or(MAX_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        let offset = opts
            .cursor
            .as_deref()
            .map(decode_cursor)
            .transpose()?
            .unwrap_or(0);
        let prefix = opts.prefix.unwrap_or_default();
        let pattern = format!("{}%", escape_like(&prefix));

        let order = if opts.reverse { "DESC" } else { "ASC" };
        // Over-fetch so lazily-expired rows don't shorten the page.
        let rows: Vec<(String, Option<Vec<u8>>, Option<i64>)> = sqlx::query_as(&format!(
            "SELECT key, metadata, expiration FROM kv
             WHERE namespace = ? AND key LIKE ? ESCAPE '\\'
             ORDER BY key {order} LIMIT ? OFFSET ?"
        ))
        .bind(&self.namespace)
        .bind(&pattern)
        .bind(limit + 1)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let now = now_ms();
        let mut keys = Vec::new();
        let mut scanned = 0i64;
        for (key, metadata, expiration) in rows {
            scanned += 1;
            if keys.len() as i64 == limit {
                break;
            }
            if let Some(exp) = expiration {
                if exp <= now {
                    self.delete_row(&key).await?;
                    continue;
                }
            }
            keys.push(KvListKey {
                name: key,
                expiration: expiration.map(|ms| ms / 1000),
                metadata: metadata.map(|m| serde_json::from_slice(&m)).transpose()?,
            });
        }

        let list_complete = (keys.len() as i64) < limit || scanned <= limit;
        let cursor = if list_complete {
            None
        } else {
            Some(encode_cursor(offset + scanned - 1))
        };
        Ok(KvListResult {
            keys,
            list_complete,
            cursor,
        })
    }
}

fn encode_cursor(offset: i64) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(offset.to_string())
}

fn decode_cursor(cursor: &str) -> Result<i64> {
    let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| anyhow::anyhow!("invalid list cursor"))?;
    String::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("invalid list cursor"))
}

/// Escape `%`, `_` and `\` so a user prefix is matched literally in LIKE.
pub(crate) fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    async fn kv(name: &str, dir: &std::path::Path) -> KvNamespace {
        let storage = Storage::open(dir).await.unwrap();
        KvNamespace::new(storage.pool(), name, BindingTracer::disabled("kv"))
    }

    #[tokio::test]
    async fn put_get_roundtrip_all_types() {
        let dir = tempfile::tempdir().unwrap();
        let ns = kv("ns", dir.path()).await;
        ns.put("k", br#"{"a":1}"#, KvPutOptions::default())
            .await
            .unwrap();

        let text = ns.get("k", KvType::Text).await.unwrap().unwrap();
        assert_eq!(text.as_text(), Some(r#"{"a":1}"#));
        let json = ns.get("k", KvType::Json).await.unwrap().unwrap();
        assert_eq!(json, KvValue::Json(serde_json::json!({"a": 1})));
        let bytes = ns.get("k", KvType::ArrayBuffer).await.unwrap().unwrap();
        assert_eq!(bytes, KvValue::Bytes(Bytes::from_static(br#"{"a":1}"#)));
    }

    #[tokio::test]
    async fn missing_key_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let ns = kv("ns", dir.path()).await;
        assert!(ns.get("nope", KvType::Text).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_key_is_ghosted_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let ns = kv("ns", dir.path()).await;
        ns.put(
            "k",
            b"v",
            KvPutOptions {
                // Already in the past.
                expiration: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(ns.get("k", KvType::Text).await.unwrap().is_none());
        // The lazy delete removed the row entirely.
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT value FROM kv WHERE namespace = 'ns' AND key = 'k'")
                .fetch_optional(&ns.pool)
                .await
                .unwrap();
        assert!(row.is_none());
    }

    #[tokio::test]
    async fn metadata_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let ns = kv("ns", dir.path()).await;
        ns.put(
            "k",
            b"v",
            KvPutOptions {
                metadata: Some(serde_json::json!({"tag": "blue"})),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let (_, meta) = ns
            .get_with_metadata("k", KvType::Text)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta, Some(serde_json::json!({"tag": "blue"})));
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let a = kv("a", dir.path()).await;
        let b = KvNamespace::new(a.pool.clone(), "b", BindingTracer::disabled("kv"));
        a.put("k", b"from-a", KvPutOptions::default()).await.unwrap();
        assert!(b.get("k", KvType::Text).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_prefix_pagination_and_reverse() {
        let dir = tempfile::tempdir().unwrap();
        let ns = kv("ns", dir.path()).await;
        for key in ["a:1", "a:2", "a:3", "b:1"] {
            ns.put(key, b"v", KvPutOptions::default()).await.unwrap();
        }

        let page1 = ns
            .list(KvListOptions {
                prefix: Some("a:".into()),
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(
            page1.keys.iter().map(|k| k.name.as_str()).collect::<Vec<_>>(),
            vec!["a:1", "a:2"]
        );
        assert!(!page1.list_complete);

        let page2 = ns
            .list(KvListOptions {
                prefix: Some("a:".into()),
                limit: Some(2),
                cursor: page1.cursor,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page2.keys.len(), 1);
        assert_eq!(page2.keys[0].name, "a:3");
        assert!(page2.list_complete);

        let rev = ns
            .list(KvListOptions {
                prefix: Some("a:".into()),
                reverse: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rev.keys[0].name, "a:3");
    }

    #[tokio::test]
    async fn list_omits_expired_keys() {
        let dir = tempfile::tempdir().unwrap();
        let ns = kv("ns", dir.path()).await;
        ns.put("live", b"v", KvPutOptions::default()).await.unwrap();
        ns.put(
            "dead",
            b"v",
            KvPutOptions {
                expiration: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let result = ns.list(KvListOptions::default()).await.unwrap();
        let names: Vec<_> = result.keys.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(names, vec!["live"]);
    }

    #[tokio::test]
    async fn oversized_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ns = kv("ns", dir.path()).await;
        let long = "k".repeat(MAX_KEY_BYTES + 1);
        assert!(ns.put(&long, b"v", KvPutOptions::default()).await.is_err());
    }
}
