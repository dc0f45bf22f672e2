//! R2 bucket binding: object store with conditional operations, ranged
//! reads, multipart uploads, and delimited listing.
//!
//! Object metadata lives in the shared substrate; bodies are plain files
//! under `<root>/r2/<bucket>/<key>`. Multipart parts are temp files under
//! `__multipart__/<uploadId>/part-<n>` until completion concatenates them.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use base64::Engine as _;
use bytes::Bytes;
use md5::{Digest as _, Md5};
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::storage::now_ms;
use crate::trace::BindingTracer;

// ─── Limits ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct R2Limits {
    pub max_key_bytes: usize,
    pub max_custom_metadata_bytes: usize,
    pub max_batch_delete: usize,
    pub max_parts: u32,
    /// Minimum part size is advisory in dev; the last part is always exempt.
    pub min_part_size: usize,
}

impl Default for R2Limits {
    fn default() -> Self {
        Self {
            max_key_bytes: 1024,
            max_custom_metadata_bytes: 2048,
            max_batch_delete: 1000,
            max_parts: 10_000,
            min_part_size: 5 * 1024 * 1024,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum R2Error {
    #[error("invalid R2 key: {0}")]
    InvalidKey(String),
    #[error("R2 custom metadata too large ({0} bytes)")]
    MetadataTooLarge(usize),
    #[error("batch delete limited to {0} keys")]
    TooManyDeletes(usize),
    #[error("etag mismatch for part {0}")]
    EtagMismatch(u16),
    #[error("too many parts ({0})")]
    TooManyParts(u32),
    #[error("unknown multipart upload")]
    UnknownUpload,
    #[error("checksum mismatch ({0})")]
    ChecksumMismatch(String),
}

// ─── Metadata types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct R2Object {
    pub key: String,
    pub size: i64,
    pub etag: String,
    pub version: String,
    /// Epoch milliseconds.
    pub uploaded: i64,
    pub http_metadata: HashMap<String, String>,
    pub custom_metadata: HashMap<String, String>,
    pub checksums: HashMap<String, String>,
    /// The actual range served by a ranged `get`, when one was requested.
    pub range: Option<(u64, u64)>,
}

/// Result of `get`: full body, or metadata only when `only_if` failed.
#[derive(Debug)]
pub enum R2GetResult {
    Body(R2Object, Bytes),
    PreconditionFailed(R2Object),
}

impl R2GetResult {
    pub fn object(&self) -> &R2Object {
        match self {
            R2GetResult::Body(o, _) | R2GetResult::PreconditionFailed(o) => o,
        }
    }

    pub fn body(&self) -> Option<&Bytes> {
        match self {
            R2GetResult::Body(_, b) => Some(b),
            R2GetResult::PreconditionFailed(_) => None,
        }
    }
}

// ─── Conditions & ranges ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct R2Conditional {
    pub etag_matches: Vec<String>,
    pub etag_does_not_match: Vec<String>,
    /// Epoch milliseconds.
    pub uploaded_before: Option<i64>,
    pub uploaded_after: Option<i64>,
}

impl R2Conditional {
    /// Evaluate against the current object, if any. `"*"` in `etag_matches`
    /// matches any existing object.
    pub fn check(&self, existing: Option<(&str, i64)>) -> bool {
        match existing {
            None => {
                // With no object there is nothing to match.
                self.etag_matches.is_empty()
            }
            Some((etag, uploaded)) => {
                if !self.etag_matches.is_empty()
                    && !self
                        .etag_matches
                        .iter()
                        .any(|e| e == "*" || trim_etag(e) == etag)
                {
                    return false;
                }
                if self
                    .etag_does_not_match
                    .iter()
                    .any(|e| e == "*" || trim_etag(e) == etag)
                {
                    return false;
                }
                if let Some(before) = self.uploaded_before {
                    if uploaded >= before {
                        return false;
                    }
                }
                if let Some(after) = self.uploaded_after {
                    if uploaded <= after {
                        return false;
                    }
                }
                true
            }
        }
    }
}

fn trim_etag(etag: &str) -> &str {
    etag.trim_matches('"')
}

#[derive(Debug, Clone, Copy)]
pub enum R2Range {
    /// Starting offset with optional length.
    Offset { offset: u64, length: Option<u64> },
    /// Last `n` bytes.
    Suffix(u64),
}

impl R2Range {
    /// Resolve against the object size, clamping out-of-bounds lengths.
    fn resolve(self, size: u64) -> (u64, u64) {
        match self {
            R2Range::Offset { offset, length } => {
                let offset = offset.min(size);
                let max = size - offset;
                (offset, length.unwrap_or(max).min(max))
            }
            R2Range::Suffix(n) => {
                let n = n.min(size);
                (size - n, n)
            }
        }
    }
}

// ─── Options ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct R2PutOptions {
    pub http_metadata: HashMap<String, String>,
    pub custom_metadata: HashMap<String, String>,
    pub only_if: Option<R2Conditional>,
    /// Expected checksums, hex-encoded, keyed by `md5|sha1|sha256|sha384|sha512`.
    pub checksums: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct R2GetOptions {
    pub only_if: Option<R2Conditional>,
    pub range: Option<R2Range>,
}

#[derive(Debug, Clone, Default)]
pub struct R2ListOptions {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

#[derive(Debug)]
pub struct R2Objects {
    pub objects: Vec<R2Object>,
    pub truncated: bool,
    pub cursor: Option<String>,
    pub delimited_prefixes: Vec<String>,
}

// ─── Bucket ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct R2Bucket {
    pool: SqlitePool,
    bucket: String,
    dir: PathBuf,
    limits: R2Limits,
    tracer: BindingTracer,
}

type ObjectRow = (
    String,
    i64,
    String,
    String,
    i64,
    String,
    String,
    String,
);

impl R2Bucket {
    pub fn new(
        pool: SqlitePool,
        bucket: impl Into<String>,
        dir: PathBuf,
        limits: R2Limits,
        tracer: BindingTracer,
    ) -> Self {
        Self {
            pool,
            bucket: bucket.into(),
            dir,
            limits,
            tracer,
        }
    }

    fn validate_key(&self, key: &str) -> Result<()> {
        if key.is_empty() || key.len() > self.limits.max_key_bytes {
            return Err(R2Error::InvalidKey(format!("bad length {}", key.len())).into());
        }
        // Never let a key escape the bucket directory.
        if key.split(['/', '\\']).any(|seg| seg == "..") || key.starts_with('/') {
            return Err(R2Error::InvalidKey(key.to_string()).into());
        }
        Ok(())
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    fn row_to_object(row: ObjectRow) -> R2Object {
        let (key, size, etag, version, uploaded, http_metadata, custom_metadata, checksums) = row;
        R2Object {
            key,
            size,
            etag,
            version,
            uploaded,
            http_metadata: serde_json::from_str(&http_metadata).unwrap_or_default(),
            custom_metadata: serde_json::from_str(&custom_metadata).unwrap_or_default(),
            checksums: serde_json::from_str(&checksums).unwrap_or_default(),
            range: None,
        }
    }

    async fn fetch_row(&self, key: &str) -> Result<Option<R2Object>> {
        let row: Option<ObjectRow> = sqlx::query_as(
            "SELECT key, size, etag, version, uploaded, http_metadata, custom_metadata, checksums
             FROM r2_objects WHERE bucket = ? AND key = ?",
        )
        .bind(&self.bucket)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Self::row_to_object))
    }

    // ─── Single-object operations ─────────────────────────────────────────

    /// Store an object. Returns `None` when `only_if` failed (nothing is
    /// written in that case).
    pub async fn put(
        &self,
        key: &str,
        data: impl Into<Bytes>,
        opts: R2PutOptions,
    ) -> Result<Option<R2Object>> {
        let mut span = self.tracer.span("put", Some(key));
        let result = self.put_inner(key, data.into(), opts).await;
        if let Err(ref e) = result {
            span.fail(e);
        }
        result
    }

    async fn put_inner(
        &self,
        key: &str,
        data: Bytes,
        opts: R2PutOptions,
    ) -> Result<Option<R2Object>> {
        self.validate_key(key)?;
        let custom_json = serde_json::to_string(&opts.custom_metadata)?;
        if custom_json.len() > self.limits.max_custom_metadata_bytes {
            return Err(R2Error::MetadataTooLarge(custom_json.len()).into());
        }

        if let Some(cond) = &opts.only_if {
            let existing = self.fetch_row(key).await?;
            let current = existing.as_ref().map(|o| (o.etag.as_str(), o.uploaded));
            if !cond.check(current) {
                return Ok(None);
            }
        }

        let mut checksums = compute_checksums(&data, &opts.checksums)?;
        let etag = checksums
            .entry("md5".to_string())
            .or_insert_with(|| hex_digest::<Md5>(&data))
            .clone();

        // Write body: temp file then rename, last writer wins.
        let path = self.object_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;

        let version = Uuid::new_v4().to_string();
        let uploaded = now_ms();
        sqlx::query(
            "INSERT INTO r2_objects
               (bucket, key, size, etag, version, uploaded, http_metadata, custom_metadata, checksums)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(bucket, key) DO UPDATE SET
               size = excluded.size,
               etag = excluded.etag,
               version = excluded.version,
               uploaded = excluded.uploaded,
               http_metadata = excluded.http_metadata,
               custom_metadata = excluded.custom_metadata,
               checksums = excluded.checksums",
        )
        .bind(&self.bucket)
        .bind(key)
        .bind(data.len() as i64)
        .bind(&etag)
        .bind(&version)
        .bind(uploaded)
        .bind(serde_json::to_string(&opts.http_metadata)?)
        .bind(&custom_json)
        .bind(serde_json::to_string(&checksums)?)
        .execute(&self.pool)
        .await?;

        Ok(Some(R2Object {
            key: key.to_string(),
            size: data.len() as i64,
            etag,
            version,
            uploaded,
            http_metadata: opts.http_metadata,
            custom_metadata: opts.custom_metadata,
            checksums,
            range: None,
        }))
    }

    pub async fn head(&self, key: &str) -> Result<Option<R2Object>> {
        let _span = self.tracer.span("head", Some(key));
        self.validate_key(key)?;
        self.fetch_row(key).await
    }

    pub async fn get(&self, key: &str, opts: R2GetOptions) -> Result<Option<R2GetResult>> {
        let _span = self.tracer.span("get", Some(key));
        self.validate_key(key)?;
        let Some(mut object) = self.fetch_row(key).await? else {
            return Ok(None);
        };

        if let Some(cond) = &opts.only_if {
            if !cond.check(Some((object.etag.as_str(), object.uploaded))) {
                return Ok(Some(R2GetResult::PreconditionFailed(object)));
            }
        }

        let body = tokio::fs::read(self.object_path(key)).await?;
        let body = match opts.range {
            None => Bytes::from(body),
            Some(range) => {
                let (offset, length) = range.resolve(body.len() as u64);
                object.range = Some((offset, length));
                Bytes::from(body).slice(offset as usize..(offset + length) as usize)
            }
        };
        Ok(Some(R2GetResult::Body(object, body)))
    }

    pub async fn delete(&self, keys: &[&str]) -> Result<()> {
        let _span = self.tracer.span("delete", keys.first().copied());
        if keys.len() > self.limits.max_batch_delete {
            return Err(R2Error::TooManyDeletes(keys.len()).into());
        }
        for key in keys {
            self.validate_key(key)?;
            sqlx::query("DELETE FROM r2_objects WHERE bucket = ? AND key = ?")
                .bind(&self.bucket)
                .bind(key)
                .execute(&self.pool)
                .await?;
            match tokio::fs::remove_file(self.object_path(key)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    // ─── Listing ──────────────────────────────────────────────────────────

    /// List objects in key order. With a delimiter, keys that share a prefix
    /// up to the next delimiter collapse into `delimited_prefixes`.
    pub async fn list(&self, opts: R2ListOptions) -> Result<R2Objects> {
        let _span = self.tracer.span("list", opts.prefix.as_deref());
        let prefix = opts.prefix.clone().unwrap_or_default();
        let pattern = format!("{}%", super::kv::escape_like(&prefix));
        let rows: Vec<ObjectRow> = sqlx::query_as(
            "SELECT key, size, etag, version, uploaded, http_metadata, custom_metadata, checksums
             FROM r2_objects WHERE bucket = ? AND key LIKE ? ESCAPE '\\' ORDER BY key ASC",
        )
        .bind(&self.bucket)
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await?;

        // Entries (objects + first occurrence of each delimited prefix) in
        // key order; the cursor is an opaque offset into this entry list.
        enum Entry {
            Object(R2Object),
            Prefix(String),
        }
        let mut entries: Vec<Entry> = Vec::new();
        let mut seen_prefixes: std::collections::HashSet<String> = Default::default();
        for row in rows {
            let object = Self::row_to_object(row);
            if let Some(delim) = opts.delimiter.as_deref() {
                let suffix = &object.key[prefix.len()..];
                if let Some(pos) = suffix.find(delim) {
                    let group = format!("{}{}{}", prefix, &suffix[..pos], delim);
                    if seen_prefixes.insert(group.clone()) {
                        entries.push(Entry::Prefix(group));
                    }
                    continue;
                }
            }
            entries.push(Entry::Object(object));
        }

        let offset = opts
            .cursor
            .as_deref()
            .map(decode_cursor)
            .transpose()?
            .unwrap_or(0);
        let limit = opts.limit.unwrap_or(1000).max(1);
        let total = entries.len();
        let page: Vec<Entry> = entries
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect();
        let consumed = offset + page.len();
        let truncated = consumed < total;

        let mut objects = Vec::new();
        let mut delimited_prefixes = Vec::new();
        for entry in page {
            match entry {
                Entry::Object(o) => objects.push(o),
                Entry::Prefix(p) => delimited_prefixes.push(p),
            }
        }
        Ok(R2Objects {
            objects,
            truncated,
            cursor: truncated.then(|| encode_cursor(consumed)),
            delimited_prefixes,
        })
    }

    // ─── Multipart ────────────────────────────────────────────────────────

    pub async fn create_multipart_upload(
        &self,
        key: &str,
        opts: R2PutOptions,
    ) -> Result<R2MultipartUpload> {
        let _span = self.tracer.span("createMultipartUpload", Some(key));
        self.validate_key(key)?;
        let upload_id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO r2_multipart_uploads
               (upload_id, bucket, key, http_metadata, custom_metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&upload_id)
        .bind(&self.bucket)
        .bind(key)
        .bind(serde_json::to_string(&opts.http_metadata)?)
        .bind(serde_json::to_string(&opts.custom_metadata)?)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(R2MultipartUpload {
            bucket: self.clone(),
            key: key.to_string(),
            upload_id,
        })
    }

    /// Rehydrate a handle for an in-progress upload. Validation of the id is
    /// deferred to the first operation, matching the platform.
    pub fn resume_multipart_upload(&self, key: &str, upload_id: &str) -> R2MultipartUpload {
        R2MultipartUpload {
            bucket: self.clone(),
            key: key.to_string(),
            upload_id: upload_id.to_string(),
        }
    }

    fn multipart_dir(&self, upload_id: &str) -> PathBuf {
        self.dir.join("__multipart__").join(upload_id)
    }
}

// ─── Multipart upload handle ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct R2UploadedPart {
    pub part_number: u16,
    pub etag: String,
}

pub struct R2MultipartUpload {
    bucket: R2Bucket,
    pub key: String,
    pub upload_id: String,
}

impl R2MultipartUpload {
    async fn assert_exists(&self) -> Result<()> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT key FROM r2_multipart_uploads WHERE upload_id = ?")
                .bind(&self.upload_id)
                .fetch_optional(&self.bucket.pool)
                .await?;
        if row.is_none() {
            return Err(R2Error::UnknownUpload.into());
        }
        Ok(())
    }

    pub async fn upload_part(&self, part_number: u16, data: impl Into<Bytes>) -> Result<R2UploadedPart> {
        let _span = self.bucket.tracer.span("uploadPart", Some(&self.key));
        self.assert_exists().await?;
        let data = data.into();
        let dir = self.bucket.multipart_dir(&self.upload_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("part-{part_number}"));
        tokio::fs::write(&path, &data).await?;
        let etag = hex_digest::<Md5>(&data);
        sqlx::query(
            "INSERT INTO r2_multipart_parts (upload_id, part_number, etag, size, path)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(upload_id, part_number) DO UPDATE SET
               etag = excluded.etag, size = excluded.size, path = excluded.path",
        )
        .bind(&self.upload_id)
        .bind(part_number as i64)
        .bind(&etag)
        .bind(data.len() as i64)
        .bind(path.to_string_lossy().as_ref())
        .execute(&self.bucket.pool)
        .await?;
        Ok(R2UploadedPart { part_number, etag })
    }

    /// Atomically assemble the final object: either it appears with every
    /// part reflected, or nothing changes.
    pub async fn complete(&self, parts: Vec<R2UploadedPart>) -> Result<R2Object> {
        let _span = self.bucket.tracer.span("completeMultipartUpload", Some(&self.key));
        self.assert_exists().await?;
        if parts.len() as u32 > self.bucket.limits.max_parts {
            return Err(R2Error::TooManyParts(parts.len() as u32).into());
        }
        let meta_row: (String, String) = sqlx::query_as(
            "SELECT http_metadata, custom_metadata FROM r2_multipart_uploads WHERE upload_id = ?",
        )
        .bind(&self.upload_id)
        .fetch_one(&self.bucket.pool)
        .await?;

        let mut parts = parts;
        parts.sort_by_key(|p| p.part_number);

        // Validate caller-supplied etags before touching the filesystem.
        let mut paths = Vec::with_capacity(parts.len());
        for part in &parts {
            let row: Option<(String, String)> = sqlx::query_as(
                "SELECT etag, path FROM r2_multipart_parts WHERE upload_id = ? AND part_number = ?",
            )
            .bind(&self.upload_id)
            .bind(part.part_number as i64)
            .fetch_optional(&self.bucket.pool)
            .await?;
            match row {
                Some((etag, path)) if trim_etag(&part.etag) == etag => paths.push(path),
                _ => return Err(R2Error::EtagMismatch(part.part_number).into()),
            }
        }

        // Concatenate into a temp file, then a single rename publishes it.
        let final_path = self.bucket.object_path(&self.key);
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = final_path.with_extension(format!("tmp-{}", Uuid::new_v4()));
        let mut assembled: Vec<u8> = Vec::new();
        for path in &paths {
            assembled.extend_from_slice(&tokio::fs::read(path).await?);
        }
        let etag = hex_digest::<Md5>(&assembled);
        let size = assembled.len() as i64;
        tokio::fs::write(&tmp, &assembled).await?;
        tokio::fs::rename(&tmp, &final_path).await?;

        let version = Uuid::new_v4().to_string();
        let uploaded = now_ms();
        let checksums = serde_json::to_string(&HashMap::from([("md5".to_string(), etag.clone())]))?;
        let mut tx = self.bucket.pool.begin().await?;
        sqlx::query(
            "INSERT INTO r2_objects
               (bucket, key, size, etag, version, uploaded, http_metadata, custom_metadata, checksums)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(bucket, key) DO UPDATE SET
               size = excluded.size,
               etag = excluded.etag,
               version = excluded.version,
               uploaded = excluded.uploaded,
               http_metadata = excluded.http_metadata,
               custom_metadata = excluded.custom_metadata,
               checksums = excluded.checksums",
        )
        .bind(&self.bucket.bucket)
        .bind(&self.key)
        .bind(size)
        .bind(&etag)
        .bind(&version)
        .bind(uploaded)
        .bind(&meta_row.0)
        .bind(&meta_row.1)
        .bind(&checksums)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM r2_multipart_parts WHERE upload_id = ?")
            .bind(&self.upload_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM r2_multipart_uploads WHERE upload_id = ?")
            .bind(&self.upload_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let _ = tokio::fs::remove_dir_all(self.bucket.multipart_dir(&self.upload_id)).await;

        Ok(R2Object {
            key: self.key.clone(),
            size,
            etag,
            version,
            uploaded,
            http_metadata: serde_json::from_str(&meta_row.0).unwrap_or_default(),
            custom_metadata: serde_json::from_str(&meta_row.1).unwrap_or_default(),
            checksums: HashMap::from([("md5".to_string(), hex_digest::<Md5>(&assembled))]),
            range: None,
        })
    }

    /// Drop the upload and its parts without creating an object.
    pub async fn abort(&self) -> Result<()> {
        let _span = self.bucket.tracer.span("abortMultipartUpload", Some(&self.key));
        self.assert_exists().await?;
        sqlx::query("DELETE FROM r2_multipart_parts WHERE upload_id = ?")
            .bind(&self.upload_id)
            .execute(&self.bucket.pool)
            .await?;
        sqlx::query("DELETE FROM r2_multipart_uploads WHERE upload_id = ?")
            .bind(&self.upload_id)
            .execute(&self.bucket.pool)
            .await?;
        let _ = tokio::fs::remove_dir_all(self.bucket.multipart_dir(&self.upload_id)).await;
        Ok(())
    }
}

// ─── Checksums ────────────────────────────────────────────────────────────────

fn hex_digest<D: md5::Digest>(data: &[u8]) -> String {
    let mut hasher = D::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verify any caller-supplied checksums and return the stored map. Computed
/// digests are compared case-insensitively against the expected hex.
fn compute_checksums(
    data: &[u8],
    expected: &HashMap<String, String>,
) -> Result<HashMap<String, String>> {
    let mut out = HashMap::new();
    for (alg, want) in expected {
        let got = match alg.as_str() {
            "md5" => hex_digest::<Md5>(data),
            "sha1" => hex_digest::<Sha1>(data),
            "sha256" => hex_digest::<Sha256>(data),
            "sha384" => hex_digest::<Sha384>(data),
            "sha512" => hex_digest::<Sha512>(data),
            other => return Err(R2Error::ChecksumMismatch(format!("unsupported {other}")).into()),
        };
        if !got.eq_ignore_ascii_case(want) {
            return Err(R2Error::ChecksumMismatch(alg.clone()).into());
        }
        out.insert(alg.clone(), got);
    }
    Ok(out)
}

fn encode_cursor(offset: usize) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(offset.to_string())
}

fn decode_cursor(cursor: &str) -> Result<usize> {
    let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| anyhow::anyhow!("invalid list cursor"))?;
    String::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("invalid list cursor"))
}
