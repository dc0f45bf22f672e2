//! Worker configuration: the validated record the dispatch core builds a
//! generation from.
//!
//! Accepted formats are JSON-with-comments (`wrangler.jsonc`) and TOML
//! (`wrangler.toml`). Environment overrides under `env.<name>` shallow-merge
//! into the base; `.dev.vars` next to the config file supplies local
//! secrets. The record is immutable after load — one per generation.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file {0} not found")]
    NotFound(String),
    #[error("unsupported config format '{0}' (expected .json, .jsonc or .toml)")]
    UnsupportedFormat(String),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("worker 'name' is required")]
    MissingName,
    #[error("worker 'main' entrypoint is required")]
    MissingMain,
    #[error("duplicate binding name '{0}'")]
    DuplicateBinding(String),
    #[error("invalid cron '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },
    #[error("unknown environment '{0}'")]
    UnknownEnv(String),
}

// ─── Binding sections ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct KvNamespaceConfig {
    pub binding: String,
    pub id: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct R2BucketConfig {
    pub binding: String,
    pub bucket_name: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct D1DatabaseConfig {
    pub binding: String,
    pub database_name: String,
    #[serde(default)]
    pub database_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct DurableObjectsSection {
    #[serde(default)]
    pub bindings: Vec<DurableObjectBindingConfig>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DurableObjectBindingConfig {
    pub name: String,
    pub class_name: String,
    #[serde(default)]
    pub script_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct WorkflowConfig {
    pub binding: String,
    pub name: String,
    pub class_name: String,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct QueuesSection {
    #[serde(default)]
    pub producers: Vec<QueueProducerConfig>,
    #[serde(default)]
    pub consumers: Vec<QueueConsumerSection>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct QueueProducerConfig {
    pub binding: String,
    pub queue: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct QueueConsumerSection {
    pub queue: String,
    #[serde(default)]
    pub max_batch_size: Option<i64>,
    #[serde(default)]
    pub max_retries: Option<i64>,
    #[serde(default)]
    pub dead_letter_queue: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ServiceConfig {
    pub binding: String,
    pub service: String,
    #[serde(default)]
    pub entrypoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct TriggersSection {
    #[serde(default)]
    pub crons: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AssetsConfig {
    pub directory: String,
    #[serde(default)]
    pub binding: Option<String>,
    #[serde(default)]
    pub html_handling: Option<String>,
    #[serde(default)]
    pub not_found_handling: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ImagesConfig {
    pub binding: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ContainerConfig {
    pub class_name: String,
    pub image: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub max_instances: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MigrationConfig {
    pub tag: String,
    #[serde(default)]
    pub new_classes: Vec<String>,
    #[serde(default)]
    pub new_sqlite_classes: Vec<String>,
    #[serde(default)]
    pub deleted_classes: Vec<String>,
}

// ─── Raw file shape ───────────────────────────────────────────────────────────

/// The on-disk shape, shared by the base document and `env.<name>` blocks.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub main: Option<String>,
    #[serde(default)]
    pub compatibility_date: Option<String>,
    #[serde(default)]
    pub vars: HashMap<String, Value>,
    #[serde(default)]
    pub kv_namespaces: Vec<KvNamespaceConfig>,
    #[serde(default)]
    pub r2_buckets: Vec<R2BucketConfig>,
    #[serde(default)]
    pub d1_databases: Vec<D1DatabaseConfig>,
    #[serde(default)]
    pub durable_objects: DurableObjectsSection,
    #[serde(default)]
    pub workflows: Vec<WorkflowConfig>,
    #[serde(default)]
    pub queues: QueuesSection,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub triggers: TriggersSection,
    #[serde(default)]
    pub assets: Option<AssetsConfig>,
    #[serde(default)]
    pub images: Option<ImagesConfig>,
    #[serde(default)]
    pub containers: Vec<ContainerConfig>,
    #[serde(default)]
    pub migrations: Vec<MigrationConfig>,
    #[serde(default)]
    pub env: HashMap<String, RawConfig>,
}

// ─── Validated record ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub name: String,
    pub main: String,
    pub compatibility_date: Option<String>,
    pub vars: HashMap<String, Value>,
    pub kv_namespaces: Vec<KvNamespaceConfig>,
    pub r2_buckets: Vec<R2BucketConfig>,
    pub d1_databases: Vec<D1DatabaseConfig>,
    pub durable_objects: Vec<DurableObjectBindingConfig>,
    pub workflows: Vec<WorkflowConfig>,
    pub queue_producers: Vec<QueueProducerConfig>,
    pub queue_consumers: Vec<QueueConsumerSection>,
    pub services: Vec<ServiceConfig>,
    pub crons: Vec<String>,
    pub assets: Option<AssetsConfig>,
    pub images: Option<ImagesConfig>,
    pub containers: Vec<ContainerConfig>,
    pub migrations: Vec<MigrationConfig>,
}

impl WorkerConfig {
    /// Load and validate a config file, optionally selecting an
    /// `env.<name>` override block and merging `.dev.vars`.
    pub fn load(path: &Path, env_name: Option<&str>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::NotFound(path.display().to_string()))?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        let raw: RawConfig = match extension.as_str() {
            "json" | "jsonc" => serde_json::from_str(&strip_jsonc(&content))
                .map_err(|e| ConfigError::Parse(e.to_string()))?,
            "toml" => toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };

        let mut config = Self::from_raw(raw, env_name)?;

        // `.dev.vars` next to the config file wins over `vars`.
        let dev_vars = path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(".dev.vars");
        if let Ok(content) = std::fs::read_to_string(&dev_vars) {
            for (key, value) in parse_dev_vars(&content) {
                config.vars.insert(key, Value::String(value));
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Resolve the raw document (plus env override) into the validated
    /// record. Exposed for tests and embedders that build configs in code.
    pub fn from_raw(mut raw: RawConfig, env_name: Option<&str>) -> Result<Self, ConfigError> {
        if let Some(env_name) = env_name {
            let Some(override_block) = raw.env.remove(env_name) else {
                return Err(ConfigError::UnknownEnv(env_name.to_string()));
            };
            raw = shallow_merge(raw, override_block);
        }
        Ok(Self {
            name: raw.name.unwrap_or_default(),
            main: raw.main.unwrap_or_default(),
            compatibility_date: raw.compatibility_date,
            vars: raw.vars,
            kv_namespaces: raw.kv_namespaces,
            r2_buckets: raw.r2_buckets,
            d1_databases: raw.d1_databases,
            durable_objects: raw.durable_objects.bindings,
            workflows: raw.workflows,
            queue_producers: raw.queues.producers,
            queue_consumers: raw.queues.consumers,
            services: raw.services,
            crons: raw.triggers.crons,
            assets: raw.assets,
            images: raw.images,
            containers: raw.containers,
            migrations: raw.migrations,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingName);
        }
        if self.main.trim().is_empty() {
            return Err(ConfigError::MissingMain);
        }

        let mut seen = std::collections::HashSet::new();
        let mut check = |binding: &str| -> Result<(), ConfigError> {
            if !seen.insert(binding.to_string()) {
                return Err(ConfigError::DuplicateBinding(binding.to_string()));
            }
            Ok(())
        };
        for kv in &self.kv_namespaces {
            check(&kv.binding)?;
        }
        for r2 in &self.r2_buckets {
            check(&r2.binding)?;
        }
        for d1 in &self.d1_databases {
            check(&d1.binding)?;
        }
        for durable in &self.durable_objects {
            check(&durable.name)?;
        }
        for workflow in &self.workflows {
            check(&workflow.binding)?;
        }
        for producer in &self.queue_producers {
            check(&producer.binding)?;
        }
        for service in &self.services {
            check(&service.binding)?;
        }
        if let Some(images) = &self.images {
            check(&images.binding)?;
        }
        if let Some(assets) = &self.assets {
            if let Some(binding) = &assets.binding {
                check(binding)?;
            }
        }
        for var in self.vars.keys() {
            if seen.contains(var) {
                warn!(var = %var, "var name shadows a binding; the binding wins");
            }
        }

        for expr in &self.crons {
            crate::cron::parse_cron(expr).map_err(|e| ConfigError::InvalidCron {
                expr: expr.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// The container config for a DO class, if that class is
    /// container-enabled.
    pub fn container_for_class(&self, class_name: &str) -> Option<&ContainerConfig> {
        self.containers.iter().find(|c| c.class_name == class_name)
    }
}

/// Override fields replace base fields when present/non-empty; `vars` merge
/// key-by-key. This is the platform's shallow-merge rule.
fn shallow_merge(mut base: RawConfig, over: RawConfig) -> RawConfig {
    if over.name.is_some() {
        base.name = over.name;
    }
    if over.main.is_some() {
        base.main = over.main;
    }
    if over.compatibility_date.is_some() {
        base.compatibility_date = over.compatibility_date;
    }
    for (key, value) in over.vars {
        base.vars.insert(key, value);
    }
    if !over.kv_namespaces.is_empty() {
        base.kv_namespaces = over.kv_namespaces;
    }
    if !over.r2_buckets.is_empty() {
        base.r2_buckets = over.r2_buckets;
    }
    if !over.d1_databases.is_empty() {
        base.d1_databases = over.d1_databases;
    }
    if !over.durable_objects.bindings.is_empty() {
        base.durable_objects = over.durable_objects;
    }
    if !over.workflows.is_empty() {
        base.workflows = over.workflows;
    }
    if !over.queues.producers.is_empty() || !over.queues.consumers.is_empty() {
        base.queues = over.queues;
    }
    if !over.services.is_empty() {
        base.services = over.services;
    }
    if !over.triggers.crons.is_empty() {
        base.triggers = over.triggers;
    }
    if over.assets.is_some() {
        base.assets = over.assets;
    }
    if over.images.is_some() {
        base.images = over.images;
    }
    if !over.containers.is_empty() {
        base.containers = over.containers;
    }
    base
}

/// Strip `//` and `/* */` comments (outside strings) and trailing commas so
/// serde_json accepts a JSONC document.
pub fn strip_jsonc(input: &str) -> String {
    let bytes: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        match c {
            '"' => {
                out.push(c);
                i += 1;
                while i < bytes.len() {
                    out.push(bytes[i]);
                    if bytes[i] == '\\' && i + 1 < bytes.len() {
                        out.push(bytes[i + 1]);
                        i += 2;
                        continue;
                    }
                    if bytes[i] == '"' {
                        i += 1;
                        break;
                    }
                    i += 1;
                }
            }
            '/' if i + 1 < bytes.len() && bytes[i + 1] == '/' => {
                while i < bytes.len() && bytes[i] != '\n' {
                    i += 1;
                }
            }
            '/' if i + 1 < bytes.len() && bytes[i + 1] == '*' => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == '*' && bytes[i + 1] == '/') {
                    i += 1;
                }
                i = (i + 2).min(bytes.len());
            }
            ',' => {
                // Drop a trailing comma: next non-whitespace is } or ].
                let mut j = i + 1;
                while j < bytes.len() && bytes[j].is_whitespace() {
                    j += 1;
                }
                if j < bytes.len() && (bytes[j] == '}' || bytes[j] == ']') {
                    i += 1;
                    continue;
                }
                out.push(c);
                i += 1;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// `.dev.vars`: `KEY=VALUE` lines, `#` comments, optional surrounding
/// quotes on values.
pub fn parse_dev_vars(content: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            out.push((key.trim().to_string(), value.to_string()));
        }
    }
    out
}
