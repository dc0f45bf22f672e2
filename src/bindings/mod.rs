//! Local implementations of the platform bindings and the env mapping the
//! worker observes.

pub mod assets;
pub mod cache;
pub mod container;
pub mod d1;
pub mod durable;
pub mod images;
pub mod kv;
pub mod queue;
pub mod r2;
pub mod service;
pub mod workflow;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde_json::Value;

/// One env slot. Every variant is a cheap clone (Arc-backed handles).
#[derive(Clone)]
pub enum Binding {
    Var(String),
    Json(Value),
    Kv(kv::KvNamespace),
    R2(r2::R2Bucket),
    D1(d1::D1Database),
    Queue(queue::QueueProducer),
    DurableObject(durable::DoNamespace),
    Workflow(workflow::WorkflowBinding),
    Service(service::ServiceBinding),
    Assets(assets::AssetsBinding),
    Images(images::ImagesBinding),
}

impl Binding {
    pub fn kind(&self) -> &'static str {
        match self {
            Binding::Var(_) => "var",
            Binding::Json(_) => "json",
            Binding::Kv(_) => "kv",
            Binding::R2(_) => "r2",
            Binding::D1(_) => "d1",
            Binding::Queue(_) => "queue",
            Binding::DurableObject(_) => "durable_object",
            Binding::Workflow(_) => "workflow",
            Binding::Service(_) => "service",
            Binding::Assets(_) => "assets",
            Binding::Images(_) => "images",
        }
    }
}

/// The env value handed to worker entrypoints: slot name → binding handle.
/// A generation owns exactly one env; handles never cross generations.
/// The default cache rides along so worker code can reach the `caches`
/// global without a configured slot.
#[derive(Clone, Default)]
pub struct Env {
    slots: Arc<HashMap<String, Binding>>,
    cache: Option<cache::CacheBinding>,
}

impl Env {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(slots: HashMap<String, Binding>) -> Self {
        Self {
            slots: Arc::new(slots),
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: cache::CacheBinding) -> Self {
        self.cache = Some(cache);
        self
    }

    /// The process-wide default cache (`caches.default`).
    pub fn caches(&self) -> Result<&cache::CacheBinding> {
        self.cache
            .as_ref()
            .ok_or_else(|| anyhow!("default cache is not attached to this env"))
    }

    pub fn get(&self, slot: &str) -> Option<&Binding> {
        self.slots.get(slot)
    }

    pub fn slot_names(&self) -> impl Iterator<Item = (&str, &'static str)> {
        self.slots.iter().map(|(k, v)| (k.as_str(), v.kind()))
    }

    fn require<'a, T: ?Sized>(
        &'a self,
        slot: &str,
        kind: &'static str,
        pick: impl FnOnce(&'a Binding) -> Option<&'a T>,
    ) -> Result<&'a T> {
        let binding = self
            .slots
            .get(slot)
            .ok_or_else(|| anyhow!("env has no binding named '{slot}'"))?;
        pick(binding).ok_or_else(|| anyhow!("binding '{slot}' is not a {kind}"))
    }

    pub fn var(&self, slot: &str) -> Result<&str> {
        self.require(slot, "var", |b| match b {
            Binding::Var(v) => Some(v.as_str()),
            _ => None,
        })
    }

    pub fn kv(&self, slot: &str) -> Result<&kv::KvNamespace> {
        self.require(slot, "KV namespace", |b| match b {
            Binding::Kv(h) => Some(h),
            _ => None,
        })
    }

    pub fn r2(&self, slot: &str) -> Result<&r2::R2Bucket> {
        self.require(slot, "R2 bucket", |b| match b {
            Binding::R2(h) => Some(h),
            _ => None,
        })
    }

    pub fn d1(&self, slot: &str) -> Result<&d1::D1Database> {
        self.require(slot, "D1 database", |b| match b {
            Binding::D1(h) => Some(h),
            _ => None,
        })
    }

    pub fn queue(&self, slot: &str) -> Result<&queue::QueueProducer> {
        self.require(slot, "queue producer", |b| match b {
            Binding::Queue(h) => Some(h),
            _ => None,
        })
    }

    pub fn durable_object(&self, slot: &str) -> Result<&durable::DoNamespace> {
        self.require(slot, "Durable Object namespace", |b| match b {
            Binding::DurableObject(h) => Some(h),
            _ => None,
        })
    }

    pub fn workflow(&self, slot: &str) -> Result<&workflow::WorkflowBinding> {
        self.require(slot, "workflow", |b| match b {
            Binding::Workflow(h) => Some(h),
            _ => None,
        })
    }

    pub fn service(&self, slot: &str) -> Result<&service::ServiceBinding> {
        self.require(slot, "service binding", |b| match b {
            Binding::Service(h) => Some(h),
            _ => None,
        })
    }

    pub fn assets(&self, slot: &str) -> Result<&assets::AssetsBinding> {
        self.require(slot, "assets binding", |b| match b {
            Binding::Assets(h) => Some(h),
            _ => None,
        })
    }

    pub fn images(&self, slot: &str) -> Result<&images::ImagesBinding> {
        self.require(slot, "images binding", |b| match b {
            Binding::Images(h) => Some(h),
            _ => None,
        })
    }
}
