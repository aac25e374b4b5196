//! In-process store with API-server-like resourceVersion semantics.

use std::collections::HashMap;
use std::sync::Mutex;

use oam_core::{Document, ObjectKey, TraitDefinition, TraitDefinitionSpec};
use serde_json::Value as Json;

use crate::{ApplyOptions, DefinitionProvider, ObjectStore, StoreError};

#[derive(Default)]
struct Inner {
    objects: HashMap<ObjectKey, Document>,
    last_rv: u64,
    writes: u64,
}

impl Inner {
    fn next_rv(&mut self) -> String {
        self.last_rv += 1;
        self.last_rv.to_string()
    }
}

/// Every `apply` and `update` call counts as a write, changed or not.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

fn without_rv(doc: &Document) -> Json {
    let mut v = doc.as_json().clone();
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("resourceVersion");
    }
    v
}

fn check_identity(key: &ObjectKey) -> Result<(), StoreError> {
    if key.api_version.is_empty() || key.kind.is_empty() || key.name.is_empty() {
        return Err(StoreError::Invalid(format!("incomplete identity: {}", key)));
    }
    Ok(())
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Seed an object without counting a write.
    pub fn insert(&self, mut doc: Document) -> Document {
        let mut inner = self.lock();
        let rv = inner.next_rv();
        doc.set_resource_version(&rv);
        inner.objects.insert(doc.key(), doc.clone());
        doc
    }

    pub fn get_doc(&self, key: &ObjectKey) -> Option<Document> { self.lock().objects.get(key).cloned() }

    /// All stored objects, ordered by key.
    pub fn snapshot(&self) -> Vec<Document> {
        let mut docs: Vec<_> = self.lock().objects.values().cloned().collect();
        docs.sort_by_key(|d| d.key().to_string());
        docs
    }

    pub fn writes(&self) -> u64 { self.lock().writes }

    pub fn len(&self) -> usize { self.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Document, StoreError> {
        self.lock().objects.get(key).cloned().ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn apply(&self, doc: &Document, _opts: &ApplyOptions) -> Result<Document, StoreError> {
        let key = doc.key();
        check_identity(&key)?;
        let mut inner = self.lock();
        inner.writes += 1;
        if let Some(live) = inner.objects.get(&key) {
            if without_rv(live) == without_rv(doc) {
                return Ok(live.clone());
            }
        }
        let mut stored = Document::new(without_rv(doc));
        let rv = inner.next_rv();
        stored.set_resource_version(&rv);
        inner.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update(&self, doc: &Document) -> Result<Document, StoreError> {
        let key = doc.key();
        check_identity(&key)?;
        let mut inner = self.lock();
        inner.writes += 1;
        let live_rv = match inner.objects.get(&key) {
            Some(live) => live.resource_version().map(|s| s.to_string()),
            None => return Err(StoreError::NotFound(key)),
        };
        if doc.resource_version().is_none() || doc.resource_version() != live_rv.as_deref() {
            return Err(StoreError::Conflict { key, seen: doc.resource_version().map(|s| s.to_string()) });
        }
        let mut stored = doc.clone();
        let rv = inner.next_rv();
        stored.set_resource_version(&rv);
        inner.objects.insert(key, stored.clone());
        Ok(stored)
    }
}

/// Trait definitions keyed by the trait's apiVersion and kind.
#[derive(Default)]
pub struct MemoryDefinitions {
    defs: HashMap<(String, String), TraitDefinition>,
}

impl MemoryDefinitions {
    pub fn new() -> Self { Self::default() }

    pub fn define(mut self, api_version: &str, kind: &str, workload_ref_path: Option<&str>) -> Self {
        let def = TraitDefinition {
            name: format!("{}s", kind.to_lowercase()),
            spec: TraitDefinitionSpec { workload_ref_path: workload_ref_path.map(|s| s.to_string()), ..Default::default() },
        };
        self.defs.insert((api_version.to_string(), kind.to_string()), def);
        self
    }
}

#[async_trait::async_trait]
impl DefinitionProvider for MemoryDefinitions {
    async fn trait_definition(&self, trait_doc: &Document) -> Result<TraitDefinition, StoreError> {
        self.defs
            .get(&(trait_doc.api_version().to_string(), trait_doc.kind().to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(ObjectKey {
                api_version: TraitDefinition::API_VERSION.to_string(),
                kind: TraitDefinition::KIND.to_string(),
                namespace: None,
                name: format!("{}s", trait_doc.kind().to_lowercase()),
            }))
    }
}
