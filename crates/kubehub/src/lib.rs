//! OAM kubehub: the object-store boundary and its kube-rs backed implementation.

#![forbid(unsafe_code)]

pub mod memory;

use std::time::Duration;

use anyhow::{anyhow, Context};
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{self, Scope},
    Client,
};
use metrics::counter;
use oam_core::{Document, ObjectKey, TraitDefinition};
use serde_json::Value as Json;
use tracing::debug;

pub use memory::{MemoryDefinitions, MemoryStore};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(ObjectKey),
    #[error("conflict: {key} changed since resourceVersion {seen:?}")]
    Conflict { key: ObjectKey, seen: Option<String> },
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    /// Conflicts and timeouts clear up on a later pass.
    pub fn is_transient(&self) -> bool { matches!(self, StoreError::Conflict { .. } | StoreError::Timeout(_)) }
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
}

/// Options for create-or-update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOptions {
    pub field_manager: String,
    pub force: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self { Self { field_manager: "oam-runtime".into(), force: true } }
}

/// Persistence boundary. Implementations hold no cache of objects.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the live object.
    async fn get(&self, key: &ObjectKey) -> Result<Document, StoreError>;
    /// Create or update; applying the same document twice is a no-op the second time.
    async fn apply(&self, doc: &Document, opts: &ApplyOptions) -> Result<Document, StoreError>;
    /// Replace, conditioned on `metadata.resourceVersion` matching the live object.
    async fn update(&self, doc: &Document) -> Result<Document, StoreError>;
}

/// Looks up the definition object governing a trait instance.
#[async_trait::async_trait]
pub trait DefinitionProvider: Send + Sync {
    async fn trait_definition(&self, trait_doc: &Document) -> Result<TraitDefinition, StoreError>;
}

pub async fn get_kube_client() -> anyhow::Result<Client> {
    Client::try_default().await.context("building kube client from current context")
}

pub fn parse_gvk(api_version: &str, kind: &str) -> Result<GroupVersionKind, StoreError> {
    if api_version.is_empty() || kind.is_empty() {
        return Err(StoreError::Invalid(format!("missing apiVersion/kind ({:?}/{:?})", api_version, kind)));
    }
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    Ok(GroupVersionKind { group, version, kind: kind.to_string() })
}

/// `<plural>.<group>`, or just `<plural>` for the core group.
pub fn definition_name(plural: &str, group: &str) -> String {
    if group.is_empty() { plural.to_string() } else { format!("{}.{}", plural, group) }
}

fn strip_for_apply(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
    }
    v
}

/// Store backed by the cluster's API server via dynamic objects.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn try_default() -> anyhow::Result<Self> { Ok(Self::new(get_kube_client().await?)) }

    async fn find_api_resource(&self, api_version: &str, kind: &str) -> Result<(ApiResource, bool), StoreError> {
        let gvk = parse_gvk(api_version, kind)?;
        let (ar, caps) = discovery::pinned_kind(&self.client, &gvk)
            .await
            .with_context(|| format!("resolving API resource for {} {}", api_version, kind))?;
        Ok((ar, matches!(caps.scope, Scope::Namespaced)))
    }

    async fn api_for(&self, key: &ObjectKey) -> Result<Api<DynamicObject>, StoreError> {
        let (ar, namespaced) = self.find_api_resource(&key.api_version, &key.kind).await?;
        if !namespaced {
            return Ok(Api::all_with(self.client.clone(), &ar));
        }
        match key.namespace.as_deref() {
            Some(ns) => Ok(Api::namespaced_with(self.client.clone(), ns, &ar)),
            None => Err(StoreError::Invalid(format!("namespace required for namespaced kind {}", key.kind))),
        }
    }
}

fn map_kube_err(e: kube::Error, key: &ObjectKey, seen: Option<&str>) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(key.clone()),
        kube::Error::Api(ae) if ae.code == 409 => {
            counter!("store_conflict_total", 1u64);
            StoreError::Conflict { key: key.clone(), seen: seen.map(|s| s.to_string()) }
        }
        other => StoreError::Backend(anyhow::Error::new(other).context(key.to_string())),
    }
}

fn to_document(obj: &DynamicObject) -> Result<Document, StoreError> {
    let v = serde_json::to_value(obj).context("serializing DynamicObject")?;
    Ok(Document::new(v))
}

fn to_dynamic(v: Json) -> Result<DynamicObject, StoreError> {
    serde_json::from_value(v).map_err(|e| StoreError::Invalid(format!("not a kubernetes object: {}", e)))
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Document, StoreError> {
        let api = self.api_for(key).await?;
        let obj = api.get(&key.name).await.map_err(|e| map_kube_err(e, key, None))?;
        to_document(&obj)
    }

    async fn apply(&self, doc: &Document, opts: &ApplyOptions) -> Result<Document, StoreError> {
        let key = doc.key();
        if key.name.is_empty() {
            return Err(StoreError::Invalid(format!("{} {} has no metadata.name", key.api_version, key.kind)));
        }
        let api = self.api_for(&key).await?;
        let mut pp = PatchParams::apply(&opts.field_manager);
        if opts.force { pp = pp.force(); }
        let body = strip_for_apply(doc.as_json().clone());
        let obj = api.patch(&key.name, &pp, &Patch::Apply(&body)).await.map_err(|e| map_kube_err(e, &key, None))?;
        debug!(object = %key, rv = ?obj.metadata.resource_version, "applied");
        to_document(&obj)
    }

    async fn update(&self, doc: &Document) -> Result<Document, StoreError> {
        let key = doc.key();
        let seen = doc
            .resource_version()
            .ok_or_else(|| StoreError::Invalid(format!("update of {} without metadata.resourceVersion", key)))?;
        let api = self.api_for(&key).await?;
        let obj = to_dynamic(doc.as_json().clone())?;
        let out = api
            .replace(&key.name, &PostParams::default(), &obj)
            .await
            .map_err(|e| map_kube_err(e, &key, Some(seen)))?;
        debug!(object = %key, rv = ?out.metadata.resource_version, "updated");
        to_document(&out)
    }
}

#[async_trait::async_trait]
impl DefinitionProvider for KubeStore {
    async fn trait_definition(&self, trait_doc: &Document) -> Result<TraitDefinition, StoreError> {
        let (ar, _) = self.find_api_resource(trait_doc.api_version(), trait_doc.kind()).await?;
        let key = ObjectKey {
            api_version: TraitDefinition::API_VERSION.to_string(),
            kind: TraitDefinition::KIND.to_string(),
            namespace: trait_doc.namespace().map(|s| s.to_string()),
            name: definition_name(&ar.plural, &ar.group),
        };
        let doc = self.get(&key).await?;
        TraitDefinition::from_document(&doc)
            .map_err(|e| StoreError::Backend(anyhow!("decoding trait definition {}: {}", key.name, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_from_api_version() {
        let g = parse_gvk("core.oam.dev/v1alpha2", "ManualScalerTrait").unwrap();
        assert_eq!((g.group.as_str(), g.version.as_str(), g.kind.as_str()), ("core.oam.dev", "v1alpha2", "ManualScalerTrait"));
        let g = parse_gvk("v1", "ConfigMap").unwrap();
        assert!(g.group.is_empty());
        assert!(matches!(parse_gvk("", "X"), Err(StoreError::Invalid(_))));
    }

    #[test]
    fn definition_names_follow_crd_naming() {
        assert_eq!(definition_name("manualscalertraits", "core.oam.dev"), "manualscalertraits.core.oam.dev");
        assert_eq!(definition_name("services", ""), "services");
    }

    #[test]
    fn apply_body_drops_server_bookkeeping() {
        let v = serde_json::json!({
            "metadata": { "name": "x", "resourceVersion": "9", "managedFields": [ {} ], "labels": { "a": "b" } },
            "spec": { "k": 1 }
        });
        let out = strip_for_apply(v);
        assert_eq!(out, serde_json::json!({ "metadata": { "name": "x", "labels": { "a": "b" } }, "spec": { "k": 1 } }));
    }

    #[test]
    fn transient_errors() {
        let key = ObjectKey { api_version: "v1".into(), kind: "K".into(), namespace: None, name: "n".into() };
        assert!(StoreError::Conflict { key: key.clone(), seen: None }.is_transient());
        assert!(StoreError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!StoreError::NotFound(key).is_transient());
        assert!(!StoreError::Cancelled.is_transient());
    }
}
