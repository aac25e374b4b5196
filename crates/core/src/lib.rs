//! OAM core types: documents, typed references and prior workload status.

#![forbid(unsafe_code)]

pub mod fieldpath;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub use fieldpath::{kind_of, FieldPath, PathError, Segment};

/// Identity triple used to reference workloads and scopes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

impl TypedReference {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self { api_version: api_version.into(), kind: kind.into(), name: name.into() }
    }

    /// Structural match against a raw membership-list entry.
    /// Entries that are not objects never match.
    pub fn matches(&self, entry: &Json) -> bool {
        let field = |k: &str| entry.get(k).and_then(|v| v.as_str());
        field("apiVersion") == Some(self.api_version.as_str())
            && field("kind") == Some(self.kind.as_str())
            && field("name") == Some(self.name.as_str())
    }

    pub fn to_json(&self) -> Json {
        serde_json::json!({ "apiVersion": self.api_version, "kind": self.kind, "name": self.name })
    }

    /// Store key for this reference inside `namespace`.
    pub fn key_in(&self, namespace: Option<&str>) -> ObjectKey {
        ObjectKey {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            namespace: namespace.map(|s| s.to_string()),
            name: self.name.clone(),
        }
    }
}

impl fmt::Display for TypedReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.api_version, self.kind, self.name)
    }
}

/// Address of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {} {}/{}", self.api_version, self.kind, ns, self.name),
            None => write!(f, "{} {} {}", self.api_version, self.kind, self.name),
        }
    }
}

/// A semi-structured object as stored by the API server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Document(pub Json);

impl Document {
    pub fn new(value: Json) -> Self { Self(value) }

    fn str_at(&self, outer: Option<&str>, key: &str) -> Option<&str> {
        let base = match outer {
            Some(o) => self.0.get(o)?,
            None => &self.0,
        };
        base.get(key).and_then(|v| v.as_str())
    }

    pub fn api_version(&self) -> &str { self.str_at(None, "apiVersion").unwrap_or("") }
    pub fn kind(&self) -> &str { self.str_at(None, "kind").unwrap_or("") }
    pub fn name(&self) -> &str { self.str_at(Some("metadata"), "name").unwrap_or("") }
    pub fn namespace(&self) -> Option<&str> { self.str_at(Some("metadata"), "namespace").filter(|s| !s.is_empty()) }
    pub fn resource_version(&self) -> Option<&str> {
        self.str_at(Some("metadata"), "resourceVersion").filter(|s| !s.is_empty())
    }

    pub fn set_resource_version(&mut self, rv: &str) {
        let Some(obj) = self.0.as_object_mut() else { return };
        let meta = obj.entry("metadata").or_insert(Json::Object(serde_json::Map::new()));
        if let Some(m) = meta.as_object_mut() {
            m.insert("resourceVersion".into(), Json::String(rv.to_string()));
        }
    }

    pub fn typed_reference(&self) -> TypedReference {
        TypedReference::new(self.api_version(), self.kind(), self.name())
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            api_version: self.api_version().to_string(),
            kind: self.kind().to_string(),
            namespace: self.namespace().map(|s| s.to_string()),
            name: self.name().to_string(),
        }
    }

    pub fn get(&self, path: &FieldPath) -> Result<&Json, PathError> { path.get(&self.0) }
    pub fn get_opt(&self, path: &FieldPath) -> Result<Option<&Json>, PathError> { path.get_opt(&self.0) }
    pub fn set(&mut self, path: &FieldPath, value: Json) -> Result<(), PathError> { path.set(&mut self.0, value) }

    pub fn as_json(&self) -> &Json { &self.0 }
    pub fn into_json(self) -> Json { self.0 }
}

impl From<Json> for Document {
    fn from(v: Json) -> Self { Self(v) }
}

/// One scope a workload was recorded as a member of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadScope {
    pub scope_ref: TypedReference,
}

/// Prior-pass record of an applied workload and its scope memberships.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_name: Option<String>,
    pub workload_ref: TypedReference,
    #[serde(default)]
    pub scopes: Vec<WorkloadScope>,
}

/// Desired state of one workload for a pass: the workload document plus
/// the traits and scopes attached to it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workload {
    pub workload: Document,
    #[serde(default)]
    pub traits: Vec<Document>,
    #[serde(default)]
    pub scopes: Vec<Document>,
}

impl Workload {
    pub fn reference(&self) -> TypedReference { self.workload.typed_reference() }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionReference {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TraitDefinitionSpec {
    #[serde(default)]
    pub definition_ref: DefinitionReference,
    /// Where a trait instance wants its owning workload's reference written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_ref_path: Option<String>,
    #[serde(default)]
    pub revision_enabled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applies_to_workloads: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TraitDefinition {
    pub name: String,
    pub spec: TraitDefinitionSpec,
}

impl TraitDefinition {
    pub const API_VERSION: &'static str = "core.oam.dev/v1alpha2";
    pub const KIND: &'static str = "TraitDefinition";

    pub fn from_document(doc: &Document) -> Result<Self, serde_json::Error> {
        let spec = match doc.as_json().get("spec") {
            Some(s) => serde_json::from_value(s.clone())?,
            None => TraitDefinitionSpec::default(),
        };
        Ok(Self { name: doc.name().to_string(), spec })
    }

    /// The requested stamp path; an empty string means none.
    pub fn workload_ref_path(&self) -> Option<&str> {
        self.spec.workload_ref_path.as_deref().filter(|p| !p.is_empty())
    }
}

pub mod prelude {
    pub use super::{
        Document, FieldPath, ObjectKey, PathError, TraitDefinition, TypedReference, Workload, WorkloadScope,
        WorkloadStatus,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn document_identity_accessors() {
        let d = Document::new(json!({
            "apiVersion": "core.oam.dev/v1alpha2",
            "kind": "ContainerizedWorkload",
            "metadata": { "name": "web", "namespace": "prod", "resourceVersion": "7" }
        }));
        assert_eq!(d.typed_reference(), TypedReference::new("core.oam.dev/v1alpha2", "ContainerizedWorkload", "web"));
        assert_eq!(d.namespace(), Some("prod"));
        assert_eq!(d.resource_version(), Some("7"));
        assert_eq!(d.key().to_string(), "core.oam.dev/v1alpha2 ContainerizedWorkload prod/web");
    }

    #[test]
    fn reference_matches_raw_entries_structurally() {
        let r = TypedReference::new("v1", "K", "a");
        assert!(r.matches(&json!({ "apiVersion": "v1", "kind": "K", "name": "a", "uid": "x" })));
        assert!(!r.matches(&json!({ "apiVersion": "v1", "kind": "K", "name": "b" })));
        assert!(!r.matches(&json!({ "kind": "K", "name": "a" })));
        assert!(!r.matches(&json!("v1/K/a")));
        assert_eq!(serde_json::to_value(&r).unwrap(), r.to_json());
    }

    #[test]
    fn status_uses_wire_names() {
        let st: WorkloadStatus = serde_json::from_value(json!({
            "componentName": "web",
            "workloadRef": { "apiVersion": "v1", "kind": "K", "name": "web" },
            "scopes": [ { "scopeRef": { "apiVersion": "v1", "kind": "S", "name": "s1" } } ]
        }))
        .unwrap();
        assert_eq!(st.scopes[0].scope_ref.name, "s1");
    }

    #[test]
    fn empty_workload_ref_path_means_none() {
        let doc = Document::new(json!({ "metadata": { "name": "x" }, "spec": { "workloadRefPath": "" } }));
        assert_eq!(TraitDefinition::from_document(&doc).unwrap().workload_ref_path(), None);
        let doc = Document::new(json!({ "metadata": { "name": "x" }, "spec": { "workloadRefPath": "spec.workloadRef" } }));
        assert_eq!(TraitDefinition::from_document(&doc).unwrap().workload_ref_path(), Some("spec.workloadRef"));
    }
}
