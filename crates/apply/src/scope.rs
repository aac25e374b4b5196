//! Scope membership: joining, leaving, and working out which scopes a
//! workload has left since the previous pass.
//!
//! A scope's membership list is a plain JSON array of `{apiVersion, kind, name}`
//! entries. Joins and leaves are read-modify-write cycles against the live scope,
//! written back with a resourceVersion-conditioned update so a concurrent writer
//! turns into a conflict instead of a lost update.

use metrics::counter;
use oam_core::{kind_of, Document, FieldPath, ObjectKey, PathError, TypedReference, Workload, WorkloadStatus};
use oam_kubehub::{DefinitionProvider, ObjectStore};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{ApplyError, Workloads};

/// A workload that must be removed from a scope it no longer belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Departure {
    pub workload: TypedReference,
    pub scope: TypedReference,
}

/// Pairs recorded in `status` that the desired `workloads` no longer keep.
///
/// A workload still present only keeps the scopes it still lists; a workload
/// gone from the set leaves every scope it was recorded in.
pub fn departures(status: &[WorkloadStatus], workloads: &[Workload]) -> Vec<Departure> {
    let mut out = Vec::new();
    for st in status {
        // later entries win when a reference repeats
        let current = workloads.iter().rev().find(|w| w.reference() == st.workload_ref);
        for ws in &st.scopes {
            let kept = current.is_some_and(|w| w.scopes.iter().any(|s| s.typed_reference() == ws.scope_ref));
            if !kept {
                out.push(Departure { workload: st.workload_ref.clone(), scope: ws.scope_ref.clone() });
            }
        }
    }
    out
}

fn members(doc: &Document, path: &FieldPath) -> Result<Vec<Json>, PathError> {
    match doc.get_opt(path)? {
        None | Some(Json::Null) => Ok(Vec::new()),
        Some(Json::Array(items)) => Ok(items.clone()),
        Some(other) => Err(PathError::TypeMismatch { path: path.to_string(), expected: "array", found: kind_of(other) }),
    }
}

/// Append `member` unless an equal entry exists. Returns whether `doc` changed.
pub fn add_member(doc: &mut Document, path: &FieldPath, member: &TypedReference) -> Result<bool, PathError> {
    let mut refs = members(doc, path)?;
    if refs.iter().any(|e| member.matches(e)) {
        return Ok(false);
    }
    refs.push(member.to_json());
    doc.set(path, Json::Array(refs))?;
    Ok(true)
}

/// Drop the entry equal to `member`. Order of the remaining entries is not kept.
/// Returns whether `doc` changed.
pub fn remove_member(doc: &mut Document, path: &FieldPath, member: &TypedReference) -> Result<bool, PathError> {
    let mut refs = members(doc, path)?;
    let Some(idx) = refs.iter().position(|e| member.matches(e)) else {
        return Ok(false);
    };
    refs.swap_remove(idx);
    doc.set(path, Json::Array(refs))?;
    Ok(true)
}

impl<S: ObjectStore, D: DefinitionProvider> Workloads<S, D> {
    async fn fetch_scope(
        &self,
        cancel: &CancellationToken,
        key: &ObjectKey,
        workload: &TypedReference,
    ) -> Result<Document, ApplyError> {
        self.call(cancel, self.store.get(key)).await.map_err(|e| {
            ApplyError::store(e, |source| ApplyError::ApplyScope { key: key.clone(), workload: workload.clone(), source })
        })
    }

    async fn write_scope(
        &self,
        cancel: &CancellationToken,
        key: &ObjectKey,
        workload: &TypedReference,
        doc: &Document,
    ) -> Result<(), ApplyError> {
        self.call(cancel, self.store.update(doc)).await.map(|_| ()).map_err(|e| {
            ApplyError::store(e, |source| ApplyError::ApplyScope { key: key.clone(), workload: workload.clone(), source })
        })
    }

    /// Add `workload` to `scope`'s membership list. Returns false when it was
    /// already a member and nothing was written.
    pub async fn join_scope(
        &self,
        cancel: &CancellationToken,
        namespace: Option<&str>,
        scope: &Document,
        workload: &TypedReference,
    ) -> Result<bool, ApplyError> {
        let key = scope.typed_reference().key_in(namespace);
        let mut live = self.fetch_scope(cancel, &key, workload).await?;
        let path = &self.config.scope_refs_path;
        let changed = add_member(&mut live, path, workload).map_err(|source| ApplyError::ScopeMembership {
            key: key.clone(),
            workload: workload.clone(),
            source,
        })?;
        if !changed {
            debug!(scope = %key, workload = %workload, "already a member");
            return Ok(false);
        }
        self.write_scope(cancel, &key, workload, &live).await?;
        counter!("scope_join_total", 1u64);
        debug!(scope = %key, workload = %workload, "joined scope");
        Ok(true)
    }

    /// Remove `workload` from the scope named by `scope`. Returns false when
    /// the reference was already absent and nothing was written.
    pub async fn leave_scope(
        &self,
        cancel: &CancellationToken,
        namespace: Option<&str>,
        workload: &TypedReference,
        scope: &TypedReference,
    ) -> Result<bool, ApplyError> {
        let key = scope.key_in(namespace);
        let mut live = self.fetch_scope(cancel, &key, workload).await?;
        let path = &self.config.scope_refs_path;
        let changed = remove_member(&mut live, path, workload).map_err(|source| ApplyError::ScopeMembership {
            key: key.clone(),
            workload: workload.clone(),
            source,
        })?;
        if !changed {
            debug!(scope = %key, workload = %workload, "not a member; nothing to remove");
            return Ok(false);
        }
        self.write_scope(cancel, &key, workload, &live).await?;
        counter!("scope_leave_total", 1u64);
        debug!(scope = %key, workload = %workload, "left scope");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oam_core::WorkloadScope;
    use serde_json::json;

    fn r(kind: &str, name: &str) -> TypedReference { TypedReference::new("core.oam.dev/v1alpha2", kind, name) }

    fn doc(kind: &str, name: &str) -> Document {
        Document::new(json!({ "apiVersion": "core.oam.dev/v1alpha2", "kind": kind, "metadata": { "name": name } }))
    }

    fn status(name: &str, scopes: &[&str]) -> WorkloadStatus {
        WorkloadStatus {
            component_name: None,
            workload_ref: r("ContainerizedWorkload", name),
            scopes: scopes.iter().map(|s| WorkloadScope { scope_ref: r("HealthScope", s) }).collect(),
        }
    }

    fn workload(name: &str, scopes: &[&str]) -> Workload {
        Workload {
            workload: doc("ContainerizedWorkload", name),
            traits: vec![],
            scopes: scopes.iter().map(|s| doc("HealthScope", s)).collect(),
        }
    }

    fn refs_path() -> FieldPath { FieldPath::parse("spec.workloadRefs").unwrap() }

    #[test]
    fn departures_narrow_to_dropped_scopes() {
        let d = departures(&[status("web", &["a", "b"])], &[workload("web", &["a"])]);
        assert_eq!(d, vec![Departure { workload: r("ContainerizedWorkload", "web"), scope: r("HealthScope", "b") }]);
    }

    #[test]
    fn departures_cover_every_scope_of_a_removed_workload() {
        let d = departures(&[status("gone", &["a", "b"])], &[workload("web", &["a"])]);
        let scopes: Vec<_> = d.iter().map(|d| d.scope.name.as_str()).collect();
        assert_eq!(scopes, ["a", "b"]);
        assert!(d.iter().all(|d| d.workload.name == "gone"));
    }

    #[test]
    fn departures_empty_when_nothing_changed() {
        assert!(departures(&[status("web", &["a"])], &[workload("web", &["a", "c"])]).is_empty());
        assert!(departures(&[], &[workload("web", &["a"])]).is_empty());
    }

    #[test]
    fn scope_identity_compares_kind_too() {
        let mut st = status("web", &["a"]);
        st.scopes[0].scope_ref.kind = "OtherScope".into();
        assert_eq!(departures(&[st], &[workload("web", &["a"])]).len(), 1);
    }

    #[test]
    fn add_member_deduplicates_and_keeps_other_fields() {
        let mut s = Document::new(json!({
            "apiVersion": "core.oam.dev/v1alpha2", "kind": "HealthScope",
            "metadata": { "name": "h", "labels": { "x": "y" } },
            "spec": { "probe-timeout": 5 }
        }));
        let w = r("ContainerizedWorkload", "web");
        assert!(add_member(&mut s, &refs_path(), &w).unwrap());
        assert!(!add_member(&mut s, &refs_path(), &w).unwrap());
        assert_eq!(s.0["spec"]["workloadRefs"], json!([w.to_json()]));
        assert_eq!(s.0["spec"]["probe-timeout"], json!(5));
        assert_eq!(s.0["metadata"]["labels"], json!({ "x": "y" }));
    }

    #[test]
    fn remove_member_is_a_noop_when_absent() {
        let a = r("ContainerizedWorkload", "a");
        let b = r("ContainerizedWorkload", "b");
        let c = r("ContainerizedWorkload", "c");
        let mut s = doc("HealthScope", "h");
        s.0["spec"] = json!({ "workloadRefs": [a.to_json(), b.to_json(), c.to_json()] });
        assert!(remove_member(&mut s, &refs_path(), &a).unwrap());
        assert!(!remove_member(&mut s, &refs_path(), &a).unwrap());
        let left = s.0["spec"]["workloadRefs"].as_array().unwrap();
        assert_eq!(left.len(), 2);
        assert!(left.iter().any(|e| b.matches(e)) && left.iter().any(|e| c.matches(e)));

        let mut empty = doc("HealthScope", "e");
        assert!(!remove_member(&mut empty, &refs_path(), &a).unwrap());
        assert_eq!(empty, doc("HealthScope", "e"));
    }

    #[test]
    fn malformed_membership_list_is_an_error() {
        let mut s = doc("HealthScope", "h");
        s.0["spec"] = json!({ "workloadRefs": "web" });
        let w = r("ContainerizedWorkload", "web");
        assert!(matches!(add_member(&mut s, &refs_path(), &w), Err(PathError::TypeMismatch { .. })));
        assert!(matches!(remove_member(&mut s, &refs_path(), &w), Err(PathError::TypeMismatch { .. })));
    }
}
