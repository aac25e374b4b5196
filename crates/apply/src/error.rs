use oam_core::{ObjectKey, PathError, TypedReference};
use oam_kubehub::StoreError;

/// Errors that abort an apply pass. Each names the object being handled.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("the application has no component")]
    NoComponent,
    #[error("cannot apply workload {key}")]
    ApplyWorkload { key: ObjectKey, source: StoreError },
    #[error("cannot find trait definition {key}")]
    TraitDefinition { key: ObjectKey, source: StoreError },
    #[error("cannot set trait {key} reference to {workload}")]
    StampTrait { key: ObjectKey, workload: TypedReference, source: PathError },
    #[error("cannot apply trait {key}")]
    ApplyTrait { key: ObjectKey, source: StoreError },
    #[error("cannot change membership of workload {workload} in scope {key}")]
    ScopeMembership { key: ObjectKey, workload: TypedReference, source: PathError },
    #[error("cannot apply scope {key} for workload {workload}")]
    ApplyScope { key: ObjectKey, workload: TypedReference, source: StoreError },
    #[error("apply pass cancelled")]
    Cancelled,
}

impl ApplyError {
    /// Wrap a store failure; cancellation surfaces as `Cancelled` whatever the call was.
    pub(crate) fn store(source: StoreError, wrap: impl FnOnce(StoreError) -> ApplyError) -> Self {
        match source {
            StoreError::Cancelled => ApplyError::Cancelled,
            other => wrap(other),
        }
    }

    /// True when a later pass may succeed without any input change.
    pub fn is_transient(&self) -> bool {
        match self {
            ApplyError::ApplyWorkload { source, .. }
            | ApplyError::TraitDefinition { source, .. }
            | ApplyError::ApplyTrait { source, .. }
            | ApplyError::ApplyScope { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool { matches!(self, ApplyError::Cancelled) }

    /// Identity of the object the pass failed on, when there is one.
    pub fn object(&self) -> Option<&ObjectKey> {
        match self {
            ApplyError::ApplyWorkload { key, .. }
            | ApplyError::TraitDefinition { key, .. }
            | ApplyError::StampTrait { key, .. }
            | ApplyError::ApplyTrait { key, .. }
            | ApplyError::ScopeMembership { key, .. }
            | ApplyError::ApplyScope { key, .. } => Some(key),
            ApplyError::NoComponent | ApplyError::Cancelled => None,
        }
    }
}
