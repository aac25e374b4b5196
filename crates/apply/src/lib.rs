//! OAM apply: converge workloads, their traits and scope memberships in one pass.
//!
//! A pass upserts each workload in input order, stamps every trait whose
//! definition asks for it with a reference to the owning workload, upserts
//! the trait, joins the workload into its scopes, and finally removes the
//! workload from scopes it has left since the previous pass.

#![forbid(unsafe_code)]

mod error;
pub mod scope;

use std::future::Future;
use std::str::FromStr;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use oam_core::{Document, FieldPath, Workload, WorkloadStatus};
use oam_kubehub::{ApplyOptions, DefinitionProvider, ObjectStore, StoreError};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

pub use error::ApplyError;
pub use scope::{departures, Departure};

/// Where scopes keep their membership list unless configured otherwise.
pub const DEFAULT_SCOPE_REFS_PATH: [&str; 2] = ["spec", "workloadRefs"];

/// Which of a workload's attached scopes a pass joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeJoin {
    /// Only the first attached scope, as the controller has always behaved.
    #[default]
    First,
    /// Every attached scope.
    All,
}

impl FromStr for ScopeJoin {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" => Ok(ScopeJoin::First),
            "all" => Ok(ScopeJoin::All),
            other => Err(format!("unknown scope join mode {:?} (expect first|all)", other)),
        }
    }
}

/// Knobs for an apply pass.
#[derive(Debug, Clone)]
pub struct ApplyConfig {
    /// Which attached scopes each workload joins.
    pub scope_join: ScopeJoin,
    /// Where a scope keeps its membership list.
    pub scope_refs_path: FieldPath,
    /// Field manager and force flag for workload and trait upserts.
    pub apply: ApplyOptions,
    /// Upper bound for each individual storage call.
    pub call_timeout: Option<Duration>,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            scope_join: ScopeJoin::default(),
            scope_refs_path: FieldPath::from_fields(DEFAULT_SCOPE_REFS_PATH),
            apply: ApplyOptions::default(),
            call_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl ApplyConfig {
    /// Defaults overridden by `OAM_SCOPE_JOIN`, `OAM_SCOPE_REFS_PATH`,
    /// `OAM_FIELD_MANAGER` and `OAM_CALL_TIMEOUT_MS` (0 disables the timeout).
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(v) = get("OAM_SCOPE_JOIN") {
            match v.parse() {
                Ok(j) => cfg.scope_join = j,
                Err(e) => warn!(error = %e, "ignoring OAM_SCOPE_JOIN"),
            }
        }
        if let Some(v) = get("OAM_SCOPE_REFS_PATH") {
            match FieldPath::parse(&v) {
                Ok(p) => cfg.scope_refs_path = p,
                Err(e) => warn!(error = %e, "ignoring OAM_SCOPE_REFS_PATH"),
            }
        }
        if let Some(v) = get("OAM_FIELD_MANAGER").filter(|s| !s.is_empty()) {
            cfg.apply.field_manager = v;
        }
        if let Some(v) = get("OAM_CALL_TIMEOUT_MS") {
            match v.parse::<u64>() {
                Ok(0) => cfg.call_timeout = None,
                Ok(ms) => cfg.call_timeout = Some(Duration::from_millis(ms)),
                Err(e) => warn!(error = %e, value = %v, "ignoring OAM_CALL_TIMEOUT_MS"),
            }
        }
        cfg
    }
}

/// Counts of what a successful pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassSummary {
    pub workloads_applied: usize,
    pub traits_applied: usize,
    pub traits_stamped: usize,
    pub scopes_joined: usize,
    /// Joins where the workload was already a member.
    pub joins_skipped: usize,
    /// Attached scopes left alone under `ScopeJoin::First`.
    pub scopes_unprocessed: usize,
    pub scopes_left: usize,
    /// Departures where the reference was already gone.
    pub leaves_skipped: usize,
}

/// Creates or updates workloads and their traits, and keeps scope
/// memberships in step.
#[async_trait::async_trait]
pub trait WorkloadApplicator: Send + Sync {
    async fn apply(
        &self,
        cancel: &CancellationToken,
        status: &[WorkloadStatus],
        workloads: &[Workload],
    ) -> Result<PassSummary, ApplyError>;
}

/// Applicator over an object store and a trait-definition provider.
pub struct Workloads<S, D> {
    store: S,
    definitions: D,
    config: ApplyConfig,
}

impl<S: ObjectStore, D: DefinitionProvider> Workloads<S, D> {
    pub fn new(store: S, definitions: D, config: ApplyConfig) -> Self { Self { store, definitions, config } }

    pub fn store(&self) -> &S { &self.store }

    pub fn config(&self) -> &ApplyConfig { &self.config }

    /// Run one storage call under the pass's cancellation token and the
    /// per-call timeout. Nothing is started once the token is cancelled.
    pub(crate) async fn call<T, F>(&self, cancel: &CancellationToken, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>> + Send,
        T: Send,
    {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let bounded = async {
            match self.config.call_timeout {
                Some(d) => match tokio::time::timeout(d, fut).await {
                    Ok(r) => r,
                    Err(_) => Err(StoreError::Timeout(d)),
                },
                None => fut.await,
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StoreError::Cancelled),
            r = bounded => r,
        }
    }

    /// The field path at which `trait_doc` wants its workload reference, if any.
    /// A definition that cannot be fetched fails the pass.
    pub async fn workload_ref_path(
        &self,
        cancel: &CancellationToken,
        trait_doc: &Document,
    ) -> Result<Option<String>, ApplyError> {
        let def = self
            .call(cancel, self.definitions.trait_definition(trait_doc))
            .await
            .map_err(|e| ApplyError::store(e, |source| ApplyError::TraitDefinition { key: trait_doc.key(), source }))?;
        Ok(def.workload_ref_path().map(|s| s.to_string()))
    }

    async fn apply_traits(
        &self,
        cancel: &CancellationToken,
        wl: &Workload,
        applied: &Document,
        summary: &mut PassSummary,
    ) -> Result<(), ApplyError> {
        let workload_ref = applied.typed_reference();
        for t in &wl.traits {
            let mut trait_doc = t.clone();
            if let Some(raw) = self.workload_ref_path(cancel, t).await? {
                FieldPath::parse(&raw)
                    .and_then(|path| trait_doc.set(&path, workload_ref.to_json()))
                    .map_err(|source| ApplyError::StampTrait { key: t.key(), workload: workload_ref.clone(), source })?;
                summary.traits_stamped += 1;
            }
            self.call(cancel, self.store.apply(&trait_doc, &self.config.apply))
                .await
                .map_err(|e| ApplyError::store(e, |source| ApplyError::ApplyTrait { key: t.key(), source }))?;
            summary.traits_applied += 1;
        }
        Ok(())
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        status: &[WorkloadStatus],
        workloads: &[Workload],
    ) -> Result<PassSummary, ApplyError> {
        let first = workloads.first().ok_or(ApplyError::NoComponent)?;
        // one pass, one namespace
        let namespace = first.workload.namespace();
        let mut summary = PassSummary::default();

        for wl in workloads {
            let applied = self
                .call(cancel, self.store.apply(&wl.workload, &self.config.apply))
                .await
                .map_err(|e| ApplyError::store(e, |source| ApplyError::ApplyWorkload { key: wl.workload.key(), source }))?;
            summary.workloads_applied += 1;
            let workload_ref = applied.typed_reference();

            self.apply_traits(cancel, wl, &applied, &mut summary).await?;

            let take = match self.config.scope_join {
                ScopeJoin::First => wl.scopes.len().min(1),
                ScopeJoin::All => wl.scopes.len(),
            };
            if take < wl.scopes.len() {
                debug!(workload = %workload_ref, skipped = wl.scopes.len() - take, "joining first attached scope only");
                summary.scopes_unprocessed += wl.scopes.len() - take;
            }
            for s in &wl.scopes[..take] {
                if self.join_scope(cancel, namespace, s, &workload_ref).await? {
                    summary.scopes_joined += 1;
                } else {
                    summary.joins_skipped += 1;
                }
            }
        }

        for d in departures(status, workloads) {
            if self.leave_scope(cancel, namespace, &d.workload, &d.scope).await? {
                summary.scopes_left += 1;
            } else {
                summary.leaves_skipped += 1;
            }
        }
        Ok(summary)
    }
}

#[async_trait::async_trait]
impl<S: ObjectStore, D: DefinitionProvider> WorkloadApplicator for Workloads<S, D> {
    async fn apply(
        &self,
        cancel: &CancellationToken,
        status: &[WorkloadStatus],
        workloads: &[Workload],
    ) -> Result<PassSummary, ApplyError> {
        let t0 = Instant::now();
        counter!("apply_pass_total", 1u64);
        let span = info_span!("apply_pass", workloads = workloads.len(), prior = status.len());
        let res = self.run(cancel, status, workloads).instrument(span).await;
        match &res {
            Ok(summary) => {
                histogram!("apply_pass_ms", t0.elapsed().as_secs_f64() * 1000.0);
                info!(
                    workloads = summary.workloads_applied,
                    traits = summary.traits_applied,
                    joined = summary.scopes_joined,
                    left = summary.scopes_left,
                    "apply pass converged"
                );
            }
            Err(_) => {
                counter!("apply_pass_err", 1u64);
            }
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_join_parses_case_insensitively() {
        assert_eq!("All".parse::<ScopeJoin>().unwrap(), ScopeJoin::All);
        assert_eq!(" first ".parse::<ScopeJoin>().unwrap(), ScopeJoin::First);
        assert!("some".parse::<ScopeJoin>().is_err());
    }

    #[test]
    fn config_defaults_keep_observed_behavior() {
        let cfg = ApplyConfig::default();
        assert_eq!(cfg.scope_join, ScopeJoin::First);
        assert_eq!(cfg.scope_refs_path.as_str(), "spec.workloadRefs");
        assert_eq!(cfg.apply.field_manager, "oam-runtime");
    }

    #[test]
    fn config_from_lookup_overrides_and_ignores_garbage() {
        let cfg = ApplyConfig::from_lookup(|k| match k {
            "OAM_SCOPE_JOIN" => Some("all".into()),
            "OAM_SCOPE_REFS_PATH" => Some("spec.members".into()),
            "OAM_CALL_TIMEOUT_MS" => Some("0".into()),
            "OAM_FIELD_MANAGER" => Some("me".into()),
            _ => None,
        });
        assert_eq!(cfg.scope_join, ScopeJoin::All);
        assert_eq!(cfg.scope_refs_path.as_str(), "spec.members");
        assert_eq!(cfg.call_timeout, None);
        assert_eq!(cfg.apply.field_manager, "me");

        let cfg = ApplyConfig::from_lookup(|k| match k {
            "OAM_SCOPE_JOIN" => Some("sometimes".into()),
            "OAM_SCOPE_REFS_PATH" => Some("spec..x".into()),
            "OAM_CALL_TIMEOUT_MS" => Some("soon".into()),
            _ => None,
        });
        assert_eq!(cfg.scope_join, ScopeJoin::First);
        assert_eq!(cfg.scope_refs_path.as_str(), "spec.workloadRefs");
        assert_eq!(cfg.call_timeout, Some(Duration::from_secs(30)));
    }
}
