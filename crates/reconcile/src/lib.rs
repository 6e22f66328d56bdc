//! funk reconciler: drives create/update/delete of a function's resource
//! set and tracks convergence phase.
//!
//! One `Deployer` owns all reconcile state; there is no process-wide
//! singleton. The cluster itself is the system of record: after a `Failed`
//! cycle or a process restart, state is re-derived by inspection rather
//! than trusted from memory.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use funk_cluster::{AppliedResource, ClusterClient, ClusterError, LogLine, LogOptions, StreamHandle};
use funk_manifest::{ready_predicate, BindError, Endpoint, ResourceKind, ResourceManifest, TriggerBinder};
use funk_spec::{DeploymentSpec, FunctionSpec, SpecError, TriggerSpec};

/// Convergence phase of one function's resource set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Absent,
    Applying,
    AwaitingReady,
    Ready,
    Removing,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Absent => "Absent",
            Phase::Applying => "Applying",
            Phase::AwaitingReady => "AwaitingReady",
            Phase::Ready => "Ready",
            Phase::Removing => "Removing",
            Phase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Why a cycle ended in `Failed`. Always non-empty: the phase it failed in,
/// the resource it failed on when one is attributable, and the cause.
#[derive(Debug, Clone, Serialize)]
pub struct FailureCause {
    pub phase: Phase,
    pub resource: Option<(ResourceKind, String)>,
    pub message: String,
}

/// Per-function reconcile snapshot. Created when a cycle begins, destroyed
/// when the resources are confirmed removed.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileState {
    pub name: String,
    pub phase: Phase,
    /// Populated only in `Ready`.
    pub endpoint: Option<Endpoint>,
    pub failure: Option<FailureCause>,
}

impl ReconcileState {
    fn new(name: &str) -> Self {
        Self { name: name.to_string(), phase: Phase::Absent, endpoint: None, failure: None }
    }
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    InvalidSpec(#[from] SpecError),
    #[error(transparent)]
    Trigger(#[from] BindError),
    #[error("unknown function: {0}")]
    NotFound(String),
    #[error("{0}: a reconcile cycle is already in progress")]
    AlreadyInProgress(String),
    #[error("{0}: cycle cancelled by caller")]
    Cancelled(String),
    #[error("{0} is not ready")]
    NotReady(String),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Retry and readiness tuning. Env overrides follow the FUNK_* convention.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub poll_interval: Duration,
    pub readiness_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub apply_deadline: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            readiness_timeout: Duration::from_secs(300),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            apply_deadline: Duration::from_secs(300),
        }
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs)
}

impl ReconcileConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            poll_interval: env_secs("FUNK_POLL_SECS").unwrap_or(d.poll_interval),
            readiness_timeout: env_secs("FUNK_READY_TIMEOUT_SECS").unwrap_or(d.readiness_timeout),
            backoff_base: env_secs("FUNK_BACKOFF_BASE_SECS").unwrap_or(d.backoff_base),
            backoff_cap: env_secs("FUNK_BACKOFF_CAP_SECS").unwrap_or(d.backoff_cap),
            apply_deadline: env_secs("FUNK_APPLY_DEADLINE_SECS").unwrap_or(d.apply_deadline),
        }
    }

    /// Exponential backoff for the given retry attempt, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor).min(self.backoff_cap)
    }
}

struct Entry {
    state: ReconcileState,
    in_flight: bool,
    cancel: Option<CancellationToken>,
}

enum CycleError {
    Cluster(ClusterError),
    Cancelled,
}

impl CycleError {
    fn message(&self) -> String {
        match self {
            CycleError::Cluster(e) => e.to_string(),
            CycleError::Cancelled => "cancelled by caller".to_string(),
        }
    }
}

/// Converges a cluster's state to a `DeploymentSpec` and exposes snapshots.
///
/// At most one apply/remove cycle runs per function name; a second submit or
/// remove for a busy name is rejected with `AlreadyInProgress` (we reject
/// rather than queue so callers always see the cycle they started). Cycles
/// for different names never block each other.
pub struct Deployer {
    cluster: Arc<dyn ClusterClient>,
    binder: TriggerBinder,
    config: ReconcileConfig,
    namespace: String,
    registry: Mutex<HashMap<String, Entry>>,
}

impl Deployer {
    pub fn new(cluster: Arc<dyn ClusterClient>, binder: TriggerBinder, namespace: impl Into<String>) -> Self {
        Self::with_config(cluster, binder, namespace, ReconcileConfig::default())
    }

    pub fn with_config(
        cluster: Arc<dyn ClusterClient>,
        binder: TriggerBinder,
        namespace: impl Into<String>,
        config: ReconcileConfig,
    ) -> Self {
        Self { cluster, binder, config, namespace: namespace.into(), registry: Mutex::new(HashMap::new()) }
    }

    /// Submit a deployment: apply every function's manifest sequence, wait
    /// for readiness, resolve endpoints. Returns per-function snapshots in
    /// spec order. Individual functions may end `Failed`; the snapshot
    /// carries the cause.
    pub async fn submit(&self, spec: &DeploymentSpec) -> Result<Vec<ReconcileState>, DeployError> {
        spec.validate()?;
        if spec.namespace != self.namespace {
            return Err(SpecError::InvalidSpec(format!(
                "deployment namespace {} does not match deployer namespace {}",
                spec.namespace, self.namespace
            ))
            .into());
        }
        for entry in &spec.functions {
            self.binder.ensure_supported(entry.trigger.kind())?;
        }

        // Claim every name atomically so a partial claim never lingers.
        {
            let mut reg = self.registry.lock().unwrap();
            for entry in &spec.functions {
                if reg.get(&entry.function.name).map(|e| e.in_flight).unwrap_or(false) {
                    return Err(DeployError::AlreadyInProgress(entry.function.name.clone()));
                }
            }
            for entry in &spec.functions {
                let token = CancellationToken::new();
                let slot = reg
                    .entry(entry.function.name.clone())
                    .or_insert_with(|| Entry {
                        state: ReconcileState::new(&entry.function.name),
                        in_flight: false,
                        cancel: None,
                    });
                slot.in_flight = true;
                slot.cancel = Some(token);
            }
        }

        let mut out = Vec::with_capacity(spec.functions.len());
        for entry in &spec.functions {
            let token = self
                .with_entry(&entry.function.name, |e| e.cancel.clone())
                .flatten()
                .unwrap_or_default();
            let state = self.run_cycle(&entry.function, &entry.trigger, token).await;
            self.with_entry(&entry.function.name, |e| {
                e.state = state.clone();
                e.in_flight = false;
                e.cancel = None;
            });
            out.push(state);
        }
        Ok(out)
    }

    /// Current snapshot for one function. Unknown names are re-derived from
    /// the cluster before reporting `NotFound`.
    pub async fn status(&self, name: &str) -> Result<ReconcileState, DeployError> {
        if let Some(state) = self.with_entry(name, |e| e.state.clone()) {
            return Ok(state);
        }
        self.derive_from_cluster(name).await
    }

    /// Snapshots for every function this deployer has seen, in name order.
    pub fn snapshot(&self) -> Vec<ReconcileState> {
        let reg = self.registry.lock().unwrap();
        let mut states: Vec<_> = reg.values().map(|e| e.state.clone()).collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        states
    }

    /// Tear down a function's resource set, trigger resources first so no
    /// trigger ever references a deleted Function. Deleting an already-gone
    /// resource counts as success.
    pub async fn remove(&self, name: &str) -> Result<(), DeployError> {
        let token = CancellationToken::new();
        let claimed = {
            let mut reg = self.registry.lock().unwrap();
            match reg.get_mut(name) {
                Some(e) if e.in_flight => return Err(DeployError::AlreadyInProgress(name.to_string())),
                Some(e) => {
                    e.in_flight = true;
                    e.cancel = Some(token.clone());
                    e.state.phase = Phase::Removing;
                    e.state.endpoint = None;
                    true
                }
                None => false,
            }
        };

        if !claimed {
            // Nothing in memory: confirm the function exists before
            // removing, so removal of a never-deployed name is NotFound.
            match self.cluster.get(ResourceKind::Function, name).await {
                Ok(_) => {}
                Err(ClusterError::NotFound { .. }) => return Err(DeployError::NotFound(name.to_string())),
                Err(e) => return Err(e.into()),
            }
            let mut reg = self.registry.lock().unwrap();
            let slot = reg.entry(name.to_string()).or_insert_with(|| Entry {
                state: ReconcileState::new(name),
                in_flight: false,
                cancel: None,
            });
            if slot.in_flight {
                return Err(DeployError::AlreadyInProgress(name.to_string()));
            }
            slot.in_flight = true;
            slot.cancel = Some(token.clone());
            slot.state.phase = Phase::Removing;
        }

        info!(function = %name, "removal starting");
        counter!("reconcile_remove_total", 1u64);

        // Reverse of build order: both trigger kinds before the Function, so
        // a stale trigger left by an earlier trigger change never outlives
        // it. Deleting a missing resource is a no-op.
        let kinds = [ResourceKind::HttpRoute, ResourceKind::TopicSubscription, ResourceKind::Function];
        for kind in kinds {
            match self.delete_with_retry(kind, name, &token).await {
                Ok(()) => {}
                Err(e) => {
                    let msg = e.message();
                    self.with_entry(name, |en| {
                        en.state.phase = Phase::Failed;
                        en.state.failure = Some(FailureCause {
                            phase: Phase::Removing,
                            resource: Some((kind, name.to_string())),
                            message: msg.clone(),
                        });
                        en.in_flight = false;
                        en.cancel = None;
                    });
                    counter!("reconcile_failed_total", 1u64);
                    return Err(match e {
                        CycleError::Cancelled => DeployError::Cancelled(name.to_string()),
                        CycleError::Cluster(c) => c.into(),
                    });
                }
            }
        }

        // Confirmed removed: drop the state entirely.
        self.registry.lock().unwrap().remove(name);
        info!(function = %name, "removal complete");
        Ok(())
    }

    /// Cancel an in-flight apply or removal cycle. Stops retries and polling
    /// promptly; never cleans up already-applied resources.
    pub fn cancel(&self, name: &str) -> Result<(), DeployError> {
        let token = self
            .with_entry(name, |e| e.cancel.clone())
            .ok_or_else(|| DeployError::NotFound(name.to_string()))?;
        match token {
            Some(t) => {
                info!(function = %name, "cancellation requested");
                t.cancel();
                Ok(())
            }
            None => Ok(()), // no cycle in flight; nothing to stop
        }
    }

    /// Log stream for a Ready function; thin pass-through to the cluster's
    /// log capability.
    pub async fn stream_logs(&self, name: &str, opts: LogOptions) -> Result<StreamHandle<LogLine>, DeployError> {
        let state = self.status(name).await?;
        if state.phase != Phase::Ready {
            return Err(DeployError::NotReady(name.to_string()));
        }
        Ok(self.cluster.log_stream(name, opts).await?)
    }

    // ---- cycle internals ----

    async fn run_cycle(&self, func: &FunctionSpec, trigger: &TriggerSpec, token: CancellationToken) -> ReconcileState {
        let name = func.name.as_str();
        let t0 = Instant::now();
        counter!("reconcile_submit_total", 1u64);

        // A cycle after Failed (or a restart) starts from the live cluster,
        // not from stale memory: the derived snapshot replaces the Failed
        // entry before the cycle mutates anything.
        let prior = self.with_entry(name, |e| e.state.phase);
        if matches!(prior, Some(Phase::Failed) | None) {
            match self.derive_from_cluster(name).await {
                Ok(derived) => {
                    debug!(function = %name, phase = %derived.phase, "resuming from cluster-derived state");
                    self.with_entry(name, |e| e.state = derived.clone());
                }
                Err(DeployError::NotFound(_)) => debug!(function = %name, "no live function; starting from Absent"),
                Err(e) => debug!(function = %name, error = %e, "state probe failed; apply will retry"),
            }
        }

        let mut state = ReconcileState::new(name);
        state.phase = Phase::Applying;
        self.with_entry(name, |e| e.state = state.clone());
        info!(function = %name, trigger = %trigger.kind(), "applying manifest sequence");

        // Builder is deterministic; kind support was checked before claim.
        let manifests = funk_manifest::build_manifests(func, trigger, &self.namespace);

        for (idx, manifest) in manifests.iter().enumerate() {
            match self.apply_with_retry(manifest, &token).await {
                Ok(res) => {
                    debug!(function = %name, kind = %manifest.kind, unchanged = res.unchanged, "manifest applied");
                }
                Err(e) => {
                    // Partial failure: earlier manifests stay in place, no
                    // implicit rollback. A retried submit repairs the rest.
                    warn!(
                        function = %name,
                        kind = %manifest.kind,
                        applied = idx,
                        total = manifests.len(),
                        error = %e.message(),
                        "apply failed; leaving applied resources in place"
                    );
                    return self.fail(name, Phase::Applying, Some((manifest.kind, manifest.name.clone())), e.message());
                }
            }
        }

        // A trigger change leaves the previous kind's resource behind; prune
        // whatever the new sequence no longer declares. Deleting a missing
        // resource is a no-op.
        for kind in [ResourceKind::HttpRoute, ResourceKind::TopicSubscription] {
            if manifests.iter().any(|m| m.kind == kind) {
                continue;
            }
            if let Err(e) = self.delete_with_retry(kind, name, &token).await {
                return self.fail(name, Phase::Applying, Some((kind, name.to_string())), e.message());
            }
        }

        state.phase = Phase::AwaitingReady;
        self.with_entry(name, |e| e.state = state.clone());

        let mut trigger_raw: Option<AppliedResource> = None;
        for manifest in &manifests {
            let pred = ready_predicate(manifest.kind);
            let awaited = tokio::select! {
                _ = token.cancelled() => {
                    return self.fail(name, Phase::AwaitingReady, Some((manifest.kind, manifest.name.clone())), "cancelled by caller".into());
                }
                res = self.cluster.await_condition(
                    manifest.kind,
                    &manifest.name,
                    &pred,
                    self.config.poll_interval,
                    self.config.readiness_timeout,
                ) => res,
            };
            match awaited {
                Ok(res) => {
                    if manifest.kind != ResourceKind::Function {
                        trigger_raw = Some(res);
                    }
                }
                Err(e @ ClusterError::Timeout { .. }) => {
                    // Resources stay in place for inspection.
                    return self.fail(
                        name,
                        Phase::AwaitingReady,
                        Some((manifest.kind, manifest.name.clone())),
                        format!("readiness timeout: {e}"),
                    );
                }
                Err(e) => {
                    return self.fail(name, Phase::AwaitingReady, Some((manifest.kind, manifest.name.clone())), e.to_string());
                }
            }
        }

        let endpoint = match self.binder.resolve_endpoint(
            name,
            &self.namespace,
            trigger,
            trigger_raw.as_ref().map(|r| &r.raw),
        ) {
            Ok(ep) => ep,
            Err(e) => return self.fail(name, Phase::AwaitingReady, None, e.to_string()),
        };

        state.phase = Phase::Ready;
        state.endpoint = Some(endpoint.clone());
        self.with_entry(name, |e| e.state = state.clone());
        histogram!("reconcile_ready_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(function = %name, endpoint = %endpoint, took_ms = %t0.elapsed().as_millis(), "ready");
        state
    }

    async fn apply_with_retry(&self, manifest: &ResourceManifest, token: &CancellationToken) -> Result<AppliedResource, CycleError> {
        let deadline = Instant::now() + self.config.apply_deadline;
        let mut attempt: u32 = 0;
        loop {
            if token.is_cancelled() {
                return Err(CycleError::Cancelled);
            }
            match self.cluster.apply(manifest).await {
                Ok(res) => return Ok(res),
                Err(e) if e.is_transient() => {
                    let delay = self.config.backoff_delay(attempt);
                    attempt += 1;
                    if Instant::now() + delay >= deadline {
                        warn!(kind = %manifest.kind, name = %manifest.name, attempts = attempt, "apply deadline exhausted");
                        return Err(CycleError::Cluster(e));
                    }
                    counter!("apply_retry_total", 1u64);
                    debug!(kind = %manifest.kind, name = %manifest.name, attempt, delay_ms = %delay.as_millis(), error = %e, "transient apply failure; backing off");
                    tokio::select! {
                        _ = token.cancelled() => return Err(CycleError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(CycleError::Cluster(e)),
            }
        }
    }

    async fn delete_with_retry(&self, kind: ResourceKind, name: &str, token: &CancellationToken) -> Result<(), CycleError> {
        let deadline = Instant::now() + self.config.apply_deadline;
        let mut attempt: u32 = 0;
        loop {
            if token.is_cancelled() {
                return Err(CycleError::Cancelled);
            }
            match self.cluster.delete(kind, name).await {
                Ok(()) => return Ok(()),
                // Already gone is the desired end state.
                Err(ClusterError::NotFound { .. }) => return Ok(()),
                Err(e) if e.is_transient() => {
                    let delay = self.config.backoff_delay(attempt);
                    attempt += 1;
                    if Instant::now() + delay >= deadline {
                        return Err(CycleError::Cluster(e));
                    }
                    counter!("delete_retry_total", 1u64);
                    tokio::select! {
                        _ = token.cancelled() => return Err(CycleError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(CycleError::Cluster(e)),
            }
        }
    }

    /// Rebuild a snapshot by inspecting live resources. Used when this
    /// process has no memory of the function (e.g. after a restart).
    async fn derive_from_cluster(&self, name: &str) -> Result<ReconcileState, DeployError> {
        let func = match self.cluster.get(ResourceKind::Function, name).await {
            Ok(res) => res,
            Err(ClusterError::NotFound { .. }) => return Err(DeployError::NotFound(name.to_string())),
            Err(e) => return Err(e.into()),
        };

        let route = match self.cluster.get(ResourceKind::HttpRoute, name).await {
            Ok(res) => Some(res),
            Err(ClusterError::NotFound { .. }) => None,
            Err(e) => return Err(e.into()),
        };
        let sub = match self.cluster.get(ResourceKind::TopicSubscription, name).await {
            Ok(res) => Some(res),
            Err(ClusterError::NotFound { .. }) => None,
            Err(e) => return Err(e.into()),
        };

        let func_ready = funk_manifest::function_ready(&func.raw);
        let (trigger_ready, endpoint) = match (&route, &sub) {
            (Some(r), _) => (
                funk_manifest::route_programmed(&r.raw),
                funk_manifest::endpoint_from_route(&r.raw),
            ),
            (None, Some(s)) => (
                funk_manifest::subscription_active(&s.raw),
                funk_manifest::endpoint_from_subscription(&s.raw),
            ),
            (None, None) => (true, Some(funk_manifest::endpoint_direct(name, &self.namespace))),
        };

        let mut state = ReconcileState::new(name);
        if func_ready && trigger_ready {
            state.phase = Phase::Ready;
            state.endpoint = endpoint;
        } else {
            state.phase = Phase::AwaitingReady;
        }
        debug!(function = %name, phase = %state.phase, "state derived from cluster");

        let mut reg = self.registry.lock().unwrap();
        reg.entry(name.to_string()).or_insert_with(|| Entry {
            state: state.clone(),
            in_flight: false,
            cancel: None,
        });
        Ok(state)
    }

    fn fail(&self, name: &str, phase: Phase, resource: Option<(ResourceKind, String)>, message: String) -> ReconcileState {
        counter!("reconcile_failed_total", 1u64);
        let mut state = ReconcileState::new(name);
        state.phase = Phase::Failed;
        state.failure = Some(FailureCause { phase, resource, message });
        self.with_entry(name, |e| e.state = state.clone());
        state
    }

    fn with_entry<R>(&self, name: &str, f: impl FnOnce(&mut Entry) -> R) -> Option<R> {
        let mut reg = self.registry.lock().unwrap();
        reg.get_mut(name).map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = ReconcileConfig {
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            ..Default::default()
        };
        assert_eq!(cfg.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(cfg.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(cfg.backoff_delay(4), Duration::from_secs(16));
        assert_eq!(cfg.backoff_delay(5), Duration::from_secs(30));
        assert_eq!(cfg.backoff_delay(63), Duration::from_secs(30));
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ReconcileConfig::default();
        assert_eq!(cfg.poll_interval, Duration::from_secs(2));
        assert_eq!(cfg.readiness_timeout, Duration::from_secs(300));
        assert_eq!(cfg.backoff_base, Duration::from_secs(1));
        assert_eq!(cfg.backoff_cap, Duration::from_secs(30));
        assert_eq!(cfg.apply_deadline, Duration::from_secs(300));
    }
}
