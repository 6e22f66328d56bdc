//! funk cluster client facade: apply/get/delete/await over the three
//! resource kinds, plus the pod log-stream capability.
//!
//! The facade is a stateless gateway. It owns no reconcile state and does no
//! client-side locking; conflicting external mutation is reported through
//! the cluster's own conflict detection.

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use funk_manifest::{ResourceKind, ResourceManifest, FIELD_MANAGER, FUNCTION_LABEL, MANAGED_BY_LABEL};

/// Failure taxonomy of the cluster API surface.
#[derive(Debug, Clone, Error)]
pub enum ClusterError {
    /// Transient transport or server failure. The only retriable variant.
    #[error("cluster unreachable: {0}")]
    Unreachable(String),
    /// A resource with incompatible identity already exists. Never retried,
    /// never silently overwritten.
    #[error("conflict on {kind}/{name}: {reason}")]
    Conflict { kind: ResourceKind, name: String, reason: String },
    /// The cluster refused the manifest content. Never retried.
    #[error("rejected {kind}/{name}: {reason}")]
    Rejected { kind: ResourceKind, name: String, reason: String },
    #[error("not found: {kind}/{name}")]
    NotFound { kind: ResourceKind, name: String },
    #[error("timed out waiting on {kind}/{name} after {waited:?}")]
    Timeout { kind: ResourceKind, name: String, waited: Duration },
}

impl ClusterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterError::Unreachable(_))
    }
}

/// Result of an apply or get: identity plus the raw object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedResource {
    pub kind: ResourceKind,
    pub name: String,
    pub namespace: String,
    pub resource_version: Option<String>,
    /// True when the applied content matched the live object and the call
    /// was a no-op.
    pub unchanged: bool,
    pub raw: Json,
}

/// A single line of function log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub line: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogOptions {
    /// Follow the stream; when false the stream ends at the current tail.
    pub follow: bool,
    /// Tail last n lines (server-side).
    pub tail_lines: Option<i64>,
    /// Only return logs newer than X seconds.
    pub since_seconds: Option<i64>,
}

/// Cancellation handle for an in-flight stream.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub fn from_sender(tx: oneshot::Sender<()>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Pull-based stream of items with a cancel handle. End-of-stream is a
/// normal terminal condition; the stream is not restartable.
pub struct StreamHandle<T> {
    pub rx: mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}

/// Capability surface the reconciler drives. Implementations must be
/// stateless gateways: identical applies are no-ops, deletes of missing
/// resources report `NotFound` for the caller to interpret.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Server-side apply. Unchanged content is a no-op; changed content is
    /// merged with last-applied-wins semantics for specified fields.
    async fn apply(&self, manifest: &ResourceManifest) -> Result<AppliedResource, ClusterError>;

    async fn get(&self, kind: ResourceKind, name: &str) -> Result<AppliedResource, ClusterError>;

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), ClusterError>;

    /// Poll `get` until `predicate` accepts the raw object or `timeout`
    /// elapses. `NotFound` while polling means not-yet-ready, not failure.
    async fn await_condition(
        &self,
        kind: ResourceKind,
        name: &str,
        predicate: &(dyn for<'a> Fn(&'a Json) -> bool + Send + Sync),
        poll: Duration,
        timeout: Duration,
    ) -> Result<AppliedResource, ClusterError> {
        let started = Instant::now();
        loop {
            match self.get(kind, name).await {
                Ok(res) => {
                    if predicate(&res.raw) {
                        return Ok(res);
                    }
                }
                Err(ClusterError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
            if started.elapsed() >= timeout {
                return Err(ClusterError::Timeout { kind, name: name.to_string(), waited: started.elapsed() });
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Stream logs for a function's backing instances.
    async fn log_stream(&self, function: &str, opts: LogOptions) -> Result<StreamHandle<LogLine>, ClusterError>;
}

// ---- kube-rs implementation ----

/// Facade over a real cluster, scoped to one namespace. The kube client is
/// the opaque access context; obtaining it (kubeconfig loading) is the
/// caller's concern.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    namespace: String,
}

impl KubeCluster {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self { client, namespace: namespace.into() }
    }

    fn api_for(&self, kind: ResourceKind) -> Api<DynamicObject> {
        let gvk = GroupVersionKind {
            group: "funk.dev".to_string(),
            version: "v1".to_string(),
            kind: kind.as_str().to_string(),
        };
        let ar = ApiResource::from_gvk_with_plural(&gvk, kind.plural());
        Api::namespaced_with(self.client.clone(), &self.namespace, &ar)
    }

    fn applied_from(&self, kind: ResourceKind, obj: &DynamicObject, unchanged: bool) -> Result<AppliedResource, ClusterError> {
        let mut raw = serde_json::to_value(obj)
            .map_err(|e| ClusterError::Unreachable(format!("serializing live object: {e}")))?;
        strip_managed_fields(&mut raw);
        Ok(AppliedResource {
            kind,
            name: obj.metadata.name.clone().unwrap_or_default(),
            namespace: self.namespace.clone(),
            resource_version: obj.metadata.resource_version.clone(),
            unchanged,
            raw,
        })
    }
}

fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

/// Map a kube error onto the facade taxonomy for one addressed resource.
fn map_kube_err(kind: ResourceKind, name: &str, e: kube::Error) -> ClusterError {
    match e {
        kube::Error::Api(ae) => map_api_code(kind, name, ae.code, &ae.message),
        other => ClusterError::Unreachable(other.to_string()),
    }
}

fn map_api_code(kind: ResourceKind, name: &str, code: u16, message: &str) -> ClusterError {
    match code {
        404 => ClusterError::NotFound { kind, name: name.to_string() },
        409 => ClusterError::Conflict { kind, name: name.to_string(), reason: message.to_string() },
        400 | 422 => ClusterError::Rejected { kind, name: name.to_string(), reason: message.to_string() },
        500..=599 | 429 => ClusterError::Unreachable(format!("{kind}/{name}: {code} {message}")),
        _ => ClusterError::Rejected { kind, name: name.to_string(), reason: format!("{code} {message}") },
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn apply(&self, manifest: &ResourceManifest) -> Result<AppliedResource, ClusterError> {
        let t0 = Instant::now();
        counter!("cluster_apply_total", 1u64);
        let api = self.api_for(manifest.kind);

        // Ownership and no-op checks against the live object.
        let live = api
            .get_opt(&manifest.name)
            .await
            .map_err(|e| map_kube_err(manifest.kind, &manifest.name, e))?;
        if let Some(obj) = &live {
            let managed_by = obj
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(MANAGED_BY_LABEL))
                .map(String::as_str);
            if managed_by != Some(FIELD_MANAGER) {
                return Err(ClusterError::Conflict {
                    kind: manifest.kind,
                    name: manifest.name.clone(),
                    reason: format!("resource exists but is not managed by {FIELD_MANAGER}"),
                });
            }
            let live_raw = serde_json::to_value(obj)
                .map_err(|e| ClusterError::Unreachable(format!("serializing live object: {e}")))?;
            if manifest.content_eq(&live_raw) {
                counter!("cluster_apply_unchanged_total", 1u64);
                debug!(kind = %manifest.kind, name = %manifest.name, "apply is a no-op");
                return self.applied_from(manifest.kind, obj, true);
            }
        }

        let pp = PatchParams::apply(FIELD_MANAGER);
        let obj = api
            .patch(&manifest.name, &pp, &Patch::Apply(&manifest.fields))
            .await
            .map_err(|e| map_kube_err(manifest.kind, &manifest.name, e))?;
        histogram!("cluster_apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(kind = %manifest.kind, name = %manifest.name, rv = ?obj.metadata.resource_version, "applied");
        self.applied_from(manifest.kind, &obj, false)
    }

    async fn get(&self, kind: ResourceKind, name: &str) -> Result<AppliedResource, ClusterError> {
        let api = self.api_for(kind);
        let obj = api.get(name).await.map_err(|e| map_kube_err(kind, name, e))?;
        self.applied_from(kind, &obj, false)
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), ClusterError> {
        counter!("cluster_delete_total", 1u64);
        let api = self.api_for(kind);
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_err(kind, name, e))?;
        info!(kind = %kind, name = %name, "deleted");
        Ok(())
    }

    async fn log_stream(&self, function: &str, opts: LogOptions) -> Result<StreamHandle<LogLine>, ClusterError> {
        use k8s_openapi::api::core::v1::Pod;

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let lp = ListParams::default().labels(&format!("{FUNCTION_LABEL}={function}"));
        let list = pods
            .list(&lp)
            .await
            .map_err(|e| map_kube_err(ResourceKind::Function, function, e))?;
        let pod_name = list
            .items
            .iter()
            .filter_map(|p| p.metadata.name.clone())
            .next()
            .ok_or_else(|| ClusterError::NotFound { kind: ResourceKind::Function, name: function.to_string() })?;

        let mut params = LogParams::default();
        params.follow = opts.follow;
        params.tail_lines = opts.tail_lines;
        params.since_seconds = opts.since_seconds;

        let (tx, rx) = mpsc::channel::<LogLine>(1024);
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let cancel = CancelHandle { tx: Some(cancel_tx) };

        let function = function.to_string();
        tokio::spawn(async move {
            use tokio_util::{compat::FuturesAsyncReadCompatExt, io::ReaderStream};
            info!(function = %function, pod = %pod_name, follow = params.follow, "log stream starting");
            let reader = match pods.log_stream(&pod_name, &params).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(function = %function, error = %e, "log stream failed to open");
                    return;
                }
            };
            let stream = ReaderStream::new(reader.compat());
            pump_bytes_to_lines(stream, tx, cancel_rx, &function).await;
        });

        Ok(StreamHandle { rx, cancel })
    }
}

/// Consume a byte stream, split into lines, forward over a bounded channel.
/// Drops lines when the consumer lags. Flushes the last partial line at end.
pub async fn pump_bytes_to_lines<S, E>(
    stream: S,
    tx: mpsc::Sender<LogLine>,
    mut cancel_rx: oneshot::Receiver<()>,
    ctx: &str,
) where
    S: futures::Stream<Item = Result<bytes::Bytes, E>>,
    E: std::fmt::Display,
{
    let stream = stream.fuse();
    futures::pin_mut!(stream);
    let mut buf = bytes::BytesMut::new();
    loop {
        tokio::select! {
            _ = &mut cancel_rx => {
                info!(ctx = %ctx, "log pump cancelled");
                break;
            }
            next = stream.next() => {
                match next {
                    Some(Ok(chunk)) => {
                        buf.extend_from_slice(&chunk);
                        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                            let line = buf.split_to(pos);
                            let _ = buf.split_to(1); // drop '\n'
                            if let Ok(s) = std::str::from_utf8(&line) {
                                let _ = tx.try_send(LogLine { line: s.to_string() });
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(ctx = %ctx, error = %e, "log stream error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
    if !buf.is_empty() {
        if let Ok(s) = std::str::from_utf8(&buf) {
            let _ = tx.try_send(LogLine { line: s.to_string() });
        }
    }
    info!(ctx = %ctx, "log pump ended");
}
