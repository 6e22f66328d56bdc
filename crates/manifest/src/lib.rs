//! funk resource builder: spec -> ordered cluster manifests, plus the
//! per-trigger-kind binding strategy (readiness predicates and endpoint
//! resolution from structured status fields).

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use thiserror::Error;

use funk_spec::{FunctionSpec, TriggerKind, TriggerSpec};

pub const API_VERSION: &str = "funk.dev/v1";
pub const FIELD_MANAGER: &str = "funk";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const FUNCTION_LABEL: &str = "funk.dev/function";

/// Port every function runtime serves on.
pub const FUNCTION_PORT: u16 = 8080;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BindError {
    #[error("unsupported trigger kind: {0}")]
    UnsupportedTrigger(TriggerKind),
    #[error("missing status field on {kind}/{name}: {field}")]
    MissingStatus { kind: ResourceKind, name: String, field: String },
}

/// The three resource kinds the cluster API serves for us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Function,
    HttpRoute,
    TopicSubscription,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Function => "Function",
            ResourceKind::HttpRoute => "HTTPRoute",
            ResourceKind::TopicSubscription => "TopicSubscription",
        }
    }

    pub fn plural(&self) -> &'static str {
        match self {
            ResourceKind::Function => "functions",
            ResourceKind::HttpRoute => "httproutes",
            ResourceKind::TopicSubscription => "topicsubscriptions",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One cluster resource to be created or updated. Produced by the builder,
/// never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceManifest {
    pub kind: ResourceKind,
    pub name: String,
    pub namespace: String,
    pub fields: Json,
}

impl ResourceManifest {
    /// Content equality against a live object, ignoring server-assigned
    /// fields (timestamps, versions, status).
    pub fn content_eq(&self, live: &Json) -> bool {
        strip_server_fields(self.fields.clone()) == strip_server_fields(live.clone())
    }
}

/// Drop fields the server owns so logical content can be compared.
pub fn strip_server_fields(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("generation");
        meta.remove("creationTimestamp");
        meta.remove("uid");
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

fn metadata(func: &FunctionSpec, namespace: &str) -> Json {
    let mut labels = serde_json::Map::new();
    for (k, v) in &func.labels {
        labels.insert(k.clone(), Json::String(v.clone()));
    }
    labels.insert(MANAGED_BY_LABEL.into(), Json::String(FIELD_MANAGER.into()));
    labels.insert(FUNCTION_LABEL.into(), Json::String(func.name.clone()));
    json!({
        "name": func.name,
        "namespace": namespace,
        "labels": labels,
    })
}

/// Translate one (function, trigger) pair into its ordered manifest sequence.
/// The Function manifest is always first; trigger resources reference it and
/// must never be applied before it (or deleted after it).
pub fn build_manifests(func: &FunctionSpec, trigger: &TriggerSpec, namespace: &str) -> Vec<ResourceManifest> {
    let mut out = Vec::with_capacity(2);

    let mut spec = json!({
        "runtime": func.runtime.as_str(),
        "handler": func.handler.to_string(),
        "source": func.source,
        "port": FUNCTION_PORT,
    });
    {
        let obj = spec.as_object_mut().unwrap();
        if let Some(mem) = &func.memory {
            obj.insert("memory".into(), Json::String(mem.clone()));
        }
        if !func.environment.is_empty() {
            obj.insert("environment".into(), serde_json::to_value(&func.environment).unwrap_or(Json::Null));
        }
        if let Some(desc) = &func.description {
            obj.insert("description".into(), Json::String(desc.clone()));
        }
    }
    out.push(ResourceManifest {
        kind: ResourceKind::Function,
        name: func.name.clone(),
        namespace: namespace.to_string(),
        fields: json!({
            "apiVersion": API_VERSION,
            "kind": ResourceKind::Function.as_str(),
            "metadata": metadata(func, namespace),
            "spec": spec,
        }),
    });

    match trigger {
        TriggerSpec::Http { path, hostname } => {
            let mut spec = json!({
                "path": path,
                "backend": { "function": func.name, "port": FUNCTION_PORT },
            });
            if let Some(host) = hostname {
                spec.as_object_mut().unwrap().insert("hostname".into(), Json::String(host.clone()));
            }
            out.push(ResourceManifest {
                kind: ResourceKind::HttpRoute,
                name: func.name.clone(),
                namespace: namespace.to_string(),
                fields: json!({
                    "apiVersion": API_VERSION,
                    "kind": ResourceKind::HttpRoute.as_str(),
                    "metadata": metadata(func, namespace),
                    "spec": spec,
                }),
            });
        }
        TriggerSpec::Topic { topic, retries } => {
            let mut spec = json!({
                "topic": topic,
                "function": func.name,
            });
            if let Some(r) = retries {
                spec.as_object_mut().unwrap().insert("retries".into(), json!(r));
            }
            out.push(ResourceManifest {
                kind: ResourceKind::TopicSubscription,
                name: func.name.clone(),
                namespace: namespace.to_string(),
                fields: json!({
                    "apiVersion": API_VERSION,
                    "kind": ResourceKind::TopicSubscription.as_str(),
                    "metadata": metadata(func, namespace),
                    "spec": spec,
                }),
            });
        }
        TriggerSpec::None => {}
    }

    out
}

// ---- readiness predicates (structured status reads, never text parsing) ----

/// Function is ready when at least one backing instance is running.
pub fn function_ready(raw: &Json) -> bool {
    raw.pointer("/status/availableReplicas")
        .and_then(|v| v.as_i64())
        .map(|n| n >= 1)
        .unwrap_or(false)
}

/// Route is ready once the ingress reports it programmed with an address.
pub fn route_programmed(raw: &Json) -> bool {
    let programmed = raw
        .pointer("/status/programmed")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let has_addr = raw
        .pointer("/status/address")
        .and_then(|v| v.as_str())
        .map(|s| !s.is_empty())
        .unwrap_or(false);
    programmed && has_addr
}

/// Subscription is ready once bound to the messaging substrate.
pub fn subscription_active(raw: &Json) -> bool {
    raw.pointer("/status/state")
        .and_then(|v| v.as_str())
        .map(|s| s == "Active")
        .unwrap_or(false)
}

pub fn ready_predicate(kind: ResourceKind) -> fn(&Json) -> bool {
    match kind {
        ResourceKind::Function => function_ready,
        ResourceKind::HttpRoute => route_programmed,
        ResourceKind::TopicSubscription => subscription_active,
    }
}

// ---- endpoint resolution ----

/// Externally reachable invocation endpoint, recorded once a function is Ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Endpoint {
    /// Public URL behind the cluster ingress (http trigger).
    Url(String),
    /// Topic name on the external messaging substrate (topic trigger).
    Topic(String),
    /// In-cluster service address (direct invocation).
    Internal(String),
}

impl Endpoint {
    /// URL usable by the invoker, if this endpoint is HTTP-reachable.
    pub fn url(&self) -> Option<&str> {
        match self {
            Endpoint::Url(u) | Endpoint::Internal(u) => Some(u),
            Endpoint::Topic(_) => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Url(u) | Endpoint::Internal(u) => f.write_str(u),
            Endpoint::Topic(t) => f.write_str(t),
        }
    }
}

fn internal_address(function: &str, namespace: &str) -> String {
    format!("http://{function}.{namespace}.svc.cluster.local:{FUNCTION_PORT}")
}

/// Per-trigger-kind strategy. Holds the cluster capability set negotiated at
/// startup; binding a kind the cluster does not serve fails fast.
#[derive(Debug, Clone)]
pub struct TriggerBinder {
    supported: HashSet<TriggerKind>,
}

impl TriggerBinder {
    pub fn new(supported: impl IntoIterator<Item = TriggerKind>) -> Self {
        Self { supported: supported.into_iter().collect() }
    }

    /// Binder for a cluster serving every trigger kind.
    pub fn all() -> Self {
        Self::new([TriggerKind::Http, TriggerKind::Topic, TriggerKind::None])
    }

    pub fn ensure_supported(&self, kind: TriggerKind) -> Result<(), BindError> {
        if self.supported.contains(&kind) {
            Ok(())
        } else {
            Err(BindError::UnsupportedTrigger(kind))
        }
    }

    /// Validate the trigger kind against cluster capabilities and build the
    /// manifest sequence. Field-level validation already happened in the spec
    /// model; this only rejects kinds this cluster build cannot wire.
    pub fn build(
        &self,
        func: &FunctionSpec,
        trigger: &TriggerSpec,
        namespace: &str,
    ) -> Result<Vec<ResourceManifest>, BindError> {
        self.ensure_supported(trigger.kind())?;
        Ok(build_manifests(func, trigger, namespace))
    }

    /// Resolve the reachable endpoint once the resource set is ready.
    /// `trigger_raw` is the live trigger resource (route or subscription),
    /// absent for direct invocation.
    pub fn resolve_endpoint(
        &self,
        func_name: &str,
        namespace: &str,
        trigger: &TriggerSpec,
        trigger_raw: Option<&Json>,
    ) -> Result<Endpoint, BindError> {
        match trigger {
            TriggerSpec::Http { path, .. } => {
                let raw = trigger_raw.ok_or_else(|| BindError::MissingStatus {
                    kind: ResourceKind::HttpRoute,
                    name: func_name.to_string(),
                    field: "status".into(),
                })?;
                endpoint_from_route(raw).ok_or_else(|| BindError::MissingStatus {
                    kind: ResourceKind::HttpRoute,
                    name: func_name.to_string(),
                    field: format!("status.address (path {path})"),
                })
            }
            TriggerSpec::Topic { topic, .. } => Ok(Endpoint::Topic(topic.clone())),
            TriggerSpec::None => Ok(Endpoint::Internal(internal_address(func_name, namespace))),
        }
    }
}

/// Rebuild the public URL of an http trigger from a live route object:
/// programmed address joined with the route's own path. Used both at the
/// Ready transition and when re-deriving state from the cluster.
pub fn endpoint_from_route(raw: &Json) -> Option<Endpoint> {
    let addr = raw.pointer("/status/address")?.as_str()?;
    if addr.is_empty() {
        return None;
    }
    let path = raw.pointer("/spec/path").and_then(|v| v.as_str()).unwrap_or("/");
    Some(Endpoint::Url(format!("{}{}", addr.trim_end_matches('/'), path)))
}

/// Endpoint of a live topic subscription: the topic name itself.
pub fn endpoint_from_subscription(raw: &Json) -> Option<Endpoint> {
    raw.pointer("/spec/topic")
        .and_then(|v| v.as_str())
        .map(|t| Endpoint::Topic(t.to_string()))
}

/// Endpoint for a function with no trigger resource.
pub fn endpoint_direct(function: &str, namespace: &str) -> Endpoint {
    Endpoint::Internal(internal_address(function, namespace))
}

#[cfg(test)]
mod tests {
    use super::*;
    use funk_spec::{Handler, Runtime, Source};
    use std::collections::BTreeMap;

    fn echo() -> FunctionSpec {
        FunctionSpec {
            name: "echo".into(),
            runtime: Runtime::Python27,
            handler: Handler::new("handler", "echo"),
            source: Source::Inline { text: "def echo(event, context):\n    return event\n".into() },
            memory: Some("128Mi".into()),
            environment: BTreeMap::from([("FOO".into(), "bar".into())]),
            description: None,
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn function_manifest_is_always_first() {
        let trigger = TriggerSpec::Http { path: "/echo".into(), hostname: None };
        let seq = build_manifests(&echo(), &trigger, "default");
        assert_eq!(seq.len(), 2);
        assert_eq!(seq[0].kind, ResourceKind::Function);
        assert_eq!(seq[1].kind, ResourceKind::HttpRoute);
    }

    #[test]
    fn none_trigger_builds_only_the_function() {
        let seq = build_manifests(&echo(), &TriggerSpec::None, "default");
        assert_eq!(seq.len(), 1);
        assert_eq!(seq[0].kind, ResourceKind::Function);
    }

    #[test]
    fn manifests_are_deterministic() {
        let trigger = TriggerSpec::Topic { topic: "hello_topic".into(), retries: Some(3) };
        let a = build_manifests(&echo(), &trigger, "default");
        let b = build_manifests(&echo(), &trigger, "default");
        let a_bytes = serde_json::to_vec(&a).unwrap();
        let b_bytes = serde_json::to_vec(&b).unwrap();
        assert_eq!(a_bytes, b_bytes);
    }

    #[test]
    fn round_trip_reconstructs_logical_fields() {
        let func = echo();
        let trigger = TriggerSpec::Http { path: "/echo".into(), hostname: Some("example.com".into()) };
        let seq = build_manifests(&func, &trigger, "default");

        let f = &seq[0].fields;
        assert_eq!(f.pointer("/spec/runtime").unwrap(), "python2.7");
        assert_eq!(f.pointer("/spec/handler").unwrap(), "handler.echo");
        assert_eq!(f.pointer("/spec/memory").unwrap(), "128Mi");
        assert_eq!(f.pointer("/spec/environment/FOO").unwrap(), "bar");
        assert_eq!(f.pointer("/metadata/namespace").unwrap(), "default");

        let r = &seq[1].fields;
        assert_eq!(r.pointer("/spec/path").unwrap(), "/echo");
        assert_eq!(r.pointer("/spec/hostname").unwrap(), "example.com");
        assert_eq!(r.pointer("/spec/backend/function").unwrap(), "echo");
    }

    #[test]
    fn content_eq_ignores_server_assigned_fields() {
        let seq = build_manifests(&echo(), &TriggerSpec::None, "default");
        let mut live = seq[0].fields.clone();
        live["metadata"]["creationTimestamp"] = serde_json::json!("2020-01-01T00:00:00Z");
        live["metadata"]["resourceVersion"] = serde_json::json!("42");
        live["metadata"]["uid"] = serde_json::json!("e2b1c9a0-0000-0000-0000-000000000000");
        live["status"] = serde_json::json!({"availableReplicas": 1});
        assert!(seq[0].content_eq(&live));

        live["spec"]["memory"] = serde_json::json!("256Mi");
        assert!(!seq[0].content_eq(&live));
    }

    #[test]
    fn readiness_predicates_read_structured_status() {
        let ready = serde_json::json!({"status": {"availableReplicas": 1}});
        let not_ready = serde_json::json!({"status": {"availableReplicas": 0}});
        assert!(function_ready(&ready));
        assert!(!function_ready(&not_ready));
        assert!(!function_ready(&serde_json::json!({})));

        let programmed = serde_json::json!({"status": {"programmed": true, "address": "http://1.2.3.4"}});
        let pending = serde_json::json!({"status": {"programmed": false}});
        assert!(route_programmed(&programmed));
        assert!(!route_programmed(&pending));

        let active = serde_json::json!({"status": {"state": "Active"}});
        assert!(subscription_active(&active));
        assert!(!subscription_active(&serde_json::json!({"status": {"state": "Pending"}})));
    }

    #[test]
    fn http_endpoint_joins_address_and_path() {
        let raw = serde_json::json!({
            "spec": {"path": "/echo"},
            "status": {"programmed": true, "address": "http://203.0.113.7/"}
        });
        let ep = endpoint_from_route(&raw).unwrap();
        assert_eq!(ep, Endpoint::Url("http://203.0.113.7/echo".into()));
    }

    #[test]
    fn binder_rejects_unsupported_kinds() {
        let binder = TriggerBinder::new([TriggerKind::Http, TriggerKind::None]);
        let trigger = TriggerSpec::Topic { topic: "t".into(), retries: None };
        let err = binder.build(&echo(), &trigger, "default").unwrap_err();
        assert_eq!(err, BindError::UnsupportedTrigger(TriggerKind::Topic));
    }

    #[test]
    fn topic_endpoint_is_the_topic_name() {
        let binder = TriggerBinder::all();
        let trigger = TriggerSpec::Topic { topic: "hello_topic".into(), retries: None };
        let ep = binder.resolve_endpoint("events", "default", &trigger, None).unwrap();
        assert_eq!(ep, Endpoint::Topic("hello_topic".into()));
    }

    #[test]
    fn direct_endpoint_is_the_cluster_local_address() {
        let ep = endpoint_direct("hello", "default");
        assert_eq!(ep, Endpoint::Internal("http://hello.default.svc.cluster.local:8080".into()));
    }
}
