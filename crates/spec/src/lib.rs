//! funk spec model: declarative descriptions of deployable functions.
//!
//! Pure value objects with validation at construction time. No I/O here;
//! parsing project files into these types is the CLI's job, and turning
//! them into cluster resources is the manifest builder's.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rejection of a spec before any cluster call is made. Never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SpecError {
    #[error("invalid spec: {0}")]
    InvalidSpec(String),
}

fn invalid(msg: impl Into<String>) -> SpecError {
    SpecError::InvalidSpec(msg.into())
}

/// Supported, versioned language runtimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Runtime {
    Python27,
    Nodejs6,
    Nodejs8,
    Ruby24,
}

impl Runtime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Runtime::Python27 => "python2.7",
            Runtime::Nodejs6 => "nodejs6",
            Runtime::Nodejs8 => "nodejs8",
            Runtime::Ruby24 => "ruby2.4",
        }
    }

    pub fn language(&self) -> &'static str {
        match self {
            Runtime::Python27 => "python",
            Runtime::Nodejs6 | Runtime::Nodejs8 => "nodejs",
            Runtime::Ruby24 => "ruby",
        }
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Runtime {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python2.7" | "python" => Ok(Runtime::Python27),
            "nodejs6" => Ok(Runtime::Nodejs6),
            "nodejs8" | "nodejs" => Ok(Runtime::Nodejs8),
            "ruby2.4" | "ruby" => Ok(Runtime::Ruby24),
            other => Err(invalid(format!("unsupported runtime: {other}"))),
        }
    }
}

impl TryFrom<String> for Runtime {
    type Error = SpecError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Runtime> for String {
    fn from(r: Runtime) -> String {
        r.as_str().to_string()
    }
}

/// Entry point reference: `module.function`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Handler {
    pub module: String,
    pub function: String,
}

impl Handler {
    pub fn new(module: impl Into<String>, function: impl Into<String>) -> Self {
        Self { module: module.into(), function: function.into() }
    }
}

impl fmt::Display for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.function)
    }
}

impl FromStr for Handler {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((m, f)) if !m.is_empty() && !f.is_empty() => Ok(Handler::new(m, f)),
            _ => Err(invalid(format!("handler must be module.function, got: {s}"))),
        }
    }
}

impl TryFrom<String> for Handler {
    type Error = SpecError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Handler> for String {
    fn from(h: Handler) -> String {
        h.to_string()
    }
}

/// Where the function code comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Code inlined into the function resource.
    Inline { text: String },
    /// Archive fetched by the runtime at startup.
    Archive { url: String },
}

/// One deployable unit of code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    pub runtime: Runtime,
    pub handler: Handler,
    pub source: Source,
    /// Memory limit, cluster units (e.g. "128Mi").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl FunctionSpec {
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.name.is_empty() {
            return Err(invalid("function name must not be empty"));
        }
        if self.handler.module.is_empty() || self.handler.function.is_empty() {
            return Err(invalid(format!("{}: handler module and function must not be empty", self.name)));
        }
        Ok(())
    }
}

/// How a deployed function receives invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Http,
    Topic,
    None,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerKind::Http => "http",
            TriggerKind::Topic => "topic",
            TriggerKind::None => "none",
        };
        f.write_str(s)
    }
}

/// At most one trigger per function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TriggerSpec {
    Http {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hostname: Option<String>,
    },
    Topic {
        topic: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retries: Option<u32>,
    },
    None,
}

impl TriggerSpec {
    pub fn kind(&self) -> TriggerKind {
        match self {
            TriggerSpec::Http { .. } => TriggerKind::Http,
            TriggerSpec::Topic { .. } => TriggerKind::Topic,
            TriggerSpec::None => TriggerKind::None,
        }
    }

    pub fn validate(&self, function: &str) -> Result<(), SpecError> {
        match self {
            TriggerSpec::Http { path, .. } if !path.starts_with('/') => {
                Err(invalid(format!("{function}: http trigger path must start with '/', got: {path}")))
            }
            TriggerSpec::Topic { topic, .. } if topic.is_empty() => {
                Err(invalid(format!("{function}: topic trigger needs a non-empty topic name")))
            }
            _ => Ok(()),
        }
    }
}

/// Ordered set of functions sharing a namespace. Order is irrelevant for
/// correctness but preserved so apply logging is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub namespace: String,
    pub functions: Vec<FunctionEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionEntry {
    pub function: FunctionSpec,
    #[serde(default = "default_trigger")]
    pub trigger: TriggerSpec,
}

fn default_trigger() -> TriggerSpec {
    TriggerSpec::None
}

impl DeploymentSpec {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), functions: Vec::new() }
    }

    pub fn with_function(mut self, function: FunctionSpec, trigger: TriggerSpec) -> Self {
        self.functions.push(FunctionEntry { function, trigger });
        self
    }

    /// Checks every invariant the reconciler relies on. Called before any
    /// cluster traffic.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.namespace.is_empty() {
            return Err(invalid("deployment namespace must not be empty"));
        }
        if self.functions.is_empty() {
            return Err(invalid("deployment needs at least one function"));
        }
        let mut seen = HashSet::new();
        for entry in &self.functions {
            entry.function.validate()?;
            entry.trigger.validate(&entry.function.name)?;
            if !seen.insert(entry.function.name.as_str()) {
                return Err(invalid(format!("duplicate function name: {}", entry.function.name)));
            }
        }
        Ok(())
    }
}
