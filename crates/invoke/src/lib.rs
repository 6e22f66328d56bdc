//! funk invoker: synchronous invocation of a Ready function over its
//! resolved endpoint. A thin pass-through once the reconciler guarantees
//! readiness; the only protocol smarts here is the single-hop 301 follow
//! some cluster ingresses emit when canonicalizing the host.

#![forbid(unsafe_code)]

use reqwest::{redirect, Method, StatusCode};
use serde_json::Value as Json;
use thiserror::Error;
use tracing::{debug, info};

use funk_reconcile::{Phase, ReconcileState};

#[derive(Debug, Error)]
pub enum InvokeError {
    /// The function has not reached Ready; re-poll or wait.
    #[error("{0} is not ready")]
    NotReady(String),
    /// The endpoint is not HTTP-reachable (topic triggers are published to
    /// via the external messaging substrate, not invoked).
    #[error("{0} has no invokable endpoint")]
    NotInvokable(String),
    #[error("invocation failed: {0}")]
    Invocation(String),
}

#[derive(Debug, Clone)]
pub struct InvokeResponse {
    pub status: u16,
    pub body: String,
}

pub struct Invoker {
    http: reqwest::Client,
}

impl Invoker {
    /// Redirects are disabled on the client; the one permitted hop is
    /// followed explicitly in `invoke`. Certificate checks are relaxed the
    /// way in-cluster ingress endpoints require.
    pub fn new() -> Result<Self, InvokeError> {
        let http = reqwest::Client::builder()
            .redirect(redirect::Policy::none())
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| InvokeError::Invocation(e.to_string()))?;
        Ok(Self { http })
    }

    /// Invoke a Ready function. GET when there is no payload, POST with a
    /// JSON body otherwise. A 301 is followed exactly once; a second
    /// redirect is returned to the caller as-is.
    pub async fn invoke(&self, state: &ReconcileState, payload: Option<&Json>) -> Result<InvokeResponse, InvokeError> {
        if state.phase != Phase::Ready {
            return Err(InvokeError::NotReady(state.name.clone()));
        }
        let url = state
            .endpoint
            .as_ref()
            .and_then(|ep| ep.url())
            .ok_or_else(|| InvokeError::NotInvokable(state.name.clone()))?;

        let method = if payload.is_some() { Method::POST } else { Method::GET };
        info!(function = %state.name, url = %url, method = %method, "invoking");

        let first = self.send_once(method.clone(), url, payload).await?;
        if first.status() == StatusCode::MOVED_PERMANENTLY {
            if let Some(location) = first
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
            {
                debug!(function = %state.name, location = %location, "following 301 once");
                let second = self.send_once(method, &location, payload).await?;
                return Self::finish(second).await;
            }
        }
        Self::finish(first).await
    }

    async fn send_once(&self, method: Method, url: &str, payload: Option<&Json>) -> Result<reqwest::Response, InvokeError> {
        let mut req = self.http.request(method, url);
        if let Some(body) = payload {
            req = req.json(body);
        }
        req.send().await.map_err(|e| InvokeError::Invocation(e.to_string()))
    }

    async fn finish(res: reqwest::Response) -> Result<InvokeResponse, InvokeError> {
        let status = res.status().as_u16();
        let body = res.text().await.map_err(|e| InvokeError::Invocation(e.to_string()))?;
        Ok(InvokeResponse { status, body })
    }
}
