//! Invocation against a local endpoint, including the single 301 hop.

use funk_invoke::{InvokeError, Invoker};
use funk_manifest::Endpoint;
use funk_reconcile::{Phase, ReconcileState};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Minimal HTTP endpoint: `/moved` answers 301 pointing at `/echo`,
/// `/echo` echoes a POST body or returns "hello world" on GET. Every
/// redirect target is absolute, like a canonicalizing ingress.
async fn serve(listener: TcpListener, addr: String) {
    loop {
        let (mut sock, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(_) => return,
        };
        let addr = addr.clone();
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut tmp = [0u8; 1024];
            let body_start = loop {
                let n = match sock.read(&mut tmp).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                buf.extend_from_slice(&tmp[..n]);
                if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
                    break pos + 4;
                }
            };
            let head = String::from_utf8_lossy(&buf[..body_start]).to_string();
            let content_length: usize = head
                .lines()
                .find_map(|l| {
                    let lower = l.to_ascii_lowercase();
                    lower.strip_prefix("content-length:").map(|v| v.trim().to_string())
                })
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            while buf.len() < body_start + content_length {
                let n = match sock.read(&mut tmp).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                buf.extend_from_slice(&tmp[..n]);
            }
            let body = String::from_utf8_lossy(&buf[body_start..]).to_string();
            let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();

            let response = if path.starts_with("/moved") {
                format!(
                    "HTTP/1.1 301 Moved Permanently\r\nLocation: http://{addr}/echo\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                )
            } else {
                let payload = if body.is_empty() { "hello world".to_string() } else { body };
                format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    payload.len(),
                    payload
                )
            };
            let _ = sock.write_all(response.as_bytes()).await;
            let _ = sock.shutdown().await;
        });
    }
}

async fn start_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let addr_for_server = addr.clone();
    tokio::spawn(async move { serve(listener, addr_for_server).await });
    addr
}

fn ready(name: &str, url: String) -> ReconcileState {
    ReconcileState {
        name: name.into(),
        phase: Phase::Ready,
        endpoint: Some(Endpoint::Url(url)),
        failure: None,
    }
}

#[tokio::test]
async fn get_invocation_returns_the_function_result() {
    let addr = start_server().await;
    let invoker = Invoker::new().unwrap();
    let state = ready("hello", format!("http://{addr}/echo"));

    let res = invoker.invoke(&state, None).await.unwrap();
    assert_eq!(res.status, 200);
    assert!(res.body.contains("hello world"), "body={}", res.body);
}

#[tokio::test]
async fn post_follows_a_301_exactly_once_and_echoes_the_payload() {
    let addr = start_server().await;
    let invoker = Invoker::new().unwrap();
    let state = ready("echo", format!("http://{addr}/moved"));

    let payload = json!({"hello": "world"});
    let res = invoker.invoke(&state, Some(&payload)).await.unwrap();
    assert_eq!(res.status, 200);
    assert!(res.body.contains("\"hello\""), "body={}", res.body);
    assert!(res.body.contains("\"world\""), "body={}", res.body);
}

#[tokio::test]
async fn unreachable_endpoint_surfaces_an_invocation_error() {
    let invoker = Invoker::new().unwrap();
    // Reserved TEST-NET address; nothing listens there.
    let state = ready("hello", "http://192.0.2.1:9/echo".to_string());
    let err = invoker.invoke(&state, None).await.unwrap_err();
    assert!(matches!(err, InvokeError::Invocation(_)));
}
