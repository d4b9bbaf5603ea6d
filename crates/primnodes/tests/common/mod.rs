// Shared fixtures for the executor tests.
#![allow(dead_code)]

use primcore::{EventBus, ExecutionContext, NodeContext, Value};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Context for one direct executor call.
pub fn context(subtype: &str, config: Value, input: Value) -> NodeContext {
    context_with_trigger(subtype, config, input, json!({}))
}

pub fn context_with_trigger(
    subtype: &str,
    config: Value,
    input: Value,
    trigger_data: Value,
) -> NodeContext {
    let bus = EventBus::new(64);
    let run_id = Uuid::new_v4();
    NodeContext {
        run_id,
        node_id: "node".to_string(),
        subtype: subtype.to_string(),
        config: config.as_object().cloned().unwrap_or_default(),
        input,
        context: ExecutionContext::new(trigger_data).snapshot(),
        attempt: 1,
        events: bus.create_emitter(run_id, "node"),
        cancellation: CancellationToken::new(),
    }
}

/// One request as the test server saw it.
#[derive(Debug, Clone)]
pub struct Captured {
    pub request_line: String,
    pub head: String,
    pub body: String,
}

impl Captured {
    pub fn json_body(&self) -> Value {
        serde_json::from_str(&self.body).unwrap()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.head.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        401 => "Unauthorized",
        404 => "Not Found",
        503 => "Service Unavailable",
        _ => "Status",
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// Minimal HTTP server answering one connection per entry of `replies`, in order.
///
/// Returns the base URL and a handle yielding every captured request.
pub async fn serve(replies: Vec<(u16, Value)>) -> (String, JoinHandle<Vec<Captured>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let mut captured = Vec::new();
        for (status, body) in replies {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];

            let head_end = loop {
                let n = socket.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                if let Some(end) = find_head_end(&buf) {
                    break end;
                }
                if n == 0 {
                    break buf.len();
                }
            };
            let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
            let length = head
                .lines()
                .find_map(|line| {
                    let (key, value) = line.split_once(':')?;
                    key.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            while buf.len() < head_end + length {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }

            let payload = body.to_string();
            let response = format!(
                "HTTP/1.1 {} {}\r\ncontent-type: application/json\r\n\
                 content-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                reason(status),
                payload.len(),
                payload
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;

            captured.push(Captured {
                request_line: head.lines().next().unwrap_or_default().to_string(),
                body: String::from_utf8_lossy(&buf[head_end..]).to_string(),
                head,
            });
        }
        captured
    });

    (format!("http://{}", addr), handle)
}

/// Address nothing listens on.
pub const UNREACHABLE: &str = "http://127.0.0.1:1/";
