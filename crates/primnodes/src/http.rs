use primcore::{ErrorKind, ExecutionError, NodeContext, Value};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde_json::{json, Map};

/// Decoded response of an outbound request
pub(crate) struct HttpReply {
    pub status: StatusCode,
    pub headers: Map<String, Value>,
    pub body: Value,
}

impl HttpReply {
    pub fn to_value(&self) -> Value {
        json!({
            "status_code": self.status.as_u16(),
            "headers": self.headers,
            "body": self.body,
        })
    }
}

pub(crate) fn parse_method(raw: &str) -> Option<Method> {
    match raw.to_ascii_uppercase().as_str() {
        "GET" => Some(Method::GET),
        "POST" => Some(Method::POST),
        "PUT" => Some(Method::PUT),
        "PATCH" => Some(Method::PATCH),
        "DELETE" => Some(Method::DELETE),
        "HEAD" => Some(Method::HEAD),
        _ => None,
    }
}

/// Parse an absolute http(s) URL.
pub(crate) fn parse_url(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw).map_err(|e| format!("invalid URL '{}': {}", raw, e))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(format!("unsupported URL scheme '{}'", other)),
    }
}

/// Send a request, racing it against the node's cancellation token.
pub(crate) async fn send(
    ctx: &NodeContext,
    request: RequestBuilder,
) -> Result<HttpReply, ExecutionError> {
    let response = tokio::select! {
        _ = ctx.cancellation.cancelled() => return Err(ExecutionError::cancelled()),
        response = request.send() => response.map_err(transport_error)?,
    };

    let status = response.status();
    let headers: Map<String, Value> = response
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_str().unwrap_or("").to_string())))
        .collect();
    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("application/json"));

    let text = response.text().await.map_err(transport_error)?;
    let body = if is_json {
        serde_json::from_str::<Value>(&text).unwrap_or_else(|_| Value::String(text))
    } else {
        Value::String(text)
    };

    Ok(HttpReply { status, headers, body })
}

/// Classify a failure to get any response at all.
pub(crate) fn transport_error(err: reqwest::Error) -> ExecutionError {
    if err.is_timeout() {
        ExecutionError::transient(ErrorKind::Timeout, format!("request timed out: {}", err))
    } else if err.is_builder() {
        ExecutionError::configuration(format!("invalid request: {}", err))
    } else {
        ExecutionError::transient(ErrorKind::Network, format!("request failed: {}", err))
    }
}

/// Classify an unsuccessful status. Throttling and server errors are worth
/// retrying; other client errors are not.
pub(crate) fn status_error(status: StatusCode) -> Option<ExecutionError> {
    if !status.is_client_error() && !status.is_server_error() {
        return None;
    }
    let message = format!("remote responded with {}", status);
    let error = match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ExecutionError::permanent(ErrorKind::Credentials, message)
        }
        StatusCode::REQUEST_TIMEOUT => ExecutionError::transient(ErrorKind::Timeout, message),
        StatusCode::TOO_MANY_REQUESTS => ExecutionError::transient(ErrorKind::Network, message),
        s if s.is_server_error() => ExecutionError::transient(ErrorKind::Network, message),
        _ => ExecutionError::permanent(ErrorKind::InvalidData, message),
    };
    Some(error)
}
