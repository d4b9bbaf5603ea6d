use crate::http::{self, parse_method, parse_url};
use crate::{check_value, timestamp, unsupported_subtype};
use async_trait::async_trait;
use primcore::schema::{find_schema, SubtypeSchema};
use primcore::{
    Config, ConfigExt, ConfigSchema, ExecutionError, NodeContext, NodeOutput, PrimitiveExecutor,
    PrimitiveKind, ValidationIssue, Value,
};
use reqwest::Method;
use serde_json::json;
use std::time::{Duration, Instant};
use uuid::Uuid;

const SCHEMAS: &[SubtypeSchema] = &[
    (
        "api_call",
        ConfigSchema::new(&["url"], &["method", "headers", "body", "timeout_ms"]),
    ),
    (
        "notification",
        ConfigSchema::new(&["webhook_url"], &["channel", "message", "timeout_ms"]),
    ),
    ("wait", ConfigSchema::new(&["duration"], &["unit"])),
    ("transform", ConfigSchema::new(&[], &["transform_type"])),
];

const WAIT_UNITS: &[&str] = &["milliseconds", "seconds", "minutes", "hours"];

fn wait_duration(amount: f64, unit: &str) -> Option<Duration> {
    let seconds = match unit {
        "milliseconds" => amount / 1000.0,
        "seconds" => amount,
        "minutes" => amount * 60.0,
        "hours" => amount * 3600.0,
        _ => return None,
    };
    Duration::try_from_secs_f64(seconds).ok()
}

/// Performs externally observable work: HTTP calls, notifications, waits.
///
/// Network failures, timeouts, throttling and 5xx responses are reported as
/// retryable; anything the remote side rejected for good is not.
pub struct ActionExecutor {
    client: reqwest::Client,
}

impl ActionExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn api_call(&self, ctx: &NodeContext) -> Result<Value, ExecutionError> {
        let url = parse_url(ctx.config.require_str("url")?).map_err(ExecutionError::configuration)?;
        let method_name = ctx.config.str_or("method", "GET");
        let method = parse_method(method_name).ok_or_else(|| {
            ExecutionError::configuration(format!("unsupported method '{}'", method_name))
        })?;

        ctx.events.info(format!("{} {}", method, url));
        let mut request = self.client.request(method.clone(), url);

        if let Some(headers) = ctx.config.object_value("headers") {
            for (key, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(key, value);
                }
            }
        }

        let carries_body = matches!(method, Method::POST | Method::PUT | Method::PATCH);
        match ctx.config.get("body") {
            Some(body) => request = request.json(body),
            None if carries_body && !ctx.input.is_null() => request = request.json(&ctx.input),
            None => {}
        }

        if let Some(ms) = ctx.config.u64_value("timeout_ms") {
            request = request.timeout(Duration::from_millis(ms));
        }

        let reply = http::send(ctx, request).await?;
        if let Some(error) = http::status_error(reply.status) {
            return Err(error);
        }
        ctx.events.info(format!("Response status: {}", reply.status));
        Ok(reply.to_value())
    }

    async fn notification(&self, ctx: &NodeContext) -> Result<Value, ExecutionError> {
        let url = parse_url(ctx.config.require_str("webhook_url")?)
            .map_err(ExecutionError::configuration)?;
        let channel = ctx.config.str_or("channel", "webhook");
        let message = match ctx.config.str_value("message") {
            Some(message) => message.to_string(),
            None => ctx.input.to_string(),
        };

        let mut request = self.client.post(url).json(&json!({
            "channel": channel,
            "text": message,
        }));
        if let Some(ms) = ctx.config.u64_value("timeout_ms") {
            request = request.timeout(Duration::from_millis(ms));
        }

        let reply = http::send(ctx, request).await?;
        if let Some(error) = http::status_error(reply.status) {
            return Err(error);
        }

        Ok(json!({
            "channel": channel,
            "message": message,
            "status_code": reply.status.as_u16(),
            "notification_id": format!("notif_{}", &Uuid::new_v4().simple().to_string()[..8]),
        }))
    }

    async fn wait(&self, ctx: &NodeContext) -> Result<Value, ExecutionError> {
        let amount = ctx
            .config
            .f64_value("duration")
            .ok_or_else(|| ExecutionError::configuration("'duration' must be a number"))?;
        let unit = ctx.config.str_or("unit", "seconds");
        let duration = wait_duration(amount, unit).ok_or_else(|| {
            ExecutionError::configuration(format!("invalid wait of {} {}", amount, unit))
        })?;

        tokio::select! {
            _ = ctx.cancellation.cancelled() => return Err(ExecutionError::cancelled()),
            _ = tokio::time::sleep(duration) => {}
        }

        Ok(json!({
            "waited_for": format!("{} {}", amount, unit),
            "actual_ms": duration.as_millis() as u64,
        }))
    }

    fn transform(&self, ctx: &NodeContext) -> Value {
        json!({
            "transformed": true,
            "original": ctx.input,
            "transform_type": ctx.config.str_or("transform_type", "json"),
        })
    }
}

impl Default for ActionExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PrimitiveExecutor for ActionExecutor {
    fn kind(&self) -> PrimitiveKind {
        PrimitiveKind::Action
    }

    fn subtypes(&self) -> Vec<&'static str> {
        SCHEMAS.iter().map(|(name, _)| *name).collect()
    }

    fn schema(&self, subtype: &str) -> Option<ConfigSchema> {
        find_schema(SCHEMAS, subtype)
    }

    fn description(&self) -> &str {
        "Call remote APIs, send notifications, wait or wrap data"
    }

    fn validate_config(&self, subtype: &str, config: &Config) -> Vec<ValidationIssue> {
        let Some(schema) = self.schema(subtype) else {
            return vec![unsupported_subtype(self.kind(), subtype)];
        };
        let mut issues = schema.check(config);

        for key in ["url", "webhook_url"] {
            if let Some(raw) = config.get(key) {
                match raw.as_str().map(parse_url) {
                    Some(Ok(_)) => {}
                    Some(Err(message)) => issues.push(ValidationIssue::for_key(key, message)),
                    None => issues.push(ValidationIssue::for_key(key, "expected a URL string")),
                }
            }
        }
        check_value(
            config,
            "method",
            "an HTTP method",
            |v| v.as_str().and_then(parse_method).is_some(),
            &mut issues,
        );
        check_value(config, "headers", "an object of strings", |v| {
            v.as_object().is_some_and(|h| h.values().all(Value::is_string))
        }, &mut issues);
        check_value(
            config,
            "timeout_ms",
            "a positive integer",
            |v| v.as_u64().is_some_and(|ms| ms > 0),
            &mut issues,
        );
        check_value(
            config,
            "duration",
            "a non-negative number",
            |v| v.as_f64().is_some_and(|d| d >= 0.0),
            &mut issues,
        );
        check_value(config, "unit", "one of milliseconds, seconds, minutes, hours", |v| {
            v.as_str().is_some_and(|u| WAIT_UNITS.contains(&u))
        }, &mut issues);
        issues
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, ExecutionError> {
        let started = Instant::now();
        let result = match ctx.subtype.as_str() {
            "api_call" => self.api_call(&ctx).await?,
            "notification" => self.notification(&ctx).await?,
            "wait" => self.wait(&ctx).await?,
            "transform" => self.transform(&ctx),
            other => {
                return Err(ExecutionError::configuration(format!(
                    "unsupported action subtype '{}'",
                    other
                )));
            }
        };

        Ok(NodeOutput::new(json!({
            "action_type": ctx.subtype,
            "result": result,
            "success": true,
            "execution_time_ms": started.elapsed().as_millis() as u64,
            "timestamp": timestamp(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_duration_units() {
        assert_eq!(wait_duration(1.5, "seconds"), Some(Duration::from_millis(1500)));
        assert_eq!(wait_duration(2.0, "minutes"), Some(Duration::from_secs(120)));
        assert_eq!(wait_duration(250.0, "milliseconds"), Some(Duration::from_millis(250)));
        assert_eq!(wait_duration(1.0, "fortnights"), None);
        assert_eq!(wait_duration(-1.0, "seconds"), None);
    }
}
