//! HTTP client for the agent server's session API.
//!
//! The server is a black box: it may answer a message POST with the
//! completed assistant message, a list of messages, an empty body, or
//! something else entirely. Everything here degrades to polling the session
//! until an assistant reply appears, and only gives up with a distinct
//! non-retryable error when the polling window closes empty.

use std::time::{Duration, Instant};

use reqwest::Method;
use serde_json::{Value, json};
use thiserror::Error;
use utils::{msg, text::fmt_elapsed};

use crate::model::ModelRef;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const MESSAGE_POST_TIMEOUT: Duration = Duration::from_secs(600);
const POLL_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const POLL_INTERVAL: Duration = Duration::from_millis(1500);
const POLL_DEADLINE: Duration = Duration::from_secs(120);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("agent server request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected response from agent server: {0}")]
    UnexpectedResponse(String),
    /// No assistant reply within the polling window. Non-retryable: the
    /// agent never started, so further attempts would fail identically.
    #[error("agent did not run: {0}")]
    AgentDidNotRun(String),
}

/// Connection settings, populated once at startup from the environment.
#[derive(Debug, Clone)]
pub struct AgentServerConfig {
    pub base_url: String,
    pub username: String,
    pub password: Option<String>,
}

impl AgentServerConfig {
    pub fn from_env() -> Self {
        let base_url = std::env::var("OPENCODE_BASE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:4096".to_string())
            .trim_end_matches('/')
            .to_string();
        let username =
            std::env::var("OPENCODE_SERVER_USERNAME").unwrap_or_else(|_| "opencode".to_string());
        let password = std::env::var("OPENCODE_SERVER_PASSWORD").ok();
        Self {
            base_url,
            username,
            password,
        }
    }
}

/// Background heartbeat that prints elapsed time while a long agent call is
/// in flight. Pure printer; aborted on drop.
pub struct ProgressTimer {
    started: Instant,
    handle: tokio::task::JoinHandle<()>,
}

impl ProgressTimer {
    pub fn start() -> Self {
        let started = Instant::now();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                msg::progress(format!(
                    "Waiting for agent... ({})",
                    fmt_elapsed(started.elapsed().as_secs_f64())
                ));
            }
        });
        Self { started, handle }
    }

    pub fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

impl Drop for ProgressTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// True when a message (or its nested `info`) carries the assistant role.
pub fn is_assistant_message(msg: &Value) -> bool {
    let Some(obj) = msg.as_object() else {
        return false;
    };
    if obj.get("role").and_then(Value::as_str) == Some("assistant") {
        return true;
    }
    obj.get("info")
        .and_then(Value::as_object)
        .and_then(|info| info.get("role"))
        .and_then(Value::as_str)
        == Some("assistant")
}

/// Bring any message shape to `{info: {...}, parts: [...]}`.
///
/// Non-objects become the empty message; a missing or non-list `parts`
/// becomes `[]` so downstream code never iterates a string by character.
pub fn normalize_message(msg: &Value) -> Value {
    let Some(obj) = msg.as_object() else {
        return json!({"info": {}, "parts": []});
    };
    if obj.contains_key("info") && obj.contains_key("parts") {
        let mut out = obj.clone();
        if !out.get("parts").map(Value::is_array).unwrap_or(false) {
            out.insert("parts".to_string(), json!([]));
        }
        return Value::Object(out);
    }
    let info = match obj.get("role") {
        Some(Value::String(role)) if !role.is_empty() => json!({"role": role}),
        _ => json!({}),
    };
    let parts = match obj.get("parts") {
        Some(Value::Array(parts)) => Value::Array(parts.clone()),
        _ => json!([]),
    };
    json!({"info": info, "parts": parts})
}

fn role_of(msg: &Value) -> String {
    msg.get("role")
        .and_then(Value::as_str)
        .or_else(|| {
            msg.get("info")
                .and_then(Value::as_object)
                .and_then(|i| i.get("role"))
                .and_then(Value::as_str)
        })
        .unwrap_or("?")
        .to_string()
}

pub struct AgentClient {
    http: reqwest::Client,
    config: AgentServerConfig,
}

impl AgentClient {
    pub fn new(config: AgentServerConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn from_env() -> Self {
        Self::new(AgentServerConfig::from_env())
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// Raw request helper. Returns `None` for an empty body; a body that is
    /// not JSON comes back as a JSON string value.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        params: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<Option<Value>, ClientError> {
        let url = format!("{}{}", self.config.base_url, path);
        let mut req = self.http.request(method, &url).timeout(timeout);
        if !params.is_empty() {
            req = req.query(params);
        }
        if let Some(password) = &self.config.password {
            req = req.basic_auth(&self.config.username, Some(password));
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?.error_for_status()?;
        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Ok(None);
        }
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(_) => Ok(Some(Value::String(
                String::from_utf8_lossy(&bytes).into_owned(),
            ))),
        }
    }

    fn dir_params<'a>(directory: Option<&'a str>) -> Vec<(&'static str, &'a str)> {
        match directory {
            Some(dir) => vec![("directory", dir)],
            None => Vec::new(),
        }
    }

    /// GET the server health endpoint; anything but a JSON object is fatal.
    pub async fn check_health(&self) -> Result<Value, ClientError> {
        let health = self
            .request(Method::GET, "/global/health", None, &[], REQUEST_TIMEOUT)
            .await?;
        match health {
            Some(value) if value.is_object() => {
                let version = value
                    .get("version")
                    .and_then(Value::as_str)
                    .unwrap_or("?")
                    .to_string();
                msg::ok(format!("Server up — version: {version}"));
                Ok(value)
            }
            other => Err(ClientError::UnexpectedResponse(format!(
                "health endpoint returned {other:?} (expected object)"
            ))),
        }
    }

    /// Create a session scoped to `directory`; rejects responses without an
    /// `id` field.
    pub async fn create_session(&self, directory: &str) -> Result<String, ClientError> {
        let session = self
            .request(
                Method::POST,
                "/session",
                Some(&json!({"title": "patch-gen"})),
                &Self::dir_params(Some(directory)),
                REQUEST_TIMEOUT,
            )
            .await?;
        let id = session
            .as_ref()
            .and_then(Value::as_object)
            .and_then(|obj| obj.get("id"))
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        match id {
            Some(id) => {
                msg::ok(format!("Session: {id}"));
                Ok(id)
            }
            None => Err(ClientError::UnexpectedResponse(format!(
                "session response missing 'id': {session:?}"
            ))),
        }
    }

    /// Send the coding task and return the assistant's reply, normalized.
    ///
    /// Handles all four response shapes: completed message, message list,
    /// empty body, and unexpected payloads; the latter two fall back to
    /// polling. Raises [`ClientError::AgentDidNotRun`] when the polling
    /// window closes with no assistant message.
    pub async fn send_task(
        &self,
        session_id: &str,
        prompt: &str,
        directory: &str,
        agent: &str,
        model: Option<&ModelRef>,
    ) -> Result<Value, ClientError> {
        let mut body = json!({
            "agent": agent,
            "parts": [{"type": "text", "text": prompt}],
        });
        if let Some(model) = model {
            body["model"] = serde_json::to_value(model).expect("model serializes");
        }
        let model_desc = model
            .map(|m| format!("{}:{}", m.provider_id, m.model_id))
            .unwrap_or_else(|| "server default".to_string());
        msg::progress(format!(
            "Sending task to '{agent}' (model: {model_desc}) — waiting for response..."
        ));

        let timer = ProgressTimer::start();
        let msg_value = self
            .request(
                Method::POST,
                &format!("/session/{session_id}/message"),
                Some(&body),
                &Self::dir_params(Some(directory)),
                MESSAGE_POST_TIMEOUT,
            )
            .await?;

        let finish = |value: Value| {
            msg::ok(format!("Agent finished ({})", fmt_elapsed(timer.elapsed())));
            Ok(value)
        };

        match msg_value {
            // Empty body: poll for the reply.
            None => {
                msg::progress("Message POST returned no body; polling for assistant reply...");
                finish(self.wait_for_assistant_message(session_id, Some(directory)).await?)
            }
            Some(Value::String(s)) if s.trim().is_empty() => {
                msg::progress("Message POST returned no body; polling for assistant reply...");
                finish(self.wait_for_assistant_message(session_id, Some(directory)).await?)
            }
            // List: pick the last assistant message, else poll.
            Some(Value::Array(items)) => {
                if let Some(last) = items.iter().rev().find(|m| is_assistant_message(m)) {
                    return finish(normalize_message(last));
                }
                finish(self.wait_for_assistant_message(session_id, Some(directory)).await?)
            }
            // Completed assistant message.
            Some(value) if is_assistant_message(&value) => finish(normalize_message(&value)),
            // Anything else: poll.
            Some(_) => {
                msg::progress("Unexpected response shape; polling for assistant reply...");
                finish(self.wait_for_assistant_message(session_id, Some(directory)).await?)
            }
        }
    }

    /// Poll the session messages until an assistant reply appears or the
    /// deadline elapses. The first three polls and every 20th thereafter
    /// log a progress line with the roles seen so far.
    async fn wait_for_assistant_message(
        &self,
        session_id: &str,
        directory: Option<&str>,
    ) -> Result<Value, ClientError> {
        let deadline = Instant::now() + POLL_DEADLINE;
        let mut poll_count = 0u32;

        while Instant::now() < deadline {
            let messages = self.get_messages(session_id, directory).await?;
            poll_count += 1;
            if poll_count <= 3 || poll_count % 20 == 0 {
                let roles: Vec<String> = messages
                    .iter()
                    .filter(|m| m.is_object())
                    .map(role_of)
                    .collect();
                println!(
                    "  [poll {poll_count}] {} message(s), roles={roles:?}",
                    messages.len()
                );
                if poll_count == 1
                    && let Some(last) = messages.last().and_then(Value::as_object)
                {
                    let keys: Vec<&String> = last.keys().collect();
                    println!("  [poll {poll_count}] last message keys: {keys:?}");
                }
            }
            if let Some(found) = messages.iter().rev().find(|m| is_assistant_message(m)) {
                return Ok(normalize_message(found));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        let messages = self.get_messages(session_id, directory).await.unwrap_or_default();
        let detail = match messages.last() {
            Some(last) => {
                let info = last.get("info").unwrap_or(last);
                format!(
                    "no assistant message within {}s; last message role={:?}, error={:?}",
                    POLL_DEADLINE.as_secs(),
                    info.get("role"),
                    info.get("error")
                )
            }
            None => format!(
                "no assistant message within {}s (no messages found)",
                POLL_DEADLINE.as_secs()
            ),
        };
        Err(ClientError::AgentDidNotRun(format!(
            "{detail}; check that the configured model matches a valid providerID:modelID"
        )))
    }

    /// All messages in the session; a single object becomes a one-element
    /// list, any other shape an empty one.
    pub async fn get_messages(
        &self,
        session_id: &str,
        directory: Option<&str>,
    ) -> Result<Vec<Value>, ClientError> {
        let raw = self
            .request(
                Method::GET,
                &format!("/session/{session_id}/message"),
                None,
                &Self::dir_params(directory),
                POLL_REQUEST_TIMEOUT,
            )
            .await?;
        Ok(match raw {
            Some(Value::Array(items)) => items,
            Some(value @ Value::Object(_)) => vec![value],
            _ => Vec::new(),
        })
    }

    /// Session metadata; failures tolerated for trajectory collection.
    pub async fn get_session(&self, session_id: &str, directory: Option<&str>) -> Option<Value> {
        self.request(
            Method::GET,
            &format!("/session/{session_id}"),
            None,
            &Self::dir_params(directory),
            REQUEST_TIMEOUT,
        )
        .await
        .ok()
        .flatten()
    }

    /// File-level change status; failures tolerated.
    pub async fn get_file_status(&self, directory: Option<&str>) -> Option<Value> {
        self.request(
            Method::GET,
            "/file/status",
            None,
            &Self::dir_params(directory),
            REQUEST_TIMEOUT,
        )
        .await
        .ok()
        .flatten()
    }

    /// Structured session diff; failures tolerated.
    pub async fn get_session_diff(&self, session_id: &str, directory: Option<&str>) -> Option<Value> {
        self.request(
            Method::GET,
            &format!("/session/{session_id}/diff"),
            None,
            &Self::dir_params(directory),
            REQUEST_TIMEOUT,
        )
        .await
        .ok()
        .flatten()
    }

    /// Provider/model catalog endpoint, raw.
    pub async fn get_providers(&self, directory: Option<&str>) -> Result<Option<Value>, ClientError> {
        self.request(
            Method::GET,
            "/config/providers",
            None,
            &Self::dir_params(directory),
            REQUEST_TIMEOUT,
        )
        .await
    }

    /// Best-effort session deletion.
    pub async fn cleanup_session(&self, session_id: &str, directory: &str) {
        let result = self
            .request(
                Method::DELETE,
                &format!("/session/{session_id}"),
                None,
                &Self::dir_params(Some(directory)),
                REQUEST_TIMEOUT,
            )
            .await;
        match result {
            Ok(_) => msg::ok("Session cleaned up."),
            Err(err) => tracing::debug!(%err, "session cleanup failed"),
        }
    }
}

/// Print the assistant's visible reply: text parts plus a tool-call count.
pub fn print_response(msg_value: Option<&Value>) {
    let Some(msg_value) = msg_value else {
        msg::warn("No response from agent.");
        return;
    };
    let parts = msg_value
        .get("parts")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for part in &parts {
        if part.get("type").and_then(Value::as_str) == Some("text")
            && let Some(text) = part.get("text").and_then(Value::as_str)
        {
            println!("  {text}");
        }
    }
    let tool_parts = parts
        .iter()
        .filter(|p| p.get("type").and_then(Value::as_str) == Some("tool"))
        .count();
    if tool_parts > 0 {
        msg::ok(format!("{tool_parts} tool call(s) made"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_role_from_top_level_or_info() {
        assert!(is_assistant_message(&json!({"role": "assistant"})));
        assert!(is_assistant_message(&json!({"info": {"role": "assistant"}})));
        assert!(!is_assistant_message(&json!({"role": "user"})));
        assert!(!is_assistant_message(&json!("assistant")));
        assert!(!is_assistant_message(&json!(null)));
    }

    #[test]
    fn normalize_non_dict_to_empty_message() {
        let out = normalize_message(&json!("oops"));
        assert_eq!(out, json!({"info": {}, "parts": []}));
    }

    #[test]
    fn normalize_defaults_non_list_parts() {
        let out = normalize_message(&json!({"info": {"role": "assistant"}, "parts": "text!"}));
        assert_eq!(out["parts"], json!([]));
        assert_eq!(out["info"]["role"], "assistant");
    }

    #[test]
    fn normalize_lifts_top_level_role() {
        let out = normalize_message(&json!({"role": "assistant", "parts": [{"type": "text"}]}));
        assert_eq!(out["info"]["role"], "assistant");
        assert_eq!(out["parts"].as_array().unwrap().len(), 1);
    }
}
