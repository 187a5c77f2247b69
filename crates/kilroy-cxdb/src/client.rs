use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use kilroy_types::{KilroyError, Result};

/// Per-request HTTP timeout. The client is stateless across calls; every
/// request is bounded so a wedged server cannot block the engine.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextInfo {
    pub context_id: String,
    pub head_turn_id: String,
    pub head_depth: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppendTurnRequest {
    pub type_id: String,
    pub type_version: u32,
    pub data: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_turn_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppendTurnResponse {
    pub context_id: String,
    pub turn_id: String,
    pub depth: i64,
    pub payload_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Turn {
    pub turn_id: String,
    pub parent_turn_id: String,
    pub depth: i64,
    pub type_id: String,
    pub type_version: i64,
    pub payload: Option<serde_json::Map<String, Value>>,
    pub payload_hash: String,
}

#[derive(Debug, Clone, Default)]
pub struct ListTurnsOptions {
    pub limit: Option<usize>,
    pub before_turn_id: Option<String>,
    pub view: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct Client {
    base_url: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| KilroyError::ConfigError(format!("cxdb http client: {e}")))?;
        Ok(Self { base_url, http })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Probe server liveness. Tries `/health`, then `/healthz` for servers
    /// that only expose the latter.
    pub async fn health(&self) -> Result<()> {
        match self.get_ok("/health").await {
            Ok(()) => Ok(()),
            Err(e) if should_try_compat(&e) => self.get_ok("/healthz").await,
            Err(_) => self.get_ok("/healthz").await,
        }
    }

    async fn get_ok(&self, path: &str) -> Result<()> {
        let resp = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .map_err(|e| transport_err(path, e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(http_err(path, status.as_u16(), &body));
        }
        Ok(())
    }

    /// `POST /v1/contexts/create` — start a new context chain.
    pub async fn create_context(&self, base_turn_id: &str) -> Result<ContextInfo> {
        self.post_context("/v1/contexts/create", base_turn_id).await
    }

    /// `POST /v1/contexts/fork` — fork from an existing turn.
    pub async fn fork_context(&self, base_turn_id: &str) -> Result<ContextInfo> {
        self.post_context("/v1/contexts/fork", base_turn_id).await
    }

    async fn post_context(&self, path: &str, base_turn_id: &str) -> Result<ContextInfo> {
        let base_turn_id = if base_turn_id.trim().is_empty() {
            "0"
        } else {
            base_turn_id.trim()
        };
        let body = serde_json::json!({ "base_turn_id": base_turn_id });
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_err(path, e))?;
        let status = resp.status();
        let raw = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(http_err(path, status.as_u16(), &raw));
        }
        let info = parse_context_info(&raw)?;
        if info.context_id.trim().is_empty() {
            return Err(KilroyError::Other(
                "cxdb create context: missing context_id".into(),
            ));
        }
        Ok(info)
    }

    /// `POST /v1/contexts/{id}/append`. Legacy compatibility: on 404/405 the
    /// same data is retried under `/turns` with the key `payload` instead of
    /// `data`.
    pub async fn append_turn(
        &self,
        context_id: &str,
        req: AppendTurnRequest,
    ) -> Result<AppendTurnResponse> {
        if context_id.trim().is_empty() {
            return Err(KilroyError::ConfigError("context_id is required".into()));
        }
        if req.type_id.trim().is_empty() || req.type_version == 0 {
            return Err(KilroyError::ConfigError(
                "type_id and type_version are required".into(),
            ));
        }

        let path = format!("/v1/contexts/{}/append", context_id);
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(&req)
            .send()
            .await
            .map_err(|e| transport_err(&path, e))?;
        let status = resp.status().as_u16();
        let raw = resp.text().await.unwrap_or_default();

        if status == 404 || status == 405 {
            return self.append_turn_legacy(context_id, &req).await;
        }
        if !(200..300).contains(&status) {
            return Err(http_err(&path, status, &raw));
        }
        finish_append(&raw)
    }

    async fn append_turn_legacy(
        &self,
        context_id: &str,
        req: &AppendTurnRequest,
    ) -> Result<AppendTurnResponse> {
        let mut compat = serde_json::json!({
            "type_id": req.type_id,
            "type_version": req.type_version,
            "payload": req.data,
        });
        if let Some(parent) = req.parent_turn_id.as_deref().filter(|s| !s.trim().is_empty()) {
            compat["parent_turn_id"] = Value::String(parent.to_string());
        }
        if let Some(key) = req.idempotency_key.as_deref().filter(|s| !s.trim().is_empty()) {
            compat["idempotency_key"] = Value::String(key.to_string());
        }

        let path = format!("/v1/contexts/{}/turns", context_id);
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(&compat)
            .send()
            .await
            .map_err(|e| transport_err(&path, e))?;
        let status = resp.status().as_u16();
        let raw = resp.text().await.unwrap_or_default();
        if !(200..300).contains(&status) {
            return Err(http_err(&path, status, &raw));
        }
        finish_append(&raw)
    }

    /// `GET /v1/contexts/{id}`. Older servers without direct GET are served
    /// from the listing endpoint.
    pub async fn get_context(&self, context_id: &str) -> Result<ContextInfo> {
        if context_id.trim().is_empty() {
            return Err(KilroyError::ConfigError("context_id is required".into()));
        }
        let path = format!("/v1/contexts/{}", context_id);
        let resp = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .map_err(|e| transport_err(&path, e))?;
        let status = resp.status().as_u16();
        let raw = resp.text().await.unwrap_or_default();

        if status == 404 || status == 405 {
            let list = self.list_contexts().await?;
            if let Some(ci) = list.into_iter().find(|ci| ci.context_id == context_id) {
                return Ok(ci);
            }
            return Err(http_err(&path, status, &raw));
        }
        if !(200..300).contains(&status) {
            return Err(http_err(&path, status, &raw));
        }
        let mut info = parse_context_info(&raw)?;
        if info.context_id.trim().is_empty() {
            info.context_id = context_id.to_string();
        }
        Ok(info)
    }

    /// `GET /v1/contexts`. Accepts both a bare array and `{"contexts": [...]}`.
    pub async fn list_contexts(&self) -> Result<Vec<ContextInfo>> {
        let path = "/v1/contexts";
        let resp = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .map_err(|e| transport_err(path, e))?;
        let status = resp.status().as_u16();
        let raw = resp.text().await.unwrap_or_default();
        if !(200..300).contains(&status) {
            return Err(http_err(path, status, &raw));
        }
        let maps = parse_object_list(&raw, "contexts")?;
        Ok(maps.iter().map(parse_context_info_map).collect())
    }

    /// `GET /v1/contexts/{id}/turns?limit=&before_turn_id=&view=`.
    pub async fn list_turns(
        &self,
        context_id: &str,
        opts: ListTurnsOptions,
    ) -> Result<Vec<Turn>> {
        if context_id.trim().is_empty() {
            return Err(KilroyError::ConfigError("context_id is required".into()));
        }
        let path = format!("/v1/contexts/{}/turns", context_id);
        let mut query: Vec<(String, String)> = Vec::new();
        if let Some(limit) = opts.limit.filter(|n| *n > 0) {
            query.push(("limit".into(), limit.to_string()));
        }
        if let Some(before) = opts.before_turn_id.as_deref().filter(|s| !s.trim().is_empty()) {
            query.push(("before_turn_id".into(), before.trim().to_string()));
        }
        if let Some(view) = opts.view.as_deref().filter(|s| !s.trim().is_empty()) {
            query.push(("view".into(), view.trim().to_string()));
        }

        let resp = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .query(&query)
            .send()
            .await
            .map_err(|e| transport_err(&path, e))?;
        let status = resp.status().as_u16();
        let raw = resp.text().await.unwrap_or_default();
        if !(200..300).contains(&status) {
            return Err(http_err(&path, status, &raw));
        }
        let maps = parse_object_list(&raw, "turns")?;
        Ok(maps.iter().map(parse_turn_map).collect())
    }

    /// `PUT /v1/registry/bundles/{id}` — publish the field-tag registry used
    /// by the msgpack encoder. 201/204 are the success statuses.
    pub async fn publish_registry_bundle(
        &self,
        bundle_id: &str,
        bundle: &Value,
    ) -> Result<u16> {
        if bundle_id.trim().is_empty() {
            return Err(KilroyError::ConfigError("bundle_id is required".into()));
        }
        let path = format!("/v1/registry/bundles/{}", bundle_id);
        let resp = self
            .http
            .put(format!("{}{}", self.base_url, path))
            .json(bundle)
            .send()
            .await
            .map_err(|e| transport_err(&path, e))?;
        let status = resp.status().as_u16();
        if status == 201 || status == 204 {
            return Ok(status);
        }
        let raw = resp.text().await.unwrap_or_default();
        Err(http_err(&path, status, &raw))
    }
}

// ---------------------------------------------------------------------------
// Parse helpers — tolerant of numeric IDs and wrapper objects
// ---------------------------------------------------------------------------

fn transport_err(path: &str, e: reqwest::Error) -> KilroyError {
    KilroyError::CxdbError {
        path: path.to_string(),
        status: 0,
        code: None,
        message: e.to_string(),
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

pub(crate) fn http_err(path: &str, status: u16, raw: &str) -> KilroyError {
    if let Ok(env) = serde_json::from_str::<ErrorEnvelope>(raw) {
        if !env.error.message.trim().is_empty() {
            return KilroyError::CxdbError {
                path: path.to_string(),
                status,
                code: Some(env.error.code).filter(|c| !c.is_empty()),
                message: env.error.message,
            };
        }
    }
    KilroyError::CxdbError {
        path: path.to_string(),
        status,
        code: None,
        message: raw.trim().to_string(),
    }
}

fn should_try_compat(err: &KilroyError) -> bool {
    matches!(
        err,
        KilroyError::CxdbError {
            status: 404 | 405,
            ..
        }
    )
}

fn finish_append(raw: &str) -> Result<AppendTurnResponse> {
    let out = parse_append_turn_response(raw)?;
    if out.turn_id.trim().is_empty() {
        return Err(KilroyError::Other("cxdb append: missing turn_id".into()));
    }
    Ok(out)
}

fn parse_object_list(raw: &str, wrapper_key: &str) -> Result<Vec<serde_json::Map<String, Value>>> {
    if let Ok(arr) = serde_json::from_str::<Vec<serde_json::Map<String, Value>>>(raw) {
        return Ok(arr);
    }
    let wrapped: serde_json::Map<String, Value> = serde_json::from_str(raw)?;
    match wrapped.get(wrapper_key) {
        Some(Value::Array(items)) => Ok(items
            .iter()
            .filter_map(|v| v.as_object().cloned())
            .collect()),
        _ => Ok(Vec::new()),
    }
}

/// Render a JSON value as an ID string. Numeric IDs come back from some
/// servers where others use strings; both must compare equal downstream.
pub(crate) fn any_to_string(v: Option<&Value>) -> String {
    match v {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else {
                n.to_string()
            }
        }
        Some(other) => other.to_string(),
    }
}

pub(crate) fn any_to_i64(v: Option<&Value>) -> i64 {
    match v {
        Some(Value::Number(n)) => n.as_i64().unwrap_or_else(|| n.as_f64().unwrap_or(0.0) as i64),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

pub(crate) fn parse_context_info(raw: &str) -> Result<ContextInfo> {
    let m: serde_json::Map<String, Value> = serde_json::from_str(raw)?;
    Ok(parse_context_info_map(&m))
}

pub(crate) fn parse_context_info_map(m: &serde_json::Map<String, Value>) -> ContextInfo {
    ContextInfo {
        context_id: any_to_string(m.get("context_id")),
        head_turn_id: any_to_string(m.get("head_turn_id")),
        head_depth: any_to_i64(m.get("head_depth")),
    }
}

pub(crate) fn parse_append_turn_response(raw: &str) -> Result<AppendTurnResponse> {
    let m: serde_json::Map<String, Value> = serde_json::from_str(raw)?;
    let payload_hash = {
        let primary = any_to_string(m.get("payload_hash"));
        if primary.trim().is_empty() {
            // Backward-compat key.
            any_to_string(m.get("content_hash"))
        } else {
            primary
        }
    };
    Ok(AppendTurnResponse {
        context_id: any_to_string(m.get("context_id")),
        turn_id: any_to_string(m.get("turn_id")),
        depth: any_to_i64(m.get("depth")),
        payload_hash,
    })
}

pub(crate) fn parse_turn_map(m: &serde_json::Map<String, Value>) -> Turn {
    let mut type_id = any_to_string(m.get("type_id"));
    let mut type_version = any_to_i64(m.get("type_version"));
    // The typed view nests declared_type/decoded_as objects.
    for nested_key in ["declared_type", "decoded_as"] {
        if type_id.is_empty() || type_version == 0 {
            if let Some(Value::Object(nested)) = m.get(nested_key) {
                if type_id.is_empty() {
                    type_id = any_to_string(nested.get("type_id"));
                }
                if type_version == 0 {
                    type_version = any_to_i64(nested.get("type_version"));
                }
            }
        }
    }
    let payload = match (m.get("payload"), m.get("data")) {
        (Some(Value::Object(p)), _) => Some(p.clone()),
        (_, Some(Value::Object(d))) => Some(d.clone()),
        _ => None,
    };
    Turn {
        turn_id: any_to_string(m.get("turn_id")),
        parent_turn_id: any_to_string(m.get("parent_turn_id")),
        depth: any_to_i64(m.get("depth")),
        type_id,
        type_version,
        payload,
        payload_hash: any_to_string(m.get("payload_hash")),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
