use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use flowcore::{ExecutionNode, StoreError};
use reqwest::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

pub const SCHEMA_VERSION: u32 = 2;

const CLIENT_USER_AGENT: &str = concat!("flowtrace/", env!("CARGO_PKG_VERSION"));

/// One checkpoint as sent to the remote trace store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointPayload {
    pub execution_id: String,
    pub version: u64,
    pub schema_version: u32,
    pub workflow_name: String,
    pub started_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    /// Base64 of the gzip-compressed, already redacted execution tree.
    pub raw_execution: String,
    pub steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_run_id: Option<String>,
}

impl CheckpointPayload {
    /// Decode `raw_execution` back into the tree it was built from.
    pub fn execution(&self) -> Result<ExecutionNode, StoreError> {
        decode_raw_execution(&self.raw_execution)
    }
}

/// What the store told us about a checkpoint it accepted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceReceipt {
    pub trace_id: Option<String>,
    pub execution_id: Option<String>,
    pub workflow_name: Option<String>,
}

/// Remote destination for checkpoints.
///
/// The first successful `create_trace` yields the trace id used for every
/// later `update_trace`. Errors are logged by the caller, never propagated
/// to the traced workflow.
#[async_trait]
pub trait TraceStore: Send + Sync {
    async fn create_trace(&self, payload: &CheckpointPayload) -> Result<TraceReceipt, StoreError>;

    async fn update_trace(
        &self,
        trace_id: &str,
        payload: &CheckpointPayload,
    ) -> Result<TraceReceipt, StoreError>;
}

pub fn gzip(bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

pub fn gunzip(bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Serialize a (redacted) tree with an `updatedAt` stamp, gzip it and
/// base64 the result.
pub fn encode_raw_execution(
    root: &ExecutionNode,
    updated_at: DateTime<Utc>,
) -> Result<String, StoreError> {
    let mut json = serde_json::to_value(root)?;
    if let serde_json::Value::Object(map) = &mut json {
        map.insert("updatedAt".to_string(), updated_at.timestamp_millis().into());
    }
    let compressed = gzip(&serde_json::to_vec(&json)?)?;
    Ok(STANDARD.encode(compressed))
}

pub fn decode_raw_execution(encoded: &str) -> Result<ExecutionNode, StoreError> {
    let compressed = STANDARD
        .decode(encoded)
        .map_err(|e| StoreError::Decode(e.to_string()))?;
    let bytes = gunzip(&compressed)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Pull the trace id and echo fields out of a store response. Fields may be
/// nested under `data` or sit at the top level.
pub fn parse_receipt(response: &serde_json::Value) -> TraceReceipt {
    let data = response
        .get("data")
        .filter(|d| d.is_object())
        .unwrap_or(response);
    let text = |key: &str| {
        data.get(key).and_then(|v| match v {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    };

    TraceReceipt {
        trace_id: ["traceId", "trace_id", "id"].iter().find_map(|key| text(*key)),
        execution_id: text("executionId"),
        workflow_name: text("workflowName"),
    }
}

/// Trace store speaking the HTTP API: `POST {base}/org/{org}/traces` to
/// create, `PUT {base}/org/{org}/traces/{id}` to update.
pub struct HttpTraceStore {
    client: reqwest::Client,
    base_url: String,
    org: String,
    api_key: String,
}

impl HttpTraceStore {
    pub fn new(
        base_url: impl Into<String>,
        org: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            org: org.into(),
            api_key: api_key.into(),
        }
    }

    pub fn traces_url(&self) -> String {
        format!("{}/org/{}/traces", self.base_url, self.org)
    }

    async fn send(
        &self,
        method: reqwest::Method,
        url: String,
        payload: &CheckpointPayload,
    ) -> Result<TraceReceipt, StoreError> {
        let body = gzip(&serde_json::to_vec(payload)?)?;
        tracing::debug!(version = payload.version, "Writing checkpoint to {} {}", method, url);

        let response = self
            .client
            .request(method, &url)
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_ENCODING, "gzip")
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(USER_AGENT, CLIENT_USER_AGENT)
            .body(body)
            .send()
            .await
            .map_err(|e| StoreError::Http(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| StoreError::Http(format!("Failed to read response: {}", e)))?;
        if !status.is_success() {
            return Err(StoreError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(json) => Ok(parse_receipt(&json)),
            Err(e) => {
                // A 2xx without a JSON body still counts as stored.
                tracing::warn!("Error parsing checkpoint response ({}): {}", status, e);
                Ok(TraceReceipt::default())
            }
        }
    }
}

#[async_trait]
impl TraceStore for HttpTraceStore {
    async fn create_trace(&self, payload: &CheckpointPayload) -> Result<TraceReceipt, StoreError> {
        self.send(reqwest::Method::POST, self.traces_url(), payload).await
    }

    async fn update_trace(
        &self,
        trace_id: &str,
        payload: &CheckpointPayload,
    ) -> Result<TraceReceipt, StoreError> {
        let url = format!("{}/{}", self.traces_url(), trace_id);
        self.send(reqwest::Method::PUT, url, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn receipt_reads_nested_or_flat_ids() {
        let nested = parse_receipt(&json!({
            "data": {"traceId": "t-1", "executionId": "e-1", "workflowName": "Flow"}
        }));
        assert_eq!(nested.trace_id.as_deref(), Some("t-1"));
        assert_eq!(nested.execution_id.as_deref(), Some("e-1"));
        assert_eq!(nested.workflow_name.as_deref(), Some("Flow"));

        assert_eq!(
            parse_receipt(&json!({"trace_id": "t-2"})).trace_id.as_deref(),
            Some("t-2")
        );
        assert_eq!(parse_receipt(&json!({"id": 17})).trace_id.as_deref(), Some("17"));
        assert_eq!(parse_receipt(&json!({"ok": true})), TraceReceipt::default());
    }

    #[test]
    fn raw_execution_decodes_to_the_same_tree() {
        let mut child = ExecutionNode::new("a", "Step").with_parent("root").with_output("x");
        child.end_time = DateTime::from_timestamp_millis(1_700_000_000_123);
        let root = ExecutionNode::new("root", "Workflow").with_child(child);
        let encoded = encode_raw_execution(&root, Utc::now()).unwrap();
        assert_eq!(decode_raw_execution(&encoded).unwrap(), root);
    }

    #[test]
    fn garbage_raw_execution_is_a_decode_error() {
        assert!(matches!(
            decode_raw_execution("not base64!!"),
            Err(StoreError::Decode(_))
        ));
    }

    #[test]
    fn payload_omits_absent_optional_fields() {
        let payload = CheckpointPayload {
            execution_id: "root".into(),
            version: 1,
            schema_version: SCHEMA_VERSION,
            workflow_name: "Flow".into(),
            started_at: 0,
            completed_at: None,
            raw_execution: String::new(),
            steps: 1,
            runtime: Some("sdk".into()),
            runtime_version: None,
            execution_run_id: None,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["schemaVersion"], 2);
        assert_eq!(json["runtime"], "sdk");
        assert!(json.get("completedAt").is_none());
        assert!(json.get("executionRunId").is_none());
    }

    #[test]
    fn store_urls_strip_trailing_slash() {
        let store = HttpTraceStore::new("https://api.example/", "acme", "key");
        assert_eq!(store.traces_url(), "https://api.example/org/acme/traces");
    }
}
