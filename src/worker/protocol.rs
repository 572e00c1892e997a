//! The message protocol between the UI and the worker.
//!
//! Requests are JSON objects tagged by `type`:
//!
//! ```json
//! {"type": "query", "request_id": 3, "bounds": {"min_y": 0, "max_y": 100, "xType": "x_dist"}}
//! ```
//!
//! and responses are `{"type": ..., "data": ..., "request_id": ...}` where
//! `request_id` echoes the request's, when it had one.

use serde::{Deserialize, Serialize};
use serde_json::{from_str, from_value, Value};

use super::bounds::{QueryBounds, QueryResult};
use crate::{
    abstract_filtering::SearchResult,
    file_format::{StatusMessage, UploadPayload},
    worker_error::{Result, WorkerError},
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerRequest {
    Upload(UploadPayload),
    Query {
        #[serde(default)]
        bounds: Option<QueryBounds>,
    },
    Search {
        /// Usually a JSON-encoded string; see `worker::search`.
        search: Value,
        #[serde(default)]
        bounds: Option<QueryBounds>,
    },
    Config,
    Details {
        node_id: usize,
    },
    List {
        node_id: usize,
        key: String,
    },
}

impl WorkerRequest {
    pub fn type_name(&self) -> &'static str {
        match self {
            WorkerRequest::Upload(_) => "upload",
            WorkerRequest::Query { .. } => "query",
            WorkerRequest::Search { .. } => "search",
            WorkerRequest::Config => "config",
            WorkerRequest::Details { .. } => "details",
            WorkerRequest::List { .. } => "list",
        }
    }
}

/// A request plus the id it should be answered under.
#[derive(Clone, Debug, PartialEq)]
pub struct Inbound {
    pub request_id: Option<u64>,
    pub request: WorkerRequest,
}

impl Inbound {
    /// Decode one message.  On failure the `Err` is the response to send back,
    /// carrying the request id and type if they could be salvaged.
    pub fn from_value(value: Value) -> std::result::Result<Inbound, OutboundMessage> {
        let request_id = value.get("request_id").and_then(Value::as_u64);
        let request_type = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        match from_value::<WorkerRequest>(value) {
            Ok(request) => Ok(Inbound {
                request_id,
                request,
            }),
            Err(err) => Err(OutboundMessage {
                response: WorkerResponse::error(&request_type, &err.into()),
                request_id,
            }),
        }
    }

    pub fn parse_line(line: &str) -> std::result::Result<Inbound, OutboundMessage> {
        match from_str::<Value>(line) {
            Ok(value) => Inbound::from_value(value),
            Err(err) => Err(OutboundMessage {
                response: WorkerResponse::error("unknown", &err.into()),
                request_id: None,
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ErrorReport {
    pub request_type: String,
    pub layer: &'static str,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum WorkerResponse {
    Status(StatusMessage),
    Query(QueryResult),
    Search(SearchResult),
    Config(Value),
    Details(Value),
    List(Vec<Value>),
    Error(ErrorReport),
}

impl WorkerResponse {
    pub fn error(request_type: &str, err: &WorkerError) -> WorkerResponse {
        WorkerResponse::Error(ErrorReport {
            request_type: request_type.to_string(),
            layer: err.layer().name(),
            message: err.message(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OutboundMessage {
    #[serde(flatten)]
    pub response: WorkerResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
}

impl OutboundMessage {
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
