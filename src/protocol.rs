//! Wire format of the daemon's REST API
//!
//! Single responsibility: describe logical requests and the response envelope.
//! No knowledge of transports, waiting, or resource types.

use serde::Deserialize;
use serde_json::Value;
use std::fmt;

use crate::error::{LxdError, Result};

/// API version prefix joined to every logical path.
pub const API_PREFIX: &str = "/1.0";

/// Status code of a freshly accepted asynchronous operation.
pub const STATUS_CREATED: u16 = 100;

/// Terminal success.
pub const STATUS_SUCCESS: u16 = 200;

/// Request verbs, including the raw GET used for file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    /// GET whose body is returned verbatim instead of being classified
    GetRaw,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl Method {
    pub fn parse(verb: &str) -> Option<Self> {
        match verb {
            "GET" => Some(Method::Get),
            "GET_RAW" => Some(Method::GetRaw),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "PATCH" => Some(Method::Patch),
            "DELETE" => Some(Method::Delete),
            "HEAD" => Some(Method::Head),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::GetRaw => "GET_RAW",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
        }
    }

    /// The HTTP verb that goes on the wire.
    pub fn http(&self) -> http::Method {
        match self {
            Method::Get | Method::GetRaw => http::Method::GET,
            Method::Post => http::Method::POST,
            Method::Put => http::Method::PUT,
            Method::Patch => http::Method::PATCH,
            Method::Delete => http::Method::DELETE,
            Method::Head => http::Method::HEAD,
        }
    }

    pub fn is_raw(&self) -> bool {
        matches!(self, Method::GetRaw)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request payload
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Value),
    Bytes(Vec<u8>),
}

/// One (method, path, body) triple dispatched through classification.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalRequest {
    pub method: Method,
    /// Path below the API prefix, always starting with `/` (or empty for the root)
    pub path: String,
    pub body: RequestBody,
}

impl LogicalRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: normalize_path(&path.into()),
            body: RequestBody::Empty,
        }
    }

    /// Parse `"<METHOD> <path>"`, e.g. `"GET /containers"`.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let (verb, path) = line.split_once(' ').unwrap_or((line, ""));
        let method = Method::parse(verb.trim())
            .ok_or_else(|| LxdError::Protocol(format!("Unknown request method: {}", verb)))?;
        Ok(Self::new(method, path.trim()))
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn get_raw(path: impl Into<String>) -> Self {
        Self::new(Method::GetRaw, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Post, path).with_body(RequestBody::Json(body))
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Put, path).with_body(RequestBody::Json(body))
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    /// Full path on the wire, including the API prefix.
    pub fn wire_path(&self) -> String {
        format!("{}{}", API_PREFIX, self.path)
    }
}

impl fmt::Display for LogicalRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.wire_path())
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_start_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

/// Top-level response shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    Sync,
    Async,
    Error,
}

impl ResponseType {
    pub fn from_wire(kind: &str) -> Option<Self> {
        match kind {
            "sync" => Some(ResponseType::Sync),
            "async" => Some(ResponseType::Async),
            "error" => Some(ResponseType::Error),
            _ => None,
        }
    }
}

/// The structured body of every non-raw response.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_code: u16,
    /// URL of the operation, for async responses
    #[serde(default)]
    pub operation: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub error_code: u16,
    #[serde(default)]
    pub metadata: Value,
}

impl ResponseEnvelope {
    pub fn decode(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body)
            .map_err(|e| LxdError::Protocol(format!("Malformed response body: {}", e)))
    }

    /// Classify the envelope, rejecting unknown shapes.
    pub fn response_type(&self) -> Result<ResponseType> {
        ResponseType::from_wire(&self.kind)
            .ok_or_else(|| LxdError::Protocol(format!("Unknown response type: {:?}", self.kind)))
    }

    /// Convert an `error` envelope into its structured failure.
    pub fn into_remote_error(self) -> LxdError {
        let status = if self.status.is_empty() {
            self.error.clone()
        } else {
            self.status
        };
        LxdError::Remote {
            message: self.error,
            status,
            code: self.error_code,
        }
    }
}

/// Last path segment of a resource URL such as `/1.0/containers/web`.
pub fn resource_name(url: &str) -> &str {
    let trimmed = url.split('?').next().unwrap_or(url).trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}
