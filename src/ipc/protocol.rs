// IPC protocol between a supervised analysis and its supervisor
//
// Messages are JSON objects, one per line, tagged by a `type` field.

use crate::error::Result;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Address family filter of a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum AddressFamily {
    #[default]
    Any,
    V4,
    V6,
}

impl AddressFamily {
    pub fn as_number(&self) -> u8 {
        match self {
            AddressFamily::Any => 0,
            AddressFamily::V4 => 4,
            AddressFamily::V6 => 6,
        }
    }
}

// Children send the family either as a number (0, 4, 6) or as "IPv4"/"IPv6"
fn deserialize_family<'de, D>(deserializer: D) -> std::result::Result<AddressFamily, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(n) => match n.as_u64() {
            Some(4) => AddressFamily::V4,
            Some(6) => AddressFamily::V6,
            _ => AddressFamily::Any,
        },
        Value::String(s) => match s.as_str() {
            "IPv4" | "4" => AddressFamily::V4,
            "IPv6" | "6" => AddressFamily::V6,
            _ => AddressFamily::Any,
        },
        _ => AddressFamily::Any,
    })
}

/// Options of a `DNS_LOOKUP_REQUEST`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LookupOptions {
    #[serde(default, deserialize_with = "deserialize_family")]
    pub family: AddressFamily,
    /// Return every address instead of the first one
    #[serde(default)]
    pub all: bool,
}

/// Options of a `DNS_RESOLVE4_REQUEST` / `DNS_RESOLVE6_REQUEST`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResolveOptions {
    /// Return `{address, ttl}` records instead of bare addresses
    #[serde(default)]
    pub ttl: bool,
}

/// One address returned by a lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupAddress {
    pub address: String,
    pub family: u8,
}

/// Lookup result: a single address, or all of them when `all` was requested
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LookupResult {
    One(LookupAddress),
    All(Vec<LookupAddress>),
}

/// One record of a resolve result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResolvedRecord {
    WithTtl { address: String, ttl: u32 },
    Address(String),
}

/// Request sent by the child
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum IpcRequest {
    #[serde(rename = "DNS_LOOKUP_REQUEST", rename_all = "camelCase")]
    DnsLookup {
        request_id: Value,
        hostname: String,
        #[serde(default)]
        options: LookupOptions,
    },
    #[serde(rename = "DNS_RESOLVE4_REQUEST", rename_all = "camelCase")]
    DnsResolve4 {
        request_id: Value,
        hostname: String,
        #[serde(default)]
        options: ResolveOptions,
    },
    #[serde(rename = "DNS_RESOLVE6_REQUEST", rename_all = "camelCase")]
    DnsResolve6 {
        request_id: Value,
        hostname: String,
        #[serde(default)]
        options: ResolveOptions,
    },
}

impl IpcRequest {
    /// Wire name of the request type
    pub fn kind(&self) -> &'static str {
        match self {
            IpcRequest::DnsLookup { .. } => "DNS_LOOKUP_REQUEST",
            IpcRequest::DnsResolve4 { .. } => "DNS_RESOLVE4_REQUEST",
            IpcRequest::DnsResolve6 { .. } => "DNS_RESOLVE6_REQUEST",
        }
    }

    /// Wire name of the matching response type
    pub fn response_kind(&self) -> &'static str {
        match self {
            IpcRequest::DnsLookup { .. } => "DNS_LOOKUP_RESPONSE",
            IpcRequest::DnsResolve4 { .. } => "DNS_RESOLVE4_RESPONSE",
            IpcRequest::DnsResolve6 { .. } => "DNS_RESOLVE6_RESPONSE",
        }
    }

    pub fn request_id(&self) -> &Value {
        match self {
            IpcRequest::DnsLookup { request_id, .. }
            | IpcRequest::DnsResolve4 { request_id, .. }
            | IpcRequest::DnsResolve6 { request_id, .. } => request_id,
        }
    }

    pub fn hostname(&self) -> &str {
        match self {
            IpcRequest::DnsLookup { hostname, .. }
            | IpcRequest::DnsResolve4 { hostname, .. }
            | IpcRequest::DnsResolve6 { hostname, .. } => hostname,
        }
    }
}

/// Response sent back to the child, correlated by `requestId`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcResponse {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "requestId")]
    pub request_id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IpcResponse {
    pub fn success(request: &IpcRequest, result: Value) -> Self {
        Self {
            kind: request.response_kind().to_string(),
            request_id: request.request_id().clone(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(request: &IpcRequest, error: impl Into<String>) -> Self {
        Self {
            kind: request.response_kind().to_string(),
            request_id: request.request_id().clone(),
            result: None,
            error: Some(error.into()),
        }
    }

    /// Error reply to a request that could not be parsed
    pub fn rejection(kind: &str, request_id: Value, error: impl Into<String>) -> Self {
        let base = kind.strip_suffix("_REQUEST").unwrap_or(kind);
        Self {
            kind: format!("{}_RESPONSE", base),
            request_id,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Serialize as one protocol line (without the trailing newline)
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Anything the child can send
#[derive(Debug, Clone, PartialEq)]
pub enum ChildMessage {
    Request(IpcRequest),
    /// A well-formed message of a type the supervisor does not handle
    Unknown(String),
    /// A request of a known type whose fields do not parse. Still carries
    /// its id so the child can be told.
    Invalid {
        kind: String,
        request_id: Value,
        error: String,
    },
}

/// Parse one protocol line
pub fn parse_message(line: &str) -> Result<ChildMessage> {
    let value: Value = serde_json::from_str(line)?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match kind.as_str() {
        "DNS_LOOKUP_REQUEST" | "DNS_RESOLVE4_REQUEST" | "DNS_RESOLVE6_REQUEST" => {
            let request_id = value.get("requestId").cloned();
            match (serde_json::from_value(value), request_id) {
                (Ok(request), _) => Ok(ChildMessage::Request(request)),
                (Err(e), Some(request_id)) => Ok(ChildMessage::Invalid {
                    kind,
                    request_id,
                    error: e.to_string(),
                }),
                (Err(e), None) => Err(e.into()),
            }
        }
        _ => Ok(ChildMessage::Unknown(kind)),
    }
}
