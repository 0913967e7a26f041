//! Wire formats shared between the callback fabric, the datagram bridge,
//! and external clients. All JSON fields are camelCase.

use serde::{Deserialize, Serialize};

/// A callback request originating inside a guest, targeted at the client
/// holding that guest's WebSocket session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackRequest {
    /// Unique within a session; correlates the response.
    pub id: String,

    /// Opaque method name.
    pub method: String,

    /// Opaque payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,

    /// Wall-clock seconds at origin.
    pub timestamp: i64,
}

/// A client's response to a [`CallbackRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackResponse {
    pub id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CallbackError>,
}

/// An error carried in a callback response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackError {
    pub code: i32,
    pub message: String,
}

/// One parsed line of the guest-facing datagram protocol.
///
/// Guests send newline-delimited text commands. `CALLBACK <method> <json>`
/// routes to the client session; any other verb is forwarded opaquely with
/// the lowercased verb as the method name.
#[derive(Debug, Clone, PartialEq)]
pub struct DatagramCommand {
    pub method: String,
    pub params: Option<serde_json::Value>,
}

impl DatagramCommand {
    /// Parse a single protocol line. Returns `None` for blank lines.
    pub fn parse(line: &str) -> std::result::Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let (verb, rest) = match line.split_once(' ') {
            Some((v, r)) => (v, r.trim()),
            None => (line, ""),
        };

        let (method, raw_params) = if verb == "CALLBACK" {
            let (method, params) = match rest.split_once(' ') {
                Some((m, p)) => (m, p.trim()),
                None => (rest, ""),
            };
            if method.is_empty() {
                return Err("CALLBACK requires a method name".to_string());
            }
            (method.to_string(), params)
        } else {
            (verb.to_ascii_lowercase(), rest)
        };

        let params = if raw_params.is_empty() {
            None
        } else {
            Some(
                serde_json::from_str(raw_params)
                    .map_err(|e| format!("invalid JSON params: {}", e))?,
            )
        };

        Ok(Some(Self { method, params }))
    }
}
