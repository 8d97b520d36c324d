//! Poll messages exchanged with the broker.
//!
//! The client poll request travels as a `"1.0\n"` version line followed by
//! a JSON body; the poll response is a bare JSON object. These encoders
//! and decoders define the wire format the broker must speak.

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};
use crate::nat::NatType;

/// Version line prefixed to every encoded poll request.
pub const POLL_REQUEST_VERSION: &str = "1.0";

/// Client → broker: an SDP offer, the advertised NAT type, and the
/// fingerprint of the bridge the broker should pair us with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientPollRequest {
    pub offer: String,
    pub nat: NatType,
    pub fingerprint: String,
}

impl ClientPollRequest {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = serde_json::to_vec(self)?;
        let mut out = Vec::with_capacity(POLL_REQUEST_VERSION.len() + 1 + body.len());
        out.extend_from_slice(POLL_REQUEST_VERSION.as_bytes());
        out.push(b'\n');
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode(blob: &[u8]) -> Result<Self> {
        let newline = blob
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| ClientError::Rendezvous("poll request has no version line".to_string()))?;
        let (version, body) = blob.split_at(newline);
        if version != POLL_REQUEST_VERSION.as_bytes() {
            return Err(ClientError::Rendezvous(format!(
                "unsupported poll request version {:?}",
                String::from_utf8_lossy(version)
            )));
        }
        Ok(serde_json::from_slice(&body[1..])?)
    }
}

/// Broker → client. Exactly one of `answer` and `error` is non-empty in a
/// well-formed response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientPollResponse {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub answer: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl ClientPollResponse {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(blob: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(blob)?)
    }
}
