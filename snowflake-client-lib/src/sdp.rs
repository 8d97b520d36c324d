//! Session descriptions on the broker wire, and scrubbing of local
//! interface addresses from offers.
//!
//! Offers leave the client as JSON `{"type": ..., "sdp": ...}` pairs.
//! Before an offer is sent, `a=candidate` attributes of type `host` whose
//! connection address is private, loopback, unspecified, carrier-grade
//! NAT, link-local, or unique-local are removed: they are useless to a
//! remote proxy and leak the local network layout to the broker path.
//! Candidates of other types and all non-candidate attributes survive.

use std::net::IpAddr;
use std::sync::LazyLock;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::{ClientError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// A `(type, sdp)` pair in the JSON form exchanged with the broker. Both
/// fields are required; a blob missing either fails to deserialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn to_rtc(&self) -> Result<RTCSessionDescription> {
        let desc = match self.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(self.sdp.clone()),
            SdpType::Answer => RTCSessionDescription::answer(self.sdp.clone()),
            SdpType::Pranswer => RTCSessionDescription::pranswer(self.sdp.clone()),
            SdpType::Rollback => {
                return Err(ClientError::Negotiation(
                    "rollback description cannot carry SDP".to_string(),
                ))
            }
        };
        desc.map_err(ClientError::from)
    }

    pub fn from_rtc(desc: &RTCSessionDescription) -> Result<Self> {
        let sdp_type = match desc.sdp_type {
            RTCSdpType::Offer => SdpType::Offer,
            RTCSdpType::Pranswer => SdpType::Pranswer,
            RTCSdpType::Answer => SdpType::Answer,
            RTCSdpType::Rollback => SdpType::Rollback,
            RTCSdpType::Unspecified => {
                return Err(ClientError::Negotiation(
                    "session description has no type".to_string(),
                ))
            }
        };
        Ok(Self { sdp_type, sdp: desc.sdp.clone() })
    }
}

/// Address ranges never routable from a remote volunteer proxy:
/// loopback, unspecified, RFC 1918 private, RFC 6598 carrier-grade NAT,
/// RFC 3927 link-local, RFC 4193 unique-local.
static FILTERED_NETS: LazyLock<Vec<IpNet>> = LazyLock::new(|| {
    [
        "127.0.0.0/8",
        "::1/128",
        "0.0.0.0/32",
        "::/128",
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "100.64.0.0/10",
        "169.254.0.0/16",
        "fc00::/7",
    ]
    .iter()
    .filter_map(|s| s.parse().ok())
    .collect()
});

/// Whether `ip` must not be advertised as a host candidate.
pub fn is_filtered_address(ip: IpAddr) -> bool {
    FILTERED_NETS.iter().any(|net| net.contains(&ip))
}

fn is_local_host_candidate(value: &str) -> bool {
    // candidate attribute value:
    //   <foundation> <component> <transport> <priority> <address> <port> typ <type> ...
    let fields: Vec<&str> = value.split_whitespace().collect();
    if fields.len() < 8 {
        return false;
    }
    let is_host = fields
        .iter()
        .position(|f| *f == "typ")
        .and_then(|i| fields.get(i + 1))
        .is_some_and(|t| *t == "host");
    if !is_host {
        return false;
    }
    match fields[4].parse::<IpAddr>() {
        Ok(ip) => is_filtered_address(ip),
        // mDNS obfuscated addresses and the like; gathering policy deals
        // with those, not the scrubber.
        Err(_) => false,
    }
}

/// Removes host candidates with non-routable addresses from an SDP blob,
/// preserving every other line byte for byte. Idempotent.
pub fn strip_local_candidates(sdp: &str) -> String {
    sdp.split_inclusive('\n')
        .filter(|line| {
            let trimmed = line.trim_end_matches(['\r', '\n']);
            match trimmed.strip_prefix("a=candidate:") {
                Some(value) => !is_local_host_candidate(value),
                None => true,
            }
        })
        .collect()
}
