//! NAT classification and the advertisement policy.
//!
//! The broker pairs clients and proxies by NAT compatibility. Until the
//! client's own NAT has been probed, advertising `unrestricted` steers the
//! broker towards handing out restricted-NAT proxies, keeping the scarce
//! unrestricted ones for clients that need them. One failed attempt on
//! that assumption latches the policy off for the rest of the process.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::info;

/// Coarse NAT mapping behavior, per RFC 5780 probing (done externally).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NatType {
    #[default]
    Unknown,
    Restricted,
    Unrestricted,
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NatType::Unknown => "unknown",
            NatType::Restricted => "restricted",
            NatType::Unrestricted => "unrestricted",
        };
        f.write_str(s)
    }
}

/// Decides which NAT type to advertise to the broker. One instance per
/// client configuration; share it with `Arc`.
#[derive(Debug, Default)]
pub struct NatPolicy {
    assumed_unrestricted_failed: AtomicBool,
}

impl NatPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// The NAT type to put in the next poll request given the observed
    /// type. An unknown NAT is advertised as unrestricted until that
    /// assumption has failed once.
    pub fn nat_type_to_send(&self, actual: NatType) -> NatType {
        if actual == NatType::Unknown
            && !self.assumed_unrestricted_failed.load(Ordering::Relaxed)
        {
            NatType::Unrestricted
        } else {
            actual
        }
    }

    pub fn success(&self, actual: NatType, sent: NatType) {
        info!(%actual, %sent, "connection succeeded with advertised NAT type");
    }

    /// Records a failed connection attempt. Failing while advertising
    /// `unrestricted` over an unknown NAT latches the bias off; the latch
    /// is never cleared.
    pub fn failure(&self, actual: NatType, sent: NatType) {
        info!(%actual, %sent, "connection failed with advertised NAT type");
        if actual == NatType::Unknown && sent == NatType::Unrestricted {
            self.assumed_unrestricted_failed.store(true, Ordering::Relaxed);
        }
    }
}
