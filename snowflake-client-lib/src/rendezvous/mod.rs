//! Out-of-band channels for exchanging a poll request against the broker.
//!
//! All flavours share one contract: ship an opaque request blob, get an
//! opaque response blob back, or fail. Which one runs is decided by the
//! configuration (see [`crate::broker`]).

mod amp;
mod http;
mod sqs;
mod transport;

pub use amp::AmpCacheRendezvous;
pub use http::HttpRendezvous;
pub use sqs::{SqsApi, SqsRendezvous, CLIENT_QUEUE_PREFIX};
pub use transport::{
    FrontSelector, RendezvousTransport, ReqwestRoundTripper, RoundTripper,
    BROKER_ERROR_UNEXPECTED, MAX_RESPONSE_LEN, RESPONSE_TIMEOUT,
};
