#![forbid(unsafe_code)]

pub mod amp;
pub mod broker;
pub mod config;
pub mod dialer;
pub mod encapsulation;
pub mod error;
pub mod messages;
pub mod nat;
pub mod peer;
pub mod pool;
pub mod proxy;
pub mod rendezvous;
pub mod sdp;

pub use broker::BrokerChannel;
pub use config::{load_from_path, Config};
pub use dialer::Dialer;
pub use error::{ClientError, Result};
pub use nat::{NatPolicy, NatType};
pub use peer::{ConnectionEvent, PeerConfig, WebRtcPeer};
pub use pool::PeerPool;
pub use rendezvous::{RendezvousTransport, RoundTripper};
pub use sdp::SessionDescription;
