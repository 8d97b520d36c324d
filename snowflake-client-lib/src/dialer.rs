//! Collecting snowflakes.
//!
//! A thin layer over the broker channel: each `catch` dials one fresh
//! peer and hands it back fully open. Everything below configuration
//! level is recoverable here — a peer that failed to come up is simply
//! discarded and the caller catches another.

use std::sync::Arc;

use crate::broker::BrokerChannel;
use crate::config::Config;
use crate::error::Result;
use crate::nat::NatPolicy;
use crate::peer::{EventSender, PeerConfig, WebRtcPeer};

pub struct Dialer {
    broker: Arc<BrokerChannel>,
    policy: Arc<NatPolicy>,
    peer_config: PeerConfig,
    max_peers: usize,
    events: Option<EventSender>,
}

impl Dialer {
    pub fn new(broker: Arc<BrokerChannel>, peer_config: PeerConfig, max_peers: usize) -> Self {
        Self {
            broker,
            policy: Arc::new(NatPolicy::new()),
            peer_config,
            max_peers,
            events: None,
        }
    }

    /// Wires everything up from a validated configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let broker = Arc::new(BrokerChannel::from_config(config)?);
        let peer_config = PeerConfig {
            ice_servers: config.ice_servers.clone(),
            keep_local_addresses: config.keep_local_addresses,
            communication_proxy: config.communication_proxy.clone(),
        };
        Ok(Self::new(broker, peer_config, config.max_peers))
    }

    /// Subscribes a listener to per-peer connection events.
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Dials one new peer and waits until it is open.
    pub async fn catch(&self) -> Result<WebRtcPeer> {
        WebRtcPeer::connect(
            &self.peer_config,
            &self.broker,
            &self.policy,
            self.events.clone(),
        )
        .await
    }

    /// The configured concurrent peer capacity.
    pub fn get_max(&self) -> usize {
        self.max_peers
    }

    /// The broker channel, e.g. for feeding in an externally probed NAT
    /// type.
    pub fn broker(&self) -> &Arc<BrokerChannel> {
        &self.broker
    }
}
