//! The negotiation channel to the broker.
//!
//! Owns the client's view of its own NAT type, serialises offers (scrubbed
//! of local addresses unless configured otherwise), drives whichever
//! rendezvous flavour the configuration selected, and turns the broker's
//! response back into a session description.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use crate::config::{Config, RendezvousSource};
use crate::error::{ClientError, Result};
use crate::messages::{ClientPollRequest, ClientPollResponse};
use crate::nat::NatType;
use crate::rendezvous::{
    AmpCacheRendezvous, HttpRendezvous, RendezvousTransport, ReqwestRoundTripper, RoundTripper,
    SqsRendezvous,
};
use crate::sdp::{strip_local_candidates, SessionDescription};

pub struct BrokerChannel {
    rendezvous: Box<dyn RendezvousTransport>,
    nat_type: Mutex<NatType>,
    bridge_fingerprint: String,
    keep_local_addresses: bool,
}

impl BrokerChannel {
    pub fn new(
        rendezvous: Box<dyn RendezvousTransport>,
        bridge_fingerprint: String,
        keep_local_addresses: bool,
    ) -> Self {
        Self {
            rendezvous,
            nat_type: Mutex::new(NatType::Unknown),
            bridge_fingerprint,
            keep_local_addresses,
        }
    }

    /// Builds the channel for a configuration, with the default HTTP
    /// stack behind the HTTP-shaped flavours.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::from_config_with(config, Arc::new(ReqwestRoundTripper::new()?))
    }

    /// Same, with an injected round-tripper (tests, custom TLS stacks).
    pub fn from_config_with(config: &Config, round_tripper: Arc<dyn RoundTripper>) -> Result<Self> {
        let rendezvous: Box<dyn RendezvousTransport> = match config.rendezvous_source()? {
            RendezvousSource::Sqs { queue_url, credentials } => {
                Box::new(SqsRendezvous::new(queue_url, credentials)?)
            }
            RendezvousSource::AmpCache { broker, cache } => Box::new(AmpCacheRendezvous::new(
                broker,
                Some(cache),
                config.front_domains.clone(),
                round_tripper,
            )),
            RendezvousSource::Http { broker } => Box::new(HttpRendezvous::new(
                broker,
                config.front_domains.clone(),
                round_tripper,
            )),
        };
        Ok(Self::new(
            rendezvous,
            config.bridge_fingerprint.clone(),
            config.keep_local_addresses,
        ))
    }

    /// Sends `offer` to the broker, advertising `nat_type_to_send`, and
    /// returns the proxy's answer. A broker-reported error is surfaced
    /// verbatim.
    pub async fn negotiate(
        &self,
        offer: &SessionDescription,
        nat_type_to_send: NatType,
    ) -> Result<SessionDescription> {
        let sdp = if self.keep_local_addresses {
            offer.sdp.clone()
        } else {
            strip_local_candidates(&offer.sdp)
        };
        let offer = SessionDescription { sdp_type: offer.sdp_type, sdp };

        let request = ClientPollRequest {
            offer: serde_json::to_string(&offer)?,
            nat: nat_type_to_send,
            fingerprint: self.bridge_fingerprint.clone(),
        };
        info!(nat = %nat_type_to_send, "polling broker for a snowflake");
        let response = self.rendezvous.exchange(&request.encode()?).await?;

        let response = ClientPollResponse::decode(&response)?;
        if !response.error.is_empty() {
            return Err(ClientError::Broker(response.error));
        }
        if response.answer.is_empty() {
            return Err(ClientError::Broker(
                "broker responded with neither answer nor error".to_string(),
            ));
        }
        let answer: SessionDescription = serde_json::from_str(&response.answer)?;
        debug!("broker returned an answer");
        Ok(answer)
    }

    pub fn set_nat_type(&self, nat_type: NatType) {
        *self.nat_type.lock().unwrap_or_else(PoisonError::into_inner) = nat_type;
    }

    pub fn get_nat_type(&self) -> NatType {
        *self.nat_type.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
