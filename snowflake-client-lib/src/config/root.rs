use std::net::SocketAddr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use url::Url;

use crate::error::{ClientError, Result};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Address the local forwarder listens on (optional; the binary has
    /// its own default)
    #[serde(default)]
    pub listen: Option<SocketAddr>,
    /// Broker base URL for direct or AMP-fronted rendezvous
    #[serde(default)]
    pub broker_url: Option<Url>,
    /// AMP cache URL; combined with `broker_url` it selects AMP rendezvous
    #[serde(default)]
    pub amp_cache_url: Option<Url>,
    /// SQS broker queue URL; selects SQS rendezvous and excludes the two
    /// URLs above
    #[serde(default)]
    pub sqs_queue_url: Option<Url>,
    /// base64 of JSON {"aws-access-key-id": ..., "aws-secret-key": ...}
    #[serde(default)]
    pub sqs_credentials: Option<String>,
    /// Front domains for the HTTP and AMP flavours; one is chosen at
    /// random per request
    #[serde(default)]
    pub front_domains: Vec<String>,
    /// Fingerprint of the bridge the broker should pair us with
    #[serde(default = "default_bridge_fingerprint")]
    pub bridge_fingerprint: String,
    /// Keep local interface addresses in offers and gather mDNS candidates
    /// (useful only for testing on a LAN)
    /// Default: false
    #[serde(default)]
    pub keep_local_addresses: bool,
    /// STUN/TURN URIs handed to ICE
    #[serde(default)]
    pub ice_servers: Vec<String>,
    /// How many snowflake peers to hold concurrently
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    /// SOCKS5 proxy for WebRTC's UDP traffic (optional)
    #[serde(default)]
    pub communication_proxy: Option<Url>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: None,
            broker_url: None,
            amp_cache_url: None,
            sqs_queue_url: None,
            sqs_credentials: None,
            front_domains: Vec::new(),
            bridge_fingerprint: default_bridge_fingerprint(),
            keep_local_addresses: false,
            ice_servers: Vec::new(),
            max_peers: default_max_peers(),
            communication_proxy: None,
            logging: LoggingConfig::default(),
        }
    }
}

fn default_bridge_fingerprint() -> String {
    // The flagship snowflake bridge.
    "2B280B23E1107BB62ABFC40DDCC8824814F80A72".to_string()
}

fn default_max_peers() -> usize {
    1
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub show_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), show_target: false }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Decoded SQS credential pair.
#[derive(Debug, Clone, Deserialize)]
pub struct SqsCredentials {
    #[serde(rename = "aws-access-key-id")]
    pub access_key_id: String,
    #[serde(rename = "aws-secret-key")]
    pub secret_key: String,
}

impl SqsCredentials {
    pub fn from_base64(blob: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(blob.trim())
            .map_err(|e| ClientError::Config(format!("SQS credentials are not base64: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ClientError::Config(format!("SQS credentials are not valid JSON: {e}")))
    }
}

/// The rendezvous flavour a configuration resolves to.
#[derive(Debug, Clone)]
pub enum RendezvousSource {
    Sqs { queue_url: Url, credentials: SqsCredentials },
    AmpCache { broker: Url, cache: Url },
    Http { broker: Url },
}

impl Config {
    /// Resolves the configured rendezvous flavour. SQS wins when its queue
    /// URL is set, and then no other source may be configured; AMP cache
    /// requires a broker URL beside it; a bare broker URL means direct
    /// HTTPS. No source at all is a hard error.
    pub fn rendezvous_source(&self) -> Result<RendezvousSource> {
        if let Some(queue_url) = &self.sqs_queue_url {
            if self.broker_url.is_some() || self.amp_cache_url.is_some() {
                return Err(ClientError::Config(
                    "sqs_queue_url excludes broker_url and amp_cache_url".to_string(),
                ));
            }
            let blob = self.sqs_credentials.as_ref().ok_or_else(|| {
                ClientError::Config("sqs_queue_url requires sqs_credentials".to_string())
            })?;
            return Ok(RendezvousSource::Sqs {
                queue_url: queue_url.clone(),
                credentials: SqsCredentials::from_base64(blob)?,
            });
        }
        match (&self.broker_url, &self.amp_cache_url) {
            (Some(broker), Some(cache)) => Ok(RendezvousSource::AmpCache {
                broker: broker.clone(),
                cache: cache.clone(),
            }),
            (Some(broker), None) => Ok(RendezvousSource::Http { broker: broker.clone() }),
            (None, Some(_)) => Err(ClientError::Config(
                "amp_cache_url requires broker_url".to_string(),
            )),
            (None, None) => Err(ClientError::Config(
                "no rendezvous method configured: set broker_url or sqs_queue_url".to_string(),
            )),
        }
    }
}
