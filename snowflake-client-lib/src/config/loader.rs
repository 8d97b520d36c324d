use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::error::{ClientError, Result};

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<Config> {
    let txt = fs::read_to_string(p)
        .map_err(|e| ClientError::Config(format!("Failed to read config file: {e}")))?;
    let cfg: Config = toml::from_str(&txt)
        .map_err(|e| ClientError::Config(format!("Failed to parse config: {e}")))?;

    validate_config(&cfg)?;

    Ok(cfg)
}

fn validate_config(cfg: &Config) -> Result<()> {
    // Surfaces missing/contradictory rendezvous options and bad SQS
    // credentials before anything dials out.
    cfg.rendezvous_source()?;

    if hex::decode(&cfg.bridge_fingerprint).is_err() {
        return Err(ClientError::Config(format!(
            "bridge_fingerprint is not hex: {:?}",
            cfg.bridge_fingerprint
        )));
    }

    if cfg.max_peers == 0 {
        return Err(ClientError::Config("max_peers must be at least 1".to_string()));
    }

    if let Some(proxy) = &cfg.communication_proxy {
        if proxy.scheme() != "socks5" && proxy.scheme() != "socks5h" {
            return Err(ClientError::Config(format!(
                "communication_proxy must be a socks5:// URL, got scheme {:?}",
                proxy.scheme()
            )));
        }
        if proxy.host_str().is_none() {
            return Err(ClientError::Config(
                "communication_proxy has no host".to_string(),
            ));
        }
    }

    Ok(())
}
