//! Rendezvous through an AMP cache.
//!
//! Caches only pass GETs, so the poll request is path-encoded into the
//! broker URL, which is then rewritten to its cache form. Caches also
//! mangle failures in their own ways: an upstream 5xx comes back as 404,
//! and a response the cache refuses to serve verbatim arrives as a 200
//! carrying a `Location` header (the "silent redirect"). Both collapse
//! into the broker sentinel. Successful bodies are AMP HTML armor.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode};
use tracing::{debug, warn};
use url::Url;

use super::transport::{
    build_request, check_response_len, join_endpoint, FrontSelector, RendezvousTransport,
    RoundTripper, BROKER_ERROR_UNEXPECTED,
};
use crate::amp;
use crate::error::{ClientError, Result};

pub struct AmpCacheRendezvous {
    broker: Url,
    cache: Option<Url>,
    fronts: FrontSelector,
    round_tripper: Arc<dyn RoundTripper>,
}

impl AmpCacheRendezvous {
    pub fn new(
        broker: Url,
        cache: Option<Url>,
        front_domains: Vec<String>,
        round_tripper: Arc<dyn RoundTripper>,
    ) -> Self {
        Self { broker, cache, fronts: FrontSelector::new(front_domains), round_tripper }
    }
}

#[async_trait]
impl RendezvousTransport for AmpCacheRendezvous {
    async fn exchange(&self, poll_request: &[u8]) -> Result<Vec<u8>> {
        let encoded = amp::encode_path(poll_request);
        let mut url = join_endpoint(&self.broker, &format!("amp/client/{encoded}"));
        if let Some(cache) = &self.cache {
            url = amp::cache_url(&url, cache)?;
        }
        let front = self.fronts.choose();
        debug!(%url, front = front.as_deref().unwrap_or("-"), "polling broker via AMP");

        let request = build_request(Method::GET, &url, front.as_deref(), Bytes::new())?;
        let response = self.round_tripper.round_trip(request).await?;

        if response.status() != StatusCode::OK {
            warn!(status = %response.status(), "AMP cache poll rejected");
            return Err(ClientError::Broker(BROKER_ERROR_UNEXPECTED.to_string()));
        }
        // A 200 with a Location header means the cache declined to serve
        // the origin's bytes.
        if response.headers().contains_key(http::header::LOCATION) {
            warn!("AMP cache silently redirected the poll response");
            return Err(ClientError::Broker(BROKER_ERROR_UNEXPECTED.to_string()));
        }

        let body = response.into_body();
        check_response_len(&body)?;
        amp::armor_decode(&body)
    }
}
