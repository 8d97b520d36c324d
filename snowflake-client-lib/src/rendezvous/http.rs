//! Direct (optionally domain-fronted) HTTPS rendezvous.

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
use crate::error::{ClientError, Result};

pub struct HttpRendezvous {
    broker: Url,
    fronts: FrontSelector,
    round_tripper: Arc<dyn RoundTripper>,
}

impl HttpRendezvous {
    pub fn new(
        broker: Url,
        front_domains: Vec<String>,
        round_tripper: Arc<dyn RoundTripper>,
    ) -> Self {
        Self { broker, fronts: FrontSelector::new(front_domains), round_tripper }
    }
}

#[async_trait]
impl RendezvousTransport for HttpRendezvous {
    async fn exchange(&self, poll_request: &[u8]) -> Result<Vec<u8>> {
        let url = join_endpoint(&self.broker, "client");
        let front = self.fronts.choose();
        debug!(%url, front = front.as_deref().unwrap_or("-"), "polling broker");

        let request = build_request(
            Method::POST,
            &url,
            front.as_deref(),
            Bytes::copy_from_slice(poll_request),
        )?;
        let response = self.round_tripper.round_trip(request).await?;

        if response.status() != StatusCode::OK {
            warn!(status = %response.status(), "broker poll rejected");
            return Err(ClientError::Broker(BROKER_ERROR_UNEXPECTED.to_string()));
        }
        let body = response.into_body();
        check_response_len(&body)?;
        Ok(body.to_vec())
    }
}
