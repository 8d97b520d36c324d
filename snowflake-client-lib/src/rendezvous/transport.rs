//! The rendezvous contract and the HTTP plumbing under it.
//!
//! Broker requests go through a [`RoundTripper`] so that the TLS and HTTP
//! stack stays pluggable: production uses `reqwest`, tests inject canned
//! responses, and a caller with special fingerprint requirements can bring
//! its own. Domain fronting happens here too: the configured front becomes
//! the URL (and thus SNI/connect) host while the real broker host moves
//! into the `Host` header.

use std::io;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request, Response};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use url::Url;

use crate::error::{ClientError, Result};

/// Hard ceiling on rendezvous response bodies. A response past this size
/// is indistinguishable from an attack and is treated as a truncated
/// stream.
pub const MAX_RESPONSE_LEN: usize = 100_000;

/// Sentinel for every non-success broker status; callers retry, they do
/// not discriminate.
pub const BROKER_ERROR_UNEXPECTED: &str = "Unexpected error, no answer.";

/// How long a broker exchange may take before the attempt is abandoned.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(15);

/// One poll exchange with the broker. The exchange either succeeds with
/// the complete response blob or fails; there is no partial success.
#[async_trait]
pub trait RendezvousTransport: Send + Sync {
    async fn exchange(&self, poll_request: &[u8]) -> Result<Vec<u8>>;
}

/// A single HTTP request/response cycle.
#[async_trait]
pub trait RoundTripper: Send + Sync {
    async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<Bytes>>;
}

/// Production [`RoundTripper`] on top of `reqwest`.
pub struct ReqwestRoundTripper {
    client: reqwest::Client,
}

impl ReqwestRoundTripper {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(RESPONSE_TIMEOUT)
            .build()
            .map_err(|e| ClientError::Rendezvous(format!("building HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RoundTripper for ReqwestRoundTripper {
    async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        let request = reqwest::Request::try_from(request)
            .map_err(|e| ClientError::Rendezvous(format!("building request: {e}")))?;
        let mut response = self
            .client
            .execute(request)
            .await
            .map_err(|e| ClientError::Rendezvous(format!("request failed: {e}")))?;

        let status = response.status();
        let headers = response.headers().clone();

        // Stream the body in, stopping one byte past the ceiling so the
        // transport can detect the overflow without unbounded buffering.
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ClientError::Rendezvous(format!("reading response: {e}")))?
        {
            let room = (MAX_RESPONSE_LEN + 1).saturating_sub(body.len());
            if room == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..chunk.len().min(room)]);
        }

        let mut out = Response::builder()
            .status(status)
            .body(Bytes::from(body))
            .map_err(|e| ClientError::Rendezvous(format!("assembling response: {e}")))?;
        *out.headers_mut() = headers;
        Ok(out)
    }
}

/// Uniform random choice among the configured front domains, from one
/// long-lived PRNG. Reseeding per request would anti-correlate adjacent
/// choices; selection only needs uniformity, not unpredictability.
pub struct FrontSelector {
    fronts: Vec<String>,
    rng: Mutex<SmallRng>,
}

impl FrontSelector {
    pub fn new(fronts: Vec<String>) -> Self {
        Self { fronts, rng: Mutex::new(SmallRng::from_os_rng()) }
    }

    pub fn choose(&self) -> Option<String> {
        if self.fronts.is_empty() {
            return None;
        }
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let idx = rng.random_range(0..self.fronts.len());
        self.fronts.get(idx).cloned()
    }
}

/// `base` with `segment` appended to its path.
pub(crate) fn join_endpoint(base: &Url, segment: &str) -> Url {
    let mut out = base.clone();
    let path = format!("{}/{}", base.path().trim_end_matches('/'), segment);
    out.set_path(&path);
    out
}

/// Builds a broker request, rewriting the URL host to `front` (when
/// fronting) and carrying the real host in the `Host` header.
pub(crate) fn build_request(
    method: Method,
    url: &Url,
    front: Option<&str>,
    body: Bytes,
) -> Result<Request<Bytes>> {
    let mut target = url.clone();
    let mut host_header = None;
    if let Some(front) = front {
        host_header = url.host_str().map(str::to_string);
        target
            .set_host(Some(front))
            .map_err(|_| ClientError::Rendezvous(format!("invalid front domain {front:?}")))?;
    }
    let mut builder = Request::builder().method(method).uri(target.as_str());
    if let Some(host) = host_header {
        builder = builder.header(http::header::HOST, host);
    }
    builder
        .body(body)
        .map_err(|e| ClientError::Rendezvous(format!("building request: {e}")))
}

/// Enforces the response ceiling on a fully-read body.
pub(crate) fn check_response_len(body: &Bytes) -> Result<()> {
    if body.len() > MAX_RESPONSE_LEN {
        return Err(ClientError::Io(io::ErrorKind::UnexpectedEof.into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fronted_request_swaps_host() {
        let url = Url::parse("https://broker.example/client").expect("url");
        let req = build_request(Method::POST, &url, Some("front.example"), Bytes::new())
            .expect("request");
        assert_eq!(req.uri().host(), Some("front.example"));
        assert_eq!(
            req.headers().get(http::header::HOST).map(|h| h.as_bytes()),
            Some(&b"broker.example"[..])
        );
    }

    #[test]
    fn unfronted_request_is_untouched() {
        let url = Url::parse("https://broker.example/client").expect("url");
        let req = build_request(Method::POST, &url, None, Bytes::new()).expect("request");
        assert_eq!(req.uri().host(), Some("broker.example"));
        assert!(req.headers().get(http::header::HOST).is_none());
    }

    #[test]
    fn front_choice_is_uniformly_drawn() {
        let selector = FrontSelector::new(vec!["a".into(), "b".into(), "c".into()]);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..256 {
            if let Some(front) = selector.choose() {
                seen.insert(front);
            }
        }
        assert_eq!(seen.len(), 3);
        assert!(FrontSelector::new(Vec::new()).choose().is_none());
    }

    #[test]
    fn endpoint_join_handles_trailing_slash() {
        let a = Url::parse("https://broker.example/").expect("url");
        let b = Url::parse("https://broker.example/prefix").expect("url");
        assert_eq!(join_endpoint(&a, "client").path(), "/client");
        assert_eq!(join_endpoint(&b, "client").path(), "/prefix/client");
    }

    #[test]
    fn body_ceiling() {
        assert!(check_response_len(&Bytes::from(vec![0u8; MAX_RESPONSE_LEN])).is_ok());
        let err = check_response_len(&Bytes::from(vec![0u8; MAX_RESPONSE_LEN + 1]))
            .expect_err("over ceiling");
        match err {
            ClientError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected Io(UnexpectedEof), got {other:?}"),
        }
    }
}
