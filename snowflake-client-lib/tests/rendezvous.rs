use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use snowflake_client_lib::amp;
use snowflake_client_lib::error::ClientError;
use snowflake_client_lib::rendezvous::{
    AmpCacheRendezvous, HttpRendezvous, RendezvousTransport, RoundTripper,
    BROKER_ERROR_UNEXPECTED, MAX_RESPONSE_LEN,
};
use snowflake_client_lib::Result;
use url::Url;

/// A round-tripper that replies with one canned response and records the
/// request it saw.
struct CannedRoundTripper {
    status: StatusCode,
    headers: Vec<(&'static str, String)>,
    body: Vec<u8>,
    seen: Mutex<Option<Request<Bytes>>>,
}

impl CannedRoundTripper {
    fn new(status: StatusCode, body: Vec<u8>) -> Arc<Self> {
        Arc::new(Self { status, headers: Vec::new(), body, seen: Mutex::new(None) })
    }

    fn with_header(status: StatusCode, name: &'static str, value: &str, body: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            status,
            headers: vec![(name, value.to_string())],
            body,
            seen: Mutex::new(None),
        })
    }

    fn request(&self) -> Request<Bytes> {
        self.seen
            .lock()
            .expect("seen lock")
            .take()
            .expect("a request was made")
    }
}

#[async_trait]
impl RoundTripper for CannedRoundTripper {
    async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        *self.seen.lock().expect("seen lock") = Some(request);
        let mut builder = Response::builder().status(self.status);
        for (name, value) in &self.headers {
            builder = builder.header(*name, value.as_str());
        }
        Ok(builder
            .body(Bytes::from(self.body.clone()))
            .expect("canned response"))
    }
}

fn broker_url() -> Url {
    Url::parse("https://broker.example/").expect("broker URL")
}

fn assert_sentinel(err: ClientError) {
    match err {
        ClientError::Broker(msg) => assert_eq!(msg, BROKER_ERROR_UNEXPECTED),
        other => panic!("expected broker sentinel, got {other:?}"),
    }
}

fn assert_unexpected_eof(err: ClientError) {
    match err {
        ClientError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
        other => panic!("expected UnexpectedEof, got {other:?}"),
    }
}

#[tokio::test]
async fn http_posts_the_blob_to_the_client_endpoint() {
    let rt = CannedRoundTripper::new(StatusCode::OK, b"response blob".to_vec());
    let rdv = HttpRendezvous::new(broker_url(), Vec::new(), rt.clone());

    let out = rdv.exchange(b"request blob").await.expect("exchange");
    assert_eq!(out, b"response blob");

    let request = rt.request();
    assert_eq!(request.method(), http::Method::POST);
    assert_eq!(request.uri().host(), Some("broker.example"));
    assert_eq!(request.uri().path(), "/client");
    assert_eq!(request.body().as_ref(), b"request blob");
    assert!(request.headers().get(http::header::HOST).is_none());
}

#[tokio::test]
async fn http_non_success_status_is_the_sentinel() {
    let rt = CannedRoundTripper::new(StatusCode::INTERNAL_SERVER_ERROR, Vec::new());
    let rdv = HttpRendezvous::new(broker_url(), Vec::new(), rt);
    assert_sentinel(rdv.exchange(b"x").await.expect_err("must fail"));
}

#[tokio::test]
async fn http_body_over_the_ceiling_is_a_truncated_stream() {
    let rt = CannedRoundTripper::new(StatusCode::OK, vec![0u8; MAX_RESPONSE_LEN + 1]);
    let rdv = HttpRendezvous::new(broker_url(), Vec::new(), rt);
    assert_unexpected_eof(rdv.exchange(b"x").await.expect_err("must fail"));
}

#[tokio::test]
async fn http_body_at_the_ceiling_passes() {
    let rt = CannedRoundTripper::new(StatusCode::OK, vec![7u8; MAX_RESPONSE_LEN]);
    let rdv = HttpRendezvous::new(broker_url(), Vec::new(), rt);
    let out = rdv.exchange(b"x").await.expect("exchange");
    assert_eq!(out.len(), MAX_RESPONSE_LEN);
}

#[tokio::test]
async fn http_fronting_swaps_sni_and_host() {
    let rt = CannedRoundTripper::new(StatusCode::OK, Vec::new());
    let rdv = HttpRendezvous::new(
        broker_url(),
        vec!["front.example".to_string()],
        rt.clone(),
    );
    rdv.exchange(b"x").await.expect("exchange");

    let request = rt.request();
    assert_eq!(request.uri().host(), Some("front.example"));
    assert_eq!(
        request.headers().get(http::header::HOST).map(|h| h.as_bytes()),
        Some(&b"broker.example"[..])
    );
}

#[tokio::test]
async fn amp_request_is_a_cache_rewritten_get() {
    let body = amp::armor_encode(b"response blob").into_bytes();
    let rt = CannedRoundTripper::new(StatusCode::OK, body);
    let cache = Url::parse("https://cdn.ampproject.org/").expect("cache URL");
    let rdv = AmpCacheRendezvous::new(broker_url(), Some(cache), Vec::new(), rt.clone());

    let out = rdv.exchange(b"request blob").await.expect("exchange");
    assert_eq!(out, b"response blob");

    let request = rt.request();
    assert_eq!(request.method(), http::Method::GET);
    assert_eq!(request.uri().host(), Some("cdn.ampproject.org"));
    let path = request.uri().path().to_string();
    assert!(
        path.starts_with("/c/s/broker.example/amp/client/0"),
        "unexpected path {path}"
    );
    // The request blob survives the path encoding.
    let encoded = path
        .strip_prefix("/c/s/broker.example/amp/client/")
        .expect("encoded suffix");
    assert_eq!(amp::decode_path(encoded).expect("decode"), b"request blob");
}

#[tokio::test]
async fn amp_without_cache_hits_the_broker_directly() {
    let body = amp::armor_encode(b"resp").into_bytes();
    let rt = CannedRoundTripper::new(StatusCode::OK, body);
    let rdv = AmpCacheRendezvous::new(broker_url(), None, Vec::new(), rt.clone());
    rdv.exchange(b"req").await.expect("exchange");

    let request = rt.request();
    assert_eq!(request.uri().host(), Some("broker.example"));
    assert!(request.uri().path().starts_with("/amp/client/0"));
}

#[tokio::test]
async fn amp_non_success_status_is_the_sentinel() {
    // AMP caches turn upstream 5xx into 404.
    let rt = CannedRoundTripper::new(StatusCode::NOT_FOUND, Vec::new());
    let rdv = AmpCacheRendezvous::new(broker_url(), None, Vec::new(), rt);
    assert_sentinel(rdv.exchange(b"x").await.expect_err("must fail"));
}

#[tokio::test]
async fn amp_silent_redirect_is_the_sentinel() {
    let rt = CannedRoundTripper::with_header(
        StatusCode::OK,
        "location",
        "https://x/",
        amp::armor_encode(b"ignored").into_bytes(),
    );
    let rdv = AmpCacheRendezvous::new(broker_url(), None, Vec::new(), rt);
    assert_sentinel(rdv.exchange(b"x").await.expect_err("must fail"));
}

#[tokio::test]
async fn amp_oversize_armored_body_is_a_truncated_stream() {
    // Validly armored, but the raw body crosses the ceiling: the cap
    // applies before decoding.
    let body = amp::armor_encode(&vec![0u8; MAX_RESPONSE_LEN]).into_bytes();
    assert!(body.len() > MAX_RESPONSE_LEN);
    let rt = CannedRoundTripper::new(StatusCode::OK, body);
    let rdv = AmpCacheRendezvous::new(broker_url(), None, Vec::new(), rt);
    assert_unexpected_eof(rdv.exchange(b"x").await.expect_err("must fail"));
}

#[tokio::test]
async fn a_configured_channel_negotiates_over_mocked_http() {
    use snowflake_client_lib::broker::BrokerChannel;
    use snowflake_client_lib::messages::ClientPollResponse;
    use snowflake_client_lib::nat::NatType;
    use snowflake_client_lib::sdp::{SdpType, SessionDescription};
    use snowflake_client_lib::Config;

    let answer = SessionDescription {
        sdp_type: SdpType::Answer,
        sdp: "v=0\r\ns=answer\r\n".to_string(),
    };
    let body = ClientPollResponse {
        answer: serde_json::to_string(&answer).expect("serialize"),
        error: String::new(),
    }
    .encode()
    .expect("encode");

    let rt = CannedRoundTripper::new(StatusCode::OK, body);
    let config = Config { broker_url: Some(broker_url()), ..Default::default() };
    let channel = BrokerChannel::from_config_with(&config, rt.clone()).expect("channel");

    let offer = SessionDescription {
        sdp_type: SdpType::Offer,
        sdp: "v=0\r\nm=application 9 DTLS/SCTP 5000\r\n".to_string(),
    };
    let got = channel
        .negotiate(&offer, NatType::Unknown)
        .await
        .expect("negotiate");
    assert_eq!(got, answer);

    let request = rt.request();
    assert_eq!(request.uri().path(), "/client");
    assert!(request.body().starts_with(b"1.0\n"));
}

#[tokio::test]
async fn amp_garbage_body_is_a_protocol_error() {
    let rt = CannedRoundTripper::new(StatusCode::OK, b"<html>not amp armor</html>".to_vec());
    let rdv = AmpCacheRendezvous::new(broker_url(), None, Vec::new(), rt);
    match rdv.exchange(b"x").await.expect_err("must fail") {
        ClientError::Rendezvous(_) => {}
        other => panic!("expected a rendezvous decode error, got {other:?}"),
    }
}
