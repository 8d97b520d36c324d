use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use snowflake_client_lib::error::ClientError;
use snowflake_client_lib::rendezvous::{
    RendezvousTransport, SqsApi, SqsRendezvous, CLIENT_QUEUE_PREFIX,
};
use snowflake_client_lib::Result;
use url::Url;

const BROKER_QUEUE: &str =
    "https://sqs.us-east-1.amazonaws.com/893902434899/snowflake-broker";

#[derive(Default)]
struct Recorded {
    sends: Vec<(String, String, String)>,
    queue_url_lookups: Vec<String>,
    receives: Vec<String>,
}

/// A scripted SQS double: results are popped per call, and every call is
/// recorded.
struct ScriptedSqs {
    recorded: Mutex<Recorded>,
    queue_url_results: Mutex<VecDeque<Result<String>>>,
    receive_results: Mutex<VecDeque<Result<Option<String>>>>,
}

impl ScriptedSqs {
    fn new(
        queue_url_results: Vec<Result<String>>,
        receive_results: Vec<Result<Option<String>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            recorded: Mutex::new(Recorded::default()),
            queue_url_results: Mutex::new(queue_url_results.into()),
            receive_results: Mutex::new(receive_results.into()),
        })
    }
}

#[async_trait]
impl SqsApi for ScriptedSqs {
    async fn send_message(&self, queue_url: &str, body: &str, client_id: &str) -> Result<()> {
        self.recorded.lock().expect("lock").sends.push((
            queue_url.to_string(),
            body.to_string(),
            client_id.to_string(),
        ));
        Ok(())
    }

    async fn get_queue_url(&self, queue_name: &str) -> Result<String> {
        self.recorded
            .lock()
            .expect("lock")
            .queue_url_lookups
            .push(queue_name.to_string());
        self.queue_url_results
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| Err(ClientError::Sqs("script exhausted".to_string())))
    }

    async fn receive_message(&self, queue_url: &str) -> Result<Option<String>> {
        self.recorded
            .lock()
            .expect("lock")
            .receives
            .push(queue_url.to_string());
        self.receive_results
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| Err(ClientError::Sqs("script exhausted".to_string())))
    }
}

fn rendezvous(api: Arc<ScriptedSqs>) -> SqsRendezvous {
    SqsRendezvous::with_api(Url::parse(BROKER_QUEUE).expect("queue URL"), api)
}

#[tokio::test(start_paused = true)]
async fn answer_on_the_response_queue_completes_the_exchange() {
    let api = ScriptedSqs::new(
        vec![Ok("https://sqs.us-east-1.amazonaws.com/893902434899/testing".to_string())],
        vec![Ok(Some("answer".to_string()))],
    );
    let rdv = rendezvous(api.clone());
    let client_id = rdv.client_id().to_string();

    let out = rdv.exchange(b"poll blob").await.expect("exchange");
    assert_eq!(out, b"answer");

    let recorded = api.recorded.lock().expect("lock");
    assert_eq!(
        recorded.sends,
        vec![(BROKER_QUEUE.to_string(), "poll blob".to_string(), client_id.clone())]
    );
    assert_eq!(
        recorded.queue_url_lookups,
        vec![format!("{CLIENT_QUEUE_PREFIX}{client_id}")]
    );
    assert_eq!(
        recorded.receives,
        vec!["https://sqs.us-east-1.amazonaws.com/893902434899/testing".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn queue_url_lookup_retries_then_fails_with_the_last_error() {
    let api = ScriptedSqs::new(
        (1..=5)
            .map(|i| Err(ClientError::Sqs(format!("AWS.SimpleQueueService.NonExistentQueue ({i})"))))
            .collect(),
        Vec::new(),
    );
    let rdv = rendezvous(api.clone());

    match rdv.exchange(b"poll blob").await.expect_err("must fail") {
        ClientError::Sqs(msg) => assert!(msg.contains("(5)"), "not the last error: {msg}"),
        other => panic!("expected the last lookup error, got {other:?}"),
    }
    let recorded = api.recorded.lock().expect("lock");
    assert_eq!(recorded.queue_url_lookups.len(), 5);
    assert!(recorded.receives.is_empty());
}

#[tokio::test(start_paused = true)]
async fn lookup_recovers_on_a_later_attempt() {
    let api = ScriptedSqs::new(
        vec![
            Err(ClientError::Sqs("not yet".to_string())),
            Err(ClientError::Sqs("still not".to_string())),
            Ok("https://sqs.us-east-1.amazonaws.com/893902434899/late".to_string()),
        ],
        vec![Ok(Some("late answer".to_string()))],
    );
    let rdv = rendezvous(api.clone());

    let out = rdv.exchange(b"poll blob").await.expect("exchange");
    assert_eq!(out, b"late answer");
    assert_eq!(api.recorded.lock().expect("lock").queue_url_lookups.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn empty_polls_exhaust_into_a_timeout_error() {
    let api = ScriptedSqs::new(
        vec![Ok("https://sqs.us-east-1.amazonaws.com/893902434899/empty".to_string())],
        vec![Ok(None), Ok(None), Ok(None), Ok(None), Ok(None)],
    );
    let rdv = rendezvous(api.clone());

    match rdv.exchange(b"poll blob").await.expect_err("must fail") {
        ClientError::Broker(msg) => assert!(msg.contains("timed out"), "{msg}"),
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert_eq!(api.recorded.lock().expect("lock").receives.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn a_receive_error_fails_the_exchange_immediately() {
    let api = ScriptedSqs::new(
        vec![Ok("https://sqs.us-east-1.amazonaws.com/893902434899/broken".to_string())],
        vec![Err(ClientError::Sqs("access denied".to_string()))],
    );
    let rdv = rendezvous(api.clone());

    match rdv.exchange(b"poll blob").await.expect_err("must fail") {
        ClientError::Sqs(msg) => assert!(msg.contains("access denied")),
        other => panic!("expected the receive error, got {other:?}"),
    }
    assert_eq!(api.recorded.lock().expect("lock").receives.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn a_late_message_stops_the_retry_loop() {
    let api = ScriptedSqs::new(
        vec![Ok("https://sqs.us-east-1.amazonaws.com/893902434899/slow".to_string())],
        vec![Ok(None), Ok(None), Ok(Some("slow answer".to_string()))],
    );
    let rdv = rendezvous(api.clone());

    let out = rdv.exchange(b"poll blob").await.expect("exchange");
    assert_eq!(out, b"slow answer");
    assert_eq!(api.recorded.lock().expect("lock").receives.len(), 3);
}
