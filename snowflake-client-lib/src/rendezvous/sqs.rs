//! Store-and-forward rendezvous over AWS SQS.
//!
//! The client drops its poll request on the broker's inbound queue,
//! tagged with a random client ID, and the broker answers on a per-client
//! response queue it creates on demand. Everything here is fixed-attempt
//! polling; a single `ReceiveMessage` long-poll can block for up to 20
//! seconds on the AWS side.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_sqs::types::MessageAttributeValue;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

use super::transport::RendezvousTransport;
use crate::config::SqsCredentials;
use crate::error::{ClientError, Result};

/// The broker names each per-client response queue by this prefix plus
/// the client's hex ID.
pub const CLIENT_QUEUE_PREFIX: &str = "snowflake-client-";

const QUEUE_URL_ATTEMPTS: u64 = 5;
const RECEIVE_ATTEMPTS: u64 = 5;
/// Grace period for the broker to create the response queue.
const QUEUE_CREATE_DELAY: Duration = Duration::from_secs(1);

/// The slice of the SQS API this rendezvous needs. Production wraps the
/// AWS SDK client; tests substitute a scripted double.
#[async_trait]
pub trait SqsApi: Send + Sync {
    async fn send_message(&self, queue_url: &str, body: &str, client_id: &str) -> Result<()>;
    async fn get_queue_url(&self, queue_name: &str) -> Result<String>;
    /// One long-poll receive; `None` when the poll came back empty.
    async fn receive_message(&self, queue_url: &str) -> Result<Option<String>>;
}

pub struct SqsRendezvous {
    queue_url: Url,
    client_id: String,
    api: Arc<dyn SqsApi>,
}

impl SqsRendezvous {
    pub fn new(queue_url: Url, credentials: SqsCredentials) -> Result<Self> {
        let region = region_from_queue_url(&queue_url)?;
        let api = Arc::new(AwsSqsApi::new(region, credentials));
        Ok(Self::with_api(queue_url, api))
    }

    /// Construction with an explicit API implementation.
    pub fn with_api(queue_url: Url, api: Arc<dyn SqsApi>) -> Self {
        // The ID names a publicly guessable response queue, so it must
        // come from a cryptographically secure source; ThreadRng is one.
        let client_id = format!("{:016x}", rand::random::<u64>());
        Self { queue_url, client_id, api }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

#[async_trait]
impl RendezvousTransport for SqsRendezvous {
    async fn exchange(&self, poll_request: &[u8]) -> Result<Vec<u8>> {
        let body = std::str::from_utf8(poll_request)
            .map_err(|_| ClientError::Sqs("poll request is not valid UTF-8".to_string()))?;
        self.api
            .send_message(self.queue_url.as_str(), body, &self.client_id)
            .await?;

        sleep(QUEUE_CREATE_DELAY).await;

        let queue_name = format!("{CLIENT_QUEUE_PREFIX}{}", self.client_id);
        let mut response_queue = None;
        let mut last_err = None;
        for attempt in 0..QUEUE_URL_ATTEMPTS {
            if attempt > 0 {
                sleep(Duration::from_secs(attempt)).await;
            }
            match self.api.get_queue_url(&queue_name).await {
                Ok(queue_url) => {
                    response_queue = Some(queue_url);
                    break;
                }
                Err(e) => {
                    warn!(error = %e, attempt, "response queue not resolvable yet");
                    last_err = Some(e);
                }
            }
        }
        let Some(response_queue) = response_queue else {
            return Err(last_err.unwrap_or_else(|| {
                ClientError::Sqs("could not resolve the response queue".to_string())
            }));
        };
        debug!(queue = %response_queue, "response queue resolved");

        for attempt in 0..RECEIVE_ATTEMPTS {
            if attempt > 0 {
                sleep(Duration::from_secs(attempt / 2 + 1)).await;
            }
            if let Some(body) = self.api.receive_message(&response_queue).await? {
                return Ok(body.into_bytes());
            }
        }
        // An empty blob could never decode into a poll response anyway,
        // so surface the exhaustion as a timeout.
        Err(ClientError::Broker(
            "timed out waiting for a broker answer over SQS".to_string(),
        ))
    }
}

fn region_from_queue_url(queue_url: &Url) -> Result<String> {
    let host = queue_url
        .host_str()
        .ok_or_else(|| ClientError::Config("SQS queue URL has no host".to_string()))?;
    let mut parts = host.split('.');
    match (parts.next(), parts.next()) {
        (Some("sqs"), Some(region)) if !region.is_empty() => Ok(region.to_string()),
        _ => Err(ClientError::Config(format!(
            "cannot derive an AWS region from SQS queue host {host:?}"
        ))),
    }
}

/// [`SqsApi`] over the AWS SDK.
pub struct AwsSqsApi {
    client: aws_sdk_sqs::Client,
}

impl AwsSqsApi {
    pub fn new(region: String, credentials: SqsCredentials) -> Self {
        let provider = Credentials::new(
            credentials.access_key_id,
            credentials.secret_key,
            None,
            None,
            "snowflake-sqs-rendezvous",
        );
        let config = aws_sdk_sqs::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region))
            .credentials_provider(provider)
            .build();
        Self { client: aws_sdk_sqs::Client::from_conf(config) }
    }
}

#[async_trait]
impl SqsApi for AwsSqsApi {
    async fn send_message(&self, queue_url: &str, body: &str, client_id: &str) -> Result<()> {
        let attribute = MessageAttributeValue::builder()
            .data_type("String")
            .string_value(client_id)
            .build()
            .map_err(|e| ClientError::Sqs(format!("building ClientID attribute: {e}")))?;
        self.client
            .send_message()
            .queue_url(queue_url)
            .message_body(body)
            .message_attributes("ClientID", attribute)
            .send()
            .await
            .map_err(|e| ClientError::Sqs(format!("SendMessage: {e}")))?;
        Ok(())
    }

    async fn get_queue_url(&self, queue_name: &str) -> Result<String> {
        let out = self
            .client
            .get_queue_url()
            .queue_name(queue_name)
            .send()
            .await
            .map_err(|e| ClientError::Sqs(format!("GetQueueUrl: {e}")))?;
        out.queue_url()
            .map(str::to_string)
            .ok_or_else(|| ClientError::Sqs("GetQueueUrl returned no URL".to_string()))
    }

    async fn receive_message(&self, queue_url: &str) -> Result<Option<String>> {
        let out = self
            .client
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(1)
            .wait_time_seconds(20)
            .send()
            .await
            .map_err(|e| ClientError::Sqs(format!("ReceiveMessage: {e}")))?;
        Ok(out
            .messages()
            .first()
            .and_then(|m| m.body().map(str::to_string)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_is_parsed_from_the_queue_host() {
        let url = Url::parse("https://sqs.us-east-1.amazonaws.com/1234/broker-queue")
            .expect("url");
        assert_eq!(region_from_queue_url(&url).expect("region"), "us-east-1");
    }

    #[test]
    fn non_sqs_hosts_are_rejected() {
        for bad in ["https://example.com/q", "https://sqs./q"] {
            let url = Url::parse(bad).expect("url");
            assert!(region_from_queue_url(&url).is_err(), "{bad}");
        }
    }

    #[test]
    fn client_ids_are_distinct_hex() {
        struct NoopApi;
        #[async_trait]
        impl SqsApi for NoopApi {
            async fn send_message(&self, _: &str, _: &str, _: &str) -> Result<()> {
                Ok(())
            }
            async fn get_queue_url(&self, _: &str) -> Result<String> {
                Ok(String::new())
            }
            async fn receive_message(&self, _: &str) -> Result<Option<String>> {
                Ok(None)
            }
        }
        let url = Url::parse("https://sqs.us-east-1.amazonaws.com/1234/q").expect("url");
        let a = SqsRendezvous::with_api(url.clone(), Arc::new(NoopApi));
        let b = SqsRendezvous::with_api(url, Arc::new(NoopApi));
        assert_eq!(a.client_id().len(), 16);
        assert!(a.client_id().bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(a.client_id(), b.client_id());
    }
}
