//! Request handling
//!
//! Turns one inbound delivery into one published response. Failures are
//! contained here: a bad message or a failed generation is logged, counted
//! and settled with the broker, and the pool moves on.

use crate::broker::{Acknowledger, ResponsePublisher};
use crate::generation::TextGenerator;
use crate::pool::{Inbound, MessageHandler};
use crate::store::{ExchangeRecord, RecordStore};
use chatrelay_common::metrics::{LatencyTimer, RelayMetrics};
use chatrelay_common::{RelayConfig, RelayError, Result};
use chatrelay_proto::{ChatRequest, ChatResponse};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Per-worker settings taken from configuration
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Queue responses are published to
    pub response_queue: String,

    /// Queue receiving bodies of requests that failed processing
    pub dead_letter_queue: Option<String>,

    /// `user_uuid` stamped on every response
    pub user_uuid: Uuid,

    /// Persist completed exchanges
    pub record_exchanges: bool,
}

impl RelaySettings {
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        Ok(Self {
            response_queue: config.broker.response_queue.clone(),
            dead_letter_queue: config.broker.dead_letter_queue.clone(),
            user_uuid: config.user_uuid()?,
            record_exchanges: config.store.as_ref().is_some_and(|s| s.record_exchanges),
        })
    }
}

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Response published, delivery acked
    Published,

    /// Malformed message rejected
    Dropped,

    /// Processing failed, delivery dead-lettered or rejected
    Failed,
}

/// Chat worker: one generator, one publisher, one store
pub struct ChatWorker<G, P> {
    generator: G,
    publisher: P,
    store: RecordStore,
    settings: RelaySettings,
    metrics: RelayMetrics,
}

impl<G, P> ChatWorker<G, P>
where
    G: TextGenerator,
    P: ResponsePublisher,
{
    pub fn new(
        generator: G,
        publisher: P,
        store: RecordStore,
        settings: RelaySettings,
        metrics: RelayMetrics,
    ) -> Self {
        Self {
            generator,
            publisher,
            store,
            settings,
            metrics,
        }
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Give back the store so it can be closed
    pub fn into_store(self) -> RecordStore {
        self.store
    }

    /// Decode, generate and publish. Does not settle the delivery.
    pub async fn process(&self, body: &[u8]) -> Result<ChatResponse> {
        let request =
            ChatRequest::from_slice(body).map_err(|e| RelayError::decode(e.to_string()))?;

        debug!(chat_uuid = %request.chat_uuid, chars = request.message.len(), "Generating reply");

        let reply = self
            .metrics
            .generation_duration
            .observe_async(self.generator.generate(&request.message))
            .await?;

        let response = ChatResponse::reply_to(&request, self.settings.user_uuid, reply);
        let payload = response.to_vec()?;
        self.publisher
            .publish(&self.settings.response_queue, &payload)
            .await?;
        self.metrics.responses_published.inc();

        if self.settings.record_exchanges {
            if let Err(e) = self.store.record(&ExchangeRecord::new(&request, &response)).await {
                self.metrics.store_failures.inc();
                warn!(chat_uuid = %request.chat_uuid, "Failed to record exchange: {}", e);
            }
        }

        Ok(response)
    }

    /// Process one delivery and settle it with the broker
    pub async fn handle_delivery<A: Acknowledger>(&self, job: Inbound<A>) -> Outcome {
        self.metrics.messages_received.inc();

        match self.process(&job.payload).await {
            Ok(response) => {
                debug!(
                    chat_uuid = %response.chat_uuid,
                    queue = %self.settings.response_queue,
                    "Response published"
                );
                settle(job.acker.ack().await);
                Outcome::Published
            }
            Err(err) if err.is_malformed_input() => {
                self.metrics.messages_dropped.inc();
                warn!(bytes = job.payload.len(), "Dropping message: {}", err);
                settle(job.acker.reject().await);
                Outcome::Dropped
            }
            Err(err) => {
                match &err {
                    RelayError::Generation(_) | RelayError::Timeout(_) => {
                        self.metrics.generation_failures.inc()
                    }
                    _ => self.metrics.publish_failures.inc(),
                }
                error!(kind = err.kind(), "Request failed: {}", err);
                self.dead_letter(job).await;
                Outcome::Failed
            }
        }
    }

    /// Forward the original body to the dead letter queue if one is configured
    async fn dead_letter<A: Acknowledger>(&self, job: Inbound<A>) {
        let Some(queue) = &self.settings.dead_letter_queue else {
            settle(job.acker.reject().await);
            return;
        };

        match self.publisher.publish(queue, &job.payload).await {
            Ok(()) => {
                self.metrics.dead_lettered.inc();
                debug!(queue = %queue, "Request dead-lettered");
                settle(job.acker.ack().await);
            }
            Err(e) => {
                error!(queue = %queue, "Dead-lettering failed: {}", e);
                settle(job.acker.reject().await);
            }
        }
    }
}

fn settle(result: Result<()>) {
    if let Err(e) = result {
        warn!("Failed to settle delivery: {}", e);
    }
}

impl<G, P, A> MessageHandler<A> for ChatWorker<G, P>
where
    G: TextGenerator,
    P: ResponsePublisher,
    A: Acknowledger,
{
    async fn handle(&self, job: Inbound<A>) {
        self.handle_delivery(job).await;
    }

    /// A panic can only escape from generation or publishing, before the
    /// delivery was settled, so it is treated as a failed generation.
    async fn recover(&self, job: Inbound<A>) {
        self.metrics.generation_failures.inc();
        error!(bytes = job.payload.len(), "Request aborted by a panic");
        self.dead_letter(job).await;
    }
}
