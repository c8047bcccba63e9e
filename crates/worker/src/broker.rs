//! AMQP broker plumbing
//!
//! Owns the connection and channel, declares the queues, and adapts lapin
//! deliveries into pool jobs. Publishing and acknowledgement sit behind
//! traits so the worker can run against in-process doubles.

use crate::pool::{Inbound, WorkerPool};
use chatrelay_common::config::{AckMode, BrokerConfig};
use chatrelay_common::{RelayError, Result};
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use std::future::Future;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// Publishes message bodies to a named queue
pub trait ResponsePublisher: Send + Sync + 'static {
    fn publish(&self, queue: &str, body: &[u8]) -> impl Future<Output = Result<()>> + Send;
}

/// Settles one delivery with the broker
pub trait Acknowledger: Send + 'static {
    /// Processing finished; the broker may forget the message
    fn ack(self) -> impl Future<Output = Result<()>> + Send;

    /// Processing failed; discard without requeue (dead-lettered if the queue has a DLX)
    fn reject(self) -> impl Future<Output = Result<()>> + Send;
}

fn broker_error(context: &str) -> impl Fn(lapin::Error) -> RelayError + '_ {
    move |e| RelayError::broker(format!("{}: {}", context, e))
}

/// Whether deliveries are settled by the worker. In `on_receipt` mode the
/// broker considers a message delivered as soon as it is pushed.
pub fn settles_explicitly(mode: AckMode) -> bool {
    mode == AckMode::AfterPublish
}

fn consume_options(mode: AckMode) -> BasicConsumeOptions {
    BasicConsumeOptions {
        no_ack: !settles_explicitly(mode),
        ..Default::default()
    }
}

/// Connection URI for `config`
pub fn amqp_uri(config: &BrokerConfig) -> AMQPUri {
    AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: config.user.clone(),
                password: config.password.clone(),
            },
            host: config.host.clone(),
            port: config.port,
        },
        vhost: config.vhost.clone(),
        ..Default::default()
    }
}

/// Open connection with one channel
pub struct BrokerConnection {
    connection: Connection,
    channel: Channel,
    request_queue: String,
    ack_mode: AckMode,
}

impl BrokerConnection {
    /// Connect, declare queues, and set the prefetch window
    pub async fn connect(config: &BrokerConfig, ack_mode: AckMode, prefetch: u16) -> Result<Self> {
        info!(host = %config.host, port = config.port, vhost = %config.vhost, "Connecting to broker");

        let connection = Connection::connect_uri(amqp_uri(config), ConnectionProperties::default())
            .await
            .map_err(broker_error("connect"))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(broker_error("create channel"))?;

        if config.declare_queues {
            let queues = [
                Some(&config.request_queue),
                Some(&config.response_queue),
                config.dead_letter_queue.as_ref(),
            ];
            for queue in queues.into_iter().flatten() {
                let options = QueueDeclareOptions {
                    durable: config.durable_queues,
                    ..Default::default()
                };
                channel
                    .queue_declare(queue, options, FieldTable::default())
                    .await
                    .map_err(broker_error("declare queue"))?;
                debug!(queue = %queue, "Queue declared");
            }
        }

        if settles_explicitly(ack_mode) {
            channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(broker_error("set prefetch"))?;
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(broker_error("enable publisher confirms"))?;
        }

        info!(
            request_queue = %config.request_queue,
            response_queue = %config.response_queue,
            ?ack_mode,
            prefetch,
            "Broker connection established"
        );

        Ok(Self {
            connection,
            channel,
            request_queue: config.request_queue.clone(),
            ack_mode,
        })
    }

    /// Publisher sharing this connection's channel
    pub fn publisher(&self) -> AmqpPublisher {
        AmqpPublisher {
            channel: self.channel.clone(),
            confirm: settles_explicitly(self.ack_mode),
        }
    }

    /// Subscribe to the request queue
    pub async fn consume(&self, consumer_tag: &str) -> Result<Consumer> {
        let consumer = self
            .channel
            .basic_consume(
                &self.request_queue,
                consumer_tag,
                consume_options(self.ack_mode),
                FieldTable::default(),
            )
            .await
            .map_err(broker_error("subscribe"))?;

        info!(queue = %self.request_queue, consumer_tag, "Subscribed to request queue");
        Ok(consumer)
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    /// Close channel and connection. Unacked deliveries return to the queue.
    pub async fn close(self) -> Result<()> {
        self.channel
            .close(200, "worker shutdown")
            .await
            .map_err(broker_error("close channel"))?;
        self.connection
            .close(200, "worker shutdown")
            .await
            .map_err(broker_error("close connection"))?;
        info!("Broker connection closed");
        Ok(())
    }
}

/// Publishes through the default exchange, routing by queue name
#[derive(Clone)]
pub struct AmqpPublisher {
    channel: Channel,
    confirm: bool,
}

impl ResponsePublisher for AmqpPublisher {
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2);

        let confirm = self
            .channel
            .basic_publish("", queue, BasicPublishOptions::default(), body, properties)
            .await
            .map_err(|e| RelayError::publish(format!("{}: {}", queue, e)))?;

        if self.confirm {
            let confirmation = confirm
                .await
                .map_err(|e| RelayError::publish(format!("{}: {}", queue, e)))?;
            if confirmation.is_nack() {
                return Err(RelayError::publish(format!("broker refused message for {}", queue)));
            }
        }
        Ok(())
    }
}

/// Acknowledger for a lapin delivery
#[derive(Clone)]
pub struct AmqpAcker {
    acker: Acker,
    mode: AckMode,
}

impl AmqpAcker {
    pub fn new(acker: Acker, mode: AckMode) -> Self {
        Self { acker, mode }
    }

    pub fn mode(&self) -> AckMode {
        self.mode
    }
}

impl Acknowledger for AmqpAcker {
    async fn ack(self) -> Result<()> {
        if !settles_explicitly(self.mode) {
            return Ok(());
        }
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(broker_error("ack"))
    }

    async fn reject(self) -> Result<()> {
        if !settles_explicitly(self.mode) {
            return Ok(());
        }
        self.acker
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map(|_| ())
            .map_err(broker_error("reject"))
    }
}

fn inbound(payload: Vec<u8>, acker: Acker, ack_mode: AckMode) -> Inbound<AmqpAcker> {
    Inbound::new(payload, AmqpAcker::new(acker, ack_mode))
}

/// Feed deliveries into the pool until the subscription ends.
///
/// Waits for pool capacity before taking the next delivery, so a busy pool
/// leaves messages in the broker.
pub async fn forward_deliveries(
    mut consumer: Consumer,
    pool: &WorkerPool<AmqpAcker>,
    ack_mode: AckMode,
) -> Result<()> {
    while let Some(delivery) = consumer.next().await {
        let delivery = delivery.map_err(broker_error("receive"))?;
        if delivery.redelivered {
            debug!(delivery_tag = delivery.delivery_tag, "Redelivered message");
        }
        pool.submit(inbound(delivery.data, delivery.acker, ack_mode)).await?;
    }

    warn!("Request queue subscription ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_common::RelayConfig;

    #[test]
    fn test_amqp_uri_from_config() {
        let config = RelayConfig::from_yaml_str(
            r#"
broker:
  host: rabbit.internal
  port: 5673
  user: relay
  password: "p@ss/word"
  vhost: chat
generation:
  endpoint: http://localhost:8080/generate
  model: m
  tokenizer: t
"#,
        )
        .unwrap();

        let uri = amqp_uri(&config.broker);
        assert_eq!(uri.authority.host, "rabbit.internal");
        assert_eq!(uri.authority.port, 5673);
        assert_eq!(uri.authority.userinfo.username, "relay");
        assert_eq!(uri.authority.userinfo.password, "p@ss/word");
        assert_eq!(uri.vhost, "chat");
    }

    #[test]
    fn test_consume_options_follow_ack_mode() {
        assert!(consume_options(AckMode::OnReceipt).no_ack);
        assert!(!consume_options(AckMode::AfterPublish).no_ack);
        assert!(settles_explicitly(AckMode::AfterPublish));
        assert!(!settles_explicitly(AckMode::OnReceipt));
    }

    #[tokio::test]
    async fn test_on_receipt_acker_never_settles() {
        // A detached acker has no channel behind it, so any real ack or
        // reject would have to go through the broker
        let acker = AmqpAcker::new(Acker::default(), AckMode::OnReceipt);
        acker.clone().ack().await.unwrap();
        acker.reject().await.unwrap();
    }

    #[test]
    fn test_deliveries_carry_configured_ack_mode() {
        for mode in [AckMode::AfterPublish, AckMode::OnReceipt] {
            let job = inbound(b"{}".to_vec(), Acker::default(), mode);
            assert_eq!(job.payload, b"{}");
            assert_eq!(job.acker.mode(), mode);
        }
    }
}
