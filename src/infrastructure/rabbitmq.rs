//! AMQP transport: startup connection with bounded retries, durable topic
//! exchanges for data and control responses, and the durable control queue.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions,
    ExchangeDeclareOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::RabbitMqConfig;
use crate::domain::errors::TransportError;
use crate::domain::ports::BusSink;

pub struct RabbitTransport {
    connection: Connection,
}

impl RabbitTransport {
    /// Connect with bounded retries. Running out of attempts is fatal for
    /// the process, per the startup contract.
    pub async fn connect(config: &RabbitMqConfig) -> anyhow::Result<Self> {
        let uri = config.amqp_uri();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match Connection::connect(&uri, ConnectionProperties::default()).await {
                Ok(connection) => {
                    info!(
                        "RabbitTransport: connected to {}:{} (attempt {})",
                        config.host, config.port, attempt
                    );
                    return Ok(Self { connection });
                }
                Err(e) if attempt < config.connect_attempts => {
                    warn!(
                        "RabbitTransport: connect attempt {}/{} failed: {}; retrying in {:?}",
                        attempt,
                        config.connect_attempts,
                        e,
                        config.connect_backoff()
                    );
                    tokio::time::sleep(config.connect_backoff()).await;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!(
                            "failed to connect to RabbitMQ at {}:{} after {} attempts",
                            config.host, config.port, attempt
                        )
                    });
                }
            }
        }
    }

    /// Channel bound to a durable topic exchange, publisher confirms on.
    pub async fn topic_sink(&self, exchange: &str) -> anyhow::Result<Arc<AmqpSink>> {
        let channel = self.connection.create_channel().await?;
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("failed to declare exchange '{exchange}'"))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        info!("RabbitTransport: declared topic exchange '{exchange}'");
        Ok(Arc::new(AmqpSink {
            channel,
            exchange: exchange.to_string(),
        }))
    }

    /// Consumer on the durable control queue.
    pub async fn control_consumer(&self, queue: &str) -> anyhow::Result<Consumer> {
        let channel = self.connection.create_channel().await?;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("failed to declare queue '{queue}'"))?;

        let consumer = channel
            .basic_consume(
                queue,
                "futurescan-control",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!("RabbitTransport: consuming control queue '{queue}'");
        Ok(consumer)
    }

    pub async fn close(&self) {
        if let Err(e) = self.connection.close(0, "shutdown").await {
            warn!("RabbitTransport: error closing connection: {e}");
        }
    }
}

/// `BusSink` over one AMQP channel and exchange. Messages are persistent
/// and every publish awaits the broker confirm.
pub struct AmqpSink {
    channel: Channel,
    exchange: String,
}

#[async_trait]
impl BusSink for AmqpSink {
    async fn publish(
        &self,
        routing_key: &str,
        body: Vec<u8>,
        correlation_id: Option<&str>,
    ) -> Result<(), TransportError> {
        let mut properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2);
        if let Some(id) = correlation_id {
            properties = properties.with_correlation_id(id.into());
        }

        let confirm = self
            .channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;

        if confirm.is_nack() {
            return Err(TransportError::Unconfirmed);
        }
        Ok(())
    }
}

/// Drive a consumer until shutdown, acking every delivery after the handler
/// ran. The handler owns error reporting; a malformed message must not wedge
/// the queue.
pub async fn run_consumer<F, Fut>(
    mut consumer: Consumer,
    mut shutdown: watch::Receiver<bool>,
    handler: F,
) where
    F: Fn(Vec<u8>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    loop {
        tokio::select! {
            delivery = consumer.next() => {
                match delivery {
                    Some(Ok(delivery)) => {
                        handler(delivery.data.clone()).await;
                        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                            warn!("RabbitTransport: failed to ack delivery: {e}");
                        }
                    }
                    Some(Err(e)) => {
                        error!("RabbitTransport: consumer error: {e}");
                    }
                    None => {
                        warn!("RabbitTransport: consumer stream ended");
                        break;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("RabbitTransport: control consumer stopped");
}
