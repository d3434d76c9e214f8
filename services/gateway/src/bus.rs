//! RabbitMQ consumer for the two durable queues the gateway cares about.
//!
//! Grounded in `rabbit_consumer.py`: a single topic exchange (`events`,
//! durable), two independently-bound durable queues (`ws_auth_state` for
//! auth routing keys, `ws_support_events` for support routing keys), each
//! drained by its own consumer loop. Reconnects with capped exponential
//! backoff rather than crashing the process on a broker blip.

use std::time::Duration;

use futures_util::StreamExt;
use gateway_protocol::BusEnvelope;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties, ExchangeKind};
use tracing::{error, info, warn};

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(10);

pub struct QueueBinding {
    pub queue: &'static str,
    pub routing_keys: &'static [&'static str],
}

pub const AUTH_QUEUE: QueueBinding = QueueBinding {
    queue: "ws_auth_state",
    routing_keys: &["auth.#"],
};

pub const SUPPORT_QUEUE: QueueBinding = QueueBinding {
    queue: "ws_support_events",
    routing_keys: &["support.ticket.*", "support.conversation.*"],
};

/// Runs forever, reconnecting on any error. `handle` is invoked with the
/// routing key and parsed envelope for every delivery; a malformed payload is
/// acked and dropped (logged) rather than retried, since a poison message
/// would otherwise wedge the queue.
pub async fn run_consumer(
    url: &str,
    exchange: &str,
    binding: QueueBinding,
    handle: impl Fn(&str, BusEnvelope) + Send + Sync + 'static,
) {
    let mut backoff = RECONNECT_BASE;
    loop {
        match consume_once(url, exchange, &binding, &handle).await {
            Ok(()) => {
                warn!(queue = binding.queue, "bus consumer stream ended, reconnecting");
                backoff = RECONNECT_BASE;
            }
            Err(e) => {
                error!(queue = binding.queue, error = %e, "bus consumer error, reconnecting");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(RECONNECT_CAP);
    }
}

async fn consume_once(
    url: &str,
    exchange: &str,
    binding: &QueueBinding,
    handle: &(impl Fn(&str, BusEnvelope) + Send + Sync + 'static),
) -> Result<(), lapin::Error> {
    let conn = Connection::connect(url, ConnectionProperties::default()).await?;
    let channel = conn.create_channel().await?;

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
        .await?;

    channel
        .queue_declare(
            binding.queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    for routing_key in binding.routing_keys {
        channel
            .queue_bind(
                binding.queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }

    let mut consumer = channel
        .basic_consume(
            binding.queue,
            "gateway",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    info!(queue = binding.queue, "bus consumer connected");
    while let Some(delivery) = consumer.next().await {
        let delivery = delivery?;
        let routing_key = delivery.routing_key.to_string();
        match serde_json::from_slice::<BusEnvelope>(&delivery.data) {
            Ok(envelope) => {
                handle(&routing_key, envelope);
                delivery.ack(BasicAckOptions::default()).await?;
            }
            Err(e) => {
                warn!(routing_key, error = %e, "dropping unparseable bus message");
                delivery.nack(BasicNackOptions::default()).await?;
            }
        }
    }
    Ok(())
}
