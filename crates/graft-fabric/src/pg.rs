//! Postgres-backed fabric.
//!
//! Topic-exchange semantics over three tables: bindings, messages, dead
//! letters. Publishing fans a message out to every queue with a matching
//! binding. Consumption takes a row under `FOR UPDATE SKIP LOCKED` and
//! pushes `available_at` forward by the visibility lease, so an unacked
//! message reappears after the lease lapses -- at-least-once delivery
//! without a broker process.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, warn};

use crate::routing::pattern_matches;
use crate::{Delivery, Fabric, FabricError};

/// Tuning for the Postgres fabric.
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// How long a consumed message stays invisible before redelivery.
    pub visibility_timeout: Duration,
    /// Deliveries before a message is dead-lettered; the original envelope
    /// is preserved in `fabric_dead_letters`.
    pub dead_letter_after: i32,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            dead_letter_after: 5,
        }
    }
}

/// The shipped [`Fabric`] implementation.
#[derive(Debug, Clone)]
pub struct PgFabric {
    pool: PgPool,
    config: FabricConfig,
}

impl PgFabric {
    pub fn new(pool: PgPool, config: FabricConfig) -> Self {
        Self { pool, config }
    }

    /// Messages dead-lettered from a queue, oldest first. Exposed for
    /// operators and tests.
    pub async fn dead_letters(&self, queue: &str) -> Result<Vec<Delivery>, FabricError> {
        let rows: Vec<(i64, String, String, serde_json::Value, i32)> = sqlx::query_as(
            "SELECT message_id, queue, routing_key, payload, delivery_count \
             FROM fabric_dead_letters WHERE queue = $1 ORDER BY dead_at",
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(message_id, queue, routing_key, payload, delivery_count)| Delivery {
                    message_id,
                    queue,
                    routing_key,
                    payload,
                    delivery_count,
                },
            )
            .collect())
    }
}

#[async_trait]
impl Fabric for PgFabric {
    async fn declare_queue(&self, queue: &str, bindings: &[String]) -> Result<(), FabricError> {
        for pattern in bindings {
            sqlx::query(
                "INSERT INTO fabric_bindings (queue, pattern) VALUES ($1, $2) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(queue)
            .bind(pattern)
            .execute(&self.pool)
            .await?;
        }
        debug!(queue, ?bindings, "queue declared");
        Ok(())
    }

    async fn publish(
        &self,
        routing_key: &str,
        payload: &serde_json::Value,
    ) -> Result<(), FabricError> {
        let bindings: Vec<(String, String)> =
            sqlx::query_as("SELECT queue, pattern FROM fabric_bindings")
                .fetch_all(&self.pool)
                .await?;

        let mut matched: Vec<&str> = bindings
            .iter()
            .filter(|(_, pattern)| pattern_matches(pattern, routing_key))
            .map(|(queue, _)| queue.as_str())
            .collect();
        matched.sort_unstable();
        matched.dedup();

        if matched.is_empty() {
            // Unroutable messages are dropped, as a topic exchange would.
            debug!(routing_key, "no binding matched, message dropped");
            return Ok(());
        }

        for queue in matched {
            sqlx::query(
                "INSERT INTO fabric_messages (queue, routing_key, payload) \
                 VALUES ($1, $2, $3)",
            )
            .bind(queue)
            .bind(routing_key)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Option<Delivery>, FabricError> {
        // Loop because a fetched row may need dead-lettering rather than
        // delivery; each iteration settles one row.
        loop {
            let mut tx = self.pool.begin().await?;

            let row: Option<(i64, String, serde_json::Value, i32)> = sqlx::query_as(
                "SELECT message_id, routing_key, payload, delivery_count \
                 FROM fabric_messages \
                 WHERE queue = $1 AND available_at <= NOW() \
                 ORDER BY message_id \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED",
            )
            .bind(queue)
            .fetch_optional(&mut *tx)
            .await?;

            let Some((message_id, routing_key, payload, delivery_count)) = row else {
                return Ok(None);
            };

            if delivery_count >= self.config.dead_letter_after {
                sqlx::query(
                    "INSERT INTO fabric_dead_letters \
                         (message_id, queue, routing_key, payload, delivery_count, published_at) \
                     SELECT message_id, queue, routing_key, payload, delivery_count, published_at \
                     FROM fabric_messages WHERE message_id = $1",
                )
                .bind(message_id)
                .execute(&mut *tx)
                .await?;
                sqlx::query("DELETE FROM fabric_messages WHERE message_id = $1")
                    .bind(message_id)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                warn!(queue, message_id, delivery_count, "message dead-lettered");
                continue;
            }

            sqlx::query(
                "UPDATE fabric_messages \
                 SET delivery_count = delivery_count + 1, \
                     available_at = NOW() + make_interval(secs => $1) \
                 WHERE message_id = $2",
            )
            .bind(self.config.visibility_timeout.as_secs_f64())
            .bind(message_id)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;

            return Ok(Some(Delivery {
                message_id,
                queue: queue.to_owned(),
                routing_key,
                payload,
                delivery_count: delivery_count + 1,
            }));
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), FabricError> {
        sqlx::query("DELETE FROM fabric_messages WHERE message_id = $1")
            .bind(delivery.message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<(), FabricError> {
        sqlx::query("UPDATE fabric_messages SET available_at = NOW() WHERE message_id = $1")
            .bind(delivery.message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
