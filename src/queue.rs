//! Durable task queue on the SQLite outbox table.
//!
//! Delivery is at-least-once. A message stays in the table until its handler
//! acks it; a nack reschedules it with backoff, and permanent failures are
//! dead-lettered so they stop looping and wait for a human.
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::config::App;
use crate::db::{self, OutboxMessage, Pool};

/// What the handler wants done with a delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Redeliver later.
    Nack(String),
    /// Redelivery cannot help.
    DeadLetter(String),
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message_id: &str, payload: &Value) -> Disposition;
}

#[derive(Debug, Clone)]
pub struct Queue {
    pool: Pool,
    max_backoff_secs: i64,
    max_attempts: i64,
    lease: chrono::Duration,
}

impl Queue {
    pub fn new(pool: Pool, max_backoff_secs: i64, max_attempts: i64, lease: Duration) -> Self {
        Self {
            pool,
            max_backoff_secs,
            max_attempts,
            lease: chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::minutes(15)),
        }
    }

    /// The lease is renewed while a handler runs; its length only bounds how
    /// long a crashed worker keeps a message.
    pub fn from_config(pool: Pool, app: &App) -> Self {
        let lease = app.step_deadline() * 10;
        Self::new(
            pool,
            app.max_backoff_seconds as i64,
            app.max_delivery_attempts as i64,
            lease,
        )
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Publish without an ordering key. Returns the message id.
    pub async fn publish(&self, topic: &str, payload: &Value) -> Result<String> {
        db::enqueue_outbox(&self.pool, topic, None, payload, Utc::now()).await
    }

    /// Messages sharing `ordering_key` are never delivered concurrently.
    pub async fn publish_ordered(&self, topic: &str, ordering_key: &str, payload: &Value) -> Result<String> {
        db::enqueue_outbox(&self.pool, topic, Some(ordering_key), payload, Utc::now()).await
    }

    /// Claim and handle one due message. Returns whether one was processed.
    #[instrument(skip_all, fields(topic))]
    pub async fn process_next(&self, topic: &str, handler: &dyn MessageHandler) -> Result<bool> {
        let Some(msg) = db::claim_next_outbox(&self.pool, topic, Utc::now(), self.lease).await? else {
            return Ok(false);
        };
        let work = async {
            match serde_json::from_str::<Value>(&msg.payload) {
                Ok(payload) => handler.handle(&msg.id, &payload).await,
                Err(err) => Disposition::DeadLetter(format!("payload is not JSON: {err}")),
            }
        };
        tokio::pin!(work);

        let mut renew = tokio::time::interval(self.renew_every());
        renew.tick().await;
        let disposition = loop {
            tokio::select! {
                disposition = &mut work => break disposition,
                _ = renew.tick() => {
                    let until = Utc::now() + self.lease;
                    match db::renew_outbox_lease(&self.pool, &msg.id, until).await {
                        Ok(true) => debug!(id = %msg.id, "lease renewed"),
                        Ok(false) => warn!(id = %msg.id, "lease lost while handling"),
                        Err(err) => warn!(id = %msg.id, ?err, "failed to renew lease"),
                    }
                }
            }
        };
        self.settle(&msg, disposition).await?;
        Ok(true)
    }

    fn renew_every(&self) -> Duration {
        let lease = self.lease.to_std().unwrap_or(Duration::from_secs(60));
        (lease / 3).max(Duration::from_millis(10))
    }

    async fn settle(&self, msg: &OutboxMessage, disposition: Disposition) -> Result<()> {
        let id = msg.id.as_str();
        let attempt = msg.attempt;
        match disposition {
            Disposition::Ack => {
                db::delete_outbox(&self.pool, id).await?;
                info!(id, attempt, "message acked");
            }
            Disposition::Nack(reason) if attempt + 1 >= self.max_attempts => {
                db::dead_letter_outbox(&self.pool, id, &reason).await?;
                error!(id, attempt, %reason, "delivery attempts exhausted; message dead-lettered");
            }
            Disposition::Nack(reason) => {
                let delay = db::backoff_outbox(&self.pool, id, attempt, self.max_backoff_secs, &reason)
                    .await?;
                warn!(id, attempt, delay, %reason, "message nacked; backoff");
            }
            Disposition::DeadLetter(reason) => {
                db::dead_letter_outbox(&self.pool, id, &reason).await?;
                error!(id, attempt, %reason, "message dead-lettered; needs manual attention");
            }
        }
        Ok(())
    }
}

/// Poll `topic` until `shutdown` flips to true.
pub async fn run_subscriber(
    queue: Queue,
    topic: String,
    handler: Arc<dyn MessageHandler>,
    poll: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(%topic, "subscriber started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let idle = match queue.process_next(&topic, handler.as_ref()).await {
            Ok(processed) => (!processed).then_some(poll),
            Err(err) => {
                error!(?err, "queue worker error");
                Some(Duration::from_secs(1))
            }
        };
        if let Some(wait) = idle {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
    info!(%topic, "subscriber stopped");
}

/// Pending (not dead-lettered) message count, for the status surface.
pub async fn pending(queue: &Queue, topic: &str) -> Result<i64> {
    db::count_pending_outbox(&queue.pool, topic)
        .await
        .context("failed to count pending messages")
}

/// Pending messages for one record.
pub async fn pending_for(queue: &Queue, topic: &str, record_key: &str) -> Result<i64> {
    db::count_pending_for_key(&queue.pool, topic, record_key)
        .await
        .context("failed to count pending messages")
}

/// Dead-lettered messages for one record, as `(id, attempt, last_error)`.
pub async fn dead_letters_for(
    queue: &Queue,
    topic: &str,
    record_key: &str,
) -> Result<Vec<(String, i64, Option<String>)>> {
    db::list_dead_letters_for_key(&queue.pool, topic, record_key)
        .await
        .context("failed to list dead letters")
}
