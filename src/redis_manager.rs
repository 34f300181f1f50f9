//! Redis Manager - Centralized Redis connection and operations
//!
//! This module handles all Redis-related operations including:
//! - Submission queue intake (BLPOP)
//! - Result storage and publishing
//! - Per-session event streaming

use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::Serialize;
use tracing::{info, warn};

use crate::worker::protocol::WorkerEvent;
use crate::{SubmissionJob, SubmissionResult};

/// Redis key constants
pub mod keys {
    /// Submission job queue key
    pub const SUBMISSION_QUEUE: &str = "tutor:queue";

    /// Result key prefix (for polling)
    pub const RESULT_PREFIX: &str = "tutor:result:";

    /// Result channel (for pub/sub)
    pub const RESULT_CHANNEL: &str = "tutor:results";

    /// Per-session event channel prefix (for pub/sub streaming)
    pub const EVENT_CHANNEL_PREFIX: &str = "tutor:events:";
}

const RESULT_EXPIRY_SECS: u64 = 3600; // 1 hour

/// Centralized Redis manager for queue intake.
pub struct RedisManager {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisManager {
    async fn with_url(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let conn = get_connection_with_retry(&client).await?;
        info!("Connected to Redis at {}", redis_url);
        Ok(Self { client, conn })
    }

    /// Create a new RedisManager using the REDIS_URL environment variable.
    /// Defaults to "redis://localhost:6379" if not set.
    pub async fn from_env() -> Result<Self> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        Self::with_url(&url).await
    }

    /// Block and wait for the next submission job from the queue.
    ///
    /// This uses BLPOP to efficiently wait for jobs without polling.
    /// Automatically reconnects on connection failure.
    pub async fn pop_job(&mut self) -> Result<SubmissionJob> {
        loop {
            let result: Option<(String, String)> =
                match self.conn.blpop(keys::SUBMISSION_QUEUE, 0.0).await {
                    Ok(res) => res,
                    Err(e) => {
                        warn!("Redis BLPOP failed: {}. Reconnecting...", e);
                        self.reconnect().await?;
                        continue;
                    }
                };

            if let Some((_, job_data)) = result {
                match serde_json::from_str::<SubmissionJob>(&job_data) {
                    Ok(job) => return Ok(job),
                    Err(e) => {
                        warn!("Failed to parse job data: {}. Data: {}", e, job_data);
                        continue;
                    }
                }
            }
        }
    }

    /// A handle for publishing results and events from concurrent tasks.
    pub fn publisher(&self) -> ResultPublisher {
        ResultPublisher {
            client: self.client.clone(),
            conn: self.conn.clone(),
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.conn = get_connection_with_retry(&self.client).await?;
        Ok(())
    }
}

/// Publishes result events and terminal results.
#[derive(Clone)]
pub struct ResultPublisher {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl ResultPublisher {
    /// Publish one worker event on the session's event channel.
    /// Events are non-critical; a publish failure is retried once after
    /// a reconnect and otherwise dropped.
    pub async fn publish_event(&mut self, session_key: &str, event: &WorkerEvent) -> Result<()> {
        let channel = format!("{}{}", keys::EVENT_CHANNEL_PREFIX, session_key);
        let json = serde_json::to_string(event)?;
        if let Err(e) = self.conn.publish::<_, _, ()>(&channel, &json).await {
            warn!("Failed to publish event: {}. Reconnecting...", e);
            self.reconnect().await?;
            let _ = self.conn.publish::<_, _, ()>(&channel, &json).await;
        }
        Ok(())
    }

    /// Store a submission result with a TTL and publish it for
    /// real-time subscribers.
    pub async fn store_result(&mut self, result: &SubmissionResult) -> Result<()> {
        self.store(
            &format!("{}{}", keys::RESULT_PREFIX, result.submission_id),
            Some(keys::RESULT_CHANNEL),
            result,
        )
        .await
    }

    async fn store<T: Serialize>(
        &mut self,
        key: &str,
        channel: Option<&str>,
        result: &T,
    ) -> Result<()> {
        let json = serde_json::to_string(result)?;

        // Try to store, reconnect on failure.
        if let Err(e) = self
            .conn
            .set_ex::<_, _, ()>(key, &json, RESULT_EXPIRY_SECS)
            .await
        {
            warn!("Failed to store result: {}. Reconnecting...", e);
            self.reconnect().await?;
            self.conn
                .set_ex::<_, _, ()>(key, &json, RESULT_EXPIRY_SECS)
                .await?;
        }

        // Publish to channel (ignore errors as there may be no subscribers).
        if let Some(chan) = channel {
            let _ = self.conn.publish::<_, _, ()>(chan, &json).await;
        }

        Ok(())
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.conn = get_connection_with_retry(&self.client).await?;
        Ok(())
    }
}

/// Get a Redis connection with retry logic
async fn get_connection_with_retry(client: &redis::Client) -> Result<MultiplexedConnection> {
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                warn!(
                    "Failed to connect to Redis: {}. Retrying in 3 seconds...",
                    e
                );
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    }
}
