use std::time::Duration;

use anyhow::Context;
use futures_util::StreamExt;
use pylon_common::protocol::fanout::FanoutFrame;
use redis::{aio::ConnectionManager, AsyncCommands};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);
const LOCAL_BUS_CAPACITY: usize = 1024;

pub fn instance_channel(instance_id: uuid::Uuid) -> String {
    format!("fanout:{instance_id}")
}

/// Instance-to-instance forwarding path for notifications whose target user
/// is connected elsewhere.
///
/// Each instance subscribes to its own channel; publishing to a channel with
/// no live subscriber means the target instance is gone, and the caller falls
/// back to the offline store.
#[derive(Clone)]
pub enum FanoutBus {
    Redis { client: redis::Client, conn: ConnectionManager },
    Local(broadcast::Sender<(String, FanoutFrame)>),
}

impl FanoutBus {
    pub fn redis(client: redis::Client, conn: ConnectionManager) -> Self {
        Self::Redis { client, conn }
    }

    pub fn local() -> Self {
        let (tx, _rx) = broadcast::channel(LOCAL_BUS_CAPACITY);
        Self::Local(tx)
    }

    /// Publish a frame to another instance's channel. `Ok(false)` means no
    /// instance was listening on that channel.
    pub async fn publish(&self, channel: &str, frame: &FanoutFrame) -> anyhow::Result<bool> {
        match self {
            Self::Redis { conn, .. } => {
                let payload =
                    serde_json::to_string(frame).context("failed to serialize fanout frame")?;
                let mut conn = conn.clone();
                let receivers: i64 = conn
                    .publish(channel, payload)
                    .await
                    .context("failed to publish fanout frame")?;
                Ok(receivers > 0)
            }
            Self::Local(tx) => Ok(tx.send((channel.to_owned(), frame.clone())).is_ok()),
        }
    }

    /// Consume frames addressed to this instance's channel, handing each one
    /// to `deliver`. Runs until the process shuts down; a dropped Redis
    /// subscription is re-established after a short pause.
    pub async fn run_subscriber<F, Fut>(&self, channel: String, deliver: F)
    where
        F: Fn(FanoutFrame) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        match self {
            Self::Redis { client, .. } => loop {
                match self.subscribe_once(client, &channel, &deliver).await {
                    Ok(()) => warn!(%channel, "fanout subscription ended, resubscribing"),
                    Err(error) => {
                        warn!(%channel, %error, "fanout subscription failed, resubscribing");
                    }
                }
                tokio::time::sleep(RESUBSCRIBE_BACKOFF).await;
            },
            Self::Local(tx) => {
                let mut rx = tx.subscribe();
                loop {
                    match rx.recv().await {
                        Ok((frame_channel, frame)) if frame_channel == channel => {
                            deliver(frame).await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(%channel, skipped, "local fanout receiver lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    }

    async fn subscribe_once<F, Fut>(
        &self,
        client: &redis::Client,
        channel: &str,
        deliver: &F,
    ) -> anyhow::Result<()>
    where
        F: Fn(FanoutFrame) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .context("failed to open fanout pubsub connection")?;
        pubsub.subscribe(channel).await.context("failed to subscribe to fanout channel")?;
        debug!(%channel, "fanout subscription established");

        let mut messages = pubsub.on_message();
        while let Some(message) = messages.next().await {
            let payload: String = match message.get_payload() {
                Ok(payload) => payload,
                Err(error) => {
                    warn!(%channel, %error, "fanout frame payload is not text, skipping");
                    continue;
                }
            };
            match serde_json::from_str::<FanoutFrame>(&payload) {
                Ok(frame) => deliver(frame).await,
                Err(error) => {
                    warn!(%channel, %error, "fanout frame is not valid JSON, skipping");
                }
            }
        }

        Ok(())
    }
}
