use std::pin::Pin;

use anyhow::{Context, Result};
use futures_util::{Stream, StreamExt};
use redis::Msg;

use super::LineSource;

type MessageStream = Pin<Box<dyn Stream<Item = Msg> + Send>>;

/// Consumes log lines published on a Redis pub/sub channel.
///
/// Pub/sub delivery is fire-and-forget: a message is gone from the broker
/// once received, so a crash before the window flushes loses it.
pub struct RedisSource {
    name: String,
    messages: MessageStream,
}

impl RedisSource {
    /// Connects to `url` and subscribes to `channel`.
    pub async fn connect(url: &str, channel: &str) -> Result<Self> {
        let client = redis::Client::open(url).with_context(|| format!("parsing redis url {url}"))?;
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .with_context(|| format!("connecting to redis at {url}"))?;

        pubsub
            .subscribe(channel)
            .await
            .with_context(|| format!("subscribing to redis channel {channel}"))?;

        tracing::info!(channel, "subscribed to redis channel");

        Ok(Self {
            name: format!("redis:{channel}"),
            messages: Box::pin(pubsub.into_on_message()),
        })
    }
}

impl LineSource for RedisSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_line(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self
            .messages
            .next()
            .await
            .map(|msg| msg.get_payload_bytes().to_vec()))
    }
}
