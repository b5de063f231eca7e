use anyhow::{Context, Result};
use tracing::debug;

use crate::client::{name_server_addresses, Message, MqBackend, MqProducer, ProducerSettings, SendResult};
use crate::config::MqConfig;
use crate::resolver::{HostLookup, SystemLookup};

/// Started producer; sends synchronously through the wrapped client.
pub struct Producer<P: MqProducer> {
    instance: P,
}

impl<P: MqProducer> Producer<P> {
    pub async fn new<B>(config: &MqConfig, backend: &B) -> Result<Self>
    where
        B: MqBackend<Producer = P>,
    {
        Self::with_lookup(config, backend, &SystemLookup).await
    }

    pub async fn with_lookup<B, L>(config: &MqConfig, backend: &B, lookup: &L) -> Result<Self>
    where
        B: MqBackend<Producer = P>,
        L: HostLookup,
    {
        let options = config
            .producer
            .as_ref()
            .context("producer options missing from config")?;
        let name_servers = name_server_addresses(lookup, config).await?;

        let settings = ProducerSettings {
            name_servers,
            group_name: config.group_name.clone(),
            retry_times: options.retry_times,
            send_msg_timeout: options.send_msg_timeout(),
        };
        let instance = backend.new_producer(settings).context("create producer")?;
        instance.start().context("start producer")?;
        Ok(Self { instance })
    }

    pub async fn send_message(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<SendResult> {
        self.send(Message::new(topic, payload)).await
    }

    pub async fn send(&self, message: Message) -> Result<SendResult> {
        debug!(topic = %message.topic, size = message.body.len(), "send message to topic");
        let topic = message.topic.clone();
        let result = self
            .instance
            .send_sync(message)
            .await
            .with_context(|| format!("send message to {}", topic))?;
        debug!(msg_id = %result.msg_id, status = ?result.status, "message sent");
        Ok(result)
    }

    pub fn close(&self) -> Result<()> {
        self.instance.shutdown().context("shutdown producer")
    }

    /// The wrapped client producer.
    pub fn inner(&self) -> &P {
        &self.instance
    }
}
