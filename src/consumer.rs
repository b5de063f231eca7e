use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, error};

use crate::client::{
    name_server_addresses, ConsumeResult, ConsumerSettings, MessageExt, MessageListener,
    MessageSelector, MqBackend, PushConsumer,
};
use crate::config::MqConfig;
use crate::resolver::{HostLookup, SystemLookup};

/// Push consumer bound to one group. Messages are handed to a per-message
/// callback once `start_consume` has run.
pub struct ConsumerClient<C: PushConsumer> {
    instance: C,
}

impl<C: PushConsumer> ConsumerClient<C> {
    pub async fn new<B>(config: &MqConfig, backend: &B) -> Result<Self>
    where
        B: MqBackend<Consumer = C>,
    {
        Self::with_lookup(config, backend, &SystemLookup).await
    }

    pub async fn with_lookup<B, L>(config: &MqConfig, backend: &B, lookup: &L) -> Result<Self>
    where
        B: MqBackend<Consumer = C>,
        L: HostLookup,
    {
        let name_servers = name_server_addresses(lookup, config).await?;
        let settings = ConsumerSettings {
            name_servers,
            group_name: config.group_name.clone(),
            max_reconsume_times: config.consumer.max_reconsume_times,
        };
        let instance = backend
            .new_push_consumer(settings)
            .context("create push consumer")?;
        Ok(Self { instance })
    }

    /// Starts the consumer and subscribes to every message of `topic`.
    /// Callable outside async code; delivery runs on the runtime the client
    /// was constructed in.
    pub fn start_consume<F>(&self, topic: &str, consume_fn: F) -> Result<()>
    where
        F: Fn(&MessageExt) -> Result<ConsumeResult> + Send + Sync + 'static,
    {
        self.start_consume_with(topic, MessageSelector::All, consume_fn)
    }

    pub fn start_consume_with<F>(&self, topic: &str, selector: MessageSelector, consume_fn: F) -> Result<()>
    where
        F: Fn(&MessageExt) -> Result<ConsumeResult> + Send + Sync + 'static,
    {
        self.instance.start().context("start push consumer")?;
        debug!(topic, "consumer started, waiting for messages");

        self.instance
            .subscribe(topic, selector, batch_listener(consume_fn))
            .with_context(|| format!("subscribe to {}", topic))
    }

    pub fn close(&self) -> Result<()> {
        self.instance.shutdown().context("shutdown push consumer")
    }

    pub fn inner(&self) -> &C {
        &self.instance
    }
}

/// Runs `consume_fn` over a batch, stopping at the first message that is not
/// consumed.
fn batch_listener<F>(consume_fn: F) -> MessageListener
where
    F: Fn(&MessageExt) -> Result<ConsumeResult> + Send + Sync + 'static,
{
    Arc::new(move |messages: &[MessageExt]| {
        for message in messages {
            debug!(msg_id = %message.msg_id, "consume message");
            match consume_fn(message) {
                Ok(ConsumeResult::Success) => {}
                Ok(ConsumeResult::RetryLater) => return ConsumeResult::RetryLater,
                Err(e) => {
                    error!(msg_id = %message.msg_id, "consume failed: {:#}", e);
                    return ConsumeResult::RetryLater;
                }
            }
        }
        ConsumeResult::Success
    })
}
