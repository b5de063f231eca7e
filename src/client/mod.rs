//! Seam over the message-queue client library.
//!
//! The wrappers in `producer` and `consumer` only talk to these traits.
//! `loopback` is an in-process implementation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::MqConfig;
use crate::error::ClientError;
use crate::resolver::{resolve_name_server_with, HostLookup};

pub mod loopback;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub tags: Option<String>,
    pub keys: Option<String>,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(topic: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            tags: None,
            keys: None,
            body: body.into(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags = Some(tag.into());
        self
    }

    pub fn with_keys(mut self, keys: impl Into<String>) -> Self {
        self.keys = Some(keys.into());
        self
    }
}

/// A message as handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageExt {
    pub msg_id: String,
    pub topic: String,
    pub tags: Option<String>,
    pub keys: Option<String>,
    pub body: Vec<u8>,
    pub born_timestamp_ms: u64,
    pub reconsume_times: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendStatus {
    SendOk,
    FlushDiskTimeout,
    FlushSlaveTimeout,
    SlaveNotAvailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub msg_id: String,
    pub status: SendStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeResult {
    Success,
    RetryLater,
}

/// Tag filter for a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MessageSelector {
    #[default]
    All,
    Tags(Vec<String>),
}

impl MessageSelector {
    /// Parses a tag expression such as `"tagA || tagB"`. `*` or an empty
    /// expression selects everything.
    pub fn tags(expression: &str) -> Self {
        let tags: Vec<String> = expression
            .split("||")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        if tags.is_empty() || tags.iter().any(|t| t == "*") {
            MessageSelector::All
        } else {
            MessageSelector::Tags(tags)
        }
    }

    pub fn matches(&self, tag: Option<&str>) -> bool {
        match self {
            MessageSelector::All => true,
            MessageSelector::Tags(tags) => tag.is_some_and(|t| tags.iter().any(|want| want == t)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerSettings {
    pub name_servers: Vec<String>,
    pub group_name: String,
    pub retry_times: u32,
    pub send_msg_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub name_servers: Vec<String>,
    pub group_name: String,
    pub max_reconsume_times: u32,
}

pub type MessageListener = Arc<dyn Fn(&[MessageExt]) -> ConsumeResult + Send + Sync>;

pub trait MqProducer: Send + Sync + 'static {
    fn start(&self) -> Result<(), ClientError>;

    fn send_sync(&self, message: Message) -> impl Future<Output = Result<SendResult, ClientError>> + Send;

    fn shutdown(&self) -> Result<(), ClientError>;
}

pub trait PushConsumer: Send + Sync + 'static {
    fn start(&self) -> Result<(), ClientError>;

    /// Registers `listener` for `topic`. Delivery runs on tasks owned by the
    /// backend, so this may be called from any thread.
    fn subscribe(
        &self,
        topic: &str,
        selector: MessageSelector,
        listener: MessageListener,
    ) -> Result<(), ClientError>;

    fn shutdown(&self) -> Result<(), ClientError>;
}

/// Factory for producers and push consumers of one client library.
pub trait MqBackend: Send + Sync {
    type Producer: MqProducer;
    type Consumer: PushConsumer;

    fn new_producer(&self, settings: ProducerSettings) -> Result<Self::Producer, ClientError>;

    /// Backends that deliver on tokio tasks bind to the caller's runtime here.
    fn new_push_consumer(&self, settings: ConsumerSettings) -> Result<Self::Consumer, ClientError>;
}

/// Resolves the configured name server and refuses an empty address list.
pub(crate) async fn name_server_addresses<L: HostLookup>(
    lookup: &L,
    config: &MqConfig,
) -> anyhow::Result<Vec<String>> {
    debug!(name_server = %config.name_server, "resolve name server address");
    let addresses = resolve_name_server_with(lookup, &config.name_server).await?;
    debug!(addresses = ?addresses, "name server resolved");

    if addresses.is_empty() {
        return Err(ClientError::NoNameServer(config.name_server.clone()).into());
    }
    Ok(addresses)
}
