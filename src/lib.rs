//! Convenience layer over a RocketMQ-style client: a name server resolver
//! and simplified producer/consumer constructors.

pub mod client;
pub mod config;
pub mod consumer;
pub mod error;
pub mod producer;
pub mod resolver;
pub mod scheduler;

pub use client::loopback::LoopbackBackend;
pub use client::{ConsumeResult, Message, MessageExt, MessageSelector, SendResult};
pub use config::{ConsumerOptions, MqConfig, ProducerOptions};
pub use consumer::ConsumerClient;
pub use error::{ClientError, ResolveError};
pub use producer::Producer;
pub use resolver::{resolve_name_server, resolve_name_server_with, HostLookup, ServerAddress, SystemLookup, TrustDnsLookup};
