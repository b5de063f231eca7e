//! In-process backend: producers and push consumers created from the same
//! `LoopbackBackend` (or its clones) exchange messages without a broker.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use super::{
    ConsumeResult, ConsumerSettings, Message, MessageExt, MessageListener, MessageSelector,
    MqBackend, MqProducer, ProducerSettings, PushConsumer, SendResult, SendStatus,
};
use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Closed,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn dead_letter_topic(group: &str) -> String {
    format!("%DLQ%{}", group)
}

/// Messages held per topic (no group yet) or per group (no live member).
pub const DEFAULT_BACKLOG_LIMIT: usize = 10_000;

/// Appends to a bounded queue, dropping the oldest entry when full.
fn push_bounded(queue: &mut VecDeque<MessageExt>, message: MessageExt, limit: usize) {
    if queue.len() >= limit {
        if let Some(dropped) = queue.pop_front() {
            warn!(topic = %dropped.topic, msg_id = %dropped.msg_id, limit, "backlog full, oldest message dropped");
        }
    }
    queue.push_back(message);
}

struct Member {
    id: u64,
    tx: mpsc::UnboundedSender<MessageExt>,
}

struct GroupRoute {
    group: String,
    members: Vec<Member>,
    cursor: usize,
    parked: VecDeque<MessageExt>,
}

impl GroupRoute {
    /// Round robin over the group's members. With no live member the
    /// message waits for the next one to join.
    fn dispatch(&mut self, mut message: MessageExt, limit: usize) {
        for _ in 0..self.members.len() {
            let idx = self.cursor % self.members.len();
            self.cursor = self.cursor.wrapping_add(1);
            match self.members[idx].tx.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => message = returned,
            }
        }
        trace!(group = %self.group, msg_id = %message.msg_id, "no live member, message parked");
        push_bounded(&mut self.parked, message, limit);
    }

    fn flush_parked(&mut self, limit: usize) {
        for message in std::mem::take(&mut self.parked) {
            self.dispatch(message, limit);
        }
    }
}

#[derive(Default)]
struct TopicRoute {
    groups: Vec<GroupRoute>,
    backlog: VecDeque<MessageExt>,
}

impl TopicRoute {
    fn prune(&mut self) {
        for group in &mut self.groups {
            group.members.retain(|m| !m.tx.is_closed());
        }
    }

    fn dispatch(&mut self, message: MessageExt, limit: usize) {
        for group in &mut self.groups {
            group.dispatch(message.clone(), limit);
        }
    }
}

struct Router {
    topics: Mutex<HashMap<String, TopicRoute>>,
    next_id: AtomicU64,
    next_member: AtomicU64,
    backlog_limit: usize,
}

impl Router {
    fn new(backlog_limit: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            next_member: AtomicU64::new(0),
            backlog_limit: backlog_limit.max(1),
        }
    }

    fn next_msg_id(&self, born_ms: u64) -> String {
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{:016X}{:016X}", born_ms, seq)
    }

    fn publish(&self, message: MessageExt) {
        let mut topics = lock(&self.topics);
        let route = topics.entry(message.topic.clone()).or_default();
        route.prune();
        if route.groups.is_empty() {
            trace!(topic = %message.topic, "no subscriber yet, message kept in backlog");
            push_bounded(&mut route.backlog, message, self.backlog_limit);
        } else {
            route.dispatch(message, self.backlog_limit);
        }
    }

    /// Hands a message back to the remaining members of `group` only.
    fn redeliver(&self, group: &str, message: MessageExt) {
        let mut topics = lock(&self.topics);
        let route = topics.entry(message.topic.clone()).or_default();
        route.prune();
        match route.groups.iter_mut().find(|g| g.group == group) {
            Some(existing) => existing.dispatch(message, self.backlog_limit),
            None => push_bounded(&mut route.backlog, message, self.backlog_limit),
        }
    }

    fn publish_message(&self, message: Message) -> SendResult {
        let born_timestamp_ms = now_ms();
        let msg_id = self.next_msg_id(born_timestamp_ms);
        self.publish(MessageExt {
            msg_id: msg_id.clone(),
            topic: message.topic,
            tags: message.tags,
            keys: message.keys,
            body: message.body,
            born_timestamp_ms,
            reconsume_times: 0,
        });
        SendResult {
            msg_id,
            status: SendStatus::SendOk,
        }
    }

    fn subscribe(&self, topic: &str, group: &str, tx: mpsc::UnboundedSender<MessageExt>) -> u64 {
        let id = self.next_member.fetch_add(1, Ordering::Relaxed);
        let limit = self.backlog_limit;
        let mut topics = lock(&self.topics);
        let route = topics.entry(topic.to_string()).or_default();
        route.prune();
        match route.groups.iter_mut().find(|g| g.group == group) {
            Some(existing) => {
                existing.members.push(Member { id, tx });
                existing.flush_parked(limit);
            }
            None => route.groups.push(GroupRoute {
                group: group.to_string(),
                members: vec![Member { id, tx }],
                cursor: 0,
                parked: VecDeque::new(),
            }),
        }
        for message in std::mem::take(&mut route.backlog) {
            route.dispatch(message, limit);
        }
        id
    }

    fn unsubscribe(&self, topic: &str, group: &str, id: u64) {
        let mut topics = lock(&self.topics);
        if let Some(route) = topics.get_mut(topic) {
            for g in route.groups.iter_mut().filter(|g| g.group == group) {
                g.members.retain(|m| m.id != id);
            }
        }
    }

    fn pending(&self, topic: &str) -> usize {
        lock(&self.topics).get(topic).map_or(0, |route| {
            route.backlog.len() + route.groups.iter().map(|g| g.parked.len()).sum::<usize>()
        })
    }
}

#[derive(Clone)]
pub struct LoopbackBackend {
    router: Arc<Router>,
}

impl Default for LoopbackBackend {
    fn default() -> Self {
        Self::with_backlog_limit(DEFAULT_BACKLOG_LIMIT)
    }
}

impl LoopbackBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps every per-topic backlog and per-group parking queue at `limit`
    /// messages; the oldest message is dropped first.
    pub fn with_backlog_limit(limit: usize) -> Self {
        Self {
            router: Arc::new(Router::new(limit)),
        }
    }

    /// Messages sent to `topic` that no consumer has received yet, either
    /// because nobody subscribed or because a group has no live member.
    pub fn pending(&self, topic: &str) -> usize {
        self.router.pending(topic)
    }
}

fn check_common(name_servers: &[String], group_name: &str) -> Result<(), ClientError> {
    if name_servers.is_empty() {
        return Err(ClientError::InvalidOption("empty name server list".to_string()));
    }
    if group_name.is_empty() {
        return Err(ClientError::InvalidOption("empty group name".to_string()));
    }
    Ok(())
}

impl MqBackend for LoopbackBackend {
    type Producer = LoopbackProducer;
    type Consumer = LoopbackConsumer;

    fn new_producer(&self, settings: ProducerSettings) -> Result<LoopbackProducer, ClientError> {
        check_common(&settings.name_servers, &settings.group_name)?;
        if settings.retry_times == 0 {
            return Err(ClientError::InvalidOption("retry times must be positive".to_string()));
        }
        if settings.send_msg_timeout.is_zero() {
            return Err(ClientError::InvalidOption("send timeout must be positive".to_string()));
        }
        let (state, _) = watch::channel(Lifecycle::Created);
        Ok(LoopbackProducer {
            settings,
            router: self.router.clone(),
            state,
        })
    }

    /// Captures the current tokio runtime; delivery tasks are spawned on it.
    fn new_push_consumer(&self, settings: ConsumerSettings) -> Result<LoopbackConsumer, ClientError> {
        check_common(&settings.name_servers, &settings.group_name)?;
        let runtime = Handle::try_current().map_err(|_| ClientError::NoRuntime)?;
        let (state, _) = watch::channel(Lifecycle::Created);
        Ok(LoopbackConsumer {
            settings,
            router: self.router.clone(),
            state,
            subscriptions: Mutex::new(Vec::new()),
            runtime,
        })
    }
}

fn start_lifecycle(state: &watch::Sender<Lifecycle>, role: &'static str) -> Result<(), ClientError> {
    let mut closed = false;
    state.send_if_modified(|current| match *current {
        Lifecycle::Created => {
            *current = Lifecycle::Running;
            true
        }
        Lifecycle::Running => false,
        Lifecycle::Closed => {
            closed = true;
            false
        }
    });
    if closed {
        return Err(ClientError::ShutDown(role));
    }
    Ok(())
}

pub struct LoopbackProducer {
    settings: ProducerSettings,
    router: Arc<Router>,
    state: watch::Sender<Lifecycle>,
}

impl LoopbackProducer {
    pub fn settings(&self) -> &ProducerSettings {
        &self.settings
    }
}

impl MqProducer for LoopbackProducer {
    fn start(&self) -> Result<(), ClientError> {
        start_lifecycle(&self.state, "producer")?;
        debug!(group = %self.settings.group_name, name_servers = ?self.settings.name_servers, "loopback producer started");
        Ok(())
    }

    async fn send_sync(&self, message: Message) -> Result<SendResult, ClientError> {
        let current = *self.state.borrow();
        match current {
            Lifecycle::Running => {}
            Lifecycle::Created => return Err(ClientError::NotRunning("producer")),
            Lifecycle::Closed => return Err(ClientError::ShutDown("producer")),
        }

        let topic = message.topic.clone();
        let send_timeout = self.settings.send_msg_timeout;
        let router = self.router.clone();
        timeout(send_timeout, async move { router.publish_message(message) })
            .await
            .map_err(|_| ClientError::SendTimeout {
                topic,
                timeout: send_timeout,
            })
    }

    fn shutdown(&self) -> Result<(), ClientError> {
        self.state.send_replace(Lifecycle::Closed);
        Ok(())
    }
}

pub struct LoopbackConsumer {
    settings: ConsumerSettings,
    router: Arc<Router>,
    state: watch::Sender<Lifecycle>,
    /// (topic, member id) per subscription.
    subscriptions: Mutex<Vec<(String, u64)>>,
    runtime: Handle,
}

impl LoopbackConsumer {
    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }
}

impl PushConsumer for LoopbackConsumer {
    fn start(&self) -> Result<(), ClientError> {
        start_lifecycle(&self.state, "push consumer")?;
        debug!(group = %self.settings.group_name, "loopback push consumer started");
        Ok(())
    }

    fn subscribe(
        &self,
        topic: &str,
        selector: MessageSelector,
        listener: MessageListener,
    ) -> Result<(), ClientError> {
        if *self.state.borrow() == Lifecycle::Closed {
            return Err(ClientError::ShutDown("push consumer"));
        }
        let mut subscriptions = lock(&self.subscriptions);
        if subscriptions.iter().any(|(t, _)| t == topic) {
            return Err(ClientError::AlreadySubscribed(topic.to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.router.subscribe(topic, &self.settings.group_name, tx.clone());
        subscriptions.push((topic.to_string(), id));

        let handler = Handler {
            group: self.settings.group_name.clone(),
            max_reconsume_times: self.settings.max_reconsume_times,
            selector,
            listener,
            retry_tx: tx,
            router: self.router.clone(),
        };
        self.runtime.spawn(deliver(rx, self.state.subscribe(), handler));
        Ok(())
    }

    fn shutdown(&self) -> Result<(), ClientError> {
        // Leave the routes before closing so queued messages drained by the
        // delivery tasks only go to the remaining members.
        for (topic, id) in lock(&self.subscriptions).iter() {
            self.router.unsubscribe(topic, &self.settings.group_name, *id);
        }
        self.state.send_replace(Lifecycle::Closed);
        Ok(())
    }
}

struct Handler {
    group: String,
    max_reconsume_times: u32,
    selector: MessageSelector,
    listener: MessageListener,
    retry_tx: mpsc::UnboundedSender<MessageExt>,
    router: Arc<Router>,
}

impl Handler {
    fn handle(&self, mut message: MessageExt) {
        if !self.selector.matches(message.tags.as_deref()) {
            trace!(msg_id = %message.msg_id, "tag not selected, skipped");
            return;
        }
        match (self.listener)(std::slice::from_ref(&message)) {
            ConsumeResult::Success => {}
            ConsumeResult::RetryLater if message.reconsume_times < self.max_reconsume_times => {
                message.reconsume_times += 1;
                debug!(msg_id = %message.msg_id, reconsume_times = message.reconsume_times, "redelivering");
                if let Err(mpsc::error::SendError(returned)) = self.retry_tx.send(message) {
                    warn!(msg_id = %returned.msg_id, group = %self.group, "retry queue closed, handing message back to the group");
                    self.router.redeliver(&self.group, returned);
                }
            }
            ConsumeResult::RetryLater => {
                let dlq = dead_letter_topic(&self.group);
                warn!(msg_id = %message.msg_id, dlq = %dlq, "reconsume budget exhausted");
                message.topic = dlq;
                self.router.publish(message);
            }
        }
    }
}

async fn deliver(
    mut rx: mpsc::UnboundedReceiver<MessageExt>,
    mut state: watch::Receiver<Lifecycle>,
    handler: Handler,
) {
    if state.wait_for(|s| *s != Lifecycle::Created).await.is_ok() {
        loop {
            if *state.borrow_and_update() == Lifecycle::Closed {
                break;
            }
            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                received = rx.recv() => match received {
                    Some(message) => handler.handle(message),
                    None => break,
                },
            }
        }
    }

    rx.close();
    let mut handed_back = 0usize;
    while let Ok(message) = rx.try_recv() {
        handler.router.redeliver(&handler.group, message);
        handed_back += 1;
    }
    debug!(group = %handler.group, handed_back, "delivery stopped");
}
