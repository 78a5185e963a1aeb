//! Topic subscriptions, channels and their claim on pooled transports.
//!
//! One channel exists per topic while it has subscribers; each channel holds exactly one reference
//! on the transport for its endpoint URL. The registry is the only code that opens or releases
//! those references.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use fleet_types::ClientFrame;
use fleet_types::ConnectionState;
use fleet_types::EntitySnapshot;
use fleet_types::Topic;
use fleet_ws::Frame;
use fleet_ws::Transport;
use fleet_ws::TransportHandle;
use fleet_ws::TransportPool;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use rapidhash::RapidHashMap;

use crate::errors::Result;
use crate::errors::SyncError;
use crate::reconciler::TopicSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Fetches the REST snapshot of a channel; run again to repair the channel after a reconnect
pub type SnapshotFetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<EntitySnapshot>>> + Send + Sync>;

/// Receives reconciled state for one topic.
///
/// Callbacks run on the transport's delivery task and must not block.
pub trait Subscriber: Send + Sync + 'static {
    fn on_update(&self, snapshot: &TopicSnapshot);

    fn on_connection_state(&self, _state: ConnectionState) {}

    fn on_error(&self, _error: &Arc<SyncError>) {}
}

impl<F> Subscriber for F
where
    F: Fn(&TopicSnapshot) + Send + Sync + 'static,
{
    fn on_update(&self, snapshot: &TopicSnapshot) {
        self(snapshot)
    }
}

#[derive(Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub topic: Topic,
    live: Arc<AtomicBool>,
    subscriber: Arc<dyn Subscriber>,
}

impl Subscription {
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn deliver(&self, snapshot: &TopicSnapshot) {
        if self.is_live() {
            self.subscriber.on_update(snapshot);
        }
    }

    fn deliver_state(&self, state: ConnectionState) {
        if self.is_live() {
            self.subscriber.on_connection_state(state);
        }
    }

    fn deliver_error(&self, error: &Arc<SyncError>) {
        if self.is_live() {
            self.subscriber.on_error(error);
        }
    }
}

struct Channel {
    url: String,
    handle: TransportHandle,
    subscribers: Vec<Subscription>,
    fetcher: Option<SnapshotFetcher>,
    generation: u64,
}

/// Outcome of a subscribe call
pub struct Attached {
    pub id: SubscriptionId,
    pub url: String,
    pub transport: Transport,
    /// First subscriber of the topic
    pub new_channel: bool,
    pub generation: u64,
    /// This call's fetcher became the channel's snapshot fetcher
    pub fetcher_adopted: bool,
    /// The endpoint's transport was created by this call and still has to be driven
    pub new_transport: bool,
}

/// Outcome of an unsubscribe call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detached {
    pub topic: Topic,
    pub url: String,
    /// Last subscriber of the topic left
    pub channel_closed: bool,
    /// Last channel on the endpoint left and the transport was closed
    pub transport_closed: bool,
}

/// Channel due for a snapshot repair
pub struct RepairTarget {
    pub topic: Topic,
    pub generation: u64,
    pub fetcher: SnapshotFetcher,
}

#[derive(Default)]
struct RegistryInner {
    channels: RapidHashMap<Topic, Channel>,
    subscriptions: RapidHashMap<SubscriptionId, Topic>,
    closed: bool,
}

pub struct Registry {
    pool: TransportPool,
    ws_base_url: String,
    handshake_frames: bool,
    inner: Mutex<RegistryInner>,
    next_id: AtomicU64,
    next_generation: AtomicU64,
}

impl Registry {
    pub fn new(pool: TransportPool, ws_base_url: impl Into<String>, handshake_frames: bool) -> Self {
        Self {
            pool,
            ws_base_url: ws_base_url.into().trim_end_matches('/').to_string(),
            handshake_frames,
            inner: Mutex::new(RegistryInner::default()),
            next_id: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn pool(&self) -> &TransportPool {
        &self.pool
    }

    pub fn handshake_frames(&self) -> bool {
        self.handshake_frames
    }

    /// WebSocket URL serving a topic
    pub fn endpoint_url(&self, topic: &Topic) -> Result<String> {
        let kind = topic.kind()?;
        Ok(format!("{}{}", self.ws_base_url, kind.ws_path()))
    }

    /// Register interest in a topic. The first subscriber creates the channel and claims the endpoint's transport.
    pub fn subscribe(&self, topic: &Topic, subscriber: Arc<dyn Subscriber>, fetcher: Option<SnapshotFetcher>) -> Result<Attached> {
        let url = self.endpoint_url(topic)?;
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let subscription = Subscription { id, topic: topic.clone(), live: Arc::new(AtomicBool::new(true)), subscriber };

        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(SyncError::Closed);
        }

        let attached = match inner.channels.get_mut(topic) {
            Some(channel) => {
                channel.subscribers.push(subscription);
                let fetcher_adopted = channel.fetcher.is_none() && fetcher.is_some();
                if fetcher_adopted {
                    channel.fetcher = fetcher;
                }
                Attached {
                    id,
                    url,
                    transport: channel.handle.transport().clone(),
                    new_channel: false,
                    generation: channel.generation,
                    fetcher_adopted,
                    new_transport: false,
                }
            }
            None => {
                let opened = self.pool.open(&url);
                let transport = opened.handle.transport().clone();
                if self.handshake_frames && transport.state().is_open() {
                    send_control(&transport, ClientFrame::Subscribe { topic: topic.clone() });
                }

                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let fetcher_adopted = fetcher.is_some();
                let channel = Channel { url: url.clone(), handle: opened.handle, subscribers: vec![subscription], fetcher, generation };
                inner.channels.insert(topic.clone(), channel);
                tracing::info!("Channel {topic} attached to {url}");
                Attached { id, url, transport, new_channel: true, generation, fetcher_adopted, new_transport: opened.created }
            }
        };

        inner.subscriptions.insert(id, topic.clone());
        Ok(attached)
    }

    /// Drop a subscription. The last subscriber destroys the channel and releases its transport reference.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<Detached> {
        let mut inner = self.inner.lock();
        let topic = inner.subscriptions.remove(&id).ok_or(SyncError::UnknownSubscription(id))?;
        let Some(channel) = inner.channels.get_mut(&topic) else {
            return Err(SyncError::UnknownSubscription(id));
        };

        if let Some(position) = channel.subscribers.iter().position(|subscription| subscription.id == id) {
            let subscription = channel.subscribers.remove(position);
            subscription.live.store(false, Ordering::Release);
        }

        let url = channel.url.clone();
        if !channel.subscribers.is_empty() {
            return Ok(Detached { topic, url, channel_closed: false, transport_closed: false });
        }

        let Some(channel) = inner.channels.remove(&topic) else {
            return Ok(Detached { topic, url, channel_closed: false, transport_closed: false });
        };
        drop(inner);

        let transport = channel.handle.transport();
        if self.handshake_frames && transport.state().is_open() {
            send_control(transport, ClientFrame::Unsubscribe { topic: topic.clone() });
        }

        // Closing fires state listeners, which take the registry lock
        let transport_closed = self.pool.close(channel.handle);
        tracing::info!("Channel {topic} detached from {url} (transport closed: {transport_closed})");
        Ok(Detached { topic, url, channel_closed: true, transport_closed })
    }

    pub fn has_channel(&self, topic: &Topic) -> bool {
        self.inner.lock().channels.contains_key(topic)
    }

    pub fn channel_generation(&self, topic: &Topic) -> Option<u64> {
        self.inner.lock().channels.get(topic).map(|channel| channel.generation)
    }

    pub fn channel_count(&self) -> usize {
        self.inner.lock().channels.len()
    }

    pub fn subscription_count(&self, topic: &Topic) -> usize {
        self.inner.lock().channels.get(topic).map(|channel| channel.subscribers.len()).unwrap_or(0)
    }

    /// Topics whose channel lives on the endpoint, sorted
    pub fn topics_for(&self, url: &str) -> Vec<Topic> {
        let inner = self.inner.lock();
        let mut topics: Vec<Topic> = inner.channels.iter().filter(|(_, channel)| channel.url == url).map(|(topic, _)| topic.clone()).collect();
        topics.sort();
        topics
    }

    pub fn subscribers(&self, topic: &Topic) -> Vec<Subscription> {
        self.inner.lock().channels.get(topic).map(|channel| channel.subscribers.clone()).unwrap_or_default()
    }

    pub fn repair_targets(&self, url: &str) -> Vec<RepairTarget> {
        let inner = self.inner.lock();
        let mut targets: Vec<RepairTarget> = inner
            .channels
            .iter()
            .filter(|(_, channel)| channel.url == url)
            .filter_map(|(topic, channel)| {
                channel.fetcher.clone().map(|fetcher| RepairTarget { topic: topic.clone(), generation: channel.generation, fetcher })
            })
            .collect();
        targets.sort_by(|a, b| a.topic.cmp(&b.topic));
        targets
    }

    /// Hand reconciled state to every live subscriber of the topic. Returns the number reached.
    pub fn fan_out(&self, snapshot: &TopicSnapshot) -> usize {
        let subscribers = self.subscribers(&snapshot.topic);
        let mut reached = 0;
        for subscription in &subscribers {
            if subscription.is_live() {
                subscription.deliver(snapshot);
                reached += 1;
            }
        }
        reached
    }

    pub fn notify_connection(&self, url: &str, state: ConnectionState) {
        let subscribers: Vec<Subscription> = {
            let inner = self.inner.lock();
            inner.channels.values().filter(|channel| channel.url == url).flat_map(|channel| channel.subscribers.iter().cloned()).collect()
        };
        for subscription in &subscribers {
            subscription.deliver_state(state);
        }
    }

    pub fn notify_error(&self, topic: &Topic, error: &Arc<SyncError>) {
        for subscription in &self.subscribers(topic) {
            subscription.deliver_error(error);
        }
    }

    /// Destroy every channel and close all transports. Later subscribe calls fail.
    pub fn teardown(&self) -> usize {
        let channels: Vec<Channel> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.subscriptions.clear();
            inner.channels.drain().map(|(_, channel)| channel).collect()
        };

        let mut subscribers = Vec::new();
        for channel in channels {
            subscribers.extend(channel.subscribers);
            self.pool.close(channel.handle);
        }
        self.pool.close_all();

        for subscription in &subscribers {
            subscription.deliver_state(ConnectionState::Closed);
            subscription.live.store(false, Ordering::Release);
        }
        subscribers.len()
    }
}

fn send_control(transport: &Transport, frame: ClientFrame) {
    match frame.to_text() {
        Ok(text) => {
            if let Err(err) = transport.try_send(Frame::Text(text)) {
                tracing::debug!("Control frame not sent on {}: {err}", transport.url());
            }
        }
        Err(err) => tracing::warn!("Failed to encode control frame: {err}"),
    }
}

/// Send a `subscribe` control frame for each topic, after the endpoint (re)opened
pub(crate) fn send_handshakes(transport: &Transport, topics: &[Topic]) {
    for topic in topics {
        send_control(transport, ClientFrame::Subscribe { topic: topic.clone() });
    }
}
