//! Consumer-facing entry point: [`SyncClient`] wires transports, routing, reconciliation and
//! reconnection together and hands out [`ChannelHandle`]s, live views of one topic.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use fleet_http::FleetApi;
use fleet_types::ConnectionState;
use fleet_types::Entity;
use fleet_types::EntitySnapshot;
use fleet_types::Topic;
use fleet_ws::Dialer;
use fleet_ws::Transport;
use fleet_ws::TransportPool;
use fleet_ws::TungsteniteDialer;
use futures::future::BoxFuture;
use futures::future::FutureExt;
use futures::future::Shared;
use parking_lot::Mutex;
use rapidhash::RapidHashMap;
use tokio::sync::broadcast;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::alerts::SyncEvent;
use crate::config::SyncConfig;
use crate::errors::Result;
use crate::errors::SyncError;
use crate::notifications::NotificationSink;
use crate::reconciler::Reconciler;
use crate::reconciler::TopicSnapshot;
use crate::reconnect::ControllerHooks;
use crate::reconnect::ReconnectController;
use crate::registry::Attached;
use crate::registry::Registry;
use crate::registry::SnapshotFetcher;
use crate::registry::Subscriber;
use crate::registry::SubscriptionId;
use crate::registry::send_handshakes;
use crate::router::Router;

struct ClientInner {
    config: SyncConfig,
    registry: Arc<Registry>,
    reconciler: Arc<Mutex<Reconciler>>,
    router: Arc<Router>,
    api: Option<Arc<FleetApi>>,
    events: broadcast::Sender<SyncEvent>,
    controllers: Mutex<RapidHashMap<String, JoinHandle<()>>>,
    // Initial fetches in flight for topics whose channel is not up yet
    loads: Mutex<RapidHashMap<Topic, PendingLoad>>,
    next_load: AtomicU64,
    closed: AtomicBool,
}

type SharedLoad = Shared<BoxFuture<'static, std::result::Result<Vec<EntitySnapshot>, Arc<SyncError>>>>;

struct PendingLoad {
    id: u64,
    load: SharedLoad,
}

/// How a new view gets its initial state
enum Join {
    /// The channel is live and its reconciled state is current
    Existing,
    /// Wait for the topic's single in-flight fetch
    Load(LoadTicket, SharedLoad),
}

impl ClientInner {
    fn emit(&self, event: SyncEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn join(self: &Arc<Self>, topic: &Topic, fetcher: &SnapshotFetcher) -> Join {
        let mut loads = self.loads.lock();
        if let Some(pending) = loads.get(topic) {
            let ticket = LoadTicket { client: Arc::clone(self), topic: topic.clone(), id: pending.id };
            return Join::Load(ticket, pending.load.clone());
        }
        if self.registry.has_channel(topic) {
            return Join::Existing;
        }

        let id = self.next_load.fetch_add(1, Ordering::Relaxed);
        let load = fetcher().map(|result| result.map_err(Arc::new)).boxed().shared();
        loads.insert(topic.clone(), PendingLoad { id, load: load.clone() });
        Join::Load(LoadTicket { client: Arc::clone(self), topic: topic.clone(), id }, load)
    }
}

/// A view's share of a pending load. The load is forgotten once any sharer has attached,
/// or when a sharer is dropped before getting there.
struct LoadTicket {
    client: Arc<ClientInner>,
    topic: Topic,
    id: u64,
}

impl LoadTicket {
    /// Returns true for the first sharer to settle
    fn settle(&self) -> bool {
        let mut loads = self.client.loads.lock();
        if loads.get(&self.topic).is_some_and(|pending| pending.id == self.id) {
            loads.remove(&self.topic);
            return true;
        }
        false
    }
}

impl Drop for LoadTicket {
    fn drop(&mut self) {
        self.settle();
    }
}

/// Real-time sync client. Cheap to clone; all clones share one set of connections.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<ClientInner>,
}

impl SyncClient {
    pub fn builder() -> SyncClientBuilder {
        SyncClientBuilder::default()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.inner.router
    }

    pub fn reconciler(&self) -> &Arc<Mutex<Reconciler>> {
        &self.inner.reconciler
    }

    /// Alerts raised by the client: auth rejections, persistent connection loss, failed snapshots
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Reconciled state of a topic, sorted by entity id
    pub fn state(&self, topic: &Topic) -> TopicSnapshot {
        self.inner.reconciler.lock().snapshot(topic)
    }

    /// Subscribe to pushed updates only
    pub fn subscribe(&self, topic: &Topic, subscriber: Arc<dyn Subscriber>) -> Result<SubscriptionId> {
        self.attach(topic, subscriber, None).map(|attached| attached.id)
    }

    /// Subscribe with a snapshot fetcher, rerun to repair the channel after every reconnect
    pub fn subscribe_with_snapshot(&self, topic: &Topic, subscriber: Arc<dyn Subscriber>, fetcher: SnapshotFetcher) -> Result<SubscriptionId> {
        self.attach(topic, subscriber, Some(fetcher)).map(|attached| attached.id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        release(&self.inner, id)
    }

    /// Live view of a topic. `fetch` loads the REST snapshot before the subscription starts and
    /// again whenever the endpoint recovers from a lost connection.
    ///
    /// Views of one topic share a channel: only the first fetches, views opened meanwhile wait
    /// for that fetch, and views joining a live channel start from its reconciled state.
    ///
    /// Must be called within a tokio runtime.
    pub fn use_channel<T, F, Fut, E>(&self, topic: Topic, fetch: F) -> Result<ChannelHandle<T>>
    where
        T: Entity,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Vec<T>, E>> + Send + 'static,
        E: Into<SyncError> + 'static,
    {
        if self.is_closed() {
            return Err(SyncError::Closed);
        }
        self.inner.registry.endpoint_url(&topic)?;

        let fetch = Arc::new(fetch);
        let fetcher: SnapshotFetcher = Arc::new(move || -> BoxFuture<'static, Result<Vec<EntitySnapshot>>> {
            let pending = fetch();
            Box::pin(async move {
                let items = pending.await.map_err(Into::into)?;
                items.iter().map(EntitySnapshot::from_entity).collect::<fleet_types::Result<Vec<_>>>().map_err(SyncError::from)
            })
        });

        let (view_tx, view_rx) = watch::channel(ChannelView::default());
        let view = Arc::new(ViewSubscriber { view: view_tx, _entity: PhantomData });
        let slot = Arc::new(Mutex::new(Slot { id: None, live: true }));

        let task = tokio::spawn(open_channel(self.clone(), topic.clone(), view, fetcher, Arc::clone(&slot)));
        Ok(ChannelHandle { topic, client: Arc::downgrade(&self.inner), view: view_rx, slot, task })
    }

    /// Live view of a topic whose snapshot comes from the configured REST API
    pub fn use_topic<T: Entity>(&self, topic: Topic) -> Result<ChannelHandle<T>> {
        let api = self.inner.api.clone().ok_or_else(|| SyncError::Fetch(format!("no REST API configured for {topic}")))?;
        let path = topic.kind()?.snapshot_path();
        self.use_channel(topic, move || {
            let api = Arc::clone(&api);
            let path = path.clone();
            async move { api.fetch_entities::<T>(&path).await }
        })
    }

    /// Close every channel and connection. The client cannot be used afterwards.
    pub fn teardown(&self) -> usize {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let released = self.inner.registry.teardown();
        for (_, controller) in self.inner.controllers.lock().drain() {
            controller.abort();
        }
        self.inner.reconciler.lock().clear_all();
        info!("Sync client torn down ({released} subscriptions released)");
        released
    }

    fn attach(&self, topic: &Topic, subscriber: Arc<dyn Subscriber>, fetcher: Option<SnapshotFetcher>) -> Result<Attached> {
        if self.is_closed() {
            return Err(SyncError::Closed);
        }
        let attached = self.inner.registry.subscribe(topic, subscriber, fetcher)?;
        if attached.new_transport {
            self.drive(&attached);
        }
        Ok(attached)
    }

    /// Route the new transport's frames and start its reconnect controller
    fn drive(&self, attached: &Attached) {
        let transport = &attached.transport;

        let router = Arc::downgrade(&self.inner.router);
        let url = attached.url.clone();
        transport.on_message(move |frame| {
            if let Some(router) = router.upgrade() {
                router.route(&url, frame);
            }
        });

        let registry = Arc::downgrade(&self.inner.registry);
        let url = attached.url.clone();
        transport.on_state_change(move |state| {
            if let Some(registry) = registry.upgrade() {
                registry.notify_connection(&url, state);
            }
        });

        let hooks: Arc<dyn ControllerHooks> = Arc::new(EndpointHooks { client: Arc::downgrade(&self.inner) });
        let controller = ReconnectController::new(transport.clone(), hooks, self.inner.config.backoff.clone(), self.inner.config.alert_after_attempts);

        let mut controllers = self.inner.controllers.lock();
        controllers.retain(|_, handle| !handle.is_finished());
        controllers.insert(attached.url.clone(), controller.spawn());
        debug!("Driving transport {}", attached.url);
    }
}

fn release(inner: &ClientInner, id: SubscriptionId) -> Result<()> {
    let detached = inner.registry.unsubscribe(id)?;
    if detached.channel_closed {
        clear_if_destroyed(&inner.registry, &inner.reconciler, &detached.topic);
    }
    Ok(())
}

/// Drop a topic's reconciled state unless its channel was opened again in the meantime
fn clear_if_destroyed(registry: &Registry, reconciler: &Mutex<Reconciler>, topic: &Topic) -> bool {
    // Held across the check: a re-created channel applies its snapshot only after the clear
    let mut reconciler = reconciler.lock();
    if registry.has_channel(topic) {
        debug!("Keeping state of {topic}, its channel was re-created");
        return false;
    }
    reconciler.clear(topic);
    true
}

/// Load or join, attach, then publish the reconciled state to the new view
async fn open_channel<T: Entity>(client: SyncClient, topic: Topic, view: Arc<ViewSubscriber<T>>, fetcher: SnapshotFetcher, slot: Arc<Mutex<Slot>>) {
    let (fetched, ticket) = match client.inner.join(&topic, &fetcher) {
        Join::Existing => (None, None),
        Join::Load(ticket, load) => (Some(load.await), Some(ticket)),
    };
    if !slot.lock().live {
        debug!("Channel {topic} released before its snapshot arrived");
        return;
    }

    let subscriber: Arc<dyn Subscriber> = Arc::clone(&view) as Arc<dyn Subscriber>;
    let attached = match client.attach(&topic, subscriber, Some(Arc::clone(&fetcher))) {
        Ok(attached) => attached,
        Err(err) => {
            view.fail(Arc::new(err));
            return;
        }
    };
    {
        let mut slot = slot.lock();
        if !slot.live {
            drop(slot);
            let _ = release(&client.inner, attached.id);
            return;
        }
        slot.id = Some(attached.id);
    }
    view.on_connection_state(attached.transport.state());

    let fetched = match fetched {
        Some(result) => Some(result),
        // Joined a channel that never had a snapshot, or that closed before this view attached
        None if attached.new_channel || attached.fetcher_adopted => Some(fetcher().await.map_err(Arc::new)),
        None => None,
    };
    let failed = match fetched {
        Some(Ok(entities)) if attached.new_channel => {
            client.inner.router.apply_snapshot(&topic, attached.generation, entities);
            None
        }
        Some(Ok(entities)) => {
            client.inner.router.merge_snapshot(&topic, attached.generation, entities);
            None
        }
        Some(Err(err)) => Some(err),
        None => None,
    };
    let first = ticket.as_ref().is_none_or(LoadTicket::settle);
    if let Some(err) = failed {
        if first {
            warn!("Initial snapshot of {topic} failed: {err}");
            client.inner.emit(SyncEvent::SnapshotFailed { topic: topic.clone(), error: err.to_string() });
        }
        view.fail(err);
    }

    let snapshot = client.inner.reconciler.lock().snapshot(&topic);
    view.on_update(&snapshot);
    view.loaded();
}

struct EndpointHooks {
    client: Weak<ClientInner>,
}

impl ControllerHooks for EndpointHooks {
    fn on_open(&self, url: &str, recovered: bool) -> BoxFuture<'static, ()> {
        let Some(client) = self.client.upgrade() else {
            return Box::pin(async {});
        };
        let url = url.to_string();

        if client.registry.handshake_frames()
            && let Some(transport) = client.registry.pool().get(&url)
        {
            send_handshakes(&transport, &client.registry.topics_for(&url));
        }
        if !recovered {
            return Box::pin(async {});
        }

        Box::pin(async move {
            for (topic, error) in client.router.repair_endpoint(&url).await {
                client.emit(SyncEvent::SnapshotFailed { topic, error: error.to_string() });
            }
        })
    }

    fn before_reconnect(&self, transport: &Transport) {
        if let Some(client) = self.client.upgrade() {
            client.router.begin_repair(transport.url(), transport.id());
        }
    }

    fn on_event(&self, event: SyncEvent) {
        if let Some(client) = self.client.upgrade() {
            warn!("{event:?}");
            client.emit(event);
        }
    }

    fn on_closed(&self, transport: &Transport) {
        if let Some(client) = self.client.upgrade() {
            client.router.abort_repair(transport.url(), transport.id());
        }
    }
}

#[derive(Default)]
pub struct SyncClientBuilder {
    config: SyncConfig,
    dialer: Option<Arc<dyn Dialer>>,
    api: Option<Arc<FleetApi>>,
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl SyncClientBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to a tokio-tungstenite dialer without credentials
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn api(mut self, api: Arc<FleetApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn notification_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn build(self) -> SyncClient {
        let dialer = self.dialer.unwrap_or_else(|| Arc::new(TungsteniteDialer::default()));
        let pool = TransportPool::new(dialer, self.config.transport.clone());
        let registry = Arc::new(Registry::new(pool, self.config.ws_base_url.clone(), self.config.handshake_frames));
        let reconciler = Arc::new(Mutex::new(Reconciler::new()));
        let router = Arc::new(Router::new(Arc::clone(&registry), Arc::clone(&reconciler), self.config.notification_filter.clone()));
        for sink in self.sinks {
            router.add_sink(sink);
        }
        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));

        SyncClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                registry,
                reconciler,
                router,
                api: self.api,
                events,
                controllers: Mutex::new(RapidHashMap::default()),
                loads: Mutex::new(RapidHashMap::default()),
                next_load: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

/// What a [`ChannelHandle`] currently shows
#[derive(Debug, Clone)]
pub struct ChannelView<T> {
    pub data: Vec<T>,
    pub connection_state: ConnectionState,
    pub error: Option<Arc<SyncError>>,
    /// True until the initial snapshot attempt finished
    pub loading: bool,
    pub revision: u64,
}

impl<T> Default for ChannelView<T> {
    fn default() -> Self {
        Self { data: Vec::new(), connection_state: ConnectionState::Idle, error: None, loading: true, revision: 0 }
    }
}

struct ViewSubscriber<T> {
    view: watch::Sender<ChannelView<T>>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> ViewSubscriber<T> {
    fn fail(&self, error: Arc<SyncError>) {
        self.view.send_modify(|view| {
            view.error = Some(error);
            view.loading = false;
        });
    }

    fn loaded(&self) {
        self.view.send_if_modified(|view| std::mem::replace(&mut view.loading, false));
    }
}

impl<T: Entity> Subscriber for ViewSubscriber<T> {
    fn on_update(&self, snapshot: &TopicSnapshot) {
        self.view.send_if_modified(|view| {
            if snapshot.revision < view.revision || (snapshot.revision == view.revision && snapshot.revision != 0) {
                return false;
            }
            view.data = snapshot
                .entities
                .iter()
                .filter_map(|entity| match entity.decode::<T>() {
                    Ok(decoded) => Some(decoded),
                    Err(err) => {
                        warn!("Skipping undecodable entity {} on {}: {err}", entity.id, snapshot.topic);
                        None
                    }
                })
                .collect();
            view.revision = snapshot.revision;
            true
        });
    }

    fn on_connection_state(&self, state: ConnectionState) {
        self.view.send_if_modified(|view| std::mem::replace(&mut view.connection_state, state) != state);
    }

    fn on_error(&self, error: &Arc<SyncError>) {
        let error = Arc::clone(error);
        self.view.send_modify(|view| view.error = Some(error));
    }
}

struct Slot {
    id: Option<SubscriptionId>,
    live: bool,
}

/// Live view of one topic. Dropping it unsubscribes.
pub struct ChannelHandle<T> {
    topic: Topic,
    client: Weak<ClientInner>,
    view: watch::Receiver<ChannelView<T>>,
    slot: Arc<Mutex<Slot>>,
    task: JoinHandle<()>,
}

impl<T: Clone> ChannelHandle<T> {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn data(&self) -> Vec<T> {
        self.view.borrow().data.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.view.borrow().connection_state
    }

    /// Last snapshot failure, if any. Live updates keep flowing regardless.
    pub fn error(&self) -> Option<Arc<SyncError>> {
        self.view.borrow().error.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.view.borrow().loading
    }

    pub fn view(&self) -> ChannelView<T> {
        self.view.borrow().clone()
    }

    /// Wait for the next change to the view
    pub async fn changed(&mut self) -> Result<()> {
        self.view.changed().await.map_err(|_| SyncError::Closed)
    }

    /// Wait until the view satisfies `predicate`
    pub async fn wait_for(&mut self, mut predicate: impl FnMut(&ChannelView<T>) -> bool) -> Result<ChannelView<T>> {
        let view = self.view.wait_for(|view| predicate(view)).await.map_err(|_| SyncError::Closed)?;
        Ok(view.clone())
    }
}

impl<T> Drop for ChannelHandle<T> {
    fn drop(&mut self) {
        let id = {
            let mut slot = self.slot.lock();
            slot.live = false;
            slot.id.take()
        };
        if id.is_none() {
            self.task.abort();
        }
        if let (Some(id), Some(client)) = (id, self.client.upgrade())
            && let Err(err) = release(&client, id)
        {
            debug!("Releasing {} failed: {err}", self.topic);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fleet_types::models::Vehicle;
    use fleet_ws::TransportConfig;
    use fleet_ws::testing::MemoryDialer;
    use serde_json::json;

    use super::*;
    use crate::config::BackoffConfig;

    fn client(dialer: Arc<MemoryDialer>) -> SyncClient {
        let config = SyncConfig {
            ws_base_url: "ws://fleet.test".to_string(),
            transport: TransportConfig::default(),
            backoff: BackoffConfig::deterministic(Duration::from_millis(100), Duration::from_secs(1)),
            ..Default::default()
        };
        SyncClient::builder().config(config).dialer(dialer).build()
    }

    fn vehicle(id: &str, version: u64, status: &str) -> Vehicle {
        serde_json::from_value(json!({"id": id, "version": version, "status": status})).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_view_loads_snapshot_then_follows_pushes() {
        let (dialer, mut accepted) = MemoryDialer::new();
        let client = client(dialer);
        let topic = Topic::fleet_vehicles(42);

        let mut handle = client
            .use_channel(topic, || async { Ok::<_, SyncError>(vec![vehicle("v1", 1, "available")]) })
            .unwrap();
        handle.wait_for(|view| !view.loading).await.unwrap();
        assert_eq!(handle.data().len(), 1);
        assert!(handle.error().is_none());

        let server = accepted.recv().await.unwrap();
        server.send_text(r#"{"type":"update","entity":{"id":"v1","version":2,"status":"full"}}"#).await;
        let view = handle.wait_for(|view| view.data.first().is_some_and(|v| v.version == 2)).await.unwrap();
        assert_eq!(view.data.len(), 1);
        assert_eq!(handle.connection_state(), ConnectionState::Open);

        client.teardown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_snapshot_surfaces_error_and_event() {
        let (dialer, _accepted) = MemoryDialer::new();
        let client = client(dialer);
        let mut events = client.events();

        let mut handle = client
            .use_channel(Topic::vehicle_eta(7), || async { Err::<Vec<Vehicle>, _>(SyncError::Fetch("503".to_string())) })
            .unwrap();
        let view = handle.wait_for(|view| !view.loading).await.unwrap();
        assert!(view.error.is_some());
        assert!(matches!(events.recv().await.unwrap(), SyncEvent::SnapshotFailed { .. }));
        // Still subscribed for pushes
        assert_eq!(client.registry().subscription_count(&Topic::vehicle_eta(7)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_before_snapshot_never_subscribes() {
        let (dialer, _accepted) = MemoryDialer::new();
        let client = client(dialer);
        let topic = Topic::fleet_vehicles(1);

        let handle = client
            .use_channel(topic.clone(), || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, SyncError>(vec![vehicle("v1", 1, "available")])
            })
            .unwrap();
        drop(handle);
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(!client.registry().has_channel(&topic));
        assert!(client.state(&topic).entities.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_rejects_new_channels() {
        let (dialer, _accepted) = MemoryDialer::new();
        let client = client(dialer);
        client.teardown();
        let result = client.use_channel(Topic::declared_routes(), || async { Ok::<Vec<Vehicle>, SyncError>(Vec::new()) });
        assert!(matches!(result, Err(SyncError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_keeps_state_of_recreated_channel() {
        let (dialer, _accepted) = MemoryDialer::new();
        let client = client(dialer);
        let topic = Topic::fleet_vehicles(5);
        let inner = &client.inner;

        let first = client.subscribe(&topic, Arc::new(|_: &TopicSnapshot| {})).unwrap();
        assert!(inner.registry.unsubscribe(first).unwrap().channel_closed);

        // Opened again before the old channel's state was dropped
        let second = client.subscribe(&topic, Arc::new(|_: &TopicSnapshot| {})).unwrap();
        let entity = EntitySnapshot::from_value(json!({"id": "v1", "version": 3})).unwrap();
        assert!(client.router().apply(&topic, fleet_types::Delta::Upsert(entity)));

        assert!(!clear_if_destroyed(&inner.registry, &inner.reconciler, &topic));
        assert_eq!(client.state(&topic).entities.len(), 1);

        client.unsubscribe(second).unwrap();
        assert!(client.state(&topic).entities.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_views_opened_together_share_one_fetch() {
        let (dialer, _accepted) = MemoryDialer::new();
        let client = client(dialer);
        let topic = Topic::fleet_vehicles(8);
        let fetches = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles: Vec<ChannelHandle<Vehicle>> = (0..4)
            .map(|_| {
                let fetches = Arc::clone(&fetches);
                client
                    .use_channel(topic.clone(), move || {
                        let fetches = Arc::clone(&fetches);
                        async move {
                            fetches.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            Ok::<_, SyncError>(vec![vehicle("v1", 1, "available")])
                        }
                    })
                    .unwrap()
            })
            .collect();
        for handle in &mut handles {
            let view = handle.wait_for(|view| !view.loading).await.unwrap();
            assert_eq!(view.data.len(), 1);
        }

        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert!(client.inner.loads.lock().is_empty());
        assert_eq!(client.registry().subscription_count(&topic), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_fetch_failure_is_reported_once() {
        let (dialer, _accepted) = MemoryDialer::new();
        let client = client(dialer);
        let mut events = client.events();
        let topic = Topic::vehicle_eta(3);
        let fetch = || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err::<Vec<Vehicle>, _>(SyncError::Fetch("503".to_string()))
        };

        let mut first = client.use_channel(topic.clone(), fetch).unwrap();
        let mut second = client.use_channel(topic.clone(), fetch).unwrap();
        assert!(first.wait_for(|view| !view.loading).await.unwrap().error.is_some());
        assert!(second.wait_for(|view| !view.loading).await.unwrap().error.is_some());

        assert!(matches!(events.try_recv(), Ok(SyncEvent::SnapshotFailed { .. })));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_use_topic_without_api_fails() {
        let (dialer, _accepted) = MemoryDialer::new();
        let client = client(dialer);
        assert!(matches!(client.use_topic::<Vehicle>(Topic::fleet_vehicles(3)), Err(SyncError::Fetch(_))));
    }
}
