use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fleet_app::cli;
use fleet_app::config_loader;
use fleet_app::config_loader::MonitorConfigFile;
use fleet_app::shutdown_handler;
use fleet_app::shutdown_handler::Shutdown;
use fleet_app::tracing_setup;
use fleet_http::FleetApi;
use fleet_http::Session;
use fleet_sync::ChannelHandle;
use fleet_sync::LogSink;
use fleet_sync::SyncClient;
use fleet_sync::SyncEvent;
use fleet_types::Entity;
use fleet_types::Topic;
use fleet_types::TopicKind;
use fleet_types::models::DeclaredRoute;
use fleet_types::models::Device;
use fleet_types::models::Notification;
use fleet_types::models::Vehicle;
use fleet_types::models::VehicleEta;
use fleet_types::models::VehicleLocation;
use fleet_ws::DialerConfig;
use fleet_ws::TungsteniteDialer;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::error;
use tracing::info;
use tracing::warn;

/// Log every change to one topic until shutdown
async fn watch_topic<T: Entity>(mut handle: ChannelHandle<T>, shutdown: Shutdown) {
    let topic = handle.topic().clone();
    loop {
        tokio::select! {
            changed = handle.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = handle.view();
                if let Some(err) = &view.error {
                    warn!("{topic}: {err}");
                }
                info!("{topic}: {} entities, {} (revision {})", view.data.len(), view.connection_state, view.revision);
            }
            _ = shutdown.wait() => break,
        }
    }
}

fn spawn_watcher(client: &SyncClient, topic: Topic, shutdown: &Shutdown) -> anyhow::Result<JoinHandle<()>> {
    fn start<T: Entity>(client: &SyncClient, topic: Topic, shutdown: &Shutdown) -> anyhow::Result<JoinHandle<()>> {
        let handle = client.use_topic::<T>(topic)?;
        Ok(tokio::spawn(watch_topic(handle, shutdown.clone())))
    }

    let kind = topic.kind().with_context(|| format!("cannot watch {topic}"))?;
    match kind {
        TopicKind::FleetVehicles { .. } => start::<Vehicle>(client, topic, shutdown),
        TopicKind::VehicleLocation { .. } => start::<VehicleLocation>(client, topic, shutdown),
        TopicKind::VehicleEta { .. } => start::<VehicleEta>(client, topic, shutdown),
        TopicKind::DeclaredRoutes => start::<DeclaredRoute>(client, topic, shutdown),
        TopicKind::CompanyDevices { .. } => start::<Device>(client, topic, shutdown),
        TopicKind::Notifications { .. } => start::<Notification>(client, topic, shutdown),
    }
}

/// Surface client alerts in the log
fn spawn_event_logger(client: &SyncClient, shutdown: Shutdown) -> JoinHandle<()> {
    let mut events = client.events();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = shutdown.wait() => break,
            };
            match event {
                Ok(SyncEvent::AuthRejected { url, status }) => error!("{url} rejected our credentials ({status}); log in again"),
                Ok(SyncEvent::ConnectionLost { url, attempts }) => error!("Lost connection to {url} ({attempts} attempts so far)"),
                Ok(SyncEvent::ConnectionRestored { url }) => info!("Connection to {url} restored"),
                Ok(SyncEvent::SnapshotFailed { topic, error }) => warn!("Snapshot of {topic} failed: {error}"),
                Err(RecvError::Lagged(missed)) => warn!("Missed {missed} sync events"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Refresh the bearer token ahead of expiry
fn spawn_token_refresher(api: Arc<FleetApi>, config: &MonitorConfigFile, shutdown: Shutdown) -> JoinHandle<()> {
    let margin = Duration::from_secs(config.token_refresh_margin_secs);
    let period = Duration::from_secs(config.token_check_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait() => break,
            }
            if !api.session().is_logged_in() {
                continue;
            }
            match api.refresh_if_needed(margin).await {
                Ok(true) => info!("Session token refreshed"),
                Ok(false) => {}
                Err(err) if err.is_auth() => error!("Token refresh rejected: {err}"),
                Err(err) => warn!("Token refresh failed: {err}"),
            }
        }
    })
}

async fn run(config: MonitorConfigFile, topics: Vec<Topic>, shutdown: Shutdown) -> anyhow::Result<()> {
    let session = match &config.token_file {
        Some(path) => Session::load(path).with_context(|| format!("failed to read session from {path}"))?,
        None => Session::in_memory(),
    };
    let session = Arc::new(session);
    if !session.is_logged_in() {
        warn!("No valid session token; connecting anonymously");
    }

    let api = Arc::new(FleetApi::builder().base_url(&config.api_base_url).session(Arc::clone(&session)).build()?);
    let token_session = Arc::clone(&session);
    let dialer = TungsteniteDialer::new(DialerConfig::default()).with_token_source(Arc::new(move || token_session.token()));

    let client = SyncClient::builder()
        .config(config.sync_config())
        .dialer(Arc::new(dialer))
        .api(Arc::clone(&api))
        .notification_sink(Arc::new(LogSink))
        .build();

    let mut tasks = vec![spawn_event_logger(&client, shutdown.clone()), spawn_token_refresher(Arc::clone(&api), &config, shutdown.clone())];
    let mut watching = 0;
    for topic in topics {
        match spawn_watcher(&client, topic, &shutdown) {
            Ok(task) => {
                tasks.push(task);
                watching += 1;
            }
            Err(err) => warn!("{err:#}"),
        }
    }
    info!("Watching {watching} topics");

    shutdown.wait().await;
    for task in tasks {
        let _ = task.await;
    }
    let released = client.teardown();
    info!("Shut down cleanly ({released} subscriptions released)");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = cli::parse_args();
    let loaded = config_loader::load_monitor_config(&args.config_path);
    let config = loaded.as_ref().map(Clone::clone).unwrap_or_default();

    // Keep guard alive for the entire process
    let _guard = tracing_setup::init("fleet_monitor", &config.log);
    match &loaded {
        Ok(_) => info!("Loaded monitor config from {}", args.config_path.display()),
        Err(err) => warn!("Failed to load monitor config from {}: {err}. Using defaults.", args.config_path.display()),
    }
    info!("Starting fleet monitor against {} / {}", config.api_base_url, config.ws_base_url);

    let topics = if args.topics.is_empty() { config.topics() } else { args.topics.clone() };
    if topics.is_empty() {
        anyhow::bail!("no topics to watch");
    }

    let shutdown = Shutdown::new();
    shutdown_handler::setup(shutdown.clone())?;

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run(config, topics, shutdown))
}
