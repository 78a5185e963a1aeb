use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures_util::SinkExt;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::connect_async;
use tungstenite::Message;
use url::Url;

use crate::errors::Result;
use crate::errors::WsError;
use crate::frame::Frame;
use crate::health::HealthChecker;

/// Supplies the current bearer token at dial time, so refreshed tokens are picked up on reconnect
pub type TokenSource = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// A live duplex link. Dropping `outbound` closes the socket; `inbound` ending means the link died.
pub struct Link {
    pub outbound: mpsc::Sender<Frame>,
    pub inbound: mpsc::Receiver<Frame>,
}

/// Opens links to endpoint URLs. Implemented over real sockets and, for tests, in memory.
pub trait Dialer: Send + Sync + 'static {
    fn dial(&self, url: &str) -> BoxFuture<'static, Result<Link>>;
}

#[derive(Debug, Clone)]
pub struct DialerConfig {
    /// Interval between keep-alive pings
    pub ping_interval: Duration,
    /// Drop the link when nothing (frames or pongs) arrived for this long
    pub idle_timeout: Duration,
    /// Capacity of the inbound and outbound frame queues
    pub channel_capacity: usize,
    /// Query parameter carrying the bearer token
    pub token_param: String,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self { ping_interval: Duration::from_secs(20), idle_timeout: Duration::from_secs(60), channel_capacity: 1_024, token_param: "token".to_string() }
    }
}

/// WebSocket dialer over tokio-tungstenite
pub struct TungsteniteDialer {
    config: DialerConfig,
    token: Option<TokenSource>,
}

impl TungsteniteDialer {
    pub fn new(config: DialerConfig) -> Self {
        Self { config, token: None }
    }

    pub fn with_token_source(mut self, token: TokenSource) -> Self {
        self.token = Some(token);
        self
    }

    fn endpoint_url(&self, url: &str) -> Result<Url> {
        let mut endpoint = Url::parse(url).map_err(|err| WsError::InvalidUrl { url: url.to_string(), reason: err.to_string() })?;
        if let Some(token) = self.token.as_ref().and_then(|source| source()) {
            endpoint.query_pairs_mut().append_pair(&self.config.token_param, &token);
        }
        Ok(endpoint)
    }
}

impl Default for TungsteniteDialer {
    fn default() -> Self {
        Self::new(DialerConfig::default())
    }
}

impl Dialer for TungsteniteDialer {
    fn dial(&self, url: &str) -> BoxFuture<'static, Result<Link>> {
        let endpoint = self.endpoint_url(url);
        let config = self.config.clone();
        let display_url = url.to_string();

        Box::pin(async move {
            let endpoint = endpoint?;
            tracing::debug!("Dialing {display_url}");

            let (stream, response) = connect_async(endpoint.as_str()).await.map_err(|err| classify_connect_error(&display_url, err))?;
            tracing::info!("Connected to {display_url} (HTTP {})", response.status());

            let (outbound_tx, outbound_rx) = mpsc::channel(config.channel_capacity);
            let (inbound_tx, inbound_rx) = mpsc::channel(config.channel_capacity);
            tokio::spawn(pump(stream, outbound_rx, inbound_tx, config, display_url));

            Ok(Link { outbound: outbound_tx, inbound: inbound_rx })
        })
    }
}

fn classify_connect_error(url: &str, err: tungstenite::Error) -> WsError {
    if let tungstenite::Error::Http(response) = &err {
        let status = response.status().as_u16();
        if status == 401 || status == 403 {
            return WsError::Unauthorized { url: url.to_string(), status };
        }
    }
    WsError::ConnectFailed { url: url.to_string(), source: Box::new(err) }
}

/// Shuttles frames between the socket and the link queues until either side goes away
async fn pump<S>(stream: S, mut outbound: mpsc::Receiver<Frame>, inbound: mpsc::Sender<Frame>, config: DialerConfig, url: String)
where
    S: futures_util::Stream<Item = std::result::Result<Message, tungstenite::Error>> + futures_util::Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let (mut sink, mut source) = stream.split();
    let mut health = HealthChecker::new(config.idle_timeout);
    let mut ping = tokio::time::interval(config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ping.tick().await;

    loop {
        tokio::select! {
            message = source.next() => {
                let frame = match message {
                    Some(Ok(Message::Text(text))) => Frame::Text(text.as_str().to_owned()),
                    Some(Ok(Message::Binary(data))) => Frame::Binary(data),
                    Some(Ok(Message::Ping(data))) => {
                        health.record_activity();
                        if let Err(err) = sink.send(Message::Pong(data)).await {
                            tracing::warn!("Failed to answer ping on {url}: {err}");
                            break;
                        }
                        continue;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        health.record_activity();
                        continue;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!("{url} closed by server: {frame:?}");
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => continue,
                    Some(Err(err)) => {
                        tracing::warn!("WebSocket error on {url}: {err}");
                        break;
                    }
                    None => break,
                };

                health.record_activity();
                if inbound.send(frame).await.is_err() {
                    // Transport dropped its end
                    break;
                }
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let message = match frame {
                    Frame::Text(text) => Message::Text(text.into()),
                    Frame::Binary(data) => Message::Binary(data),
                };
                if let Err(err) = sink.send(message).await {
                    tracing::warn!("Send failed on {url}: {err}");
                    break;
                }
            }
            _ = ping.tick() => {
                if !health.is_healthy() {
                    tracing::warn!("{url} idle for {:?}, dropping link", health.idle_for());
                    break;
                }
                if let Err(err) = sink.send(Message::Ping(Default::default())).await {
                    tracing::warn!("Ping failed on {url}: {err}");
                    break;
                }
            }
        }
    }

    tracing::debug!("Link pump for {url} exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_appended_as_query_param() {
        let dialer = TungsteniteDialer::default().with_token_source(Arc::new(|| Some("abc 123".to_string())));
        let url = dialer.endpoint_url("wss://api.example.com/ws/vehicles/all/42").unwrap();
        assert_eq!(url.as_str(), "wss://api.example.com/ws/vehicles/all/42?token=abc+123");
    }

    #[test]
    fn test_missing_token_leaves_url_untouched() {
        let dialer = TungsteniteDialer::default().with_token_source(Arc::new(|| None));
        let url = dialer.endpoint_url("ws://localhost:8080/declared_routes/ws/routes").unwrap();
        assert_eq!(url.query(), None);
    }

    #[test]
    fn test_invalid_url() {
        let dialer = TungsteniteDialer::default();
        assert!(matches!(dialer.endpoint_url("not a url"), Err(WsError::InvalidUrl { .. })));
    }
}
