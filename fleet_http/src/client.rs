use std::time::Duration;

use reqwest::Client;
use reqwest::ClientBuilder;

use crate::errors::Result;

/// Configuration for the REST client.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Maximum idle connections per host (default: 8)
    pub pool_max_idle_per_host: usize,

    /// Idle timeout for pooled connections (default: 90s)
    pub pool_idle_timeout: Duration,

    /// Connection establishment timeout (default: 10s)
    pub connect_timeout: Duration,

    /// Total request timeout (default: 30s)
    pub request_timeout: Duration,

    /// TCP keepalive interval (default: 60s)
    pub tcp_keepalive: Duration,

    /// HTTP/2 adaptive window sizing (default: true)
    pub http2_adaptive_window: bool,

    /// Enable Hickory DNS for async resolution (default: true)
    pub hickory_dns: bool,

    /// User-Agent header sent with every request
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            pool_max_idle_per_host: 8,
            pool_idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            tcp_keepalive: Duration::from_secs(60),
            http2_adaptive_window: true,
            hickory_dns: true,
            user_agent: concat!("fleet-sync/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HttpClientConfig {
    /// Short timeouts, for snapshot repairs that block live updates
    pub fn interactive() -> Self {
        Self { connect_timeout: Duration::from_secs(3), request_timeout: Duration::from_secs(10), ..Default::default() }
    }

    /// Long timeouts for batch tooling talking to slow backends
    pub fn patient() -> Self {
        Self { connect_timeout: Duration::from_secs(20), request_timeout: Duration::from_secs(120), ..Default::default() }
    }
}

/// Thin wrapper over a configured `reqwest::Client`
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    config: HttpClientConfig,
}

impl HttpClient {
    pub fn new() -> Result<Self> {
        Self::with_config(HttpClientConfig::default())
    }

    pub fn with_config(config: HttpClientConfig) -> Result<Self> {
        let client = ClientBuilder::new()
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout)
            .tcp_nodelay(true)
            .tcp_keepalive(Some(config.tcp_keepalive))
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .use_rustls_tls()
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .http2_adaptive_window(config.http2_adaptive_window)
            .hickory_dns(config.hickory_dns)
            .user_agent(config.user_agent.clone())
            .gzip(true)
            .brotli(true)
            .build()?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    pub fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.client.get(url)
    }

    pub fn post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client.post(url)
    }

    pub fn patch(&self, url: &str) -> reqwest::RequestBuilder {
        self.client.patch(url)
    }

    pub fn delete(&self, url: &str) -> reqwest::RequestBuilder {
        self.client.delete(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HttpClientConfig::default();
        assert_eq!(config.pool_max_idle_per_host, 8);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(config.user_agent.starts_with("fleet-sync/"));
    }

    #[test]
    fn test_presets() {
        assert_eq!(HttpClientConfig::interactive().request_timeout, Duration::from_secs(10));
        assert_eq!(HttpClientConfig::patient().request_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_client_creation() {
        let client = HttpClient::with_config(HttpClientConfig::interactive()).unwrap();
        assert_eq!(client.config().connect_timeout, Duration::from_secs(3));
    }
}
