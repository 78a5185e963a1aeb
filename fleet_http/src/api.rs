use std::sync::Arc;
use std::time::Duration;

use fleet_types::Entity;
use fleet_types::EntitySnapshot;
use fleet_types::models::DeclaredRoute;
use fleet_types::models::Device;
use fleet_types::models::Notification;
use fleet_types::models::Vehicle;
use fleet_types::models::VehicleEta;
use fleet_types::models::VehicleLocation;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::circuit_breaker::CircuitBreaker;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::client::HttpClient;
use crate::client::HttpClientConfig;
use crate::errors::ApiError;
use crate::errors::Result;
use crate::session::Session;

const DEFAULT_BASE_URL: &str = "http://localhost:8080";

/// Token issued by `POST /refresh`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenGrant {
    #[serde(alias = "token")]
    pub access_token: String,
    /// Lifetime in seconds
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
}

fn default_expires_in() -> u64 {
    3_600
}

/// REST client for the fleet backend: snapshots, mutations and token refresh
pub struct FleetApi {
    client: HttpClient,
    base_url: String,
    session: Arc<Session>,
    circuit_breaker: CircuitBreaker,
}

impl FleetApi {
    pub fn builder() -> FleetApiBuilder {
        FleetApiBuilder::default()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// GET `path` and decode it as a list of versioned entities
    pub async fn fetch_snapshot(&self, path: &str) -> Result<Vec<EntitySnapshot>> {
        let body = self.get_json::<Value>(path).await?;
        parse_snapshot(body)
    }

    /// GET `path` as a snapshot, decoded into the model type
    pub async fn fetch_entities<T: Entity>(&self, path: &str) -> Result<Vec<T>> {
        let snapshots = self.fetch_snapshot(path).await?;
        snapshots.iter().map(|snapshot| snapshot.decode::<T>().map_err(ApiError::from)).collect()
    }

    pub async fn vehicles(&self, fleet_id: &str) -> Result<Vec<Vehicle>> {
        self.fetch_entities(&format!("/vehicles/fleet/{fleet_id}")).await
    }

    pub async fn vehicle_eta(&self, vehicle_id: &str) -> Result<Vec<VehicleEta>> {
        self.fetch_entities(&format!("/vehicles/{vehicle_id}/eta")).await
    }

    pub async fn vehicle_location(&self, vehicle_id: &str) -> Result<Vec<VehicleLocation>> {
        self.fetch_entities(&format!("/vehicles/{vehicle_id}/location")).await
    }

    pub async fn declared_routes(&self) -> Result<Vec<DeclaredRoute>> {
        self.fetch_entities("/declared_routes").await
    }

    pub async fn devices(&self, company_id: &str) -> Result<Vec<Device>> {
        self.fetch_entities(&format!("/iot/devices/{company_id}")).await
    }

    pub async fn notifications(&self, company_id: &str) -> Result<Vec<Notification>> {
        self.fetch_entities(&format!("/notifications/{company_id}")).await
    }

    pub async fn get_json<R: DeserializeOwned>(&self, path: &str) -> Result<R> {
        let url = self.url(path);
        self.circuit_breaker
            .call_async(|| async {
                let response = self.authorized(self.client.get(&url))?.send().await?;
                read_json(response).await
            })
            .await
    }

    pub async fn post<B: Serialize + Sync, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R> {
        let url = self.url(path);
        self.circuit_breaker
            .call_async(|| async {
                let response = self.authorized(self.client.post(&url))?.json(body).send().await?;
                read_json(response).await
            })
            .await
    }

    pub async fn patch<B: Serialize + Sync, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R> {
        let url = self.url(path);
        self.circuit_breaker
            .call_async(|| async {
                let response = self.authorized(self.client.patch(&url))?.json(body).send().await?;
                read_json(response).await
            })
            .await
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        let url = self.url(path);
        self.circuit_breaker
            .call_async(|| async {
                let response = self.authorized(self.client.delete(&url))?.send().await?;
                check_status(response).await.map(|_| ())
            })
            .await
    }

    /// Exchange the current token for a fresh one and store it in the session
    pub async fn refresh_token(&self) -> Result<TokenGrant> {
        let grant: TokenGrant = self.post("/refresh", &serde_json::json!({})).await?;
        self.session.login(grant.access_token.clone(), Duration::from_secs(grant.expires_in))?;
        tracing::info!("Session token refreshed, valid for {}s", grant.expires_in);
        Ok(grant)
    }

    /// Refresh the token when it expires within `margin`. Returns true if a refresh happened.
    pub async fn refresh_if_needed(&self, margin: Duration) -> Result<bool> {
        if !self.session.needs_refresh(margin) {
            return Ok(false);
        }
        self.refresh_token().await?;
        Ok(true)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let token = self.session.token().ok_or(ApiError::NoSession)?;
        Ok(request.bearer_auth(token))
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(ApiError::Unauthorized { status: status.as_u16() });
    }

    let bytes = response.bytes().await.unwrap_or_default();
    Err(ApiError::Status { status: status.as_u16(), message: error_message(&bytes) })
}

async fn read_json<R: DeserializeOwned>(response: reqwest::Response) -> Result<R> {
    let bytes = check_status(response).await?.bytes().await?;
    if bytes.is_empty() {
        return Ok(serde_json::from_value(Value::Null)?);
    }
    Ok(serde_json::from_slice(&bytes)?)
}

/// Pull a human-readable message out of an error body (`{"detail": ...}` or `{"message": ...}`)
fn error_message(body: &[u8]) -> String {
    if let Ok(Value::Object(object)) = serde_json::from_slice::<Value>(body) {
        for field in ["detail", "message", "error"] {
            if let Some(Value::String(message)) = object.get(field) {
                return message.clone();
            }
        }
    }
    String::from_utf8_lossy(body).chars().take(200).collect()
}

/// Decode a snapshot body: a bare array, an envelope with `data`/`items`, or a single object.
pub fn parse_snapshot(body: Value) -> Result<Vec<EntitySnapshot>> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut object) => match object.remove("data").or_else(|| object.remove("items")) {
            Some(Value::Array(items)) => items,
            Some(single @ Value::Object(_)) => vec![single],
            Some(other) => return Err(ApiError::InvalidResponse(format!("unexpected snapshot envelope: {other}"))),
            None => vec![Value::Object(object)],
        },
        Value::Null => Vec::new(),
        other => return Err(ApiError::InvalidResponse(format!("unexpected snapshot body: {other}"))),
    };

    items.into_iter().map(|item| EntitySnapshot::from_value(item).map_err(ApiError::from)).collect()
}

pub struct FleetApiBuilder {
    http_config: HttpClientConfig,
    base_url: String,
    circuit_breaker_config: CircuitBreakerConfig,
    session: Option<Arc<Session>>,
}

impl Default for FleetApiBuilder {
    fn default() -> Self {
        Self {
            http_config: HttpClientConfig::default(),
            base_url: DEFAULT_BASE_URL.to_string(),
            circuit_breaker_config: CircuitBreakerConfig::default(),
            session: None,
        }
    }
}

impl FleetApiBuilder {
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn http_config(mut self, config: HttpClientConfig) -> Self {
        self.http_config = config;
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker_config = config;
        self
    }

    pub fn session(mut self, session: Arc<Session>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn build(self) -> Result<FleetApi> {
        Ok(FleetApi {
            client: HttpClient::with_config(self.http_config)?,
            base_url: self.base_url,
            session: self.session.unwrap_or_else(|| Arc::new(Session::in_memory())),
            circuit_breaker: CircuitBreaker::with_config(self.circuit_breaker_config),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use super::*;

    /// Serve one canned HTTP response per connection, handing each request head to the test
    async fn serve(responses: Vec<(u16, &'static str)>) -> (String, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|window| window == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    head.extend_from_slice(&buf[..n]);
                }
                let _ = tx.send(String::from_utf8_lossy(&head).to_string());

                let response = format!(
                    "HTTP/1.1 {status} Status\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
        });

        (format!("http://{addr}"), rx)
    }

    fn api(base_url: &str) -> FleetApi {
        let session = Arc::new(Session::in_memory());
        session.login("secret-token", Duration::from_secs(3600)).unwrap();
        FleetApi::builder().base_url(base_url).http_config(HttpClientConfig { hickory_dns: false, ..Default::default() }).session(session).build().unwrap()
    }

    #[test]
    fn test_parse_snapshot_shapes() {
        let bare = parse_snapshot(json!([{"id": "v1", "version": 1}, {"id": 2, "version": 3}])).unwrap();
        assert_eq!(bare.len(), 2);
        assert_eq!(bare[1].id.as_str(), "2");

        let envelope = parse_snapshot(json!({"data": [{"id": "r1", "version": 5}]})).unwrap();
        assert_eq!(envelope[0].version, 5);

        let single = parse_snapshot(json!({"id": "45", "version": 7, "eta_minutes": 4})).unwrap();
        assert_eq!(single.len(), 1);

        assert!(parse_snapshot(Value::Null).unwrap().is_empty());
        assert!(matches!(parse_snapshot(json!("nope")), Err(ApiError::InvalidResponse(_))));
        assert!(matches!(parse_snapshot(json!([{"id": "v1"}])), Err(ApiError::Entity(_))));
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(error_message(br#"{"detail":"Fleet not found"}"#), "Fleet not found");
        assert_eq!(error_message(b"plain failure"), "plain failure");
    }

    #[test]
    fn test_url_joining() {
        let api = FleetApi::builder().base_url("https://api.example.com/").build().unwrap();
        assert_eq!(api.url("/declared_routes"), "https://api.example.com/declared_routes");
        assert_eq!(api.url("vehicles/fleet/42"), "https://api.example.com/vehicles/fleet/42");
    }

    #[tokio::test]
    async fn test_requests_without_session_fail_before_sending() {
        let api = FleetApi::builder().base_url("http://127.0.0.1:9").build().unwrap();
        assert!(matches!(api.declared_routes().await, Err(ApiError::NoSession)));
    }

    #[tokio::test]
    async fn test_fetch_vehicles_with_bearer_token() {
        let (base_url, mut requests) = serve(vec![(200, r#"[{"id":"bus-1","version":1,"status":"available"}]"#)]).await;
        let api = api(&base_url);

        let vehicles = api.vehicles("42").await.unwrap();
        assert_eq!(vehicles.len(), 1);
        assert_eq!(vehicles[0].status, fleet_types::models::VehicleStatus::Available);

        let head = requests.recv().await.unwrap().to_lowercase();
        assert!(head.starts_with("get /vehicles/fleet/42 "));
        assert!(head.contains("authorization: bearer secret-token"));
    }

    #[tokio::test]
    async fn test_unauthorized_is_classified() {
        let (base_url, _requests) = serve(vec![(401, r#"{"detail":"expired"}"#)]).await;
        let err = api(&base_url).fetch_snapshot("/declared_routes").await.unwrap_err();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn test_server_error_carries_message() {
        let (base_url, _requests) = serve(vec![(503, r#"{"message":"maintenance"}"#)]).await;
        let err = api(&base_url).fetch_snapshot("/declared_routes").await.unwrap_err();
        assert!(matches!(err, ApiError::Status { status: 503, ref message } if message == "maintenance"));
    }
}
