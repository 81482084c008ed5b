//! Session with the remote control plane.
//!
//! The session registers the node with a heartbeat, learns the upstream origin, the TLS
//! identity and the token key from the reply, and keeps repeating the heartbeat on a
//! timer while connected.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cheetah_edge::{OriginController, OriginHandle, RequestValidator};
use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::tls::{TlsIdentityProvider, TlsMaterial};

pub const BUILD_VERSION: u32 = 31;
pub const DEFAULT_CONTROL_PLANE_URL: &str = "https://api.mangadex.network";
pub const DEFAULT_UPSTREAM_URL: &str = "https://uploads.mangadex.org";
/// 60 GiB; smaller cache sizes are reported as this.
pub const MIN_CACHE_SIZE: u64 = 64_424_509_440;
/// 1 PiB; reported when no cache size is configured.
pub const DEFAULT_CACHE_SIZE: u64 = 1_125_899_906_842_624;
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("failed to build control-plane client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to '{url}' failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to '{url}' responded with status {status}")]
    Status { url: String, status: StatusCode },
    #[error("failed to decode response from '{url}': {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Where and how to reach the control plane.
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    pub base_url: String,
    pub user_agent: String,
    pub heartbeat_interval: Duration,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_CONTROL_PLANE_URL.to_string(),
            user_agent: format!("cheetah/{BUILD_VERSION}.0"),
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}

/// What the node reports about itself on every heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionConfig {
    #[serde(rename = "secret")]
    pub client_secret: String,
    pub port: u16,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ip_address: String,
    /// Bytes.
    #[serde(rename = "disk_space")]
    pub cache_size: u64,
    /// Bytes per second; 0 means unmetered.
    pub network_speed: u64,
    pub build_version: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tls_created_at: String,
}

impl SessionConfig {
    pub fn new(
        client_secret: impl Into<String>,
        ip_address: impl Into<String>,
        port: u16,
        cache_size: u64,
        network_speed: u64,
    ) -> Self {
        Self {
            client_secret: client_secret.into(),
            port,
            ip_address: ip_address.into(),
            cache_size: normalize_cache_size(cache_size),
            network_speed,
            build_version: BUILD_VERSION,
            tls_created_at: String::new(),
        }
    }
}

/// Unset (zero) becomes the unlimited sentinel; anything else is raised to the floor.
pub fn normalize_cache_size(bytes: u64) -> u64 {
    if bytes == 0 {
        DEFAULT_CACHE_SIZE
    } else {
        bytes.max(MIN_CACHE_SIZE)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PingResponse {
    pub client_id: String,
    pub url: String,
    pub paused: bool,
    pub compromised: bool,
    pub latest_build: u32,
    pub image_server: String,
    pub token_key: String,
    pub disable_tokens: bool,
    #[serde(default)]
    pub tls: Option<TlsMaterial>,
}

#[derive(Serialize)]
struct StopRequest<'a> {
    secret: &'a str,
}

#[derive(Deserialize)]
struct StopResponse {}

/// Shared pieces the serving path is wired with after a successful connect.
#[derive(Clone)]
pub struct SessionHandles {
    pub origin: OriginHandle,
    pub tls: Arc<TlsIdentityProvider>,
    pub validator: Arc<RequestValidator>,
}

struct SessionInner {
    client: Client,
    control: ControlPlaneConfig,
    config: tokio::sync::Mutex<SessionConfig>,
    connected: AtomicBool,
    origin: OriginController,
    tls: Arc<TlsIdentityProvider>,
    validator: Arc<RequestValidator>,
}

pub struct ControlSession {
    inner: Arc<SessionInner>,
    shutdown: watch::Sender<bool>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl ControlSession {
    /// Create a disconnected session and start its heartbeat timer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: SessionConfig, control: ControlPlaneConfig) -> Result<Self, ControlError> {
        let client = Client::builder()
            .user_agent(control.user_agent.clone())
            .build()
            .map_err(ControlError::Client)?;
        let (origin, _) = OriginController::new(DEFAULT_UPSTREAM_URL);
        let interval = control.heartbeat_interval;

        let inner = Arc::new(SessionInner {
            client,
            control,
            config: tokio::sync::Mutex::new(config),
            connected: AtomicBool::new(false),
            origin,
            tls: Arc::new(TlsIdentityProvider::new()),
            validator: Arc::new(RequestValidator::new()),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let heartbeat = tokio::spawn(heartbeat_loop(Arc::clone(&inner), interval, shutdown_rx));

        Ok(Self {
            inner,
            shutdown,
            heartbeat: Mutex::new(Some(heartbeat)),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn handles(&self) -> SessionHandles {
        SessionHandles {
            origin: self.inner.origin.subscribe(),
            tls: Arc::clone(&self.inner.tls),
            validator: Arc::clone(&self.inner.validator),
        }
    }

    /// Register with the control plane. Does nothing if already connected.
    pub async fn connect(&self) -> Result<SessionHandles, ControlError> {
        let mut config = self.inner.config.lock().await;
        if self.is_connected() {
            return Ok(self.handles());
        }

        config.tls_created_at.clear();
        if let Err(err) = self.inner.ping(&mut config).await {
            error!(target: "cheetah::control", error = %err, "failed to connect to control plane");
            return Err(err);
        }

        self.inner.connected.store(true, Ordering::SeqCst);
        info!(target: "cheetah::control", "connected to control plane");
        Ok(self.handles())
    }

    /// Tell the control plane this node is going away. Does nothing if not connected.
    pub async fn disconnect(&self) -> Result<(), ControlError> {
        let config = self.inner.config.lock().await;
        if !self.is_connected() {
            return Ok(());
        }

        let request = StopRequest {
            secret: &config.client_secret,
        };
        if let Err(err) = self.inner.post::<_, StopResponse>("/stop", &request).await {
            error!(target: "cheetah::control", error = %err, "failed to disconnect from control plane");
            return Err(err);
        }

        self.inner.connected.store(false, Ordering::SeqCst);
        info!(target: "cheetah::control", "disconnected from control plane");
        Ok(())
    }

    /// Run one heartbeat exchange now, regardless of connection state.
    pub async fn ping(&self) -> Result<PingResponse, ControlError> {
        let mut config = self.inner.config.lock().await;
        self.inner.ping(&mut config).await
    }

    /// Stop the heartbeat timer and wait for it to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let heartbeat = self.heartbeat.lock().take();
        if let Some(heartbeat) = heartbeat {
            if let Err(err) = heartbeat.await {
                warn!(target: "cheetah::control", error = %err, "heartbeat task ended abnormally");
            }
        }
    }
}

impl Drop for ControlSession {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(heartbeat) = self.heartbeat.lock().take() {
            heartbeat.abort();
        }
    }
}

impl SessionInner {
    async fn ping(&self, config: &mut SessionConfig) -> Result<PingResponse, ControlError> {
        let response: PingResponse = self.post("/ping", &*config).await?;

        self.origin.update(&response.image_server);
        if let Some(tls) = &response.tls {
            config.tls_created_at = tls.created_at.clone();
            // A rejected pair is logged by the provider and the old one keeps serving.
            let _ = self.tls.update(tls);
        }
        let _ = self
            .validator
            .update(response.disable_tokens, &response.token_key);

        info!(
            target: "cheetah::control",
            client_id = %response.client_id,
            build = config.build_version,
            latest_build = response.latest_build,
            compromised = response.compromised,
            paused = response.paused,
            cert_included = response.tls.is_some(),
            "control plane heartbeat"
        );
        info!(
            target: "cheetah::control",
            validate_tokens = !response.disable_tokens,
            token_key = %response.token_key,
            public_url = %response.url,
            upstream_url = %response.image_server,
            "control plane settings"
        );
        if response.latest_build > config.build_version {
            warn!(target: "cheetah::control", latest_build = response.latest_build, "a newer build is available");
        }
        Ok(response)
    }

    async fn post<P, R>(&self, endpoint: &str, payload: &P) -> Result<R, ControlError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}{endpoint}", self.control.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .json(payload)
            .send()
            .await
            .map_err(|source| ControlError::Transport {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(ControlError::Status { url, status });
        }
        response
            .json::<R>()
            .await
            .map_err(|source| ControlError::Decode { url, source })
    }
}

async fn heartbeat_loop(
    inner: Arc<SessionInner>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut config = inner.config.lock().await;
                if !inner.connected.load(Ordering::SeqCst) {
                    continue;
                }
                if let Err(err) = inner.ping(&mut config).await {
                    warn!(target: "cheetah::control", error = %err, "heartbeat failed; retrying next tick");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!(target: "cheetah::control", "heartbeat stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn cache_size_is_clamped_and_defaulted() {
        assert_eq!(normalize_cache_size(0), DEFAULT_CACHE_SIZE);
        assert_eq!(normalize_cache_size(1), MIN_CACHE_SIZE);
        assert_eq!(normalize_cache_size(MIN_CACHE_SIZE + 1), MIN_CACHE_SIZE + 1);
    }

    #[test]
    fn ping_request_omits_empty_optionals() {
        let config = SessionConfig::new("s3cret", "", 443, 0, 0);
        let value = serde_json::to_value(&config).expect("json");
        assert_eq!(
            value,
            json!({
                "secret": "s3cret",
                "port": 443,
                "disk_space": DEFAULT_CACHE_SIZE,
                "network_speed": 0,
                "build_version": BUILD_VERSION,
            })
        );

        let mut config = SessionConfig::new("s3cret", "203.0.113.7", 443, 0, 0);
        config.tls_created_at = "2024-01-01T00:00:00Z".into();
        let value = serde_json::to_value(&config).expect("json");
        assert_eq!(value["ip_address"], "203.0.113.7");
        assert_eq!(value["tls_created_at"], "2024-01-01T00:00:00Z");
    }

    #[test]
    fn ping_response_tls_block_is_optional() {
        let body = json!({
            "client_id": "node-1",
            "url": "https://node-1.example",
            "paused": false,
            "compromised": false,
            "latest_build": 31,
            "image_server": "https://origin.example",
            "token_key": "",
            "disable_tokens": true,
        });
        let response: PingResponse = serde_json::from_value(body).expect("decode");
        assert!(response.tls.is_none());
        assert_eq!(response.image_server, "https://origin.example");
    }

    #[test]
    fn stop_response_is_empty_object() {
        let _: StopResponse = serde_json::from_str("{}").expect("decode");
    }
}
