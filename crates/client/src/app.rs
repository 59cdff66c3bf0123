//! The app aggregate: one object owning every per-server session, the
//! signing identity, and the persisted server registry. Subsystems receive
//! it by reference; nothing in the client is a global.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use chorus_protocol::config::ClientConfig;
use chorus_protocol::gateway::{GatewayFrame, OP_PRESENCE_UPDATE};

use crate::auth::{AuthClient, AuthError, Identity};
use crate::dispatch::ClientState;
use crate::gateway::{GatewayEvent, SessionConfig, run_session};

/// Persisted per-server state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    pub server_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// On-disk registry of known servers plus recognized activity app ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default)]
    pub servers: Vec<ServerRecord>,
    #[serde(default)]
    pub known_activity_apps: Vec<String>,
}

impl Registry {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => toml::from_str(&raw).context("parse server registry"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).context("read server registry"),
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("create registry directory")?;
        }
        let raw = toml::to_string_pretty(self).context("serialize server registry")?;
        std::fs::write(path, raw).context("write server registry")
    }

    pub fn record(&self, server_url: &str) -> Option<&ServerRecord> {
        self.servers.iter().find(|r| r.server_url == server_url)
    }

    pub fn record_mut(&mut self, server_url: &str) -> &mut ServerRecord {
        if let Some(index) = self.servers.iter().position(|r| r.server_url == server_url) {
            return &mut self.servers[index];
        }
        self.servers.push(ServerRecord {
            server_url: server_url.to_string(),
            token: None,
            user_id: None,
        });
        self.servers.last_mut().expect("just pushed")
    }
}

/// `https://host` → `wss://host/gateway` (and http → ws).
pub fn gateway_url_for(server_url: &str) -> String {
    let trimmed = server_url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}/gateway")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}/gateway")
    } else {
        format!("wss://{trimmed}/gateway")
    }
}

/// A live gateway session plus its cached server state.
pub struct ServerHandle {
    state: Arc<Mutex<ClientState>>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    session_task: tokio::task::JoinHandle<()>,
    pump_task: tokio::task::JoinHandle<()>,
}

pub struct App {
    config: ClientConfig,
    identity: Identity,
    registry: Registry,
    registry_path: PathBuf,
    servers: HashMap<String, ServerHandle>,
}

impl App {
    pub fn new(
        config: ClientConfig,
        identity: Identity,
        registry: Registry,
        registry_path: PathBuf,
    ) -> Self {
        Self {
            config,
            identity,
            registry,
            registry_path,
            servers: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// (connected, cached guild count) for one server, for status display.
    pub async fn snapshot(&self, server_url: &str) -> Option<(bool, usize)> {
        let handle = self.servers.get(server_url)?;
        let guilds = handle.state.lock().await.guilds.len();
        Some((handle.connected.load(Ordering::Relaxed), guilds))
    }

    /// Connect one server: authenticate if no token is stored, then start
    /// the gateway session and its event pump.
    pub async fn connect_server(&mut self, server_url: &str, username: &str) -> anyhow::Result<()> {
        if self.servers.contains_key(server_url) {
            return Ok(());
        }
        let stored = self.registry.record(server_url).and_then(|r| r.token.clone());
        let token = match stored {
            Some(token) => token,
            None => {
                let auth = AuthClient::new(server_url.trim_end_matches('/'));
                let verified = match auth.authenticate(&self.identity, username, None).await {
                    Ok(verified) => verified,
                    Err(AuthError::Rejected) => {
                        self.handle_auth_failure(server_url).await;
                        anyhow::bail!("{server_url} rejected our credentials");
                    }
                    Err(e) => return Err(e).context("authenticate"),
                };
                let record = self.registry.record_mut(server_url);
                record.token = Some(verified.token.clone());
                record.user_id = Some(verified.user.id.clone());
                self.registry.save(&self.registry_path)?;
                verified.token
            }
        };

        let state = Arc::new(Mutex::new(ClientState::default()));
        let connected = Arc::new(AtomicBool::new(false));
        let (outbox_tx, outbox_rx) = mpsc::channel(32);
        let (event_tx, mut event_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let session_config = SessionConfig {
            server_id: server_url.to_string(),
            url: gateway_url_for(server_url),
            token,
            gateway: self.config.gateway.clone(),
        };
        let session_task = tokio::spawn(run_session(
            session_config,
            outbox_rx,
            event_tx,
            cancel.clone(),
        ));

        let pump_state = Arc::clone(&state);
        let pump_connected = Arc::clone(&connected);
        let pump_server = server_url.to_string();
        let pump_outbox = outbox_tx;
        let pump_task = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                match event {
                    GatewayEvent::Connected { session_id } => {
                        info!(server = pump_server, session_id, "Gateway session ready");
                        pump_connected.store(true, Ordering::Relaxed);
                        let presence = GatewayFrame {
                            op: OP_PRESENCE_UPDATE,
                            d: serde_json::json!({ "status": "online" }),
                            s: None,
                            t: None,
                        };
                        let _ = pump_outbox.send(presence).await;
                    }
                    GatewayEvent::Disconnected { reason } => {
                        info!(server = pump_server, reason, "Gateway session down");
                        pump_connected.store(false, Ordering::Relaxed);
                    }
                    GatewayEvent::Dispatch(dispatch) => {
                        pump_state.lock().await.apply(&dispatch);
                    }
                }
            }
        });

        self.servers.insert(
            server_url.to_string(),
            ServerHandle { state, connected, cancel, session_task, pump_task },
        );
        Ok(())
    }

    pub async fn disconnect_server(&mut self, server_url: &str) {
        let Some(handle) = self.servers.remove(server_url) else {
            return;
        };
        handle.cancel.cancel();
        if let Err(e) = handle.session_task.await {
            warn!(server = server_url, "Session task panicked: {e:?}");
        }
        if let Err(e) = handle.pump_task.await {
            warn!(server = server_url, "Event pump panicked: {e:?}");
        }
        info!(server = server_url, "Server disconnected");
    }

    /// A rejected REST call invalidates the stored token and tears the
    /// server down.
    pub async fn handle_auth_failure(&mut self, server_url: &str) {
        if let Some(record) = self
            .registry
            .servers
            .iter_mut()
            .find(|r| r.server_url == server_url)
        {
            record.token = None;
            if let Err(e) = self.registry.save(&self.registry_path) {
                warn!("Failed to persist registry: {e:#}");
            }
        }
        self.disconnect_server(server_url).await;
        warn!(server = server_url, "Cleared token after auth failure");
    }

    pub async fn shutdown(&mut self) {
        let urls: Vec<String> = self.servers.keys().cloned().collect();
        for url in urls {
            self.disconnect_server(&url).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("chorus-test-{}-{name}", std::process::id()))
    }

    #[test]
    fn registry_roundtrips_through_toml() {
        let path = temp_path("registry.toml");
        let mut registry = Registry::default();
        registry.servers.push(ServerRecord {
            server_url: "https://chat.example.com".into(),
            token: Some("tok".into()),
            user_id: Some("u1".into()),
        });
        registry.known_activity_apps.push("app-1".into());
        registry.save(&path).unwrap();

        let loaded = Registry::load(&path).unwrap();
        assert_eq!(loaded.servers.len(), 1);
        assert_eq!(loaded.servers[0].token.as_deref(), Some("tok"));
        assert_eq!(loaded.known_activity_apps, vec!["app-1"]);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_registry_loads_empty() {
        let registry = Registry::load(&temp_path("does-not-exist.toml")).unwrap();
        assert!(registry.servers.is_empty());
    }

    #[test]
    fn record_mut_inserts_once() {
        let mut registry = Registry::default();
        registry.record_mut("https://a.example").token = Some("t1".into());
        registry.record_mut("https://a.example").user_id = Some("u1".into());
        assert_eq!(registry.servers.len(), 1);
        assert_eq!(registry.servers[0].token.as_deref(), Some("t1"));
    }

    #[test]
    fn gateway_url_mapping() {
        assert_eq!(gateway_url_for("https://chat.example.com"), "wss://chat.example.com/gateway");
        assert_eq!(gateway_url_for("http://localhost:8080/"), "ws://localhost:8080/gateway");
        assert_eq!(gateway_url_for("chat.example.com"), "wss://chat.example.com/gateway");
    }

    #[tokio::test]
    async fn auth_failure_clears_token() {
        let path = temp_path("auth-failure.toml");
        let mut registry = Registry::default();
        registry.record_mut("https://b.example").token = Some("stale".into());
        let mut app = App::new(
            ClientConfig { media: Default::default(), gateway: Default::default() },
            Identity::from_seed([3u8; 32]),
            registry,
            path.clone(),
        );
        app.handle_auth_failure("https://b.example").await;
        assert!(app.registry().record("https://b.example").unwrap().token.is_none());
        // The cleared token is persisted too.
        let reloaded = Registry::load(&path).unwrap();
        assert!(reloaded.record("https://b.example").unwrap().token.is_none());
        std::fs::remove_file(&path).unwrap();
    }
}
