mod app;
mod auth;
mod cli;
mod dispatch;
mod gateway;
mod voice;

use anyhow::Context;
use tracing::{info, warn};

use chorus_media::engine::EngineEvent;
use chorus_protocol::config::ClientConfig;

use app::{App, Registry};
use auth::Identity;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Needed for the gateway websocket and the QUIC transport alike.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = cli::parse_args()?;

    let config: ClientConfig = match &args.config_path {
        Some(path) => {
            let raw = std::fs::read_to_string(path).with_context(|| format!("read {path}"))?;
            toml::from_str(&raw).with_context(|| format!("parse {path}"))?
        }
        None => toml::from_str("").expect("empty config is valid"),
    };
    if let Err(issues) = config.validate() {
        for issue in &issues {
            warn!("{issue}");
        }
        if issues.iter().any(|i| i.starts_with("ERROR")) {
            anyhow::bail!("configuration is invalid");
        }
    }

    let registry_path = std::path::PathBuf::from(
        args.registry_path.as_deref().unwrap_or("servers.toml"),
    );
    let registry = Registry::load(&registry_path)?;

    // Key persistence is a separate concern; each run signs with a fresh
    // identity and re-authenticates where no token is stored.
    let identity = Identity::generate();
    let mut app = App::new(config.clone(), identity, registry, registry_path);
    info!(known_servers = app.registry().servers.len(), "Registry loaded");

    for server in &args.servers {
        if let Err(e) = app.connect_server(server, &args.username).await {
            warn!(server, "Failed to connect: {e:#}");
        }
    }

    let mut voice_session = None;
    if let Some(relay) = &args.relay {
        match voice::connect_voice(&config.media, relay).await {
            Ok((session, mut events)) => {
                tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        match event {
                            EngineEvent::Joined { ssrc } => info!(ssrc, "Joined voice"),
                            EngineEvent::ParticipantJoined { user_id, .. } => {
                                info!(user_id, "Participant joined voice");
                            }
                            EngineEvent::ParticipantLeft { user_id, .. } => {
                                info!(user_id, "Participant left voice");
                            }
                            EngineEvent::Speaking { user_id, speaking } => {
                                info!(user_id, speaking, "Speaking changed");
                            }
                            EngineEvent::Disconnected { reason } => {
                                info!(reason, "Voice disconnected");
                            }
                            EngineEvent::VideoError { message } => warn!("Video: {message}"),
                            EngineEvent::FatalError { message } => warn!("Voice: {message}"),
                            EngineEvent::Stats(stats) => {
                                tracing::debug!(
                                    sent = stats.packets_sent,
                                    received = stats.packets_received,
                                    "Voice stats"
                                );
                            }
                        }
                    }
                });
                voice_session = Some(session);
            }
            Err(e) => warn!(relay, "Voice connect failed: {e:#}"),
        }
    }

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
    }

    if let Some(session) = voice_session {
        session.disconnect().await;
    }
    for server in &args.servers {
        if let Some((connected, guilds)) = app.snapshot(server).await {
            info!(server, connected, guilds, "Disconnecting server");
        }
    }
    app.shutdown().await;
    info!("Client shutdown complete");
    Ok(())
}
