//! Per-server gateway session: websocket state machine with heartbeat,
//! identify/resume, and reconnect backoff.
//!
//! One task per server. The session parses `{op, d, s, t}` frames, keeps the
//! resume cursor, and forwards decoded dispatch events to the app; the app
//! pushes outbound frames (presence, voice state) through the outbox.

use std::time::{Duration, Instant};

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chorus_protocol::config::GatewayConfig;
use chorus_protocol::gateway::{
    DispatchEvent, GatewayFrame, Hello, OP_DISPATCH, OP_HEARTBEAT_ACK, OP_HELLO,
    OP_INVALID_SESSION, OP_RECONNECT,
};

pub struct SessionConfig {
    pub server_id: String,
    /// Websocket URL of the gateway endpoint.
    pub url: String,
    pub token: String,
    pub gateway: GatewayConfig,
}

#[derive(Debug)]
pub enum GatewayEvent {
    Connected { session_id: String },
    Disconnected { reason: String },
    Dispatch(DispatchEvent),
}

/// Delay before the `attempt`-th reconnect (1-based): doubles from the base,
/// capped.
pub fn reconnect_delay_ms(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
    let exponent = attempt.saturating_sub(1).min(20);
    base_ms.saturating_mul(1u64 << exponent).min(max_ms)
}

/// Delay before re-identifying after INVALID_SESSION.
fn invalid_session_delay() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(1000..5000))
}

struct SessionState {
    session_id: Option<String>,
    last_sequence: Option<u64>,
}

enum CloseReason {
    Cancelled,
    /// Server asked us to cycle the connection (op 7).
    Reconnect,
    StreamEnded,
}

/// Drive one server's gateway session until cancelled or out of reconnect
/// attempts.
pub async fn run_session(
    config: SessionConfig,
    mut outbox: mpsc::Receiver<GatewayFrame>,
    events: mpsc::Sender<GatewayEvent>,
    cancel: CancellationToken,
) {
    let mut state = SessionState { session_id: None, last_sequence: None };
    let mut attempts: u32 = 0;
    loop {
        match connect_and_handle(&config, &mut state, &mut attempts, &mut outbox, &events, &cancel)
            .await
        {
            Ok(CloseReason::Cancelled) => break,
            Ok(CloseReason::Reconnect) => {
                info!(server = config.server_id, "Server requested reconnect");
            }
            Ok(CloseReason::StreamEnded) => {
                info!(server = config.server_id, "Gateway connection closed");
            }
            Err(e) => {
                warn!(server = config.server_id, "Gateway connection error: {e:#}");
            }
        }
        if cancel.is_cancelled() {
            break;
        }
        attempts += 1;
        if attempts > config.gateway.max_reconnect_attempts {
            let _ = events
                .send(GatewayEvent::Disconnected {
                    reason: "reconnect attempts exhausted".into(),
                })
                .await;
            break;
        }
        let delay = reconnect_delay_ms(
            attempts,
            config.gateway.backoff_base_ms,
            config.gateway.backoff_max_ms,
        );
        info!(server = config.server_id, attempt = attempts, delay_ms = delay, "Reconnecting");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
        }
    }
    let _ = events
        .send(GatewayEvent::Disconnected { reason: "session ended".into() })
        .await;
}

async fn send_frame<S>(ws_tx: &mut S, frame: &GatewayFrame) -> anyhow::Result<()>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let json = serde_json::to_string(frame).context("serialize gateway frame")?;
    ws_tx.send(Message::text(json)).await.context("gateway send")?;
    Ok(())
}

async fn connect_and_handle(
    config: &SessionConfig,
    state: &mut SessionState,
    attempts: &mut u32,
    outbox: &mut mpsc::Receiver<GatewayFrame>,
    events: &mpsc::Sender<GatewayEvent>,
    cancel: &CancellationToken,
) -> anyhow::Result<CloseReason> {
    let (ws, _) = tokio_tungstenite::connect_async(config.url.as_str())
        .await
        .context("gateway websocket connect")?;
    info!(server = config.server_id, url = config.url, "Gateway connected");
    let (mut ws_tx, mut ws_rx) = ws.split();

    let mut heartbeat: Option<tokio::time::Interval> = None;
    let mut heartbeat_interval = Duration::from_secs(45);
    let mut last_ack = Instant::now();
    let mut outbox_open = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                return Ok(CloseReason::Cancelled);
            }
            // No heartbeat runs until HELLO has set the interval.
            _ = async {
                match heartbeat.as_mut() {
                    Some(hb) => {
                        hb.tick().await;
                    }
                    None => std::future::pending().await,
                }
            } => {
                // Liveness watchdog: a gateway that stops acking is dead
                // even if the TCP stream looks healthy.
                if last_ack.elapsed() > heartbeat_interval * 2 {
                    anyhow::bail!("no heartbeat ack within two intervals");
                }
                send_frame(&mut ws_tx, &GatewayFrame::heartbeat(state.last_sequence)).await?;
            }
            frame = outbox.recv(), if outbox_open => {
                match frame {
                    Some(frame) => send_frame(&mut ws_tx, &frame).await?,
                    None => outbox_open = false,
                }
            }
            msg = ws_rx.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => return Ok(CloseReason::StreamEnded),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(e.into()),
                };
                let frame: GatewayFrame = match serde_json::from_str(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("Dropping malformed gateway frame: {e}");
                        continue;
                    }
                };
                match frame.op {
                    OP_HELLO => {
                        let hello: Hello = match serde_json::from_value(frame.d) {
                            Ok(hello) => hello,
                            Err(e) => {
                                debug!("Dropping malformed HELLO: {e}");
                                continue;
                            }
                        };
                        heartbeat_interval = Duration::from_millis(hello.heartbeat_interval);
                        let mut hb = tokio::time::interval(heartbeat_interval);
                        hb.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                        heartbeat = Some(hb);
                        last_ack = Instant::now();

                        // Resume when we hold a session, identify otherwise.
                        match (&state.session_id, state.last_sequence) {
                            (Some(session_id), Some(seq)) => {
                                info!(server = config.server_id, session_id, seq, "Resuming session");
                                send_frame(
                                    &mut ws_tx,
                                    &GatewayFrame::resume(&config.token, session_id, seq),
                                )
                                .await?;
                            }
                            _ => {
                                send_frame(&mut ws_tx, &GatewayFrame::identify(&config.token))
                                    .await?;
                            }
                        }
                    }
                    OP_HEARTBEAT_ACK => {
                        last_ack = Instant::now();
                    }
                    OP_DISPATCH => {
                        if let Some(seq) = frame.s {
                            state.last_sequence = Some(seq);
                        }
                        let Some(name) = frame.t else {
                            debug!("DISPATCH without event name");
                            continue;
                        };
                        match DispatchEvent::parse(&name, frame.d) {
                            None => {
                                debug!(event = name, "Dropping malformed dispatch payload");
                            }
                            Some(DispatchEvent::Ready(ready)) => {
                                state.session_id = Some(ready.session_id.clone());
                                *attempts = 0;
                                let _ = events
                                    .send(GatewayEvent::Connected {
                                        session_id: ready.session_id.clone(),
                                    })
                                    .await;
                                let _ = events
                                    .send(GatewayEvent::Dispatch(DispatchEvent::Ready(ready)))
                                    .await;
                            }
                            Some(event) => {
                                let _ = events.send(GatewayEvent::Dispatch(event)).await;
                            }
                        }
                    }
                    OP_RECONNECT => return Ok(CloseReason::Reconnect),
                    OP_INVALID_SESSION => {
                        warn!(server = config.server_id, "Session invalidated, re-identifying");
                        state.session_id = None;
                        tokio::time::sleep(invalid_session_delay()).await;
                        send_frame(&mut ws_tx, &GatewayFrame::identify(&config.token)).await?;
                    }
                    other => {
                        debug!(op = other, "Ignoring unknown opcode");
                    }
                }
            }
        }
    }
}
