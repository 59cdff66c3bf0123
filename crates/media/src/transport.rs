//! Transport adapter: media datagrams plus the reliable control sub-channel.
//!
//! The engine never touches the socket. It holds a [`TransportHandle`] of
//! four channels; a driver task bridges those to a QUIC connection
//! (datagrams for media, one bidirectional stream of newline-delimited JSON
//! for control). An in-memory pair with the same shape backs loopback runs
//! and the integration tests.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chorus_protocol::control::ControlMessage;

/// ALPN identifier; must match the relay.
pub const ALPN: &[u8] = b"chorus-media/1";

const DATAGRAM_CAPACITY: usize = 64;
const CONTROL_CAPACITY: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid relay address: {0}")]
    Address(String),
    #[error("tls configuration: {0}")]
    Tls(String),
    #[error("connect: {0}")]
    Connect(#[from] quinn::ConnectError),
    #[error("connection: {0}")]
    Connection(#[from] quinn::ConnectionError),
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// The engine's side of the transport.
///
/// Outbound sends are fire-and-forget: the driver owns queueing and logs
/// failures. A closed `datagram_rx`/`control_rx` means the transport is gone.
pub struct TransportHandle {
    pub datagram_tx: mpsc::Sender<Bytes>,
    pub datagram_rx: mpsc::Receiver<Bytes>,
    pub control_tx: mpsc::Sender<ControlMessage>,
    pub control_rx: mpsc::Receiver<ControlMessage>,
}

/// Two connected in-memory transports. What one side sends the other
/// receives, with the same bounded-channel drop behavior as the real thing.
pub fn memory_pair() -> (TransportHandle, TransportHandle) {
    let (a_dgram_tx, b_dgram_rx) = mpsc::channel(DATAGRAM_CAPACITY);
    let (b_dgram_tx, a_dgram_rx) = mpsc::channel(DATAGRAM_CAPACITY);
    let (a_ctrl_tx, b_ctrl_rx) = mpsc::channel(CONTROL_CAPACITY);
    let (b_ctrl_tx, a_ctrl_rx) = mpsc::channel(CONTROL_CAPACITY);
    (
        TransportHandle {
            datagram_tx: a_dgram_tx,
            datagram_rx: a_dgram_rx,
            control_tx: a_ctrl_tx,
            control_rx: a_ctrl_rx,
        },
        TransportHandle {
            datagram_tx: b_dgram_tx,
            datagram_rx: b_dgram_rx,
            control_tx: b_ctrl_tx,
            control_rx: b_ctrl_rx,
        },
    )
}

/// Split `quic://host:port` into (SNI name, host, port).
pub fn parse_relay_addr(url: &str) -> Result<(String, u16), TransportError> {
    let trimmed = url.strip_prefix("quic://").unwrap_or(url);
    let colon = trimmed
        .rfind(':')
        .ok_or_else(|| TransportError::Address(format!("missing port in {url}")))?;
    let host = &trimmed[..colon];
    let port: u16 = trimmed[colon + 1..]
        .parse()
        .map_err(|_| TransportError::Address(format!("bad port in {url}")))?;
    if host.is_empty() {
        return Err(TransportError::Address(format!("missing host in {url}")));
    }
    Ok((host.to_string(), port))
}

fn client_config() -> Result<quinn::ClientConfig, TransportError> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let mut tls = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    tls.alpn_protocols = vec![ALPN.to_vec()];
    let quic = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    Ok(quinn::ClientConfig::new(Arc::new(quic)))
}

/// Connect to the media relay over QUIC and spawn the driver task.
///
/// The returned handle is live until `cancel` fires or the connection dies;
/// either way the handle's receive channels close.
pub async fn connect_quic(
    url: &str,
    connect_timeout: Duration,
    cancel: CancellationToken,
) -> Result<TransportHandle, TransportError> {
    let (host, port) = parse_relay_addr(url)?;
    let addr = tokio::net::lookup_host((host.as_str(), port))
        .await?
        .next()
        .ok_or_else(|| TransportError::Address(format!("dns resolution failed for {host}")))?;

    let mut endpoint = quinn::Endpoint::client("0.0.0.0:0".parse().expect("wildcard bind addr"))?;
    endpoint.set_default_client_config(client_config()?);

    let connecting = endpoint.connect(addr, &host)?;
    let connection = tokio::time::timeout(connect_timeout, connecting)
        .await
        .map_err(|_| TransportError::Timeout(connect_timeout))??;
    info!(%addr, "Media transport connected");

    let (control_send, control_recv) = connection.open_bi().await?;

    let (out_dgram_tx, out_dgram_rx) = mpsc::channel(DATAGRAM_CAPACITY);
    let (in_dgram_tx, in_dgram_rx) = mpsc::channel(DATAGRAM_CAPACITY);
    let (out_ctrl_tx, out_ctrl_rx) = mpsc::channel(CONTROL_CAPACITY);
    let (in_ctrl_tx, in_ctrl_rx) = mpsc::channel(CONTROL_CAPACITY);

    tokio::spawn(drive(
        endpoint,
        connection,
        control_send,
        control_recv,
        out_dgram_rx,
        in_dgram_tx,
        out_ctrl_rx,
        in_ctrl_tx,
        cancel,
    ));

    Ok(TransportHandle {
        datagram_tx: out_dgram_tx,
        datagram_rx: in_dgram_rx,
        control_tx: out_ctrl_tx,
        control_rx: in_ctrl_rx,
    })
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    endpoint: quinn::Endpoint,
    connection: quinn::Connection,
    mut control_send: quinn::SendStream,
    mut control_recv: quinn::RecvStream,
    mut out_dgram_rx: mpsc::Receiver<Bytes>,
    in_dgram_tx: mpsc::Sender<Bytes>,
    mut out_ctrl_rx: mpsc::Receiver<ControlMessage>,
    in_ctrl_tx: mpsc::Sender<ControlMessage>,
    cancel: CancellationToken,
) {
    let mut line_buf: Vec<u8> = Vec::with_capacity(4096);
    let mut read_chunk = [0u8; 4096];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                connection.close(0u32.into(), b"disconnect");
                break;
            }
            outbound = out_dgram_rx.recv() => {
                match outbound {
                    Some(datagram) => {
                        if let Err(e) = connection.send_datagram(datagram) {
                            debug!("Datagram send failed: {e}");
                        }
                    }
                    None => {
                        connection.close(0u32.into(), b"engine closed");
                        break;
                    }
                }
            }
            inbound = connection.read_datagram() => {
                match inbound {
                    Ok(datagram) => {
                        // Drop rather than stall the socket when the engine
                        // falls behind.
                        let _ = in_dgram_tx.try_send(datagram);
                    }
                    Err(e) => {
                        info!("Media transport closed: {e}");
                        break;
                    }
                }
            }
            outbound = out_ctrl_rx.recv() => {
                match outbound {
                    Some(message) => {
                        let mut line = match serde_json::to_vec(&message) {
                            Ok(line) => line,
                            Err(e) => {
                                warn!("Control message serialization failed: {e}");
                                continue;
                            }
                        };
                        line.push(b'\n');
                        if let Err(e) = control_send.write_all(&line).await {
                            info!("Control channel write failed: {e}");
                            break;
                        }
                    }
                    None => {
                        connection.close(0u32.into(), b"engine closed");
                        break;
                    }
                }
            }
            read = control_recv.read(&mut read_chunk) => {
                match read {
                    Ok(Some(n)) => {
                        line_buf.extend_from_slice(&read_chunk[..n]);
                        while let Some(pos) = line_buf.iter().position(|&b| b == b'\n') {
                            let line: Vec<u8> = line_buf.drain(..=pos).collect();
                            match serde_json::from_slice::<ControlMessage>(&line[..line.len() - 1]) {
                                Ok(message) => {
                                    let _ = in_ctrl_tx.try_send(message);
                                }
                                Err(e) => {
                                    debug!("Dropping malformed control message: {e}");
                                }
                            }
                        }
                    }
                    Ok(None) => {
                        info!("Control channel closed by relay");
                        break;
                    }
                    Err(e) => {
                        info!("Control channel read failed: {e}");
                        break;
                    }
                }
            }
        }
    }
    // Dropping the in_* senders closes the engine-facing receivers, which is
    // how the engine observes transport death.
    drop(endpoint);
}
