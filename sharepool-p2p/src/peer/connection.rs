//! Per-peer read/write task.
//!
//! Each TCP link runs in its own task. The task owns the framed socket, the
//! idle deadline and the outbound ping timer; everything stateful beyond that
//! lives with the coordinator and is reached via channels.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::codec::Framed;

use crate::config::{P2pConfig, CAPABILITY_PREFIX};
use crate::error::P2pError;
use crate::peer::PeerId;
use crate::protocol::{FrameCodec, Inbound, Message};

/// Commands the coordinator sends to a peer task.
#[derive(Debug)]
pub enum PeerCommand {
    /// Frame and write a message.
    Send(Message),
    /// Close the link.
    Disconnect,
}

/// Events a peer task sends to the coordinator.
#[derive(Debug)]
pub enum PeerEvent {
    /// A message arrived from the peer.
    Message {
        /// Originating connection.
        peer_id: PeerId,
        /// The decoded message.
        message: Box<Message>,
    },
    /// The link closed. Sent exactly once per connection.
    Disconnected {
        /// The closed connection.
        peer_id: PeerId,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Spawn the read/write task for an established TCP stream.
///
/// Returns the command channel and the task handle. The task emits
/// `Disconnected` exactly once, on any socket error, FIN, idle expiry,
/// protocol violation or disconnect command.
pub fn spawn_peer_connection(
    peer_id: PeerId,
    addr: SocketAddr,
    stream: TcpStream,
    event_tx: mpsc::Sender<PeerEvent>,
    config: Arc<P2pConfig>,
) -> (mpsc::UnboundedSender<PeerCommand>, JoinHandle<()>) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();

    let handle = tokio::spawn(async move {
        let reason = run_connection(peer_id, addr, stream, command_rx, &event_tx, &config).await;
        tracing::debug!(peer = %peer_id, addr = %addr, reason = %reason, "Connection closed");
        let _ = event_tx
            .send(PeerEvent::Disconnected { peer_id, reason })
            .await;
    });

    (command_tx, handle)
}

async fn run_connection(
    peer_id: PeerId,
    addr: SocketAddr,
    stream: TcpStream,
    mut command_rx: mpsc::UnboundedReceiver<PeerCommand>,
    event_tx: &mpsc::Sender<PeerEvent>,
    config: &P2pConfig,
) -> String {
    let mut framed = Framed::new(stream, FrameCodec::new(config.magic));
    let mut is_js2pool = false;

    // The idle deadline is re-armed only by inbound traffic.
    let idle = sleep_until(Instant::now() + config.idle_timeout);
    tokio::pin!(idle);

    let mut ping_timer = tokio::time::interval(config.ping_interval);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Skip the interval's immediate first tick; version goes out first.
    ping_timer.reset();

    // The coordinator's protocol reactions happen on its task; this loop only
    // frames traffic, answers pings, and watches the deadline.
    loop {
        tokio::select! {
            command = command_rx.recv() => match command {
                Some(PeerCommand::Send(message)) => {
                    tracing::trace!(peer = %peer_id, msg = %message, "Sending");
                    if let Err(e) = framed.send(message).await {
                        return format!("write error: {}", e);
                    }
                }
                Some(PeerCommand::Disconnect) | None => {
                    return "disconnect requested".to_string();
                }
            },

            _ = ping_timer.tick() => {
                if framed.send(Message::Ping).await.is_err() {
                    return "write error on ping".to_string();
                }
            }

            _ = &mut idle => {
                return "idle timeout".to_string();
            }

            frame = framed.next() => {
                idle.as_mut().reset(Instant::now() + config.idle_timeout);
                match frame {
                    None => return "connection closed by peer".to_string(),
                    Some(Err(e)) => return close_reason(e),
                    Some(Ok(Inbound::Unknown(command))) => {
                        tracing::debug!(peer = %peer_id, command = %command, "Unknown command");
                    }
                    Some(Ok(Inbound::Message(message))) => {
                        tracing::trace!(peer = %peer_id, addr = %addr, msg = %message, "Received");
                        match message {
                            Message::Ping => {
                                // Legacy peers expect their ping echoed as a
                                // ping; capable peers get a pong.
                                let answer = if is_js2pool { Message::Pong } else { Message::Ping };
                                if framed.send(answer).await.is_err() {
                                    return "write error on ping answer".to_string();
                                }
                            }
                            Message::Pong => {
                                // Liveness only; the deadline reset above is
                                // the whole effect.
                            }
                            other => {
                                if let Message::Version(v) = &other {
                                    is_js2pool = v.sub_version.starts_with(CAPABILITY_PREFIX);
                                }
                                let event = PeerEvent::Message {
                                    peer_id,
                                    message: Box::new(other),
                                };
                                if event_tx.send(event).await.is_err() {
                                    return "coordinator gone".to_string();
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

fn close_reason(error: P2pError) -> String {
    match &error {
        P2pError::BadMagic { .. } => "Bad magic number".to_string(),
        P2pError::BadChecksum { .. } => "Bad checksum".to_string(),
        _ => error.to_string(),
    }
}
