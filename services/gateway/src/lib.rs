// gateway: The corelink device gateway service.
//
// Terminates long-lived encrypted connections from embedded devices and
// multiplexes them against the backend API and the event bus. Each
// accepted socket runs the handshake, then a per-device session actor
// owns the connection until disconnect.

pub mod api;
pub mod cipher;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod flasher;
pub mod handshake;
pub mod publisher;
pub mod session;
pub mod state;

pub use api::{ApiCommand, ApiReply, PingStatus};
pub use config::{GatewayConfig, load_config, load_config_from_path, load_config_from_str};
pub use error::GatewayError;
pub use state::GatewayState;

use cipher::{FrameReader, FrameWriter};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Run the full per-device lifecycle on an accepted socket: handshake,
/// session registration, then the session actor until disconnect.
pub async fn handle_connection<S>(socket: S, state: Arc<GatewayState>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(socket);
    let handshake_timeout = Duration::from_millis(state.config.protocol.socket_timeout_ms);
    let outcome = tokio::time::timeout(
        handshake_timeout,
        handshake::perform(
            &mut read_half,
            &mut write_half,
            state.keystore.as_ref(),
            &state.server_key,
        ),
    )
    .await;
    let (device_id, session_key) = match outcome {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            warn!(error = %e, "handshake failed");
            return;
        }
        Err(_) => {
            warn!("handshake timed out");
            return;
        }
    };
    info!(device_id = %device_id, "device connected");

    let reader = FrameReader::new(read_half, &session_key);
    let writer = FrameWriter::new(write_half, &session_key);
    let (command_tx, command_rx) = mpsc::channel(16);
    let (event_tx, event_rx) = mpsc::channel(64);
    let serial = state.register_session(device_id, command_tx).await;
    session::run_session(
        state, device_id, serial, reader, writer, command_rx, event_tx, event_rx,
    )
    .await;
}

/// Accept loop: one spawned task per device socket, until shutdown flips.
pub async fn serve(
    listener: TcpListener,
    state: Arc<GatewayState>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let _ = socket.set_nodelay(true);
                    debug!(peer = %peer, "accepted connection");
                    tokio::spawn(handle_connection(socket, state.clone()));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    info!("accept loop stopped");
}
