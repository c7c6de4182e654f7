//! Listener task shape: accept connections, split into lines, hand each line
//! to a wire-format decoder. The decoder itself — actual Wavefront/Graphite/
//! OpenTSDB line-protocol parsing — is an external collaborator this crate
//! doesn't implement; what's here is the accept-loop plumbing every listener
//! needs regardless of the wire format it speaks.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tproxy_core::{EntityHandler, PointPreprocessor};

/// Decodes one line of input into a point, or `None` if the line is
/// malformed. Supplied by whatever wire format a given handle speaks.
pub type LineDecoder = Arc<dyn Fn(&str) -> Option<tproxy_core::Point> + Send + Sync>;

/// Binds `addr`, accepts connections, and feeds decoded points through
/// `preprocessor` into `handler`. Runs until `shutdown_rx` fires.
pub fn spawn_point_line_listener(
    addr: SocketAddr,
    decode: LineDecoder,
    preprocessor: Arc<PointPreprocessor>,
    handler: Arc<EntityHandler<tproxy_core::Point>>,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> JoinHandle<anyhow::Result<()>> {
    tokio::spawn(async move {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "listener bound");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer) = accepted?;
                    let decode = decode.clone();
                    let preprocessor = preprocessor.clone();
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(socket, peer, decode, preprocessor, handler).await {
                            warn!(error = %e, %peer, "listener connection ended with an error");
                        }
                    });
                }
                _ = &mut shutdown_rx => {
                    info!(%addr, "listener shutting down");
                    break;
                }
            }
        }
        Ok(())
    })
}

async fn serve_connection(
    socket: tokio::net::TcpStream,
    peer: SocketAddr,
    decode: LineDecoder,
    preprocessor: Arc<PointPreprocessor>,
    handler: Arc<EntityHandler<tproxy_core::Point>>,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(socket).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let Some(point) = decode(&line) else {
            handler.reject("failed to decode line");
            continue;
        };
        let point = preprocessor.report(point);
        if let Err(e) = handler.report(point) {
            warn!(error = %e, %peer, "dropping point");
        }
    }
    debug!(%peer, "connection closed");
    Ok(())
}
