//! Network Layer: TCP listener + framed socket I/O.

use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{KafdeskError, Result};
use crate::server::connection_session::handle_connection;
use crate::server::protocol::{InboundFrame, JsonLineCodec, OutboundFrame, ProtocolError};
use crate::KafdeskEngine;

// ========================================
// TCP LISTENER
// ========================================

/// Binds the configured address and accepts clients until `shutdown` resolves.
pub async fn serve(
    engine: KafdeskEngine,
    config: &ServerConfig,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| KafdeskError::Connection(format!("Cannot bind {}: {}", addr, e)))?;
    info!("[Server] Kafdesk listening on {}", addr);
    serve_listener(engine, listener, config.channel_capacity, shutdown).await
}

pub async fn serve_listener(
    engine: KafdeskEngine,
    listener: TcpListener,
    channel_capacity: usize,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("[Server] Listener stopped");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (socket, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("[Server] Accept failed: {}", e);
                        continue;
                    }
                };
                debug!("[Server] New connection from {}", addr);

                let engine = engine.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(socket, engine, channel_capacity).await {
                        error!("[Server] Error handling connection from {}: {}", addr, e);
                    }
                    debug!("[Server] Connection closed from {}", addr);
                });
            }
        }
    }
}

// ========================================
// SOCKET I/O
// ========================================

/// Runs framed I/O for one socket until either side closes.
pub async fn run_socket(
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    inbound_tx: mpsc::Sender<InboundFrame>,
    mut outbound_rx: mpsc::Receiver<OutboundFrame>,
) -> std::result::Result<(), ProtocolError> {
    let mut framed_reader = FramedRead::new(reader, JsonLineCodec::new());
    let mut framed_writer = FramedWrite::new(writer, JsonLineCodec::new());

    loop {
        tokio::select! {
            frame = framed_reader.next() => {
                match frame {
                    Some(Ok(frame)) => {
                        if inbound_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(err)) => return Err(err),
                    None => break,
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(frame) => framed_writer.send(frame).await?,
                    None => break,
                }
            }
        }
    }

    Ok(())
}
