//! Client session: request dispatch plus the consumer event bridge.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{KafdeskError, Result};
use crate::server::network::run_socket;
use crate::server::protocol::{InboundFrame, OutboundFrame};
use crate::server::router::route;
use crate::KafdeskEngine;

/// Serves one client. Requests run concurrently; consumer events are
/// forwarded to the client as push lines.
pub async fn handle_connection(socket: TcpStream, engine: KafdeskEngine, channel_capacity: usize) -> Result<()> {
    let (reader, writer) = socket.into_split();
    let capacity = channel_capacity.max(1);

    let (inbound_tx, mut inbound_rx) = mpsc::channel::<InboundFrame>(capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundFrame>(capacity);

    let mut socket_task = tokio::spawn(run_socket(reader, writer, inbound_tx, outbound_rx));

    let mut events = engine.sessions.subscribe_events();
    let push_tx = outbound_tx.clone();
    let bridge = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if push_tx.send(OutboundFrame::Push(event)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("[Server] Client fell behind; {} consumer event(s) dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let engine = Arc::new(engine);
    let mut requests = JoinSet::new();

    let outcome = loop {
        tokio::select! {
            inbound = inbound_rx.recv() => {
                let Some(frame) = inbound else { break Ok(()) };
                let tx = outbound_tx.clone();
                let engine = Arc::clone(&engine);

                requests.spawn(async move {
                    let response = match frame {
                        InboundFrame::Request(request) => {
                            debug!("[Server] -> {} (id {})", request.command, request.id);
                            OutboundFrame::Response {
                                id: request.id,
                                result: route(&request.command, request.args, &engine).await,
                            }
                        }
                        InboundFrame::Malformed { id, message } => OutboundFrame::Response {
                            id,
                            result: Err(KafdeskError::Validation(message)),
                        },
                    };
                    let _ = tx.send(response).await;
                });
            }
            socket_result = &mut socket_task => {
                break match socket_result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(KafdeskError::Connection(format!("Client protocol error: {}", e))),
                    Err(e) => Err(KafdeskError::Unknown(format!("Socket task failed: {}", e))),
                };
            }
            _ = requests.join_next(), if !requests.is_empty() => {}
        }
    };

    requests.abort_all();
    bridge.abort();
    drop(outbound_tx);
    if !socket_task.is_finished() {
        let _ = socket_task.await;
    }
    outcome
}
