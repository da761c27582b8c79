//! TCP front end: accept loop, per-connection read loop, and the writer task
//! that serializes one connection's replies and pushes in queue order.

pub mod codec;
pub mod dispatcher;
pub mod protocol;
pub mod registry;

use std::sync::Arc;

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, info};

use crate::AppState;
use codec::EnvelopeCodec;

pub async fn run(state: Arc<AppState>) -> Result<()> {
    let addr = state.config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Listening for terminals");

    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(peer = %peer, connected = state.registry.connected(), "Terminal connected");
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(state, stream).await {
                debug!(peer = %peer, error = %e, "Connection closed with error");
            } else {
                debug!(peer = %peer, "Terminal disconnected");
            }
        });
    }
}

async fn handle_connection(state: Arc<AppState>, stream: TcpStream) -> Result<()> {
    let framed = Framed::new(stream, EnvelopeCodec::new());
    let (mut sink, mut frames) = framed.split();

    let (conn_id, mut outbound) = state.registry.register();

    // Writer task: the only holder of the sink. It drains the connection's
    // queue, so replies and broadcasts leave in the order they were queued.
    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            if sink.send(envelope).await.is_err() {
                break;
            }
        }
    });

    let read_result: Result<()> = async {
        while let Some(frame) = frames.next().await {
            let envelope = frame?;
            match dispatcher::dispatch(&state, conn_id, envelope).await {
                Some(reply) => {
                    if !state.registry.send_to(conn_id, reply) {
                        break;
                    }
                }
                None => break, // CLIENT_QUIT
            }
        }
        Ok(())
    }
    .await;

    // Exit path for both clean quits and dropped connections: release the
    // session, then the registry entry: dropping the sender lets the writer
    // finish its queue and stop.
    state.sessions.cleanup_connection(conn_id).await;
    state.registry.unregister(conn_id);
    let _ = writer.await;

    read_result
}
