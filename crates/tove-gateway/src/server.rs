// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! WebSocket shim — binds the transport-agnostic dispatch to axum.
//!
//! # Wire format
//!
//! JSON over WebSocket text frames.  Inbound frames are [`ClientFrame`]s;
//! outbound frames are [`ServerFrame`]s (stream events plus gateway control
//! frames).
//!
//! # Sessions
//!
//! Every connection starts with a fresh session id.  A `resume` frame
//! rebinds the connection to an existing session, surviving reconnects
//! within the session TTL.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    frames::{ClientFrame, ControlFrame, ServerFrame},
    Gateway,
};

/// Interval between session TTL sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Serve the gateway until ctrl-c.
pub async fn serve(gateway: Arc<Gateway>) -> anyhow::Result<()> {
    // Background TTL sweeper.
    {
        let gw = gateway.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let dropped = gw.store().sweep_expired();
                if dropped > 0 {
                    debug!(dropped, "expired sessions dropped");
                }
            }
        });
    }

    let bind = gateway.config().gateway.bind.clone();
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(gateway);

    info!(bind = %bind, "starting gateway");
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}

/// HTTP handler for GET /ws.
async fn ws_handler(ws: WebSocketUpgrade, State(gateway): State<Arc<Gateway>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, gateway))
}

/// Bridge one WebSocket connection to the dispatch layer.
pub async fn handle_socket(mut socket: WebSocket, gateway: Arc<Gateway>) {
    let mut session_id = uuid::Uuid::new_v4().to_string();
    debug!(session = %session_id, "connection opened");

    // Bounded: a slow client applies backpressure all the way into the
    // orchestrator instead of buffering without limit.
    let (out_tx, mut out_rx) =
        mpsc::channel::<ServerFrame>(gateway.config().gateway.channel_capacity);

    loop {
        tokio::select! {
            // Incoming frame from the client.
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(ClientFrame::Resume { session_id: sid }) => {
                                // Rebind, then let dispatch mirror the history.
                                session_id = sid.clone();
                                gateway
                                    .clone()
                                    .handle_frame(&session_id, ClientFrame::Resume { session_id: sid }, &out_tx)
                                    .await;
                            }
                            Ok(frame) => {
                                gateway.clone().handle_frame(&session_id, frame, &out_tx).await;
                            }
                            Err(e) => {
                                let err = ServerFrame::Control(ControlFrame::Error {
                                    message: format!("invalid frame: {e}"),
                                });
                                if send_frame(&mut socket, &err).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames ignored
                    Some(Err(e)) => {
                        debug!("websocket recv error: {e}");
                        break;
                    }
                }
            }
            // Outgoing frame from a generation.
            frame = out_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if send_frame(&mut socket, &frame).await.is_err() {
                            warn!(session = %session_id, "client write failed");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    // A dead connection must not leave a generation streaming into the void.
    gateway.store().cancel(&session_id);
    debug!(session = %session_id, "connection closed");
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), axum::Error> {
    match serde_json::to_string(frame) {
        Ok(json) => socket.send(Message::Text(json.into())).await,
        Err(e) => {
            warn!("frame serialization failed: {e}");
            Ok(())
        }
    }
}
