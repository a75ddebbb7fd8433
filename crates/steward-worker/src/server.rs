// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control server for steward-worker.
//!
//! Accepts connections from the control process and routes `apply` calls to
//! the engine. The server holds no logic of its own: it converts the wire
//! message, hands the state to [`Engine::apply`] and returns the warnings.
//!
//! Only marshalling problems answer with an [`RpcError`]:
//! - `EMPTY_REQUEST`: the envelope carried no call
//! - `EMPTY_STATE`: an apply call without a state
//! - `INVALID_STATE`: the state cannot be represented (a port above 65535)
//! - `DECODE_ERROR`: the request frame is not a valid envelope

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use steward_protocol::control_proto::{
    ApplyRequest, ApplyResponse, RpcError, RpcRequest, RpcResponse, rpc_request::Request,
    rpc_response::Response,
};
use steward_protocol::frame::Frame;
use steward_protocol::server::{ConnectionHandler, ControlServer, StreamHandler};

use crate::engine::{Engine, Feedback};
use crate::error::panic_message;
use crate::state::State;

/// Run the control server until `shutdown_rx` turns `true` or its sender
/// is dropped.
#[instrument(skip_all)]
pub async fn run_control_server(
    server: ControlServer,
    engine: Arc<Engine>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let addr = server.local_addr()?;
    info!(%addr, "control server starting");

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.wait_for(|stop| *stop) => {
                info!("control server received shutdown signal");
                server.close();
                break;
            }

            incoming = server.accept() => {
                let Some(incoming) = incoming else {
                    // Endpoint closed
                    break;
                };
                let engine = engine.clone();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(connection) => {
                            handle_connection(ConnectionHandler::new(connection), engine).await;
                        }
                        Err(e) => debug!("failed to accept connection: {}", e),
                    }
                });
            }
        }
    }

    info!(%addr, "control server stopped");
    Ok(())
}

/// Handle a single connection
#[instrument(skip(conn, engine), fields(remote = %conn.remote_address()))]
async fn handle_connection(conn: ConnectionHandler, engine: Arc<Engine>) {
    debug!("control connection accepted");

    conn.run(move |stream: StreamHandler| {
        let engine = engine.clone();
        async move {
            if let Err(e) = handle_stream(stream, engine).await {
                error!("Stream error: {}", e);
            }
        }
    })
    .await;

    debug!("control connection closed");
}

/// Handle a single stream (request/response)
async fn handle_stream(mut stream: StreamHandler, engine: Arc<Engine>) -> Result<()> {
    let request_frame = stream.read_frame().await?;

    let response = match request_frame.decode::<RpcRequest>() {
        Ok(RpcRequest {
            request: Some(Request::Apply(request)),
        }) => handle_apply(&engine, request).await,
        Ok(RpcRequest { request: None }) => {
            warn!("Received empty RpcRequest");
            rpc_error("EMPTY_REQUEST", "RpcRequest contained no request")
        }
        Err(e) => {
            warn!(error = %e, "undecodable request");
            rpc_error("DECODE_ERROR", e.to_string())
        }
    };

    let response = RpcResponse {
        response: Some(response),
    };
    stream.write_frame(&Frame::response(&response)?).await?;
    stream.finish()?;
    Ok(())
}

/// Convert and apply one pushed state.
///
/// The reconciliation runs on its own task, so a dropped stream cannot cancel
/// it halfway and a panic inside it becomes a warning.
pub async fn handle_apply(engine: &Arc<Engine>, request: ApplyRequest) -> Response {
    let Some(proto) = request.state else {
        return rpc_error("EMPTY_STATE", "ApplyRequest carried no state");
    };
    let state = match State::try_from(proto) {
        Ok(state) => state,
        Err(e) => return rpc_error("INVALID_STATE", e.to_string()),
    };

    let engine = engine.clone();
    let feedback = match tokio::spawn(async move { engine.apply(state).await }).await {
        Ok(feedback) => feedback,
        Err(e) => {
            let reason = if e.is_panic() {
                panic_message(e.into_panic().as_ref())
            } else {
                e.to_string()
            };
            let mut feedback = Feedback::default();
            feedback.warn(format!("apply aborted: {reason}"));
            feedback
        }
    };

    Response::Apply(ApplyResponse {
        warnings: feedback.into_warnings(),
    })
}

fn rpc_error(code: &str, message: impl Into<String>) -> Response {
    Response::Error(RpcError {
        code: code.to_string(),
        message: message.into(),
    })
}
