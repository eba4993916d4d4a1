//! TCP IPC server: accept loop and per-connection handler.
//!
//! Connections share one `Arc<QuotaEngine>`; requests from different
//! connections run concurrently and synchronize inside the engine.

use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::engine::QuotaEngine;
use crate::ipc::codec::{read_frame, write_frame, FrameType};
use crate::ipc::dispatch::{self, DispatchContext, DispatchResponse};
use crate::types::{Error, IpcConfig};

/// Encode a JSON value to msgpack (named fields, so clients see maps).
fn encode_msgpack(value: &Value) -> std::io::Result<Vec<u8>> {
    rmp_serde::to_vec_named(value).map_err(|e| {
        tracing::error!(error = %e, "msgpack_encode_failed");
        std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
    })
}

fn error_payload(request_id: &str, error: &Error) -> Value {
    let mut detail = json!({
        "code": error.code(),
        "message": error.to_string(),
        "retryable": error.is_retryable(),
    });
    if let Some(headroom) = error.headroom() {
        detail["headroom"] = json!(headroom);
    }
    json!({ "id": request_id, "ok": false, "error": detail })
}

/// IPC server wrapping the engine.
#[derive(Debug)]
pub struct IpcServer {
    engine: Arc<QuotaEngine>,
    addr: SocketAddr,
    cancel: CancellationToken,
    ipc_config: IpcConfig,
}

impl IpcServer {
    pub fn new(engine: Arc<QuotaEngine>, addr: SocketAddr, ipc_config: IpcConfig) -> Self {
        Self {
            engine,
            addr,
            cancel: CancellationToken::new(),
            ipc_config,
        }
    }

    /// Bind the configured address and serve until cancelled.
    pub async fn serve(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve_listener(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve_listener(&self, listener: TcpListener) -> std::io::Result<()> {
        let local = listener.local_addr()?;
        let conn_semaphore = Arc::new(Semaphore::new(self.ipc_config.max_connections));
        tracing::info!(
            addr = %local,
            max_connections = self.ipc_config.max_connections,
            "ipc_server_listening"
        );

        let ctx = DispatchContext {
            engine: self.engine.clone(),
            ipc_config: self.ipc_config.clone(),
            shutdown: self.cancel.clone(),
        };

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("ipc_server_shutting_down");
                    break;
                }
                accept = listener.accept() => {
                    let (stream, peer) = accept?;

                    // Backpressure: refuse rather than queue when at capacity.
                    let permit = match conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            tracing::warn!(
                                peer = %peer,
                                max_connections = self.ipc_config.max_connections,
                                "ipc_connection_rejected"
                            );
                            drop(stream);
                            continue;
                        }
                    };

                    tracing::debug!(
                        peer = %peer,
                        active = self.ipc_config.max_connections - conn_semaphore.available_permits(),
                        "ipc_connection_accepted"
                    );
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, ctx, permit).await {
                            tracing::warn!(peer = %peer, error = %e, "ipc_connection_error");
                        }
                    });
                }
            }
        }
        Ok(())
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Token cancelled by `shutdown`.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Handle a single TCP connection: read frames → dispatch → write responses.
async fn handle_connection(
    stream: TcpStream,
    ctx: DispatchContext,
    _permit: OwnedSemaphorePermit, // held for connection lifetime
) -> std::io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let read_timeout = Duration::from_secs(ctx.ipc_config.read_timeout_secs);
    let write_timeout = Duration::from_secs(ctx.ipc_config.write_timeout_secs);
    let max_frame_bytes = ctx.ipc_config.max_frame_bytes;

    loop {
        let frame = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            read = tokio::time::timeout(read_timeout, read_frame(&mut reader, max_frame_bytes)) => {
                match read {
                    Err(_elapsed) => {
                        tracing::debug!(timeout_secs = ctx.ipc_config.read_timeout_secs, "ipc_read_timeout");
                        break;
                    }
                    Ok(result) => match result? {
                        Some(frame) => frame,
                        None => break,
                    },
                }
            }
        };

        if frame.frame_type() != Some(FrameType::Request) {
            let err = Error::validation(format!("unexpected message type: 0x{:02X}", frame.kind));
            let encoded = encode_msgpack(&error_payload("", &err))?;
            timed_write(&mut writer, FrameType::Error, &encoded, write_timeout).await?;
            continue;
        }

        let request: Value = match rmp_serde::from_slice(&frame.payload) {
            Ok(v) => v,
            Err(e) => {
                let err = Error::validation(format!("invalid msgpack: {e}"));
                let encoded = encode_msgpack(&error_payload("", &err))?;
                timed_write(&mut writer, FrameType::Error, &encoded, write_timeout).await?;
                continue;
            }
        };

        let request_id = request
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let service = request.get("service").and_then(|v| v.as_str()).unwrap_or("");
        let method = request.get("method").and_then(|v| v.as_str()).unwrap_or("");
        let body = request
            .get("body")
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

        match dispatch::route_request(&ctx, service, method, body).await {
            Ok(DispatchResponse::Single(response_body)) => {
                let response = json!({
                    "id": request_id,
                    "ok": true,
                    "body": response_body,
                });
                let encoded = encode_msgpack(&response)?;
                timed_write(&mut writer, FrameType::Response, &encoded, write_timeout).await?;
            }
            Ok(DispatchResponse::Stream(mut rx)) => {
                while let Some(chunk) = rx.recv().await {
                    let encoded = encode_msgpack(&json!({ "id": request_id, "body": chunk }))?;
                    timed_write(&mut writer, FrameType::StreamChunk, &encoded, write_timeout).await?;
                }
                let encoded = encode_msgpack(&json!({ "id": request_id }))?;
                timed_write(&mut writer, FrameType::StreamEnd, &encoded, write_timeout).await?;
            }
            Err(e) => {
                tracing::debug!(service, method, code = e.code(), "ipc_request_failed");
                let encoded = encode_msgpack(&error_payload(&request_id, &e))?;
                timed_write(&mut writer, FrameType::Error, &encoded, write_timeout).await?;
            }
        }
    }

    Ok(())
}

/// Write a frame with a timeout so slow consumers cannot pin a connection.
async fn timed_write<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    kind: FrameType,
    payload: &[u8],
    timeout: Duration,
) -> std::io::Result<()> {
    tokio::time::timeout(timeout, write_frame(writer, kind, payload))
        .await
        .map_err(|_| {
            tracing::warn!(timeout_secs = timeout.as_secs(), "ipc_write_timeout");
            std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout")
        })?
}
