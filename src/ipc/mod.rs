//! TCP+msgpack IPC transport layer.
//!
//! Length-prefixed msgpack frames carrying `{id, service, method, body}`
//! requests. Responses are `{id, ok, body}` or `{id, ok: false, error}`.

pub mod codec;
pub mod dispatch;
pub mod handlers;
pub mod server;

pub use dispatch::{DispatchContext, DispatchResponse};
pub use server::IpcServer;
