//! Loopback WebSocket JSON-RPC 2.0 server for remote-controlling a
//! long-running host application.
//!
//! The host constructs a [`RemoteServer`], registers handlers in one of
//! three categories (fire-and-forget, synchronous, asynchronous), and
//! starts it. Clients connect over WebSocket with the `streamdeck-obs`
//! subprotocol and exchange JSON-RPC 2.0 documents; the host pushes state
//! changes to every client with [`RemoteServer::notify`] and asynchronous
//! handlers deliver deferred replies with [`RemoteServer::reply`], even
//! from threads the server knows nothing about.

pub mod handlers;
pub mod rpc;
pub mod server;

pub use rpc::{ConnectionHandle, ConnectionId, Handler, HandlerTable, Request, Response, RpcError};
pub use server::{RemoteServer, ServerConfig, WEBSOCKET_PORTS, WEBSOCKET_PROTOCOL};
