//! Method registry and call routing.

use std::collections::HashMap;

use anyhow::{bail, Result};

use super::jsonrpc::{Request, Response, RpcError};
use super::session::ConnectionHandle;

pub type FireAndForgetFn = dyn Fn(&Request) -> Result<Option<Response>, RpcError> + Send + Sync;
pub type SyncFn = dyn Fn(&Request, &mut Response) -> Result<(), RpcError> + Send + Sync;
pub type AsyncFn = dyn Fn(ConnectionHandle, Request) + Send + Sync;

/// The three dispatch categories. A single tagged type keeps the dispatch
/// match total: a method is exactly one of these, never registered in
/// several parallel maps.
pub enum Handler {
    /// Runs on the connection task. `Ok(None)` means no reply is sent;
    /// `Ok(Some(response))` is sent after the request id is copied onto it
    /// if the handler left the id unset.
    FireAndForget(Box<FireAndForgetFn>),
    /// Runs on the connection task against a pre-allocated response whose
    /// id is already copied from the request; the dispatcher sends it
    /// immediately afterward.
    Sync(Box<SyncFn>),
    /// Takes ownership of the reply path: receives the connection handle
    /// and the request, and is expected to deliver its response later via
    /// `RemoteServer::reply`, possibly from another thread.
    Async(Box<AsyncFn>),
}

/// Method-name-to-handler table. Registration happens once at startup
/// (`&mut self`); dispatch is read-only, so no locking is needed on the
/// hot path.
#[derive(Default)]
pub struct HandlerTable {
    methods: HashMap<String, Handler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Registering the same method twice is a
    /// programming error in the collaborator wiring, not a runtime
    /// condition.
    pub fn register(&mut self, method: impl Into<String>, handler: Handler) -> Result<()> {
        let method = method.into();
        if self.methods.contains_key(&method) {
            bail!("method '{}' is already registered", method);
        }
        self.methods.insert(method, handler);
        Ok(())
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Route one request. `Ok(None)` means no reply is produced on this
    /// call path (fire-and-forget chose silence, or an asynchronous
    /// handler now owns the reply). An `Err` is the dispatch boundary's to
    /// convert into an error response.
    pub fn dispatch(
        &self,
        handle: ConnectionHandle,
        request: &Request,
    ) -> Result<Option<Response>, RpcError> {
        let handler = self.methods.get(request.method()).ok_or_else(|| {
            RpcError::MethodNotFound(format!("method '{}' is unknown", request.method()))
        })?;

        match handler {
            Handler::FireAndForget(callback) => match callback(request)? {
                Some(mut response) => {
                    if !response.has_id() {
                        response.copy_id(request);
                    }
                    Ok(Some(response))
                }
                None => Ok(None),
            },
            Handler::Sync(callback) => {
                let mut response = Response::new();
                response.copy_id(request);
                callback(request, &mut response)?;
                Ok(Some(response))
            }
            Handler::Async(callback) => {
                callback(handle, request.clone());
                Ok(None)
            }
        }
    }
}
