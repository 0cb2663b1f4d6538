pub mod dispatch;
pub mod jsonrpc;
pub mod session;

pub use dispatch::{Handler, HandlerTable};
pub use jsonrpc::{Request, Response, RpcError};
pub use session::{ConnectionHandle, ConnectionId, SessionRegistry};
