pub mod error;
pub mod jsonrpc;


pub use error::{BusError, EntityKind, Result};
pub use jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
