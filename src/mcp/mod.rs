//! MCP surface: tool catalogue, dispatcher, error codes and the rmcp server.
pub mod dispatcher;
pub mod error;
pub mod server;
pub mod tools;

pub use self::dispatcher::{Dispatcher, RagServices, ResourceEntry, ResourceText};
pub use self::error::DispatchError;
pub use self::server::{DocServer, serve, serve_stdio};
