pub mod client;
pub mod cmd;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod options;
pub mod resp;
pub mod retry;

// Re-export the main client components
pub use crate::client::Client;
pub use crate::cmd::{cmd, Cmd, ToArg};
pub use crate::config::{ClientConfig, InflightPolicy, ProtocolVersion};
pub use crate::dispatcher::Dispatcher;
pub use crate::error::{Error, Result};
pub use crate::resp::{Reply, RespCodec};
