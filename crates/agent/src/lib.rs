#![forbid(unsafe_code)]

//! Job-step agent: runs a build plan on this node and reports every step of
//! it to the coordinating server.

pub mod artifacts;
pub mod cancel;
pub mod config;
pub mod error;
pub mod executor;
pub mod heartbeat;
pub mod logs;
pub mod reporter;
pub mod runner;
pub mod transport;

pub use config::AgentConfig;
pub use error::{AgentError, TransportError};
pub use runner::{RunOutcome, Runner};
pub use transport::{HttpTransport, RetryPolicy, Transport};
