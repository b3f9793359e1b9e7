pub mod buffer;
pub mod config;
pub mod error;
pub mod http;
pub mod manager;
pub mod pool;
pub mod program;
pub mod reactor;
pub mod reactor_pool;
pub mod server;
pub mod session;
pub mod stats;
pub mod sync;
pub mod syscalls;
pub mod vm;

// Re-exports for users
pub use config::Config;
pub use error::{Error, Result};
pub use http::Http;
pub use manager::{ServerHandle, ServerManager};
pub use server::{AbstractServer, Server};
pub use session::{Feedback, Protocol, Session, SessionIo};
pub use stats::{ContextInfo, ServerInfo, StatsSnapshot};
