use std::io;

use thiserror::Error;

/// Process exit code for unusable command line arguments.
pub const EC_INVALID_COMMANDLINE_ARGS: i32 = 64;
/// Process exit code for a missing or unparseable config file.
pub const EC_INVALID_CONFIG_FILE: i32 = 65;

/// Central error type for the loadsim engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The config file could not be read or a required option is missing
    /// or malformed.
    #[error("config error: {0}")]
    Config(String),

    /// A bounded pool is exhausted and cannot produce another item.
    #[error("pool exhausted")]
    PoolExhausted,

    /// The reactor pool reached its reserved capacity.
    #[error("reactor pool is at maximum capacity")]
    ReactorPoolFull,

    /// An administrative operation named a reactor index that does not
    /// exist or is not in the required state.
    #[error("invalid reactor: {0}")]
    InvalidReactor(String),

    /// An administrative operation named a server handle that does not
    /// exist.
    #[error("invalid server handle: {0}")]
    InvalidServerHandle(i32),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The distinguished "operation cancelled" transport error, produced when
/// async work is torn down by a stopping reactor. It is swallowed before
/// reaching a protocol's `on_error`.
pub fn cancelled() -> io::Error {
    io::Error::from_raw_os_error(libc::ECANCELED)
}

pub fn is_cancelled(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ECANCELED)
}
