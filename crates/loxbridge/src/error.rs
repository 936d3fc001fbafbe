use thiserror::Error;

use crate::{adapter::AdapterState, protocol::SessionId};

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// The adapter was driven out of order (e.g. execute before ready).
    #[error("runtime is {actual}, expected {expected}")]
    InvalidState {
        expected: AdapterState,
        actual: AdapterState,
    },

    /// A guest address range falls outside the runtime's memory.
    #[error("guest memory access out of bounds: {address:#x}+{length}")]
    OutOfBounds { address: u32, length: u32 },

    /// Text whose encoded form does not fit a 32-bit guest buffer.
    #[error("text of {0} bytes does not fit in guest memory")]
    TooLarge(usize),

    /// The guest allocator could not satisfy a request.
    #[error("guest allocation of {0} bytes failed")]
    Allocation(u32),

    /// Execution was abandoned because the session was torn down.
    #[error("execution terminated")]
    Terminated,

    /// Wasmtime engine error (compilation, instantiation, trap).
    #[error("wasm error: {0}")]
    Wasm(#[source] anyhow::Error),

    /// Filesystem or thread spawn failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Malformed or unrecognised protocol message.
    #[error("invalid message: {0}")]
    Protocol(#[from] serde_json::Error),

    /// The worker behind a session handle has exited.
    #[error("worker session {0} is disconnected")]
    Disconnected(SessionId),

    /// The controller has no live session (a reset failed to spawn one).
    #[error("no active worker session")]
    NoSession,
}
