//! Execution bridge between an event-driven UI context and a language runtime
//! hosted on an isolated worker thread.
//!
//! The [`controller::SessionController`] submits source text to the current
//! [`session::WorkerSession`], which drives a [`adapter::RuntimeAdapter`] over
//! a blocking [`runtime::Runtime`]. Output streams back as
//! [`protocol::Envelope`]s tagged with the issuing session, so a forced reset
//! can discard everything a superseded worker still had in flight.

pub mod adapter;
pub mod config;
pub mod controller;
pub mod error;
pub mod marshal;
pub mod protocol;
pub mod runtime;
pub mod session;
pub mod wasm;

pub const TRACE_TARGET_WORKER: &str = "loxbridge::worker";

pub use adapter::{AdapterState, OutputSink, RuntimeAdapter};
pub use config::{GuestAbi, SessionConfig, WasmConfig};
pub use controller::{Affordances, ControllerEvent, DisplayLog, SessionController, Submission};
pub use error::{Error, Result};
pub use marshal::{GuestMemory, ScopedText, TextHandle};
pub use protocol::{Envelope, OutputEvent, Request, SessionId, WorkerMessage};
pub use runtime::{KillSwitch, OutputCallback, Runtime, RuntimeFactory};
pub use session::{RetiredSession, WorkerSession};
pub use wasm::{WasmRuntime, WasmTemplate, WasmTemplateBuilder};
