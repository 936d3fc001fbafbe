//! Runtime adapter: the ready handshake and the blocking execute entry point.

use std::fmt;

use tracing::{debug, info_span};

use crate::{
    TRACE_TARGET_WORKER,
    error::{Error, Result},
    marshal::{ScopedText, read_text},
    protocol::OutputEvent,
    runtime::{KillSwitch, OutputCallback, Runtime},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Uninitialized,
    Ready,
    Executing,
    Terminated,
}

impl AdapterState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consumer of decoded output events.
pub trait OutputSink: Send + 'static {
    fn on_output(&mut self, event: OutputEvent);
}

impl<F> OutputSink for F
where
    F: FnMut(OutputEvent) + Send + 'static,
{
    fn on_output(&mut self, event: OutputEvent) {
        self(event);
    }
}

/// Decodes raw runtime output and forwards it to a sink as it arrives.
struct DecodingCallback<S> {
    sink: S,
}

impl<S: OutputSink> OutputCallback for DecodingCallback<S> {
    fn on_output(
        &mut self,
        memory: &[u8],
        address: u32,
        length: u32,
        is_error: bool,
    ) -> Result<()> {
        let text = read_text(memory, address, length)?;
        self.sink.on_output(OutputEvent { text, is_error });
        Ok(())
    }
}

pub struct RuntimeAdapter<R: Runtime> {
    runtime: R,
    state: AdapterState,
    kill: KillSwitch,
}

impl<R: Runtime> RuntimeAdapter<R> {
    #[must_use]
    pub const fn new(runtime: R, kill: KillSwitch) -> Self {
        Self {
            runtime,
            state: AdapterState::Uninitialized,
            kill,
        }
    }

    /// Current state; reports [`AdapterState::Terminated`] as soon as the
    /// kill switch fires, even mid-execution.
    #[must_use]
    pub fn state(&self) -> AdapterState {
        if self.kill.is_triggered() {
            AdapterState::Terminated
        } else {
            self.state
        }
    }

    #[must_use]
    pub const fn runtime(&self) -> &R {
        &self.runtime
    }

    fn expect_state(&self, expected: AdapterState) -> Result<()> {
        let actual = self.state();
        if actual == expected {
            Ok(())
        } else {
            Err(Error::InvalidState { expected, actual })
        }
    }

    /// Move from `Uninitialized` to `Ready`. Succeeds at most once.
    ///
    /// # Errors
    /// Returns [`Error::InvalidState`] if already initialized, or the
    /// runtime's own initialization error.
    pub fn initialize(&mut self) -> Result<()> {
        self.expect_state(AdapterState::Uninitialized)?;
        self.runtime.initialize()?;
        self.state = AdapterState::Ready;
        Ok(())
    }

    /// Run `text` to completion, streaming output into `sink`.
    ///
    /// The input buffer is released before this returns, except after a
    /// teardown, where the runtime's whole memory is about to be dropped.
    ///
    /// # Errors
    /// - [`Error::InvalidState`] unless the adapter is `Ready`.
    /// - [`Error::Terminated`] if the kill switch fired during execution; the
    ///   adapter stays `Terminated`.
    /// - Any marshaling or runtime fault; the adapter returns to `Ready`.
    pub fn execute(&mut self, text: &str, sink: impl OutputSink) -> Result<()> {
        self.expect_state(AdapterState::Ready)?;
        let _span = info_span!(target: TRACE_TARGET_WORKER, "adapter.execute", bytes = text.len())
            .entered();

        self.state = AdapterState::Executing;
        let result = Self::execute_marshaled(&mut self.runtime, &self.kill, text, sink);

        if self.kill.is_triggered() {
            self.state = AdapterState::Terminated;
            return Err(Error::Terminated);
        }
        self.state = AdapterState::Ready;
        result
    }

    fn execute_marshaled(
        runtime: &mut R,
        kill: &KillSwitch,
        text: &str,
        sink: impl OutputSink,
    ) -> Result<()> {
        let mut scoped = ScopedText::write(runtime, text)?;
        let handle = scoped.handle();
        debug!(
            target: TRACE_TARGET_WORKER,
            address = handle.address(),
            capacity = handle.capacity(),
            "marshaled source"
        );

        let result = scoped.execute(handle.address(), Box::new(DecodingCallback { sink }));
        if kill.is_triggered() {
            scoped.abandon();
        }
        result
    }
}
