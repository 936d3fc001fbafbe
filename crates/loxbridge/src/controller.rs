//! UI-side orchestration of worker sessions.
//!
//! The controller owns the single current [`WorkerSession`] and a session id
//! counter. Every envelope a worker sends carries the id it was spawned with;
//! envelopes from any other id belong to a session that has been replaced and
//! are discarded, so a reset never lets stale output leak into the log of the
//! new session.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    config::SessionConfig,
    error::{Error, Result},
    protocol::{Envelope, OutputEvent, Request, SessionId, WorkerMessage},
    runtime::RuntimeFactory,
    session::{RetiredSession, WorkerSession},
};

/// Outcome of [`SessionController::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Submission {
    Accepted,
    /// A request is already in flight.
    Busy,
    /// The current session has not reported ready yet.
    NotReady,
}

/// Which operator controls should be enabled.
///
/// Cancel (force reset) stays enabled after the worker exits on its own, since
/// a reset is then the only way forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Affordances {
    pub submit_enabled: bool,
    pub cancel_enabled: bool,
}

/// What an applied envelope did to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    Ready,
    Output(OutputEvent),
    Finished,
    /// The current worker exited without being reset.
    Exited,
}

/// Accumulated program output for the current run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplayLog {
    text: String,
}

impl DisplayLog {
    pub const ERROR_MARKER: &'static str = "Error:\n";

    pub fn clear(&mut self) {
        self.text.clear();
    }

    pub fn append(&mut self, event: &OutputEvent) {
        if event.is_error {
            self.text.push_str(Self::ERROR_MARKER);
        }
        self.text.push_str(&event.text);
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// The newest `lines` lines, i.e. what a view scrolled to the bottom shows.
    #[must_use]
    pub fn tail(&self, lines: usize) -> &str {
        if lines == 0 {
            return "";
        }
        let body = self.text.strip_suffix('\n').unwrap_or(&self.text);
        let start = body
            .rmatch_indices('\n')
            .nth(lines - 1)
            .map_or(0, |(idx, _)| idx + 1);
        &self.text[start..]
    }
}

pub struct SessionController<F: RuntimeFactory> {
    factory: Arc<F>,
    config: SessionConfig,
    current: Option<WorkerSession>,
    current_id: SessionId,
    ready: bool,
    waiting: bool,
    exited: bool,
    log: DisplayLog,
    discarded: u64,
    events_tx: mpsc::UnboundedSender<Envelope>,
    events: mpsc::UnboundedReceiver<Envelope>,
}

impl<F: RuntimeFactory> SessionController<F> {
    /// Create a controller and spawn its first session.
    ///
    /// # Errors
    /// Returns an error if the first worker cannot be spawned.
    pub fn new(factory: F, config: SessionConfig) -> Result<Self> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let mut controller = Self {
            factory: Arc::new(factory),
            config,
            current: None,
            current_id: SessionId::new(0),
            ready: false,
            waiting: false,
            exited: false,
            log: DisplayLog::default(),
            discarded: 0,
            events_tx,
            events,
        };
        controller.force_reset()?;
        Ok(controller)
    }

    #[must_use]
    pub const fn is_waiting(&self) -> bool {
        self.waiting
    }

    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.ready
    }

    /// Whether the current worker has exited on its own.
    #[must_use]
    pub const fn has_exited(&self) -> bool {
        self.exited
    }

    #[must_use]
    pub const fn affordances(&self) -> Affordances {
        Affordances {
            submit_enabled: self.ready && !self.waiting,
            cancel_enabled: self.waiting || self.exited,
        }
    }

    const fn is_idle(&self) -> bool {
        self.exited || (self.ready && !self.waiting)
    }

    #[must_use]
    pub const fn log(&self) -> &DisplayLog {
        &self.log
    }

    /// Id of the current session, if one is live.
    #[must_use]
    pub fn current_session(&self) -> Option<SessionId> {
        self.current.as_ref().map(WorkerSession::id)
    }

    /// Number of envelopes dropped because their session had been replaced.
    #[must_use]
    pub const fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Send `text` to the current session unless a run is already in flight.
    ///
    /// # Errors
    /// Returns [`Error::NoSession`] after a failed reset, or
    /// [`Error::Disconnected`] if the worker has exited.
    pub fn submit(&mut self, text: impl Into<String>) -> Result<Submission> {
        if self.waiting {
            debug!("submit ignored: run in flight");
            return Ok(Submission::Busy);
        }
        let session = self.current.as_ref().ok_or(Error::NoSession)?;
        if self.exited {
            return Err(Error::Disconnected(session.id()));
        }
        if !self.ready {
            debug!(session = %session.id(), "submit ignored: session not ready");
            return Ok(Submission::NotReady);
        }

        session.post(Request::run(text))?;
        self.waiting = true;
        self.log.clear();
        Ok(Submission::Accepted)
    }

    pub fn on_output(&mut self, event: &OutputEvent) {
        self.log.append(event);
    }

    pub const fn on_completion(&mut self) {
        self.waiting = false;
    }

    pub const fn on_ready(&mut self) {
        self.ready = true;
        self.waiting = false;
    }

    /// The worker is gone; nothing in flight can complete any more.
    pub fn on_exit(&mut self) {
        warn!(session = %self.current_id, waiting = self.waiting, "worker exited unexpectedly");
        self.exited = true;
        self.ready = false;
        self.waiting = false;
    }

    /// Tear down the current session and start a fresh one.
    ///
    /// This reinstantiates the runtime, so it is meant for recovering from a
    /// hung program rather than routine use. Any in-flight request is
    /// forgotten immediately.
    ///
    /// # Errors
    /// Returns [`Error::Io`] if the new worker cannot be spawned; the
    /// controller is then left without a session.
    pub fn force_reset(&mut self) -> Result<Option<RetiredSession>> {
        let retired = self.current.take().map(WorkerSession::terminate);
        self.current_id = self.current_id.next();
        self.ready = false;
        self.waiting = false;
        self.exited = false;

        let session = WorkerSession::spawn(
            self.current_id,
            Arc::clone(&self.factory),
            self.events_tx.clone(),
            &self.config,
        )?;
        if let Err(err) = session.post(Request::IsReady) {
            warn!(session = %session.id(), %err, "readiness probe not delivered");
        }
        self.current = Some(session);

        info!(
            session = %self.current_id,
            retired = ?retired.as_ref().map(RetiredSession::id),
            "worker session reset"
        );
        Ok(retired)
    }

    /// Apply one envelope. Returns `None` if it came from a stale session.
    pub fn dispatch(&mut self, envelope: Envelope) -> Option<ControllerEvent> {
        if self.current.is_none() || envelope.session != self.current_id {
            self.discarded += 1;
            debug!(
                stale = %envelope.session,
                current = %self.current_id,
                "discarding message from replaced session"
            );
            return None;
        }

        Some(match envelope.message {
            WorkerMessage::Ready => {
                self.on_ready();
                ControllerEvent::Ready
            }
            WorkerMessage::Print { msg, is_err } => {
                let event = OutputEvent {
                    text: msg,
                    is_error: is_err,
                };
                self.on_output(&event);
                ControllerEvent::Output(event)
            }
            WorkerMessage::Finished => {
                self.on_completion();
                ControllerEvent::Finished
            }
            WorkerMessage::Exited => {
                self.on_exit();
                ControllerEvent::Exited
            }
        })
    }

    /// Wait for and apply the next envelope from the current session.
    pub async fn next_event(&mut self) -> Option<ControllerEvent> {
        loop {
            let envelope = self.events.recv().await?;
            if let Some(event) = self.dispatch(envelope) {
                return Some(event);
            }
        }
    }

    /// Apply every envelope already queued, without waiting.
    pub fn poll_events(&mut self) -> Vec<ControllerEvent> {
        let mut applied = Vec::new();
        while let Ok(envelope) = self.events.try_recv() {
            applied.extend(self.dispatch(envelope));
        }
        applied
    }

    /// Apply envelopes until the session is ready and no run is in flight,
    /// or the worker has exited.
    pub async fn wait_idle(&mut self) -> Vec<ControllerEvent> {
        let mut applied = Vec::new();
        while !self.is_idle() {
            match self.next_event().await {
                Some(event) => applied.push(event),
                None => break,
            }
        }
        applied
    }
}
