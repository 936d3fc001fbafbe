//! Worker sessions: one runtime on one dedicated OS thread.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn};

use crate::{
    TRACE_TARGET_WORKER,
    adapter::{OutputSink, RuntimeAdapter},
    config::SessionConfig,
    error::{Error, Result},
    protocol::{Envelope, OutputEvent, Request, SessionId, WorkerMessage},
    runtime::{KillSwitch, Runtime, RuntimeFactory},
};

/// Handle to a live worker.
///
/// Dropping the handle tears the worker down; there is no graceful drain.
pub struct WorkerSession {
    id: SessionId,
    requests: mpsc::UnboundedSender<Request>,
    kill: KillSwitch,
    thread: Option<JoinHandle<()>>,
}

impl WorkerSession {
    /// Spawn a worker thread that creates its runtime through `factory`,
    /// initializes it, and then emits [`WorkerMessage::Ready`] on `events`.
    ///
    /// # Errors
    /// Returns [`Error::Io`] if the worker thread cannot be spawned.
    pub fn spawn<F: RuntimeFactory>(
        id: SessionId,
        factory: Arc<F>,
        events: mpsc::UnboundedSender<Envelope>,
        config: &SessionConfig,
    ) -> Result<Self> {
        let (requests, inbox) = mpsc::unbounded_channel();
        let kill = KillSwitch::new();
        let worker_kill = kill.clone();

        let mut builder = thread::Builder::new().name(format!("{}-{}", config.thread_name, id.get()));
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }
        let thread = builder.spawn(move || {
            let outbound = Outbound {
                session: id,
                events,
                kill: worker_kill.clone(),
            };
            let _exit = ExitNotice(outbound.clone());
            worker_main(factory.as_ref(), inbox, &outbound, &worker_kill);
        })?;

        info!(target: TRACE_TARGET_WORKER, session = %id, "spawned worker session");
        Ok(Self {
            id,
            requests,
            kill,
            thread: Some(thread),
        })
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Queue a request for the worker. Requests are served in send order.
    ///
    /// # Errors
    /// Returns [`Error::Disconnected`] if the worker has exited.
    pub fn post(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|_| Error::Disconnected(self.id))
    }

    /// Decode a JSON request and queue it.
    ///
    /// # Errors
    /// Returns [`Error::Protocol`] for an invalid message (which is also
    /// logged) or [`Error::Disconnected`] if the worker has exited.
    pub fn post_json(&self, raw: &str) -> Result<()> {
        match Request::from_json(raw) {
            Ok(request) => self.post(request),
            Err(err) => {
                warn!(target: TRACE_TARGET_WORKER, session = %self.id, %err, raw, "invalid message");
                Err(err)
            }
        }
    }

    /// Whether the worker thread has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Signal the worker to stop immediately and detach from it.
    ///
    /// An execution in progress is abandoned without a completion message and
    /// without releasing its buffers; the runtime and its memory are dropped
    /// when the worker thread unwinds out of the interrupted call.
    pub fn terminate(mut self) -> RetiredSession {
        self.kill.trigger();
        info!(target: TRACE_TARGET_WORKER, session = %self.id, "terminated worker session");
        RetiredSession {
            id: self.id,
            thread: self.thread.take(),
        }
    }
}

impl Drop for WorkerSession {
    fn drop(&mut self) {
        self.kill.trigger();
    }
}

/// A session that has been torn down but whose thread may still be unwinding.
pub struct RetiredSession {
    id: SessionId,
    thread: Option<JoinHandle<()>>,
}

impl RetiredSession {
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

/// Worker-side sender that tags messages with the session id.
///
/// Messages produced after teardown are dropped at the source.
#[derive(Clone)]
struct Outbound {
    session: SessionId,
    events: mpsc::UnboundedSender<Envelope>,
    kill: KillSwitch,
}

impl Outbound {
    fn send(&self, message: WorkerMessage) {
        if self.kill.is_triggered() {
            return;
        }
        if self
            .events
            .send(Envelope::new(self.session, message))
            .is_err()
        {
            debug!(target: TRACE_TARGET_WORKER, "controller is gone; dropping message");
        }
    }
}

impl OutputSink for Outbound {
    fn on_output(&mut self, event: OutputEvent) {
        self.send(event.into());
    }
}

/// Reports [`WorkerMessage::Exited`] when the worker thread ends, including
/// by unwinding. Suppressed after a teardown like every other message.
struct ExitNotice(Outbound);

impl Drop for ExitNotice {
    fn drop(&mut self) {
        if thread::panicking() {
            error!(target: TRACE_TARGET_WORKER, session = %self.0.session, "worker panicked");
        }
        self.0.send(WorkerMessage::Exited);
    }
}

fn start_runtime<F: RuntimeFactory>(
    factory: &F,
    kill: &KillSwitch,
) -> Result<RuntimeAdapter<F::Runtime>> {
    let runtime = factory.create(kill.clone())?;
    let mut adapter = RuntimeAdapter::new(runtime, kill.clone());
    adapter.initialize()?;
    Ok(adapter)
}

fn worker_main<F: RuntimeFactory>(
    factory: &F,
    mut inbox: mpsc::UnboundedReceiver<Request>,
    outbound: &Outbound,
    kill: &KillSwitch,
) {
    let span = info_span!(target: TRACE_TARGET_WORKER, "worker.session", session = %outbound.session);
    let _enter = span.enter();

    let mut adapter = match start_runtime(factory, kill) {
        Ok(adapter) => adapter,
        Err(err) => {
            error!(target: TRACE_TARGET_WORKER, %err, "failed to start runtime");
            outbound.send(OutputEvent::stderr(format!("failed to start runtime: {err}")).into());
            return;
        }
    };
    outbound.send(WorkerMessage::Ready);

    while let Some(request) = inbox.blocking_recv() {
        if kill.is_triggered() {
            break;
        }
        match request {
            Request::IsReady => {
                info!(target: TRACE_TARGET_WORKER, state = %adapter.state(), "worker ready");
            }
            Request::Run { source_code } => {
                if !run(&mut adapter, outbound, &source_code) {
                    break;
                }
            }
        }
    }
    debug!(target: TRACE_TARGET_WORKER, "worker exiting");
}

/// Execute one request. Returns `false` once the session has been torn down.
fn run<R: Runtime>(adapter: &mut RuntimeAdapter<R>, outbound: &Outbound, source: &str) -> bool {
    match adapter.execute(source, outbound.clone()) {
        Ok(()) => {}
        Err(Error::Terminated) => {
            info!(target: TRACE_TARGET_WORKER, "execution abandoned by teardown");
            return false;
        }
        Err(err) => {
            warn!(target: TRACE_TARGET_WORKER, %err, "execution failed");
            outbound.send(OutputEvent::stderr(err.to_string()).into());
        }
    }
    outbound.send(WorkerMessage::Finished);
    true
}
