//! Transcriber process supervisor.
//!
//! Owns at most one transcriber subprocess at a time and turns what it
//! writes into lifecycle states and a final transcript for the consumer.
//!
//! # Threading
//!
//! Every session gets an event thread that drains the process's
//! [`ProcessEvent`] channel. All session state lives behind one mutex, so
//! stdout chunks, stderr lines, exit notifications, watchdog expiry and the
//! public calls (`start`, `signal_finish`, `kill`) are applied one at a time.
//!
//! Consumer callbacks are queued while the lock is held and delivered on a
//! separate dispatcher thread, in the order the state changed. A callback
//! may therefore call straight back into the supervisor.
//!
//! Events are tagged with the [`SessionId`] that produced them; anything
//! arriving for a session that was killed or replaced is dropped.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::logging::EventSink;
use crate::paths::TranscriberEnv;
use crate::protocol::{parse_line, ChildProcessUpdate, LoadingState};
use crate::session::{Session, SessionId, SessionStateMachine, Transition};
use crate::shell::ProcessExit;
use crate::spawn::{ProcessEvent, SpawnConfig, TranscriberProcess};

/// Single byte written to stdin to stop capture and start transcribing.
pub const FINISH_SIGNAL: &[u8] = b"\n";

const DEFAULT_EXIT_GRACE: Duration = Duration::from_millis(500);

/// Receives lifecycle callbacks. Both methods default to no-ops.
pub trait SessionObserver: Send + Sync {
    fn on_state_change(&self, _state: LoadingState) {}

    /// Called at most once per session.
    fn on_result(&self, _text: &str) {}
}

/// Configuration for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Interpreter, script and assets directory
    pub transcriber: TranscriberEnv,
    /// Run through this shell prefix instead of executing directly
    pub shell_prefix: Option<String>,
    /// Extra environment for the subprocess
    pub env: Vec<(String, String)>,
    /// Fail a live session that produces no event for this long
    pub stall_timeout: Option<Duration>,
    /// How long exit reporting waits for the output pipes to drain
    pub exit_grace: Duration,
}

impl SupervisorConfig {
    pub fn new(transcriber: TranscriberEnv) -> Self {
        Self {
            transcriber,
            shell_prefix: None,
            env: Vec::new(),
            stall_timeout: None,
            exit_grace: DEFAULT_EXIT_GRACE,
        }
    }

    /// Run `interpreter script` from `working_dir`.
    pub fn with_paths(
        interpreter: impl Into<PathBuf>,
        script: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self::new(TranscriberEnv {
            interpreter: interpreter.into(),
            script: script.into(),
            assets_dir: working_dir.into(),
        })
    }

    pub fn shell_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.shell_prefix = Some(prefix.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = Some(timeout);
        self
    }

    pub fn exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }

    fn spawn_config(&self) -> SpawnConfig {
        let env = &self.transcriber;
        let mut config = SpawnConfig::new(
            env.interpreter.to_string_lossy(),
            vec![env.script.to_string_lossy().into_owned()],
        )
        .working_dir(env.assets_dir.to_string_lossy())
        .exit_grace(self.exit_grace);

        if let Some(prefix) = &self.shell_prefix {
            config = config.shell_prefix(prefix);
        }
        for (key, value) in &self.env {
            config = config.env(key, value);
        }
        config
    }
}

/// What `start` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new subprocess is running.
    Spawned(SessionId),
    /// A session is already live; nothing was spawned.
    AlreadyRunning,
    /// The OS refused to spawn; state is now `error`.
    SpawnFailed,
}

enum Notification {
    State(LoadingState),
    Result(String),
}

struct Inner {
    machine: SessionStateMachine,
    session: Option<Session>,
}

struct Shared {
    config: SupervisorConfig,
    sink: Arc<dyn EventSink>,
    inner: Mutex<Inner>,
    notifications: Mutex<Sender<Notification>>,
}

/// Supervises the transcriber subprocess.
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
}

impl ProcessSupervisor {
    pub fn new(
        config: SupervisorConfig,
        sink: Arc<dyn EventSink>,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        let notify = spawn_dispatcher(observer);
        Self {
            shared: Arc::new(Shared {
                config,
                sink,
                inner: Mutex::new(Inner {
                    machine: SessionStateMachine::new(),
                    session: None,
                }),
                notifications: Mutex::new(notify),
            }),
        }
    }

    /// Start a session unless one is already live.
    ///
    /// A second call while a session is live is a logged no-op. A process
    /// left behind by a session that ended in a protocol error is reaped
    /// before the new one is spawned.
    pub fn start(&self) -> StartOutcome {
        let shared = &self.shared;
        let mut inner = shared.lock_inner();

        if let Some(session) = inner.session.as_ref().filter(|s| s.is_active()) {
            shared.sink.log(
                "record_already_running",
                json!({ "session_id": session.id.to_string(), "pid": session.pid() }),
            );
            return StartOutcome::AlreadyRunning;
        }
        if let Some(stale) = inner.session.take() {
            shared.terminate(stale, "restart");
        }

        let transition = inner.machine.begin();
        shared.publish(transition);

        let transcriber = &shared.config.transcriber;
        transcriber.check(shared.sink.as_ref());
        shared.sink.log(
            "start",
            json!({
                "interpreter": transcriber.interpreter.display().to_string(),
                "script": transcriber.script.display().to_string(),
                "working_dir": transcriber.assets_dir.display().to_string(),
            }),
        );

        let mut process = match TranscriberProcess::spawn(shared.config.spawn_config()) {
            Ok(process) => process,
            Err(e) => {
                log::error!("Failed to spawn transcriber: {}", e);
                shared
                    .sink
                    .log("spawn_error", json!({ "error": e.to_string() }));
                let transition = inner.machine.fail();
                shared.publish(transition);
                return StartOutcome::SpawnFailed;
            }
        };
        let Some(events) = process.take_receiver() else {
            log::error!("Transcriber started without an event channel");
            if let Err(e) = process.kill() {
                log::warn!("Failed to terminate transcriber: {}", e);
            }
            shared.sink.log(
                "spawn_error",
                json!({ "pid": process.pid(), "error": "event channel unavailable" }),
            );
            let transition = inner.machine.fail();
            shared.publish(transition);
            return StartOutcome::SpawnFailed;
        };

        let id = SessionId::new();
        shared.sink.log(
            "spawn",
            json!({ "session_id": id.to_string(), "pid": process.pid() }),
        );
        log::info!("Transcriber started (pid {}, session {})", process.pid(), id);
        inner.session = Some(Session::new(id.clone(), process));
        drop(inner);

        let shared = Arc::clone(&self.shared);
        let session_id = id.clone();
        thread::spawn(move || run_event_loop(shared, session_id, events));

        StartOutcome::Spawned(id)
    }

    /// Tell the transcriber to stop listening and produce a result.
    ///
    /// Writes a single newline to its stdin. Returns `false` when there is no
    /// live session or the write failed. Does not change state.
    pub fn signal_finish(&self) -> bool {
        let inner = self.shared.lock_inner();
        let Some(session) = inner.session.as_ref().filter(|s| s.is_active()) else {
            log::debug!("Finish signal ignored: no active session");
            return false;
        };

        match session.process.write_stdin(FINISH_SIGNAL) {
            Ok(()) => {
                self.shared.sink.log(
                    "finish_signal",
                    json!({ "session_id": session.id.to_string() }),
                );
                true
            }
            Err(e) => {
                log::warn!("Failed to send finish signal: {}", e);
                self.shared.sink.log(
                    "finish_signal_error",
                    json!({ "session_id": session.id.to_string(), "error": e.to_string() }),
                );
                false
            }
        }
    }

    /// Terminate the subprocess if any and return to `idle`.
    ///
    /// Always safe to call. Termination failures are logged; the handle and
    /// buffered output are released regardless.
    pub fn kill(&self) {
        let mut inner = self.shared.lock_inner();
        if let Some(session) = inner.session.take() {
            self.shared.terminate(session, "kill");
        }
        let transition = inner.machine.reset();
        self.shared.publish(transition);
    }

    pub fn state(&self) -> LoadingState {
        self.shared.lock_inner().machine.state()
    }

    /// Whether a live, non-terminal session exists.
    pub fn is_running(&self) -> bool {
        self.shared
            .lock_inner()
            .session
            .as_ref()
            .is_some_and(Session::is_active)
    }

    /// Identifier of the live session, if any.
    pub fn session_id(&self) -> Option<SessionId> {
        self.shared
            .lock_inner()
            .session
            .as_ref()
            .filter(|s| s.is_active())
            .map(|s| s.id.clone())
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        let mut inner = self.shared.lock_inner();
        if let Some(session) = inner.session.take() {
            self.shared.terminate(session, "shutdown");
        }
    }
}

impl Shared {
    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn notify(&self, notification: Notification) {
        let sender = self.notifications.lock().unwrap_or_else(|p| p.into_inner());
        if sender.send(notification).is_err() {
            log::debug!("Observer dispatcher is gone");
        }
    }

    /// Queue a state callback if the transition changed anything.
    fn publish(&self, transition: Transition) {
        match transition {
            Transition::Changed(state) => self.notify(Notification::State(state)),
            Transition::Unchanged => {}
            Transition::Rejected { from, to } => {
                log::debug!("Rejected transition {} -> {}", from, to);
            }
        }
    }

    /// Kill the session's process. Failures are logged and swallowed.
    fn terminate(&self, session: Session, reason: &str) {
        self.sink.log(
            "kill",
            json!({
                "session_id": session.id.to_string(),
                "pid": session.pid(),
                "reason": reason,
            }),
        );
        if let Err(e) = session.process.kill() {
            log::warn!("Failed to terminate transcriber: {}", e);
            self.sink.log(
                "kill_error",
                json!({ "session_id": session.id.to_string(), "error": e.to_string() }),
            );
        }
    }

    /// Apply one process event. Returns `false` once the session is gone.
    fn handle_event(&self, id: &SessionId, event: ProcessEvent) -> bool {
        match event {
            ProcessEvent::Stdout(chunk) => self.handle_stdout(id, &chunk),
            ProcessEvent::Stderr(line) => {
                let inner = self.lock_inner();
                if !owns(&inner, id) {
                    return false;
                }
                log::debug!("transcriber stderr: {}", line);
                self.sink.log(
                    "stderr",
                    json!({ "session_id": id.to_string(), "line": line }),
                );
                true
            }
            ProcessEvent::Exit(exit) => {
                self.handle_exit(id, Some(exit));
                false
            }
        }
    }

    fn handle_stdout(&self, id: &SessionId, chunk: &[u8]) -> bool {
        let mut inner = self.lock_inner();
        let Some(session) = current_session(&mut inner, id) else {
            return false;
        };
        if session.detached {
            return true;
        }

        if let Some(delay) = session.timing.mark_first_output(Instant::now()) {
            self.sink.log(
                "first_output",
                json!({ "session_id": id.to_string(), "ms_since_spawn": delay.as_millis() as u64 }),
            );
        }

        let lines: Vec<String> = session.decoder.feed(chunk).collect();
        for line in lines {
            if !current_session(&mut inner, id).is_some_and(|s| !s.detached) {
                break;
            }
            self.handle_line(&mut inner, id, &line);
        }
        owns(&inner, id)
    }

    fn handle_line(&self, inner: &mut Inner, id: &SessionId, line: &str) {
        self.sink.log(
            "stdout",
            json!({ "session_id": id.to_string(), "line": line }),
        );

        let update = match parse_line(line) {
            Ok(update) => update,
            Err(e) => {
                log::warn!("{}", e);
                self.sink.log(
                    "parse_error",
                    json!({ "session_id": id.to_string(), "line": line, "error": e.source.to_string() }),
                );
                if let Some(session) = current_session(inner, id) {
                    session.detached = true;
                }
                let transition = inner.machine.fail();
                self.publish(transition);
                return;
            }
        };

        match update {
            ChildProcessUpdate::Info { message } => {
                self.sink.log(
                    "child_info",
                    json!({ "session_id": id.to_string(), "message": message }),
                );
            }
            ChildProcessUpdate::Error { message } => {
                log::warn!("transcriber reported error: {}", message);
                self.sink.log(
                    "child_error",
                    json!({ "session_id": id.to_string(), "message": message }),
                );
                if let Some(session) = inner.session.take() {
                    self.terminate(session, "child_error");
                }
                let transition = inner.machine.fail();
                self.publish(transition);
            }
            ChildProcessUpdate::StateChange { state, .. } => {
                self.apply_state_change(inner, id, state, update.transcript());
            }
        }
    }

    fn apply_state_change(
        &self,
        inner: &mut Inner,
        id: &SessionId,
        state: LoadingState,
        transcript: Option<String>,
    ) {
        self.sink.log(
            "state_change",
            json!({ "session_id": id.to_string(), "state": state }),
        );

        let transition = inner.machine.apply_reported(state);
        if let Transition::Rejected { from, to } = transition {
            self.sink.log(
                "ignored_state",
                json!({ "session_id": id.to_string(), "from": from, "to": to }),
            );
            return;
        }
        self.publish(transition);

        if !state.is_terminal() {
            return;
        }
        let Some(session) = current_session(inner, id) else {
            return;
        };
        session.detached = true;

        let Some(text) = transcript else {
            return;
        };
        if let Some(timing) = session.timing.mark_ready(Instant::now()) {
            self.sink.log(
                "ready",
                json!({
                    "session_id": id.to_string(),
                    "ms_since_spawn": timing.since_spawn.as_millis() as u64,
                    "ms_since_first_output": timing.since_first_output.map(|d| d.as_millis() as u64),
                }),
            );
        }
        if !session.result_delivered {
            session.result_delivered = true;
            self.notify(Notification::Result(text));
        }
    }

    /// The process went away: an exit status, or the event channel closed.
    fn handle_exit(&self, id: &SessionId, exit: Option<ProcessExit>) {
        let mut inner = self.lock_inner();
        if !owns(&inner, id) {
            return;
        }
        let Some(mut session) = inner.session.take() else {
            return;
        };

        let fields = json!({
            "session_id": id.to_string(),
            "code": exit.and_then(|e| e.code),
            "signal": exit.and_then(|e| e.signal),
        });
        if session.detached {
            self.sink.log("exit_after_terminal", fields);
            return;
        }

        log::warn!("Transcriber exited before reporting a result: {:?}", exit);
        self.sink.log("exit", fields);
        if let Some(rest) = session.decoder.take_remainder() {
            self.sink.log(
                "unterminated_output",
                json!({ "session_id": id.to_string(), "line": rest }),
            );
        }
        self.terminate(session, "exit");
        let transition = inner.machine.fail();
        self.publish(transition);
    }

    /// No event arrived within the stall timeout. Returns `false` once the
    /// session is gone.
    fn handle_stall(&self, id: &SessionId, timeout: Duration) -> bool {
        let mut inner = self.lock_inner();
        let Some(session) = current_session(&mut inner, id) else {
            return false;
        };
        if session.detached {
            return true;
        }

        log::warn!("Transcriber stalled for {:?}", timeout);
        self.sink.log(
            "watchdog_timeout",
            json!({ "session_id": id.to_string(), "timeout_ms": timeout.as_millis() as u64 }),
        );
        if let Some(session) = inner.session.take() {
            self.terminate(session, "watchdog");
        }
        let transition = inner.machine.fail();
        self.publish(transition);
        false
    }
}

fn owns(inner: &Inner, id: &SessionId) -> bool {
    inner.session.as_ref().is_some_and(|s| s.id == *id)
}

fn current_session<'a>(inner: &'a mut Inner, id: &SessionId) -> Option<&'a mut Session> {
    inner.session.as_mut().filter(|s| s.id == *id)
}

fn run_event_loop(shared: Arc<Shared>, id: SessionId, events: Receiver<ProcessEvent>) {
    loop {
        let event = match shared.config.stall_timeout {
            Some(timeout) => match events.recv_timeout(timeout) {
                Ok(event) => Some(event),
                Err(RecvTimeoutError::Timeout) => {
                    if shared.handle_stall(&id, timeout) {
                        continue;
                    }
                    return;
                }
                Err(RecvTimeoutError::Disconnected) => None,
            },
            None => events.recv().ok(),
        };

        match event {
            Some(event) => {
                if !shared.handle_event(&id, event) {
                    return;
                }
            }
            None => {
                // Channel closed without an exit status.
                shared.handle_exit(&id, None);
                return;
            }
        }
    }
}

fn spawn_dispatcher(observer: Arc<dyn SessionObserver>) -> Sender<Notification> {
    let (tx, rx) = mpsc::channel::<Notification>();
    thread::spawn(move || {
        for notification in rx {
            match notification {
                Notification::State(state) => observer.on_state_change(state),
                Notification::Result(text) => observer.on_result(&text),
            }
        }
    });
    tx
}
