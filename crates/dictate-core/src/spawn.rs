//! Transcriber process spawning and I/O.
//!
//! Starts the subprocess with three independent pipes and turns everything
//! that happens to it into [`ProcessEvent`]s on a single channel:
//! - raw stdout chunks, exactly as read from the pipe
//! - stderr lines
//! - the exit status
//!
//! Each stream is read on its own thread. The exit watcher holds the exit
//! event back until both readers have hit EOF (or `exit_grace` has passed),
//! so output written just before exiting is normally delivered first.
//! Consumers must still not depend on that ordering.

use crate::shell::{build_command, ProcessExit};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

const READ_CHUNK: usize = 4096;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_EXIT_GRACE: Duration = Duration::from_millis(500);

/// Events emitted by a transcriber process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A chunk of bytes read from stdout
    Stdout(Vec<u8>),
    /// A line read from stderr
    Stderr(String),
    /// The process exited on its own
    Exit(ProcessExit),
}

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Failed to build command: {0}")]
    Command(String),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to capture {0}")]
    Pipe(&'static str),

    #[error("No active stdin")]
    NoStdin,

    #[error("Failed to write to stdin: {0}")]
    Stdin(#[source] io::Error),

    #[error("Failed to terminate process: {0}")]
    Kill(#[source] io::Error),
}

/// Configuration for spawning a process.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Program to execute (the interpreter)
    pub program: String,
    /// Arguments (the script path)
    pub args: Vec<String>,
    /// Working directory for the process
    pub working_dir: Option<String>,
    /// Shell prefix (e.g. "/bin/zsh -l -c"); `None` executes directly
    pub shell_prefix: Option<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// How long the exit watcher waits for the output pipes to drain
    pub exit_grace: Duration,
}

impl SpawnConfig {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
            shell_prefix: None,
            env: Vec::new(),
            exit_grace: DEFAULT_EXIT_GRACE,
        }
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn shell_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.shell_prefix = Some(prefix.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A running transcriber process.
///
/// Owns the OS handle. Dropping it does not terminate the process; call
/// [`TranscriberProcess::kill`] for that.
pub struct TranscriberProcess {
    pid: u32,
    child: Arc<Mutex<Option<Child>>>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    event_receiver: Option<Receiver<ProcessEvent>>,
}

impl TranscriberProcess {
    /// Spawn the process and start its reader and exit-watcher threads.
    pub fn spawn(config: SpawnConfig) -> Result<Self, SpawnError> {
        let mut cmd = build_command(
            &config.program,
            &config.args,
            config.working_dir.as_deref(),
            config.shell_prefix.as_deref(),
        )
        .map_err(SpawnError::Command)?;

        cmd.envs(config.env.iter().map(|(k, v)| (k, v)));
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| SpawnError::Spawn {
            program: config.program.clone(),
            source,
        })?;
        let pid = child.id();

        let stdin = child.stdin.take();
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => return Err(abandon(child, "stdout")),
        };
        let stderr = match child.stderr.take() {
            Some(stderr) => stderr,
            None => return Err(abandon(child, "stderr")),
        };

        let (tx, rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();

        let child_arc = Arc::new(Mutex::new(Some(child)));
        let stdin_arc = Arc::new(Mutex::new(stdin));

        spawn_stdout_reader(stdout, tx.clone(), done_tx.clone());
        spawn_stderr_reader(stderr, tx.clone(), done_tx);
        spawn_exit_watcher(
            Arc::clone(&child_arc),
            Arc::clone(&stdin_arc),
            tx,
            done_rx,
            config.exit_grace,
        );

        Ok(Self {
            pid,
            child: child_arc,
            stdin: stdin_arc,
            event_receiver: Some(rx),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Write raw bytes to stdin and flush.
    pub fn write_stdin(&self, data: &[u8]) -> Result<(), SpawnError> {
        let mut guard = lock(&self.stdin);
        let stdin = guard.as_mut().ok_or(SpawnError::NoStdin)?;
        stdin.write_all(data).map_err(SpawnError::Stdin)?;
        stdin.flush().map_err(SpawnError::Stdin)
    }

    /// Take ownership of the event receiver.
    ///
    /// Returns `None` after the first call.
    pub fn take_receiver(&mut self) -> Option<Receiver<ProcessEvent>> {
        self.event_receiver.take()
    }

    /// Terminate the process immediately and reap it.
    ///
    /// The handle is released even when the terminate call fails. Killing a
    /// process that already exited is not an error.
    pub fn kill(&self) -> Result<(), SpawnError> {
        lock(&self.stdin).take();
        let Some(mut child) = lock(&self.child).take() else {
            return Ok(());
        };
        let killed = child.kill();
        reap(child, killed)
    }
}

/// Reap a child after a kill attempt.
///
/// Only waits inline once the kill went through. A child that could not be
/// killed is handed to a background thread, so the caller never blocks on a
/// process that is still running.
fn reap(mut child: Child, killed: io::Result<()>) -> Result<(), SpawnError> {
    match killed {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
        Err(e) => {
            thread::spawn(move || {
                let _ = child.wait();
            });
            return Err(SpawnError::Kill(e));
        }
    }
    if let Err(e) = child.wait() {
        log::debug!("Failed to reap transcriber process: {}", e);
    }
    Ok(())
}

fn abandon(mut child: Child, pipe: &'static str) -> SpawnError {
    let killed = child.kill();
    if let Err(e) = reap(child, killed) {
        log::warn!("{}", e);
    }
    SpawnError::Pipe(pipe)
}

fn spawn_stdout_reader(
    mut stdout: impl Read + Send + 'static,
    tx: Sender<ProcessEvent>,
    done: Sender<()>,
) {
    thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match stdout.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(ProcessEvent::Stdout(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("stdout read failed: {}", e);
                    break;
                }
            }
        }
        let _ = done.send(());
    });
}

fn spawn_stderr_reader(
    stderr: impl Read + Send + 'static,
    tx: Sender<ProcessEvent>,
    done: Sender<()>,
) {
    thread::spawn(move || {
        let mut reader = BufReader::new(stderr);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line).trim_end().to_string();
                    if tx.send(ProcessEvent::Stderr(text)).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("stderr read failed: {}", e);
                    break;
                }
            }
        }
        let _ = done.send(());
    });
}

fn spawn_exit_watcher(
    child: Arc<Mutex<Option<Child>>>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    tx: Sender<ProcessEvent>,
    readers_done: Receiver<()>,
    grace: Duration,
) {
    thread::spawn(move || loop {
        let status = {
            let mut guard = lock(&child);
            let Some(running) = guard.as_mut() else {
                // Killed by the owner; no exit event.
                return;
            };
            match running.try_wait() {
                Ok(Some(status)) => {
                    guard.take();
                    Some(status)
                }
                Ok(None) => None,
                Err(e) => {
                    log::warn!("Failed to poll transcriber process: {}", e);
                    guard.take();
                    lock(&stdin).take();
                    return;
                }
            }
        };

        if let Some(status) = status {
            lock(&stdin).take();
            let deadline = Instant::now() + grace;
            for _ in 0..2 {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if readers_done.recv_timeout(remaining).is_err() {
                    break;
                }
            }
            let _ = tx.send(ProcessEvent::Exit(ProcessExit::from_status(status)));
            return;
        }

        thread::sleep(EXIT_POLL_INTERVAL);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_until_exit(rx: &Receiver<ProcessEvent>) -> Vec<ProcessEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.recv_timeout(Duration::from_secs(10)) {
            let done = matches!(event, ProcessEvent::Exit(_));
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    fn stdout_text(events: &[ProcessEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                ProcessEvent::Stdout(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn spawn_config_builder() {
        let config = SpawnConfig::new("/usr/bin/python3", vec!["transcribe.py".to_string()])
            .working_dir("/tmp")
            .shell_prefix("/bin/bash -c")
            .env("PYTHONUNBUFFERED", "1")
            .exit_grace(Duration::from_millis(10));

        assert_eq!(config.program, "/usr/bin/python3");
        assert_eq!(config.args, vec!["transcribe.py"]);
        assert_eq!(config.working_dir.as_deref(), Some("/tmp"));
        assert_eq!(config.shell_prefix.as_deref(), Some("/bin/bash -c"));
        assert_eq!(
            config.env,
            vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())]
        );
        assert_eq!(config.exit_grace, Duration::from_millis(10));
    }

    #[test]
    fn spawn_missing_program_fails() {
        let result = TranscriberProcess::spawn(SpawnConfig::new(
            "/definitely/not/a/real/interpreter",
            vec![],
        ));
        assert!(matches!(result, Err(SpawnError::Spawn { .. })));
    }

    #[test]
    #[cfg(unix)]
    fn stdout_arrives_before_exit() {
        let mut process = TranscriberProcess::spawn(SpawnConfig::new(
            "sh",
            vec!["-c".to_string(), "printf 'one\\ntwo\\n'".to_string()],
        ))
        .unwrap();
        let rx = process.take_receiver().unwrap();
        assert!(process.take_receiver().is_none());

        let events = collect_until_exit(&rx);
        assert_eq!(stdout_text(&events), "one\ntwo\n");
        assert!(matches!(
            events.last(),
            Some(ProcessEvent::Exit(exit)) if exit.success()
        ));
    }

    #[test]
    #[cfg(unix)]
    fn stderr_is_line_based() {
        let mut process = TranscriberProcess::spawn(SpawnConfig::new(
            "sh",
            vec!["-c".to_string(), "echo warn1 >&2; echo warn2 >&2".to_string()],
        ))
        .unwrap();
        let rx = process.take_receiver().unwrap();

        let stderr: Vec<String> = collect_until_exit(&rx)
            .into_iter()
            .filter_map(|e| match e {
                ProcessEvent::Stderr(line) => Some(line),
                _ => None,
            })
            .collect();
        assert_eq!(stderr, vec!["warn1", "warn2"]);
    }

    #[test]
    #[cfg(unix)]
    fn stdin_reaches_process() {
        let mut process = TranscriberProcess::spawn(SpawnConfig::new(
            "sh",
            vec!["-c".to_string(), "read line; echo \"got:$line\"".to_string()],
        ))
        .unwrap();
        let rx = process.take_receiver().unwrap();

        process.write_stdin(b"hello\n").unwrap();
        let events = collect_until_exit(&rx);
        assert_eq!(stdout_text(&events), "got:hello\n");
    }

    #[test]
    #[cfg(unix)]
    fn env_and_working_dir_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let config = SpawnConfig::new(
            "sh",
            vec!["-c".to_string(), "echo \"$DICTATE_TEST_VAR\"; pwd".to_string()],
        )
        .working_dir(dir.path().to_str().unwrap())
        .env("DICTATE_TEST_VAR", "set");
        let mut process = TranscriberProcess::spawn(config).unwrap();
        let rx = process.take_receiver().unwrap();

        let out = stdout_text(&collect_until_exit(&rx));
        let mut lines = out.lines();
        assert_eq!(lines.next(), Some("set"));
        let pwd = std::fs::canonicalize(lines.next().unwrap()).unwrap();
        assert_eq!(pwd, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[test]
    #[cfg(unix)]
    fn kill_releases_handle_without_exit_event() {
        let mut process =
            TranscriberProcess::spawn(SpawnConfig::new("sleep", vec!["30".to_string()])).unwrap();
        let rx = process.take_receiver().unwrap();

        process.kill().unwrap();
        // Second kill is a no-op.
        process.kill().unwrap();

        // All senders drop once the readers see EOF; no Exit is reported.
        loop {
            match rx.recv_timeout(Duration::from_secs(10)) {
                Ok(ProcessEvent::Exit(_)) => panic!("unexpected exit event after kill"),
                Ok(_) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => panic!("channel never closed"),
            }
        }
    }

    #[test]
    #[cfg(unix)]
    fn write_after_kill_fails() {
        let process =
            TranscriberProcess::spawn(SpawnConfig::new("sleep", vec!["30".to_string()])).unwrap();
        process.kill().unwrap();
        assert!(matches!(
            process.write_stdin(b"\n"),
            Err(SpawnError::NoStdin)
        ));
    }

    #[test]
    #[cfg(unix)]
    fn failed_kill_does_not_block_on_wait() {
        let child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id();

        let started = Instant::now();
        let result = reap(child, Err(io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(matches!(result, Err(SpawnError::Kill(_))));
        assert!(started.elapsed() < Duration::from_secs(5));

        // The background waiter reaps it once it is gone.
        let _ = std::process::Command::new("kill")
            .args(["-9", &pid.to_string()])
            .status();
    }

    #[test]
    #[cfg(unix)]
    fn reaping_an_exited_child_is_ok() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        child.wait().unwrap();
        let killed = child.kill();
        assert!(reap(child, killed).is_ok());
    }
}
