//! `dictate` - terminal front-end for the transcriber.
//!
//! Starts a dictation session, shows progress on stderr, sends the finish
//! signal when Enter is pressed and prints the transcript on stdout.

use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Weak};
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast::{self, error::RecvError};

use dictate_core::event_bus::{BroadcastEvent, BusObserver, DictationEvent, EventBus};
use dictate_core::paths::{expand_tilde, TranscriberEnv};
use dictate_core::{JsonLineLog, LoadingState, ProcessSupervisor, SupervisorConfig};

/// How long to wait for the transcript after `ready` is reported.
const RESULT_GRACE: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "dictate", version, about = "Dictate text from the terminal")]
struct Args {
    /// Directory containing transcribe.py; the transcriber runs from here
    #[arg(long, env = "DICTATE_ASSETS_DIR", default_value = ".")]
    assets_dir: String,

    /// Virtualenv holding the interpreter [default: ~/.config/raycast-dictate/.venv]
    #[arg(long, env = "DICTATE_VENV")]
    venv: Option<String>,

    /// Interpreter to run, overriding the virtualenv's python
    #[arg(long, env = "DICTATE_INTERPRETER")]
    interpreter: Option<String>,

    /// Transcriber script, overriding <assets-dir>/transcribe.py
    #[arg(long, env = "DICTATE_SCRIPT")]
    script: Option<String>,

    /// Directory for dictate.log
    #[arg(long, env = "DICTATE_LOG_DIR")]
    log_dir: Option<String>,

    /// Run the transcriber through a shell, e.g. "/bin/zsh -l -c"
    #[arg(long, env = "DICTATE_SHELL_PREFIX")]
    shell_prefix: Option<String>,

    /// Give up when the transcriber is silent for this many seconds
    #[arg(long, env = "DICTATE_STALL_TIMEOUT_SECS")]
    stall_timeout_secs: Option<u64>,
}

fn build_config(args: &Args) -> Result<SupervisorConfig, String> {
    let assets_dir = expand_tilde(&args.assets_dir);
    let mut transcriber = match &args.venv {
        Some(venv) => TranscriberEnv::new(&expand_tilde(venv), &assets_dir),
        None => TranscriberEnv::with_default_venv(&assets_dir)?,
    };
    if let Some(interpreter) = &args.interpreter {
        transcriber = transcriber.interpreter(expand_tilde(interpreter));
    }
    if let Some(script) = &args.script {
        transcriber = transcriber.script(expand_tilde(script));
    }

    let mut config = SupervisorConfig::new(transcriber).env("PYTHONUNBUFFERED", "1");
    if let Some(prefix) = &args.shell_prefix {
        config = config.shell_prefix(prefix);
    }
    if let Some(secs) = args.stall_timeout_secs.filter(|s| *s > 0) {
        config = config.stall_timeout(Duration::from_secs(secs));
    }
    Ok(config)
}

fn describe(state: LoadingState) -> &'static str {
    match state {
        LoadingState::Idle => "Idle.",
        LoadingState::Initializing => "Initializing...",
        LoadingState::Listening => "Listening... press Enter to finish and transcribe.",
        LoadingState::Processing => "Processing your audio...",
        LoadingState::Ready => "Done.",
        LoadingState::Error => "Dictation failed.",
    }
}

/// How a session ended, from the consumer's side.
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Transcript(String),
    NoTranscript,
    Failed,
    Cancelled,
}

async fn wait_for_outcome(rx: &mut broadcast::Receiver<BroadcastEvent>) -> Outcome {
    let mut ready = false;
    loop {
        let received = if ready {
            match tokio::time::timeout(RESULT_GRACE, rx.recv()).await {
                Ok(received) => received,
                Err(_) => return Outcome::NoTranscript,
            }
        } else {
            rx.recv().await
        };

        let event = match received {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                log::warn!("Missed {} dictation events", missed);
                continue;
            }
            Err(RecvError::Closed) => return Outcome::Failed,
        };

        match DictationEvent::from_broadcast(&event) {
            Some(DictationEvent::State(state)) => {
                eprintln!("{}", describe(state));
                match state {
                    LoadingState::Ready => ready = true,
                    LoadingState::Error => return Outcome::Failed,
                    LoadingState::Idle => return Outcome::Cancelled,
                    _ => {}
                }
            }
            Some(DictationEvent::Result(text)) => return Outcome::Transcript(text),
            None => {}
        }
    }
}

/// Send the finish signal whenever Enter is pressed while listening.
fn spawn_enter_listener(supervisor: Weak<ProcessSupervisor>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            if line.is_err() {
                break;
            }
            let Some(supervisor) = supervisor.upgrade() else {
                break;
            };
            if supervisor.state() == LoadingState::Listening {
                supervisor.signal_finish();
            }
        }
    });
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid configuration: {}", e);
            return ExitCode::from(2);
        }
    };

    let log_dir: Option<PathBuf> = args.log_dir.as_deref().map(expand_tilde);
    let sink = Arc::new(JsonLineLog::new(log_dir.as_deref()));
    let bus = Arc::new(EventBus::new());
    let mut rx = bus.subscribe();
    let supervisor = Arc::new(ProcessSupervisor::new(
        config,
        sink,
        Arc::new(BusObserver::new(Arc::clone(&bus))),
    ));

    supervisor.start();
    spawn_enter_listener(Arc::downgrade(&supervisor));

    let outcome = tokio::select! {
        outcome = wait_for_outcome(&mut rx) => outcome,
        _ = tokio::signal::ctrl_c() => {
            supervisor.kill();
            return ExitCode::from(130);
        }
    };
    drop(supervisor);

    match outcome {
        Outcome::Transcript(text) => {
            println!("{}", text);
            ExitCode::SUCCESS
        }
        Outcome::NoTranscript => ExitCode::SUCCESS,
        Outcome::Failed => ExitCode::FAILURE,
        Outcome::Cancelled => ExitCode::from(130),
    }
}
