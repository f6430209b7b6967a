//! Command construction for the transcriber subprocess.
//!
//! The transcriber normally runs directly (`<interpreter> <script>`). When a
//! shell prefix such as `/bin/zsh -l -c` is configured, the quoted command is
//! handed to that shell instead, which picks up the user's login environment.

use std::process::{Command, ExitStatus};

/// Exit status of a terminated subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessExit {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Prepend the program's parent directory to PATH.
///
/// For a virtualenv interpreter this puts the venv's `bin` first, so tools
/// the script shells out to resolve from the same environment.
pub fn prepare_path_env(cmd: &mut Command, program: &str) {
    if !program.contains('/') {
        return;
    }
    let Some(dir) = std::path::Path::new(program).parent().and_then(|d| d.to_str()) else {
        return;
    };
    if dir.is_empty() {
        return;
    }
    let existing = std::env::var("PATH").unwrap_or_default();
    let combined = if existing.is_empty() {
        dir.to_string()
    } else {
        format!("{}:{}", dir, existing)
    };
    cmd.env("PATH", combined);
}

/// Build the command that runs `program` with `args`.
///
/// With a non-empty `shell_prefix` the result is `<prefix> '<quoted command>'`;
/// otherwise the program is executed directly.
pub fn build_command(
    program: &str,
    args: &[String],
    working_dir: Option<&str>,
    shell_prefix: Option<&str>,
) -> Result<Command, String> {
    let mut cmd = match shell_prefix.filter(|p| !p.trim().is_empty()) {
        Some(prefix) => wrap_in_shell(program, args, prefix)?,
        None => {
            let mut cmd = Command::new(program);
            cmd.args(args);
            cmd
        }
    };

    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    prepare_path_env(&mut cmd, program);

    Ok(cmd)
}

fn wrap_in_shell(program: &str, args: &[String], prefix: &str) -> Result<Command, String> {
    let mut prefix_parts = prefix.split_whitespace();
    let shell_program = prefix_parts
        .next()
        .ok_or_else(|| "Empty shell prefix".to_string())?;

    let mut command_parts = Vec::with_capacity(args.len() + 1);
    for part in std::iter::once(program).chain(args.iter().map(String::as_str)) {
        command_parts.push(
            shlex::try_quote(part)
                .map_err(|_| format!("Cannot quote argument: {}", part))?
                .into_owned(),
        );
    }

    let mut cmd = Command::new(shell_program);
    cmd.args(prefix_parts).arg(command_parts.join(" "));
    Ok(cmd)
}
