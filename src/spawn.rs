//! Turns a [`crate::executor::BuiltCommand`] into a running child process
//! and waits for it, translating [`crate::config::StdioConfig`] into
//! concrete file descriptors.
//!
//! This is the only place in the crate that actually calls
//! [`std::process::Command::spawn`]; every executor backend produces a
//! [`crate::executor::BuiltCommand`] and hands it here so stdio handling
//! stays in one place regardless of which backend built the command.

use std::process::{Command, Stdio as ProcessStdio};

use crate::config::{Stdio, StdioConfig};
use crate::error::Error;
use crate::executor::{BuiltCommand, RunOutput};

pub(crate) fn run_built_command(
	built: &BuiltCommand,
	stdio: StdioConfig,
) -> Result<RunOutput, Error> {
	let mut command = Command::new(&built.program);
	command.args(&built.args);
	// The helper/sudo/container-runtime program needs its own PATH (and the
	// rest of this process's environment) to resolve and run; it builds the
	// sandboxed child's environment itself from `--env` flags, so this
	// process's env is never leaked into the sandbox.
	command.envs(&built.env);

	command.stdin(to_process_stdio(stdio.stdin));
	command.stdout(to_process_stdio(stdio.stdout));
	command.stderr(to_process_stdio(stdio.stderr));

	let needs_capture =
		matches!(stdio.stdout, Stdio::Pipe) || matches!(stdio.stderr, Stdio::Pipe);

	if needs_capture {
		let output = command
			.output()
			.map_err(|source| Error::Internal(format!("failed to spawn {:?}: {source}", built.program)))?;
		Ok(RunOutput {
			status: output.status,
			stdout: matches!(stdio.stdout, Stdio::Pipe).then_some(output.stdout),
			stderr: matches!(stdio.stderr, Stdio::Pipe).then_some(output.stderr),
		})
	} else {
		let status = command
			.status()
			.map_err(|source| Error::Internal(format!("failed to spawn {:?}: {source}", built.program)))?;
		Ok(RunOutput { status, stdout: None, stderr: None })
	}
}

fn to_process_stdio(stdio: Stdio) -> ProcessStdio {
	match stdio {
		Stdio::Inherit => ProcessStdio::inherit(),
		Stdio::Null => ProcessStdio::null(),
		Stdio::Pipe => ProcessStdio::piped(),
	}
}
