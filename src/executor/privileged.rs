//! Runs the same namespace helper as [`crate::executor::unprivileged`], but
//! wrapped in a root-escalation command on hosts that don't allow
//! unprivileged user namespaces.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::config::SandboxConfig;
use crate::env;
use crate::error::{Error, HostError};
use crate::executor::unprivileged::build_helper_command;
use crate::executor::{BuiltCommand, ExecutorState};

/// How the helper is escalated to root.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Wrapper {
	/// Already root; run the helper directly.
	None,
	Sudo,
	Su,
}

/// Picks and memoizes the escalation wrapper for this process: at most one
/// probe of `sudo -n true` and one `which su`, shared by every
/// [`Privileged`] executor instance.
fn wrapper() -> Result<&'static Wrapper, Error> {
	static WRAPPER: OnceLock<Option<Wrapper>> = OnceLock::new();
	WRAPPER
		.get_or_init(|| {
			if host_is_root() {
				return Some(Wrapper::None);
			}
			if binary_exists("sudo") && sudo_noninteractive_works() {
				return Some(Wrapper::Sudo);
			}
			if binary_exists("su") {
				return Some(Wrapper::Su);
			}
			tracing::warn!("no root escalation mechanism (sudo, su) found on this host");
			None
		})
		.as_ref()
		.ok_or(Error::Host(HostError::NoEscalationAvailable))
}

fn host_is_root() -> bool {
	crate::host::uid().is_root()
}

fn binary_exists(name: &str) -> bool {
	let Some(path_var) = std::env::var_os("PATH") else {
		return false;
	};
	std::env::split_paths(&path_var).any(|dir| dir.join(name).is_file())
}

fn sudo_noninteractive_works() -> bool {
	std::process::Command::new("sudo")
		.args(["-n", "true"])
		.stdout(std::process::Stdio::null())
		.stderr(std::process::Stdio::null())
		.status()
		.is_ok_and(|status| status.success())
}

/// True iff this host has any way to escalate to root.
#[must_use]
pub fn available() -> bool {
	env::namespace_helper_binary().is_some() && wrapper().is_ok()
}

#[derive(Debug)]
pub struct Privileged {
	pub(crate) state: ExecutorState,
}

impl Privileged {
	pub(crate) fn new() -> Result<Self, Error> {
		wrapper()?;
		Ok(Self { state: ExecutorState::default() })
	}

	pub fn build_command(
		&mut self,
		config: &SandboxConfig,
		user_argv: &[String],
	) -> Result<BuiltCommand, Error> {
		let helper = env::namespace_helper_binary()
			.ok_or_else(|| Error::Host(HostError::HelperNotFound("PATH".to_owned())))?;
		let inner = build_helper_command(&mut self.state, helper, config, user_argv)?;
		Ok(wrap_with_escalation(inner, wrapper()?))
	}
}

fn wrap_with_escalation(inner: BuiltCommand, wrapper: &Wrapper) -> BuiltCommand {
	match wrapper {
		Wrapper::None => inner,
		Wrapper::Sudo => {
			let mut args = vec![OsString::from(inner.program)];
			args.extend(inner.args);
			BuiltCommand { program: PathBuf::from("sudo"), args, env: inner.env }
		},
		Wrapper::Su => {
			let mut command_line = inner.program.to_string_lossy().into_owned();
			for arg in &inner.args {
				command_line.push(' ');
				command_line.push_str(&shell_quote(&arg.to_string_lossy()));
			}
			BuiltCommand {
				program: PathBuf::from("su"),
				args: vec!["root".into(), "-c".into(), command_line.into()],
				env: inner.env,
			}
		},
	}
}

fn shell_quote(s: &str) -> String {
	format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sudo_wrapper_prepends_program_as_argument() {
		let inner = BuiltCommand {
			program: PathBuf::from("nsbox-helper"),
			args: vec!["--rootfs".into(), "/tmp".into()],
			env: Default::default(),
		};
		let wrapped = wrap_with_escalation(inner, &Wrapper::Sudo);
		assert_eq!(wrapped.program, PathBuf::from("sudo"));
		assert_eq!(wrapped.args[0], OsString::from("nsbox-helper"));
		assert_eq!(wrapped.args[1], OsString::from("--rootfs"));
	}

	#[test]
	fn su_wrapper_builds_single_shell_command() {
		let inner = BuiltCommand {
			program: PathBuf::from("nsbox-helper"),
			args: vec!["--hostname".into(), "it's-a-sandbox".into()],
			env: Default::default(),
		};
		let wrapped = wrap_with_escalation(inner, &Wrapper::Su);
		assert_eq!(wrapped.program, PathBuf::from("su"));
		assert_eq!(wrapped.args[0], OsString::from("root"));
		assert_eq!(wrapped.args[1], OsString::from("-c"));
		assert!(wrapped.args[2].to_string_lossy().contains("nsbox-helper"));
	}

	#[test]
	fn none_wrapper_is_a_no_op() {
		let inner = BuiltCommand {
			program: PathBuf::from("nsbox-helper"),
			args: vec!["--verbose".into()],
			env: Default::default(),
		};
		let wrapped = wrap_with_escalation(inner.clone(), &Wrapper::None);
		assert_eq!(wrapped, inner);
	}
}
