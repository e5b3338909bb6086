//! Transforms a [`crate::SandboxConfig`] into a concrete child-process
//! launch, and owns the lifecycle of whatever state that launch needs
//! (persistence directories, transient tmpfs-backed overlay state).
//!
//! Modeled as a sum type with one variant per isolation backend rather than
//! a trait object, so matching on the kind when building the helper command
//! line stays exhaustive and doesn't need dynamic dispatch.

pub mod container;
pub mod privileged;
pub mod unprivileged;

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::PathBuf;

use crate::config::SandboxConfig;
use crate::error::{Error, HostError};
use crate::persist::{PersistenceDirManager, PersistenceRoot};

/// Which isolation backend an [`Executor`] uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, derive_more::Display)]
pub enum ExecutorKind {
	#[display("unprivileged-userns")]
	UnprivilegedUserNamespaces,
	#[display("privileged-userns")]
	PrivilegedUserNamespaces,
	#[display("container-runtime")]
	ContainerRuntime,
}

/// Preference order used by [`with_executor`] when the caller doesn't name
/// a specific kind: prefer the backend that needs no escalation, then the
/// one that does, then the container runtime as a last resort.
pub const PREFERENCE_ORDER: [ExecutorKind; 3] = [
	ExecutorKind::UnprivilegedUserNamespaces,
	ExecutorKind::PrivilegedUserNamespaces,
	ExecutorKind::ContainerRuntime,
];

/// Whether `kind` can run on the current host.
#[must_use]
pub fn available(kind: ExecutorKind) -> bool {
	match kind {
		ExecutorKind::UnprivilegedUserNamespaces => unprivileged::available(),
		ExecutorKind::PrivilegedUserNamespaces => privileged::available(),
		ExecutorKind::ContainerRuntime => container::available(),
	}
}

/// A fully-resolved child-process launch: program, argv, environment, and
/// whether stdio should be inherited from this process.
///
/// Returned by [`Executor::build_command`] so tests can inspect the exact
/// command line an executor would run without actually spawning it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltCommand {
	pub program: PathBuf,
	pub args: Vec<OsString>,
	pub env: BTreeMap<String, String>,
}

/// Bytes captured from a finished child, for streams configured with
/// [`crate::Stdio::Pipe`].
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
	pub status: std::process::ExitStatus,
	pub stdout: Option<Vec<u8>>,
	pub stderr: Option<Vec<u8>>,
}

impl RunOutput {
	#[must_use]
	pub fn success(&self) -> bool {
		self.status.success()
	}
}

/// Per-executor-instance live state: the persistence root chosen for this
/// instance (if any), the upper/work directories handed out from it, and
/// any scratch directories that must be removed on release.
#[derive(Debug, Default)]
pub(crate) struct ExecutorState {
	pub(crate) persistence_root: Option<PersistenceRoot>,
	pub(crate) persistent_dirs: PersistenceDirManager,
	pub(crate) scratch_dirs: Vec<tempfile::TempDir>,
}

impl ExecutorState {
	fn cleanup(&mut self) {
		// Dropping the TempDir guards removes them; this just makes the
		// intent explicit and gives cleanup() a place to hang future
		// explicit-unmount logic if a backend ever needs it.
		self.scratch_dirs.clear();
	}
}

/// One acquired isolation backend, ready to run commands.
///
/// Obtained from [`with_executor`], which guarantees [`Executor::release`]
/// runs on every exit path including a panic unwinding through `body`.
pub enum Executor {
	UnprivilegedUserNamespaces(unprivileged::Unprivileged),
	PrivilegedUserNamespaces(privileged::Privileged),
	ContainerRuntime(container::Container),
}

impl Executor {
	fn acquire(kind: ExecutorKind) -> Result<Self, Error> {
		if !available(kind) {
			return Err(Error::Host(HostError::ExecutorUnavailable(kind)));
		}
		Ok(match kind {
			ExecutorKind::UnprivilegedUserNamespaces => {
				Executor::UnprivilegedUserNamespaces(unprivileged::Unprivileged::new())
			},
			ExecutorKind::PrivilegedUserNamespaces => {
				Executor::PrivilegedUserNamespaces(privileged::Privileged::new()?)
			},
			ExecutorKind::ContainerRuntime => {
				Executor::ContainerRuntime(container::Container::new())
			},
		})
	}

	#[must_use]
	pub fn kind(&self) -> ExecutorKind {
		match self {
			Executor::UnprivilegedUserNamespaces(_) => ExecutorKind::UnprivilegedUserNamespaces,
			Executor::PrivilegedUserNamespaces(_) => ExecutorKind::PrivilegedUserNamespaces,
			Executor::ContainerRuntime(_) => ExecutorKind::ContainerRuntime,
		}
	}

	/// Transform `config` and `user_argv` into a concrete launch, without
	/// spawning anything. Exposed for tests; [`Executor::run`] uses this
	/// internally.
	pub fn build_command(
		&mut self,
		config: &SandboxConfig,
		user_argv: &[String],
	) -> Result<BuiltCommand, Error> {
		match self {
			Executor::UnprivilegedUserNamespaces(executor) => {
				executor.build_command(config, user_argv)
			},
			Executor::PrivilegedUserNamespaces(executor) => {
				executor.build_command(config, user_argv)
			},
			Executor::ContainerRuntime(executor) => executor.build_command(config, user_argv),
		}
	}

	/// Build the command, spawn it, and block until it exits.
	pub fn run(&mut self, config: &SandboxConfig, user_argv: &[String]) -> Result<RunOutput, Error> {
		let built = self.build_command(config, user_argv)?;
		crate::spawn::run_built_command(&built, config.stdio())
	}

	pub(crate) fn cleanup(&mut self) {
		match self {
			Executor::UnprivilegedUserNamespaces(executor) => executor.state.cleanup(),
			Executor::PrivilegedUserNamespaces(executor) => executor.state.cleanup(),
			Executor::ContainerRuntime(executor) => executor.state.cleanup(),
		}
	}
}

/// Acquire an executor, run `body`, and release it on every exit path
/// (including `body` returning an error or panicking).
///
/// `kind`, if given, picks a specific backend; otherwise the first of
/// [`PREFERENCE_ORDER`] that [`available`] reports usable is acquired.
pub fn with_executor<T>(
	kind: Option<ExecutorKind>,
	body: impl FnOnce(&mut Executor) -> Result<T, Error>,
) -> Result<T, Error> {
	let kind = match kind {
		Some(kind) => kind,
		None => PREFERENCE_ORDER
			.into_iter()
			.find(|&kind| available(kind))
			.ok_or(Error::Host(HostError::NoExecutorAvailable))?,
	};

	let executor = Executor::acquire(kind)?;
	let mut guard = scopeguard::guard(executor, |mut executor| executor.cleanup());
	body(&mut guard)
}
