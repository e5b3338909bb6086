use std::path::PathBuf;

use crate::executor::ExecutorKind;

/// Errors produced by this crate's public operations.
///
/// Every fallible public operation returns this type rather than an opaque
/// boxed error, so callers can match on the kind without downcasting. Most
/// variants carry enough context to act on programmatically; use the
/// [`std::fmt::Display`] impl for a message suitable for logs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// A [`crate::SandboxConfig`] failed validation before any process was spawned.
	#[error("invalid sandbox configuration: {0}")]
	Config(#[from] ConfigError),

	/// The host can't satisfy a request: no available executor, no escalation
	/// mechanism, no persistence root, or every overlay probe failed.
	#[error("sandbox host error: {0}")]
	Host(#[from] HostError),

	/// A kernel table or other expected file couldn't be read when the read
	/// was load-bearing rather than best-effort.
	#[error("failed to read {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	/// The sandboxed command ran and exited with a non-zero status.
	#[error("command exited with {status}")]
	ChildFailure { status: std::process::ExitStatus },

	/// A helper program (namespace helper, overlay probe, container runtime)
	/// produced output this crate couldn't interpret.
	#[error("internal error: {0}")]
	Internal(String),
}

impl Error {
	/// True if this error represents the sandboxed command itself failing,
	/// as opposed to this crate failing to run it at all.
	#[must_use]
	pub fn is_child_failure(&self) -> bool {
		matches!(self, Error::ChildFailure { .. })
	}
}

/// Configuration-time failures, raised by [`crate::SandboxConfig`] constructors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("mount graph is missing the required \"/\" entry")]
	MissingRoot,

	#[error("sandbox path {0:?} must be absolute")]
	SandboxPathNotAbsolute(PathBuf),

	#[error("host path {0:?} must be absolute")]
	HostPathNotAbsolute(PathBuf),

	#[error("host path {0:?} must be a directory for an overlayed mount")]
	OverlayedHostPathNotDirectory(PathBuf),

	#[error("pwd {0:?} must be an absolute sandbox path")]
	PwdNotAbsolute(PathBuf),

	#[error("entrypoint {0:?} must be an absolute sandbox path")]
	EntrypointNotAbsolute(PathBuf),

	#[error("sandbox path {0:?} given twice in legacy-form mount maps")]
	DuplicateMount(PathBuf),
}

/// Host-discovery failures, raised when acquiring an executor or selecting
/// a persistence root.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
	#[error("no sandbox executor is available on this host")]
	NoExecutorAvailable,

	#[error("executor {0:?} is not available on this host")]
	ExecutorUnavailable(ExecutorKind),

	#[error("root escalation is required but no mechanism (sudo, su) is available")]
	NoEscalationAvailable,

	#[error("could not find a persistence root that supports overlayfs for {0:?}")]
	NoPersistenceRoot(PathBuf),

	#[error("mount combination is not supported by the {executor:?} executor: {detail}")]
	UnsupportedMount {
		executor: ExecutorKind,
		detail: String,
	},

	#[error("namespace helper binary was not found (searched {0:?})")]
	HelperNotFound(String),
}
