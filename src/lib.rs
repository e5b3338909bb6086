//! Linux process sandboxing: run a child command inside an isolated root
//! filesystem assembled from host directories bind-mounted or overlaid at
//! chosen sandbox paths.
//!
//! # What's available
//!
//! A sandbox's filesystem is described entirely by a [`MountGraph`]: every
//! sandbox path is either a read-only or read-write bind mount of a host
//! directory, or an overlay whose writes are captured separately from the
//! host (optionally persisted across runs). The actual namespace entry and
//! mount application happens in an external helper program this crate
//! invokes with the right flags; three [`ExecutorKind`] backends choose how
//! that helper gets root: unprivileged user namespaces, a privileged
//! (`sudo`/`su`-wrapped) user namespace, or an external container runtime.
//!
//! This crate does not build or download rootfs images, does not ship the
//! namespace helper binary itself, and does not run on anything but Linux.
//!
//! # Example
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), nsbox::Error> {
//! let mut mounts = BTreeMap::new();
//! mounts.insert(
//!     PathBuf::from("/"),
//!     nsbox::MountInfo {
//!         host_path: PathBuf::from("/var/lib/nsbox/rootfs"),
//!         r#type: nsbox::MountType::Overlayed,
//!     },
//! );
//! let config = nsbox::SandboxConfig::new(mounts)?
//!     .env_var("PATH", "/usr/bin:/bin")
//!     .build();
//!
//! let output = nsbox::with_executor(None, |executor| {
//!     nsbox::run(executor, &config, &["echo".to_owned(), "hello".to_owned()])
//! })?;
//! assert!(output.success());
//! # Ok(())
//! # }
//! ```

#![cfg(target_os = "linux")]

mod config;
mod env;
pub mod error;
pub mod executor;
mod host;
mod mount;
mod persist;
mod spawn;

pub use config::{SandboxConfig, SandboxConfigBuilder, Stdio, StdioConfig};
pub use error::Error;
pub use executor::{
	available as executor_available, with_executor, Executor, ExecutorKind, RunOutput,
};
pub use host::{is_encrypted, kernel_version, realpath_stem, KernelVersion};
pub use mount::{MountGraph, MountInfo, MountType};
pub use persist::{find_persist_root, PersistenceKey, PersistenceRoot};

/// Build the command for `config`, spawn it under `executor`, and block
/// until it exits.
///
/// A non-zero exit status is *not* an error here: it comes back as
/// `Ok(output)` with `output.success() == false`. Use [`success`] if a
/// non-zero exit should surface as [`Error::ChildFailure`] instead.
pub fn run(
	executor: &mut Executor,
	config: &SandboxConfig,
	argv: &[String],
) -> Result<RunOutput, Error> {
	let span =
		tracing::info_span!("sandbox_run", executor = %executor.kind(), argv_len = argv.len());
	let _enter = span.enter();
	executor.run(config, argv)
}

/// Like [`run`], but treats a non-zero exit status as [`Error::ChildFailure`].
pub fn success(
	executor: &mut Executor,
	config: &SandboxConfig,
	argv: &[String],
) -> Result<RunOutput, Error> {
	let output = run(executor, config, argv)?;
	if !output.success() {
		return Err(Error::ChildFailure { status: output.status });
	}
	Ok(output)
}
