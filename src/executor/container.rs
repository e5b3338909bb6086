//! Runs the sandbox through an external OCI-compatible container runtime
//! (docker or podman) instead of entering namespaces directly.
//!
//! Mount application translates to the runtime's volume flags; overlayed
//! mounts lean on the runtime's own copy-on-write image layering rather than
//! this crate managing an overlayfs upper/work pair itself. Not every mount
//! combination this crate's data model can express is representable this
//! way; [`Container::build_command`] reports those as
//! [`HostError::UnsupportedMount`] instead of silently downgrading them.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::PathBuf;

use crate::config::SandboxConfig;
use crate::env;
use crate::error::{Error, HostError};
use crate::executor::{BuiltCommand, ExecutorKind, ExecutorState};
use crate::mount::MountType;

#[must_use]
pub fn available() -> bool {
	env::container_runtime_binary().is_some()
}

#[derive(Debug)]
pub struct Container {
	pub(crate) state: ExecutorState,
}

impl Container {
	#[must_use]
	pub fn new() -> Self {
		Self { state: ExecutorState::default() }
	}

	pub fn build_command(
		&mut self,
		config: &SandboxConfig,
		user_argv: &[String],
	) -> Result<BuiltCommand, Error> {
		let runtime = env::container_runtime_binary()
			.ok_or(Error::Host(HostError::ExecutorUnavailable(ExecutorKind::ContainerRuntime)))?;

		let root = config.mounts().root();

		let mut args: Vec<OsString> = vec!["run".into(), "--rm".into()];

		if config.hostname().is_some() {
			args.push("--hostname".into());
			args.push(config.hostname().unwrap().into());
		}

		args.push("--user".into());
		args.push(format!("{}:{}", config.uid(), config.gid()).into());

		args.push("-w".into());
		args.push(config.pwd().into());

		for (key, value) in config.env() {
			args.push("--env".into());
			args.push(format!("{key}={value}").into());
		}

		for (sandbox_path, info) in config.mounts().mount_order() {
			match info.r#type {
				MountType::ReadOnly => {
					args.push("-v".into());
					args.push(
						format!("{}:{}:ro", info.host_path.display(), sandbox_path.display()).into(),
					);
				},
				MountType::ReadWrite => {
					args.push("-v".into());
					args.push(format!("{}:{}", info.host_path.display(), sandbox_path.display()).into());
				},
				MountType::Overlayed => {
					// The runtime's own copy-on-write layer gives us
					// Overlayed semantics for free: mount read-write, but
					// the container's writable layer is discarded with the
					// container, matching persist=false.  Persisting an
					// interior Overlayed mount (not image root) across runs
					// isn't expressible through volume flags alone.
					if sandbox_path != std::path::Path::new("/") && config.persist() {
						return Err(Error::Host(HostError::UnsupportedMount {
							executor: ExecutorKind::ContainerRuntime,
							detail: format!(
								"persistent Overlayed mount at {} has no container-runtime equivalent",
								sandbox_path.display()
							),
						}));
					}
				},
				MountType::OverlayedReadOnly => {
					return Err(Error::Host(HostError::UnsupportedMount {
						executor: ExecutorKind::ContainerRuntime,
						detail: format!(
							"OverlayedReadOnly at {} is not representable by the container runtime",
							sandbox_path.display()
						),
					}));
				},
			}
		}

		args.push(image_reference(&root.host_path).into());
		if let Some(entrypoint) = config.entrypoint() {
			args.push(entrypoint.into());
		}
		args.extend(user_argv.iter().map(OsString::from));

		Ok(BuiltCommand { program: PathBuf::from(runtime), args, env: BTreeMap::new() })
	}
}

impl Default for Container {
	fn default() -> Self {
		Self::new()
	}
}

/// The container runtime addresses images by reference, not by host path;
/// this crate's rootfs is always a host directory, so we hand the runtime a
/// `dir:` OCI transport reference pointing straight at it rather than
/// requiring a separate image-build step (which is explicitly out of scope,
/// see the crate's module docs).
fn image_reference(rootfs_host_path: &std::path::Path) -> String {
	format!("dir:{}", rootfs_host_path.display())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::mount::MountInfo;
	use std::collections::BTreeMap as Map;
	use std::path::PathBuf;

	#[test]
	fn rejects_overlayed_read_only_as_broken_not_silent() {
		let dir = tempfile::tempdir().unwrap();
		let sub = tempfile::tempdir().unwrap();
		let mut mounts = Map::new();
		mounts.insert(
			PathBuf::from("/"),
			MountInfo { host_path: dir.path().to_path_buf(), r#type: MountType::Overlayed },
		);
		mounts.insert(
			PathBuf::from("/ro-overlay"),
			MountInfo { host_path: sub.path().to_path_buf(), r#type: MountType::OverlayedReadOnly },
		);
		let config = SandboxConfig::new(mounts).unwrap().persist(false).build();

		let mut container = Container::new();
		let result = container.build_command(&config, &[]);
		assert!(matches!(
			result,
			Err(Error::Host(HostError::UnsupportedMount { executor: ExecutorKind::ContainerRuntime, .. }))
		));
	}

	#[test]
	fn read_only_mount_gets_ro_volume_flag() {
		let dir = tempfile::tempdir().unwrap();
		let usr = tempfile::tempdir().unwrap();
		let mut mounts = Map::new();
		mounts.insert(
			PathBuf::from("/"),
			MountInfo { host_path: dir.path().to_path_buf(), r#type: MountType::Overlayed },
		);
		mounts.insert(
			PathBuf::from("/usr"),
			MountInfo { host_path: usr.path().to_path_buf(), r#type: MountType::ReadOnly },
		);
		let config = SandboxConfig::new(mounts).unwrap().persist(false).build();
		let mut container = Container::new();
		let built = container.build_command(&config, &["true".to_owned()]);
		// This host may not have docker/podman installed; either the
		// runtime isn't found, or the mount translation produced the
		// expected read-only volume flag.
		match built {
			Ok(built) => assert!(built.args.iter().any(|a| a.to_string_lossy().ends_with(":ro"))),
			Err(Error::Host(HostError::ExecutorUnavailable(_))) => {},
			Err(other) => panic!("unexpected error: {other}"),
		}
	}
}
