//! Runs the sandbox through the namespace helper with no root escalation,
//! relying on the kernel's unprivileged user namespace support.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::config::SandboxConfig;
use crate::env;
use crate::error::{Error, HostError};
use crate::executor::{BuiltCommand, ExecutorState};
use crate::host;
use crate::mount::MountType;
use crate::persist::PersistenceKey;

/// Whether unprivileged user namespaces are usable: the kernel allows them
/// and the namespace helper binary can be found.
#[must_use]
pub fn available() -> bool {
	unprivileged_userns_enabled() && env::namespace_helper_binary().is_some()
}

fn unprivileged_userns_enabled() -> bool {
	// Distros that restrict unprivileged user namespaces expose a sysctl
	// that defaults to enabled; its absence means the kernel doesn't gate
	// the feature at all.
	match std::fs::read_to_string("/proc/sys/kernel/unprivileged_userns_clone") {
		Ok(value) => value.trim() == "1",
		Err(_) => true,
	}
}

#[derive(Debug)]
pub struct Unprivileged {
	pub(crate) state: ExecutorState,
}

impl Unprivileged {
	#[must_use]
	pub fn new() -> Self {
		Self { state: ExecutorState::default() }
	}

	pub fn build_command(
		&mut self,
		config: &SandboxConfig,
		user_argv: &[String],
	) -> Result<BuiltCommand, Error> {
		let helper = env::namespace_helper_binary()
			.ok_or_else(|| Error::Host(HostError::HelperNotFound("PATH".to_owned())))?;
		build_helper_command(&mut self.state, helper, config, user_argv)
	}
}

impl Default for Unprivileged {
	fn default() -> Self {
		Self::new()
	}
}

/// Shared by [`Unprivileged`] and the privileged backend, which wraps the
/// exact same command line in a root-escalation wrapper.
pub(crate) fn build_helper_command(
	state: &mut ExecutorState,
	helper: PathBuf,
	config: &SandboxConfig,
	user_argv: &[String],
) -> Result<BuiltCommand, Error> {
	let root = config.mounts().root();
	let mut args: Vec<OsString> = Vec::new();

	args.push("--rootfs".into());
	args.push(root.host_path.clone().into());
	push_workspace_flag(state, config, Path::new("/"), &root.host_path, &mut args)?;

	for (sandbox_path, info) in config.mounts().mount_order() {
		args.push("--mount".into());
		args.push(format!(
			"{}:{}:{}",
			info.host_path.display(),
			sandbox_path.display(),
			info.r#type
		)
		.into());
		if info.r#type.is_overlayed() {
			push_workspace_flag(state, config, sandbox_path, &info.host_path, &mut args)?;
		}
	}

	for (key, value) in config.env() {
		args.push("--env".into());
		args.push(format!("{key}={value}").into());
	}

	args.push("--cd".into());
	args.push(config.pwd().into());

	args.push("--uid".into());
	args.push(config.uid().to_string().into());
	args.push("--gid".into());
	args.push(config.gid().to_string().into());

	if let Some(hostname) = config.hostname() {
		args.push("--hostname".into());
		args.push(hostname.into());
	}

	if let Some(entrypoint) = config.entrypoint() {
		args.push("--entrypoint".into());
		args.push(entrypoint.into());
	}

	if let Some(tmpfs_size) = config.tmpfs_size() {
		args.push("--tmpfs-size".into());
		args.push(tmpfs_size.to_string().into());
	}

	for tag in config.multiarch_formats() {
		args.push("--multiarch".into());
		args.push(tag.into());
	}

	if state.persistence_root.as_ref().is_some_and(|root| root.userxattr) {
		args.push("--userxattr".into());
	}

	if config.verbose() {
		args.push("--verbose".into());
	}

	args.push("--".into());
	args.extend(user_argv.iter().map(OsString::from));

	Ok(BuiltCommand { program: helper, args, env: BTreeMap::new() })
}

/// Resolve and emit `--workspace <upper>:<work>` for one overlayed mount,
/// creating the backing directories if this is their first use.
///
/// Persistent overlays are keyed by `(rootfs, sandbox_path)` on the
/// executor's [`crate::persist::PersistenceDirManager`] so repeated runs in
/// the same `with_executor` scope reuse the same upper/work pair.
/// Non-persistent overlays must NOT go through that cache: the key is the
/// same on every run, so caching would hand a later run the previous run's
/// scratch directories instead of the fresh one just created, leaking
/// overlay state across runs that are supposed to discard it. Each
/// non-persistent call gets its own `TempDir` and builds upper/work directly
/// under it, uncached.
fn push_workspace_flag(
	state: &mut ExecutorState,
	config: &SandboxConfig,
	sandbox_path: &Path,
	rootfs_host_path: &Path,
	args: &mut Vec<OsString>,
) -> Result<(), Error> {
	let (upper, work) = if config.persist() {
		if state.persistence_root.is_none() {
			let hints = env::persistence_root_hints();
			let root = crate::persist::find_persist_root(rootfs_host_path, &hints, config.verbose())
				.map_err(|source| Error::Internal(source.to_string()))?
				.ok_or_else(|| HostError::NoPersistenceRoot(rootfs_host_path.to_path_buf()))?;
			state.persistence_root = Some(root);
		}
		let base_dir = state.persistence_root.as_ref().expect("just set").path.clone();
		let key = PersistenceKey::new(rootfs_host_path.to_path_buf(), sandbox_path.to_path_buf());
		let dirs = state
			.persistent_dirs
			.dirs_for(key, &base_dir)
			.map_err(|source| Error::Internal(source.to_string()))?;
		(dirs.upper.clone(), dirs.work.clone())
	} else {
		let scratch = tempfile::tempdir()
			.map_err(|source| Error::Internal(format!("failed to create scratch dir: {source}")))?;
		let upper = scratch.path().join("upper");
		let work = scratch.path().join("work");
		std::fs::create_dir_all(&upper)
			.map_err(|source| Error::Internal(format!("failed to create overlay upper dir: {source}")))?;
		std::fs::create_dir_all(&work)
			.map_err(|source| Error::Internal(format!("failed to create overlay work dir: {source}")))?;
		state.scratch_dirs.push(scratch);
		(upper, work)
	};

	args.push("--workspace".into());
	args.push(format!("{}:{}", upper.display(), work.display()).into());
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::mount::MountInfo;
	use std::collections::BTreeMap;

	fn config_with_root(host_path: &Path, persist: bool) -> SandboxConfig {
		let mut mounts = BTreeMap::new();
		mounts.insert(
			PathBuf::from("/"),
			MountInfo { host_path: host_path.to_path_buf(), r#type: MountType::Overlayed },
		);
		SandboxConfig::new(mounts).unwrap().persist(persist).build()
	}

	#[test]
	fn emits_rootfs_and_terminator() {
		let dir = tempfile::tempdir().unwrap();
		let mut state = ExecutorState::default();
		let config = config_with_root(dir.path(), false);
		let built = build_helper_command(
			&mut state,
			PathBuf::from("nsbox-helper"),
			&config,
			&["sh".to_owned(), "-c".to_owned(), "true".to_owned()],
		)
		.unwrap();

		assert_eq!(built.program, PathBuf::from("nsbox-helper"));
		assert_eq!(built.args[0], OsString::from("--rootfs"));
		assert_eq!(built.args[1], OsString::from(dir.path()));
		let dash_dash = built.args.iter().position(|a| a == "--").unwrap();
		assert_eq!(
			&built.args[dash_dash + 1..],
			&[OsString::from("sh"), OsString::from("-c"), OsString::from("true")]
		);
	}

	#[test]
	fn mount_flags_are_length_descending_and_contain_type_tag() {
		let dir = tempfile::tempdir().unwrap();
		let usr = tempfile::tempdir().unwrap();
		let lib = tempfile::tempdir().unwrap();

		let mut mounts = BTreeMap::new();
		mounts.insert(
			PathBuf::from("/"),
			MountInfo { host_path: dir.path().to_path_buf(), r#type: MountType::Overlayed },
		);
		mounts.insert(
			PathBuf::from("/usr"),
			MountInfo { host_path: usr.path().to_path_buf(), r#type: MountType::ReadOnly },
		);
		mounts.insert(
			PathBuf::from("/usr/lib"),
			MountInfo { host_path: lib.path().to_path_buf(), r#type: MountType::ReadWrite },
		);
		let config = SandboxConfig::new(mounts).unwrap().persist(false).build();

		let mut state = ExecutorState::default();
		let built =
			build_helper_command(&mut state, PathBuf::from("nsbox-helper"), &config, &[]).unwrap();

		let mount_values: Vec<String> = built
			.args
			.windows(2)
			.filter(|pair| pair[0] == "--mount")
			.map(|pair| pair[1].to_string_lossy().into_owned())
			.collect();
		assert!(mount_values[0].contains("/usr/lib"));
		assert!(mount_values[0].ends_with(":rw"));
		assert!(mount_values[1].ends_with(":ro"));
	}

	#[test]
	fn sets_workspace_dirs_in_tmpfs_scratch_when_not_persisting() {
		let dir = tempfile::tempdir().unwrap();
		let mut state = ExecutorState::default();
		let config = config_with_root(dir.path(), false);
		let built =
			build_helper_command(&mut state, PathBuf::from("nsbox-helper"), &config, &[]).unwrap();

		assert!(built.args.iter().any(|a| a == "--workspace"));
		assert_eq!(state.scratch_dirs.len(), 1);
	}

	fn workspace_value(built: &BuiltCommand) -> String {
		built
			.args
			.windows(2)
			.find(|pair| pair[0] == "--workspace")
			.map(|pair| pair[1].to_string_lossy().into_owned())
			.unwrap()
	}

	#[test]
	fn non_persistent_runs_never_reuse_the_same_workspace_dirs() {
		let dir = tempfile::tempdir().unwrap();
		let mut state = ExecutorState::default();
		let config = config_with_root(dir.path(), false);

		let first =
			build_helper_command(&mut state, PathBuf::from("nsbox-helper"), &config, &[]).unwrap();
		let second =
			build_helper_command(&mut state, PathBuf::from("nsbox-helper"), &config, &[]).unwrap();

		assert_ne!(workspace_value(&first), workspace_value(&second));
		assert_eq!(state.scratch_dirs.len(), 2);
		assert!(state.persistent_dirs.is_empty());
	}
}
