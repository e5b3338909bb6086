//! The immutable request object describing one sandboxed invocation.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid};

use crate::error::ConfigError;
use crate::host;
use crate::mount::{MountGraph, MountInfo, MountType};

/// How one of the child's standard streams is connected.
///
/// The executor resolves these to concrete file descriptors at spawn time;
/// [`Stdio::Pipe`] doesn't carry a handle itself so that [`SandboxConfig`]
/// stays cheap to clone and share across `run` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stdio {
	/// Inherit the host process's stream.
	#[default]
	Inherit,
	/// Connect to `/dev/null`.
	Null,
	/// Create a pipe; the captured bytes are returned from [`crate::run`].
	Pipe,
}

/// stdin, stdout, and stderr connection modes for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StdioConfig {
	pub stdin: Stdio,
	pub stdout: Stdio,
	pub stderr: Stdio,
}

impl StdioConfig {
	/// stdin null, stdout/stderr inherited from the host: this crate's default.
	#[must_use]
	pub fn inherit_output() -> Self {
		Self { stdin: Stdio::Null, stdout: Stdio::Inherit, stderr: Stdio::Inherit }
	}

	/// All three streams piped back to the caller, for tests and callers
	/// that need to inspect output programmatically.
	#[must_use]
	pub fn piped() -> Self {
		Self { stdin: Stdio::Null, stdout: Stdio::Pipe, stderr: Stdio::Pipe }
	}
}

/// The immutable, validated description of one sandboxed invocation.
///
/// Construct with [`SandboxConfig::new`] (full mount-graph form) or
/// [`SandboxConfig::from_legacy_maps`] (three flat maps, kept for callers
/// migrating from an older shape). Derive a variant of an existing config
/// with [`SandboxConfig::with_stdio`] and friends rather than rebuilding one
/// from scratch.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
	pub(crate) mounts: MountGraph,
	pub(crate) env: BTreeMap<String, String>,
	pub(crate) entrypoint: Option<PathBuf>,
	pub(crate) pwd: PathBuf,
	pub(crate) stdio: StdioConfig,
	pub(crate) persist: bool,
	pub(crate) uid: Uid,
	pub(crate) gid: Gid,
	pub(crate) hostname: Option<String>,
	pub(crate) tmpfs_size: Option<u64>,
	pub(crate) multiarch_formats: BTreeSet<String>,
	pub(crate) verbose: bool,
}

impl SandboxConfig {
	/// Build a config from an explicit mount graph.
	///
	/// `pwd` and `entrypoint`, if given, must be absolute sandbox paths.
	/// Everything else defaults per [`SandboxConfigBuilder`].
	pub fn new(mounts: BTreeMap<PathBuf, MountInfo>) -> Result<SandboxConfigBuilder, ConfigError> {
		let mounts = MountGraph::new(mounts)?;
		Ok(SandboxConfigBuilder::new(mounts))
	}

	/// Build a config from the older three-flat-maps shape: the sandbox's
	/// root mount plus every other read-only and read-write bind mount.
	///
	/// `read_only_maps` must contain a `"/"` entry; it's promoted to
	/// [`MountType::Overlayed`]. Every other `read_only_maps` entry becomes
	/// [`MountType::ReadOnly`], and every `read_write_maps` entry becomes
	/// [`MountType::ReadWrite`]. A sandbox path given in both maps is a
	/// [`ConfigError::DuplicateMount`].
	pub fn from_legacy_maps(
		read_only_maps: BTreeMap<PathBuf, PathBuf>,
		read_write_maps: BTreeMap<PathBuf, PathBuf>,
		env: BTreeMap<String, String>,
	) -> Result<SandboxConfigBuilder, ConfigError> {
		let mut mounts = BTreeMap::new();
		for (sandbox_path, host_path) in read_only_maps {
			let r#type =
				if sandbox_path == Path::new("/") { MountType::Overlayed } else { MountType::ReadOnly };
			mounts.insert(sandbox_path, MountInfo { host_path, r#type });
		}
		for (sandbox_path, host_path) in read_write_maps {
			if mounts.contains_key(&sandbox_path) {
				return Err(ConfigError::DuplicateMount(sandbox_path));
			}
			mounts.insert(sandbox_path, MountInfo { host_path, r#type: MountType::ReadWrite });
		}
		let mut builder = Self::new(mounts)?;
		builder.0.env = env;
		Ok(builder)
	}

	/// Derive a new config from `self`, replacing only the stdio streams.
	/// Every other field is preserved exactly.
	#[must_use]
	pub fn with_stdio(&self, stdio: StdioConfig) -> Self {
		Self { stdio, ..self.clone() }
	}

	/// Derive a new config from `self`, replacing only the environment.
	#[must_use]
	pub fn with_env(&self, env: BTreeMap<String, String>) -> Self {
		Self { env, ..self.clone() }
	}

	/// Derive a new config from `self`, overriding a single environment
	/// variable (inserting it if absent).
	#[must_use]
	pub fn with_env_var(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
		let mut env = self.env.clone();
		env.insert(key.into(), value.into());
		Self { env, ..self.clone() }
	}

	/// Derive a new config from `self`, replacing only the working directory.
	pub fn with_pwd(&self, pwd: impl Into<PathBuf>) -> Result<Self, ConfigError> {
		let pwd = pwd.into();
		if !pwd.is_absolute() {
			return Err(ConfigError::PwdNotAbsolute(pwd));
		}
		Ok(Self { pwd, ..self.clone() })
	}

	#[must_use]
	pub fn mounts(&self) -> &MountGraph {
		&self.mounts
	}

	#[must_use]
	pub fn env(&self) -> &BTreeMap<String, String> {
		&self.env
	}

	#[must_use]
	pub fn entrypoint(&self) -> Option<&Path> {
		self.entrypoint.as_deref()
	}

	#[must_use]
	pub fn pwd(&self) -> &Path {
		&self.pwd
	}

	#[must_use]
	pub fn stdio(&self) -> StdioConfig {
		self.stdio
	}

	#[must_use]
	pub fn persist(&self) -> bool {
		self.persist
	}

	#[must_use]
	pub fn uid(&self) -> Uid {
		self.uid
	}

	#[must_use]
	pub fn gid(&self) -> Gid {
		self.gid
	}

	#[must_use]
	pub fn hostname(&self) -> Option<&str> {
		self.hostname.as_deref()
	}

	#[must_use]
	pub fn tmpfs_size(&self) -> Option<u64> {
		self.tmpfs_size
	}

	#[must_use]
	pub fn multiarch_formats(&self) -> &BTreeSet<String> {
		&self.multiarch_formats
	}

	#[must_use]
	pub fn verbose(&self) -> bool {
		self.verbose || crate::env::verbose_override()
	}
}

/// Builds a [`SandboxConfig`], applying and validating optional fields
/// before the immutable config is produced by [`SandboxConfigBuilder::build`].
pub struct SandboxConfigBuilder(SandboxConfig);

impl SandboxConfigBuilder {
	fn new(mounts: MountGraph) -> Self {
		Self(SandboxConfig {
			mounts,
			env: BTreeMap::new(),
			entrypoint: None,
			pwd: PathBuf::from("/"),
			stdio: StdioConfig::inherit_output(),
			persist: true,
			uid: host::uid(),
			gid: host::gid(),
			hostname: None,
			tmpfs_size: None,
			multiarch_formats: BTreeSet::new(),
			verbose: false,
		})
	}

	#[must_use]
	pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
		self.0.env = env;
		self
	}

	#[must_use]
	pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.0.env.insert(key.into(), value.into());
		self
	}

	pub fn entrypoint(mut self, entrypoint: impl Into<PathBuf>) -> Result<Self, ConfigError> {
		let entrypoint = entrypoint.into();
		if !entrypoint.is_absolute() {
			return Err(ConfigError::EntrypointNotAbsolute(entrypoint));
		}
		self.0.entrypoint = Some(entrypoint);
		Ok(self)
	}

	pub fn pwd(mut self, pwd: impl Into<PathBuf>) -> Result<Self, ConfigError> {
		let pwd = pwd.into();
		if !pwd.is_absolute() {
			return Err(ConfigError::PwdNotAbsolute(pwd));
		}
		self.0.pwd = pwd;
		Ok(self)
	}

	#[must_use]
	pub fn stdio(mut self, stdio: StdioConfig) -> Self {
		self.0.stdio = stdio;
		self
	}

	#[must_use]
	pub fn persist(mut self, persist: bool) -> Self {
		self.0.persist = persist;
		self
	}

	#[must_use]
	pub fn uid(mut self, uid: Uid) -> Self {
		self.0.uid = uid;
		self
	}

	#[must_use]
	pub fn gid(mut self, gid: Gid) -> Self {
		self.0.gid = gid;
		self
	}

	#[must_use]
	pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
		self.0.hostname = Some(hostname.into());
		self
	}

	#[must_use]
	pub fn tmpfs_size(mut self, bytes: u64) -> Self {
		self.0.tmpfs_size = Some(bytes);
		self
	}

	#[must_use]
	pub fn multiarch_format(mut self, tag: impl Into<String>) -> Self {
		self.0.multiarch_formats.insert(tag.into());
		self
	}

	#[must_use]
	pub fn verbose(mut self, verbose: bool) -> Self {
		self.0.verbose = verbose;
		self
	}

	#[must_use]
	pub fn build(self) -> SandboxConfig {
		self.0
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn rootfs_mounts(host_path: &Path) -> BTreeMap<PathBuf, MountInfo> {
		let mut mounts = BTreeMap::new();
		mounts.insert(
			PathBuf::from("/"),
			MountInfo { host_path: host_path.to_path_buf(), r#type: MountType::Overlayed },
		);
		mounts
	}

	#[test]
	fn defaults_match_spec() {
		let dir = tempfile::tempdir().unwrap();
		let config = SandboxConfig::new(rootfs_mounts(dir.path())).unwrap().build();
		assert_eq!(config.pwd(), Path::new("/"));
		assert!(config.persist());
		assert_eq!(config.uid(), host::uid());
		assert_eq!(config.gid(), host::gid());
		assert_eq!(config.hostname(), None);
		assert!(config.env().is_empty());
		assert!(!config.verbose());
	}

	#[test]
	fn rejects_relative_pwd_and_entrypoint() {
		let dir = tempfile::tempdir().unwrap();
		let builder = SandboxConfig::new(rootfs_mounts(dir.path())).unwrap();
		assert!(matches!(
			SandboxConfig::new(rootfs_mounts(dir.path())).unwrap().pwd("lib"),
			Err(ConfigError::PwdNotAbsolute(_))
		));
		assert!(matches!(builder.entrypoint("init"), Err(ConfigError::EntrypointNotAbsolute(_))));
	}

	#[test]
	fn with_stdio_preserves_other_fields() {
		let dir = tempfile::tempdir().unwrap();
		let config = SandboxConfig::new(rootfs_mounts(dir.path()))
			.unwrap()
			.env_var("PATH", "for")
			.hostname("sandy")
			.build();
		let derived = config.with_stdio(StdioConfig::piped());
		assert_eq!(derived.stdio(), StdioConfig::piped());
		assert_eq!(derived.env(), config.env());
		assert_eq!(derived.hostname(), config.hostname());
		assert_eq!(derived.mounts(), config.mounts());
	}

	#[test]
	fn legacy_form_matches_full_form() {
		let dir = tempfile::tempdir().unwrap();
		let usr = tempfile::tempdir().unwrap();
		let etc = tempfile::tempdir().unwrap();

		let mut read_only = BTreeMap::new();
		read_only.insert(PathBuf::from("/"), dir.path().to_path_buf());
		read_only.insert(PathBuf::from("/usr"), usr.path().to_path_buf());
		let mut read_write = BTreeMap::new();
		read_write.insert(PathBuf::from("/etc"), etc.path().to_path_buf());

		let legacy =
			SandboxConfig::from_legacy_maps(read_only, read_write, BTreeMap::new()).unwrap().build();

		let mut full = BTreeMap::new();
		full.insert(
			PathBuf::from("/"),
			MountInfo { host_path: dir.path().to_path_buf(), r#type: MountType::Overlayed },
		);
		full.insert(
			PathBuf::from("/usr"),
			MountInfo { host_path: usr.path().to_path_buf(), r#type: MountType::ReadOnly },
		);
		full.insert(
			PathBuf::from("/etc"),
			MountInfo { host_path: etc.path().to_path_buf(), r#type: MountType::ReadWrite },
		);
		let expected = SandboxConfig::new(full).unwrap().build();

		assert_eq!(legacy.mounts(), expected.mounts());
	}

	#[test]
	fn legacy_form_rejects_duplicate_keys() {
		let dir = tempfile::tempdir().unwrap();
		let mut read_only = BTreeMap::new();
		read_only.insert(PathBuf::from("/"), dir.path().to_path_buf());
		read_only.insert(PathBuf::from("/etc"), dir.path().to_path_buf());
		let mut read_write = BTreeMap::new();
		read_write.insert(PathBuf::from("/etc"), dir.path().to_path_buf());

		assert!(matches!(
			SandboxConfig::from_legacy_maps(read_only, read_write, BTreeMap::new()),
			Err(ConfigError::DuplicateMount(_))
		));
	}
}
