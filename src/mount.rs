//! The declarative mount graph: sandbox path → host path plus mount
//! semantics, validated at construction and ordered for mount application.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::host;

/// How a host path is exposed at its sandbox mount point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum MountType {
	/// Bind-mounted read-only; host contents visible, sandbox writes rejected.
	#[display("ro")]
	ReadOnly,

	/// Bind-mounted read-write; sandbox writes are visible on the host.
	#[display("rw")]
	ReadWrite,

	/// Host path is the overlay's lower layer; sandbox writes land in an
	/// upper layer and are never visible on the host.
	#[display("overlay")]
	Overlayed,

	/// Like [`Overlayed`](MountType::Overlayed), but the upper layer is
	/// itself read-only, so neither host writes nor sandbox writes land
	/// here; used to interpose an overlay at a path while forbidding
	/// mutation through it entirely.
	#[display("overlay-ro")]
	OverlayedReadOnly,
}

impl MountType {
	#[must_use]
	pub fn is_overlayed(self) -> bool {
		matches!(self, MountType::Overlayed | MountType::OverlayedReadOnly)
	}
}

/// A single mount graph entry: where its contents come from on the host, and
/// how it's exposed inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
	/// Absolute host path, with symlinks resolved via [`host::realpath_stem`].
	pub host_path: PathBuf,
	pub r#type: MountType,
}

impl MountInfo {
	fn validate(&self, sandbox_path: &Path) -> Result<(), ConfigError> {
		if !self.host_path.is_absolute() {
			return Err(ConfigError::HostPathNotAbsolute(self.host_path.clone()));
		}
		if self.r#type.is_overlayed() && !self.host_path.is_dir() {
			return Err(ConfigError::OverlayedHostPathNotDirectory(self.host_path.clone()));
		}
		let _ = sandbox_path;
		Ok(())
	}
}

/// The validated, normalized mount graph for a [`crate::SandboxConfig`].
///
/// Always contains a `"/"` entry. Keys are absolute sandbox paths; iterating
/// in [`MountGraph::mount_order`] gives the order the executors should emit
/// `--mount` arguments in so that parent mount points are always established
/// before the children nested beneath them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountGraph {
	entries: BTreeMap<PathBuf, MountInfo>,
}

impl MountGraph {
	/// Validate and normalize a raw sandbox-path → mount mapping.
	pub fn new(raw: BTreeMap<PathBuf, MountInfo>) -> Result<Self, ConfigError> {
		if !raw.contains_key(Path::new("/")) {
			return Err(ConfigError::MissingRoot);
		}

		let mut entries = BTreeMap::new();
		for (sandbox_path, info) in raw {
			if !sandbox_path.is_absolute() {
				return Err(ConfigError::SandboxPathNotAbsolute(sandbox_path));
			}
			info.validate(&sandbox_path)?;
			let host_path = host::realpath_stem(&info.host_path)
				.unwrap_or_else(|_| info.host_path.clone());
			entries.insert(
				normalize(&sandbox_path),
				MountInfo { host_path, r#type: info.r#type },
			);
		}
		Ok(Self { entries })
	}

	#[must_use]
	pub fn root(&self) -> &MountInfo {
		self.entries.get(Path::new("/")).expect("MountGraph invariant: \"/\" always present")
	}

	#[must_use]
	pub fn get(&self, sandbox_path: &Path) -> Option<&MountInfo> {
		self.entries.get(sandbox_path)
	}

	pub fn iter(&self) -> impl Iterator<Item = (&Path, &MountInfo)> {
		self.entries.iter().map(|(path, info)| (path.as_path(), info))
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Every mount except `"/"`, ordered by sandbox-path length descending.
	///
	/// The namespace helper applies mounts in reverse of the order it
	/// receives them, so listing the longest (most deeply nested) paths
	/// first is what produces correct top-down mounting: parents land before
	/// the children nested under them.
	#[must_use]
	pub fn mount_order(&self) -> Vec<(&Path, &MountInfo)> {
		let mut ordered: Vec<_> = self
			.entries
			.iter()
			.filter(|(path, _)| path.as_path() != Path::new("/"))
			.map(|(path, info)| (path.as_path(), info))
			.collect();
		ordered.sort_by(|(a, _), (b, _)| {
			b.as_os_str().len().cmp(&a.as_os_str().len()).then_with(|| a.cmp(b))
		});
		ordered
	}
}

/// Normalize a sandbox path: absolute, no trailing slash (except for `/`
/// itself), `.`/`..` components resolved lexically (sandbox paths don't
/// exist on the host filesystem yet, so we can't canonicalize them).
fn normalize(path: &Path) -> PathBuf {
	let mut out = PathBuf::from("/");
	for component in path.components() {
		match component {
			std::path::Component::RootDir | std::path::Component::CurDir => {},
			std::path::Component::ParentDir => {
				out.pop();
			},
			std::path::Component::Normal(part) => out.push(part),
			std::path::Component::Prefix(_) => {},
		}
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	fn info(host_path: &str, r#type: MountType) -> MountInfo {
		MountInfo { host_path: PathBuf::from(host_path), r#type }
	}

	#[test]
	fn rejects_missing_root() {
		let mut raw = BTreeMap::new();
		raw.insert(PathBuf::from("/usr"), info("/usr", MountType::ReadOnly));
		assert!(matches!(MountGraph::new(raw), Err(ConfigError::MissingRoot)));
	}

	#[test]
	fn rejects_relative_host_path() {
		let mut raw = BTreeMap::new();
		raw.insert(PathBuf::from("/"), info("rootfs", MountType::Overlayed));
		assert!(matches!(MountGraph::new(raw), Err(ConfigError::HostPathNotAbsolute(_))));
	}

	#[test]
	fn rejects_overlayed_mount_on_non_directory(){
		let dir = tempfile::tempdir().unwrap();
		let file_path = dir.path().join("not-a-dir");
		std::fs::write(&file_path, b"").unwrap();

		let mut raw = BTreeMap::new();
		raw.insert(
			PathBuf::from("/"),
			MountInfo { host_path: file_path, r#type: MountType::Overlayed },
		);
		assert!(matches!(
			MountGraph::new(raw),
			Err(ConfigError::OverlayedHostPathNotDirectory(_))
		));
	}

	#[test]
	fn mount_order_is_length_descending() {
		let dir = tempfile::tempdir().unwrap();
		let mut raw = BTreeMap::new();
		raw.insert(PathBuf::from("/"), info(dir.path().to_str().unwrap(), MountType::Overlayed));
		for path in ["/usr", "/usr/lib", "/usr/lib/test", "/etc", "/etc/config"] {
			raw.insert(PathBuf::from(path), info(dir.path().to_str().unwrap(), MountType::ReadOnly));
		}
		let graph = MountGraph::new(raw).unwrap();
		let lengths: Vec<usize> =
			graph.mount_order().iter().map(|(path, _)| path.as_os_str().len()).collect();
		let mut sorted = lengths.clone();
		sorted.sort_unstable_by(|a, b| b.cmp(a));
		assert_eq!(lengths, sorted);

		let paths: std::collections::BTreeSet<_> =
			graph.mount_order().into_iter().map(|(path, _)| path.to_path_buf()).collect();
		let expected: std::collections::BTreeSet<_> =
			["/usr", "/usr/lib", "/usr/lib/test", "/etc", "/etc/config"]
				.into_iter()
				.map(PathBuf::from)
				.collect();
		assert_eq!(paths, expected);
	}
}
