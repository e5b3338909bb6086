//! Selecting a host directory that can back overlayfs upper/work storage,
//! and keying per-rootfs upper/work directories underneath it across
//! invocations of a single executor.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};

use crate::host;

/// A host directory whose filesystem has been probed to support overlayfs
/// upper/work storage, and whether that probe needed `userxattr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceRoot {
	pub path: PathBuf,
	pub userxattr: bool,
}

/// Run the external overlay probe helper: exits 0 iff an overlay mount with
/// `rootfs` as lower and `candidate` as upper/work backing can be
/// established and torn down.
fn probe_overlay(rootfs: &Path, candidate: &Path, userxattr: bool, verbose: bool) -> Result<bool> {
	let mut command = Command::new("overlay_probe");
	if verbose {
		command.arg("--verbose");
	}
	if userxattr {
		command.arg("--userxattr");
	}
	command.arg(rootfs).arg(candidate);
	let status = command
		.status()
		.with_context(|| format!("failed to spawn overlay_probe for {candidate:?}"))?;
	Ok(status.success())
}

/// Find a directory that can host overlayfs upper/work state for `rootfs`.
///
/// Tries each of `hints` first (in order, `userxattr=true` before `false`),
/// then falls back to every mount point on the host filesystem that isn't on
/// the [`host::persistence_root_deny_list`], owned-by-current-uid mounts
/// sorted first. Returns `None` if every candidate fails to probe.
pub fn find_persist_root(
	rootfs: &Path,
	hints: &[PathBuf],
	verbose: bool,
) -> Result<Option<PersistenceRoot>> {
	for hint in hints {
		if let Some(root) = try_candidate(rootfs, hint, verbose)? {
			return Ok(Some(root));
		}
	}

	let mut candidates: Vec<PathBuf> = host::mounts()
		.into_iter()
		.filter(|mount| !host::persistence_root_deny_list().contains(mount.fstype.as_str()))
		.map(|mount| mount.mount_point)
		.collect();

	// Stable sort: owned-by-current-uid mounts first, ties broken by
	// original mount-table order. A permission-denied stat counts as
	// "not owned"; any other stat error propagates, since it likely means
	// something is actually wrong with the candidate.
	let mut owned_flags = Vec::with_capacity(candidates.len());
	for candidate in &candidates {
		owned_flags.push(host::is_owned_by_current_uid(candidate).unwrap_or(false));
	}
	let mut indexed: Vec<usize> = (0..candidates.len()).collect();
	indexed.sort_by_key(|&i| !owned_flags[i]);
	candidates = indexed.into_iter().map(|i| std::mem::take(&mut candidates[i])).collect();

	for candidate in &candidates {
		if let Some(root) = try_candidate(rootfs, candidate, verbose)? {
			return Ok(Some(root));
		}
	}

	Ok(None)
}

fn try_candidate(rootfs: &Path, candidate: &Path, verbose: bool) -> Result<Option<PersistenceRoot>> {
	for userxattr in [true, false] {
		if probe_overlay(rootfs, candidate, userxattr, verbose)? {
			return Ok(Some(PersistenceRoot { path: candidate.to_path_buf(), userxattr }));
		}
	}
	Ok(None)
}

/// Identifies a pair of overlay upper/work directories for one mount point
/// of one rootfs, stable across `run` calls on the same executor instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PersistenceKey {
	rootfs_host_path: PathBuf,
	sandbox_mount_point: PathBuf,
}

impl PersistenceKey {
	#[must_use]
	pub fn new(rootfs_host_path: PathBuf, sandbox_mount_point: PathBuf) -> Self {
		Self { rootfs_host_path, sandbox_mount_point }
	}

	/// A filesystem-safe, deterministic name for this key, used as the
	/// on-disk directory name under the persistence root.
	#[must_use]
	pub fn directory_name(&self) -> String {
		use std::hash::{Hash, Hasher};
		let mut hasher = std::collections::hash_map::DefaultHasher::new();
		self.rootfs_host_path.hash(&mut hasher);
		self.sandbox_mount_point.hash(&mut hasher);
		format!("{:016x}", hasher.finish())
	}
}

/// Sibling upper/work directories for one [`PersistenceKey`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayDirs {
	pub upper: PathBuf,
	pub work: PathBuf,
}

/// Owns the upper/work directory pairs created for one executor instance.
///
/// Persistent entries (`persist=true`) live under the selected
/// [`PersistenceRoot`] for the lifetime of the executor; the host
/// application may prune them out of band. Non-persistent entries live in a
/// private per-run tmpfs-backed scratch directory and are removed when the
/// executor is released.
#[derive(Debug, Default)]
pub struct PersistenceDirManager {
	entries: BTreeMap<PersistenceKey, OverlayDirs>,
}

impl PersistenceDirManager {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Return the upper/work pair for `key`, creating it under `base_dir` on
	/// first use. `base_dir` is the persistence root for persistent overlays,
	/// or a fresh per-run scratch directory for non-persistent ones.
	pub fn dirs_for(&mut self, key: PersistenceKey, base_dir: &Path) -> Result<&OverlayDirs> {
		if !self.entries.contains_key(&key) {
			let container = base_dir.join(key.directory_name());
			let upper = container.join("upper");
			let work = container.join("work");
			std::fs::create_dir_all(&upper)
				.with_context(|| format!("failed to create overlay upper dir {upper:?}"))?;
			std::fs::create_dir_all(&work)
				.with_context(|| format!("failed to create overlay work dir {work:?}"))?;
			self.entries.insert(key.clone(), OverlayDirs { upper, work });
		}
		Ok(self.entries.get(&key).expect("just inserted"))
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn persistence_key_directory_name_is_deterministic() {
		let key_a = PersistenceKey::new(PathBuf::from("/rootfs"), PathBuf::from("/overlayed"));
		let key_b = PersistenceKey::new(PathBuf::from("/rootfs"), PathBuf::from("/overlayed"));
		assert_eq!(key_a.directory_name(), key_b.directory_name());
	}

	#[test]
	fn persistence_key_directory_name_differs_by_mount_point() {
		let key_a = PersistenceKey::new(PathBuf::from("/rootfs"), PathBuf::from("/a"));
		let key_b = PersistenceKey::new(PathBuf::from("/rootfs"), PathBuf::from("/b"));
		assert_ne!(key_a.directory_name(), key_b.directory_name());
	}

	#[test]
	fn dir_manager_returns_same_dirs_for_same_key() {
		let base = tempfile::tempdir().unwrap();
		let mut manager = PersistenceDirManager::new();
		let key = PersistenceKey::new(PathBuf::from("/rootfs"), PathBuf::from("/overlayed"));

		let first = manager.dirs_for(key.clone(), base.path()).unwrap().clone();
		let second = manager.dirs_for(key, base.path()).unwrap().clone();
		assert_eq!(first, second);
	}

	#[test]
	fn dir_manager_separates_distinct_keys() {
		let base = tempfile::tempdir().unwrap();
		let mut manager = PersistenceDirManager::new();
		let key_a = PersistenceKey::new(PathBuf::from("/rootfs"), PathBuf::from("/a"));
		let key_b = PersistenceKey::new(PathBuf::from("/rootfs"), PathBuf::from("/b"));

		let dirs_a = manager.dirs_for(key_a, base.path()).unwrap().clone();
		let dirs_b = manager.dirs_for(key_b, base.path()).unwrap().clone();
		assert_ne!(dirs_a.upper, dirs_b.upper);
	}
}
