//! Static, best-effort queries about the host kernel and filesystem layout.
//!
//! Every function here is read-only and side-effect free, and every probe is
//! best-effort: an unreadable kernel table yields an empty result rather than
//! an error, so callers higher up don't have to thread a fallback path
//! through places where "we don't know" and "there's nothing there" mean the
//! same thing.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid};

const PROC_MOUNTS: &str = "/proc/mounts";
const PROC_MODULES: &str = "/proc/modules";

/// The real uid of the current process.
#[must_use]
pub fn uid() -> Uid {
	nix::unistd::getuid()
}

/// The real gid of the current process.
#[must_use]
pub fn gid() -> Gid {
	nix::unistd::getgid()
}

/// A parsed `major.minor.patch` kernel version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion {
	pub major: u64,
	pub minor: u64,
	pub patch: u64,
}

/// The running kernel's version, or `None` if `uname`'s release field
/// doesn't start with a parseable `major.minor.patch` triple.
///
/// Distro kernels append arbitrary suffixes to the release string (e.g.
/// `6.8.0-49-generic`, `5.15.0-1053-aws`). We trim from the right, shortest
/// prefix first being the full string, stopping once the remaining prefix is
/// too short to possibly contain three dot-separated numbers.
#[must_use]
pub fn kernel_version() -> Option<KernelVersion> {
	let uname = nix::sys::utsname::uname().ok()?;
	let release = uname.release().to_string_lossy().into_owned();
	parse_kernel_version(&release)
}

const MIN_VERSION_LEN: usize = 5; // shortest possible "X.Y.Z"

fn parse_kernel_version(release: &str) -> Option<KernelVersion> {
	let mut candidate = release;
	loop {
		if candidate.len() < MIN_VERSION_LEN {
			return None;
		}
		if let Some(version) = try_parse_triple(candidate) {
			return Some(version);
		}
		candidate = &candidate[..candidate.len() - 1];
	}
}

fn try_parse_triple(s: &str) -> Option<KernelVersion> {
	let mut parts = s.splitn(3, '.');
	let major: u64 = parts.next()?.parse().ok()?;
	let minor: u64 = parts.next()?.parse().ok()?;
	// The patch field may still carry a non-numeric suffix (e.g. "0-49-generic"
	// trimmed down to "0"); only the leading digits count.
	let patch_field = parts.next()?;
	let digits: String = patch_field.chars().take_while(char::is_ascii_digit).collect();
	if digits.is_empty() {
		return None;
	}
	let patch: u64 = digits.parse().ok()?;
	Some(KernelVersion { major, minor, patch })
}

/// One entry from the kernel's mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
	/// Always ends with `/`.
	pub mount_point: PathBuf,
	pub fstype: String,
}

/// The kernel's current mount table, read from `/proc/mounts`.
///
/// Returns an empty list if the table can't be read (e.g. running inside a
/// chroot without `/proc` mounted), never an error.
#[must_use]
pub fn mounts() -> Vec<Mount> {
	let Ok(contents) = std::fs::read_to_string(PROC_MOUNTS) else {
		return Vec::new();
	};
	parse_mounts(&contents)
}

fn parse_mounts(contents: &str) -> Vec<Mount> {
	contents
		.lines()
		.filter_map(|line| {
			let mut fields = line.split_whitespace();
			let _source = fields.next()?;
			let mount_point = fields.next()?;
			let fstype = fields.next()?;
			let mount_point = unescape_mount_field(mount_point);
			let mut mount_point = PathBuf::from(mount_point);
			if !mount_point.as_os_str().to_string_lossy().ends_with('/') {
				mount_point.push("");
			}
			Some(Mount {
				mount_point,
				fstype: fstype.to_owned(),
			})
		})
		.collect()
}

/// `/proc/mounts` escapes space, tab, newline and backslash as `\ooo` octal.
fn unescape_mount_field(field: &str) -> String {
	let mut out = String::with_capacity(field.len());
	let mut chars = field.chars().peekable();
	while let Some(c) = chars.next() {
		if c == '\\' {
			let octal: String = chars.by_ref().take(3).collect();
			if let Ok(value) = u8::from_str_radix(&octal, 8) {
				out.push(value as char);
				continue;
			}
			out.push(c);
			out.push_str(&octal);
		} else {
			out.push(c);
		}
	}
	out
}

/// A loaded kernel module, from `/proc/modules`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
	pub name: String,
	pub state: ModuleState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
	Live,
	Loading,
	Unloading,
}

/// Modules currently in the `Live` state, from `/proc/modules`.
///
/// Returns an empty list if the table can't be read.
#[must_use]
pub fn loaded_modules() -> Vec<Module> {
	let Ok(contents) = std::fs::read_to_string(PROC_MODULES) else {
		return Vec::new();
	};
	contents
		.lines()
		.filter_map(|line| {
			let mut fields = line.split_whitespace();
			let name = fields.next()?.to_owned();
			// size, instances, deps, state, offset
			let state = fields.nth(3)?;
			let state = match state {
				"Live" => ModuleState::Live,
				"Loading" => ModuleState::Loading,
				"Unloading" => ModuleState::Unloading,
				_ => return None,
			};
			Some(Module { name, state })
		})
		.filter(|module| module.state == ModuleState::Live)
		.collect()
}

/// Whether `path` lives on an `ecryptfs` filesystem, and the mount point that
/// answered the question.
///
/// `ecryptfs` upper directories are known to break overlayfs, so callers use
/// this to reject persistence roots before probing them (cheaper than
/// spawning the overlay probe helper and watching it fail).
///
/// If no mount in the table covers `path` (e.g. the path is inside a chroot
/// whose mount namespace we can't see), this conservatively reports `(false,
/// path)`, `path` unchanged rather than canonicalized.
#[must_use]
pub fn is_encrypted(path: &Path) -> (bool, PathBuf) {
	is_encrypted_against(path, &mounts())
}

fn is_encrypted_against(path: &Path, table: &[Mount]) -> (bool, PathBuf) {
	let canonical = canonicalize_for_lookup(path);
	let Some(covering) = longest_covering_mount(table, &canonical) else {
		return (false, path.to_path_buf());
	};
	(covering.fstype == "ecryptfs", covering.mount_point.clone())
}

fn canonicalize_for_lookup(path: &Path) -> PathBuf {
	let mut resolved = realpath_stem(path).unwrap_or_else(|_| path.to_path_buf());
	if resolved.is_dir() && !resolved.as_os_str().to_string_lossy().ends_with('/') {
		resolved.push("");
	}
	resolved
}

fn longest_covering_mount<'a>(table: &'a [Mount], path: &Path) -> Option<&'a Mount> {
	table
		.iter()
		.filter(|mount| path.starts_with(&mount.mount_point) || path == mount.mount_point)
		.max_by_key(|mount| mount.mount_point.as_os_str().len())
}

/// Canonicalize `path`, resolving symlinks, but tolerate a non-existent leaf
/// component.
///
/// [`std::fs::canonicalize`] fails outright if any component of the path
/// doesn't exist, which is too strict for mount sources we're about to
/// create. This resolves the longest existing prefix and appends whatever
/// doesn't exist yet untouched.
pub fn realpath_stem(path: &Path) -> std::io::Result<PathBuf> {
	if path.exists() {
		return std::fs::canonicalize(path);
	}
	let Some(leaf) = path.file_name() else {
		return Err(std::io::Error::new(
			std::io::ErrorKind::InvalidInput,
			format!("cannot resolve {path:?}: no parent to recurse into"),
		));
	};
	let parent = path.parent().ok_or_else(|| {
		std::io::Error::new(
			std::io::ErrorKind::InvalidInput,
			format!("cannot resolve {path:?}: no parent to recurse into"),
		)
	})?;
	if parent == path {
		return Err(std::io::Error::new(
			std::io::ErrorKind::InvalidInput,
			format!("cannot resolve {path:?}: reached root without finding an existing prefix"),
		));
	}
	let resolved_parent = realpath_stem(parent)?;
	Ok(resolved_parent.join(leaf))
}

/// Filesystem types excluded from persistence-root candidacy: encrypted or
/// copy-on-write filesystems known to be incompatible with overlayfs upper
/// layers, plus pseudo-filesystems that never back real data.
pub fn persistence_root_deny_list() -> &'static BTreeSet<&'static str> {
	static DENY_LIST: std::sync::OnceLock<BTreeSet<&'static str>> = std::sync::OnceLock::new();
	DENY_LIST.get_or_init(|| {
		[
			"ecryptfs",
			"zfs",
			"overlay",
			"proc",
			"sysfs",
			"tmpfs",
			"cgroup2",
			"devpts",
			"devtmpfs",
			"bpf",
			"autofs",
			"auristorfs",
			"binfmt_misc",
			"configfs",
			"debugfs",
			"efivarfs",
			"fusectl",
			"hugetlbfs",
			"mqueue",
			"nsfs",
			"pstore",
			"ramfs",
			"rpc_pipefs",
			"securityfs",
			"tracefs",
		]
		.into_iter()
		.collect()
	})
}

/// Whether `path` is owned by the current process's uid.
///
/// A stat that fails with permission-denied is treated as "not owned"
/// (conservative: never trust a path we can't even stat), while any other
/// stat error propagates since it likely indicates something is wrong with
/// the candidate mount itself.
pub fn is_owned_by_current_uid(path: &Path) -> std::io::Result<bool> {
	use std::os::unix::fs::MetadataExt;
	match std::fs::metadata(path) {
		Ok(metadata) => Ok(metadata.uid() == uid().as_raw()),
		Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => Ok(false),
		Err(err) => Err(err),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_plain_triple() {
		assert_eq!(
			parse_kernel_version("6.8.0"),
			Some(KernelVersion { major: 6, minor: 8, patch: 0 })
		);
	}

	#[test]
	fn trims_distro_suffix() {
		assert_eq!(
			parse_kernel_version("6.8.0-49-generic"),
			Some(KernelVersion { major: 6, minor: 8, patch: 0 })
		);
	}

	#[test]
	fn rejects_too_short() {
		assert_eq!(parse_kernel_version("6.8"), None);
		assert_eq!(parse_kernel_version(""), None);
	}

	#[test]
	fn rejects_non_numeric() {
		assert_eq!(parse_kernel_version("a.b.c"), None);
	}

	#[test]
	fn parses_mounts_table() {
		let table = "sysfs /sys sysfs rw,nosuid 0 0\n\
			overlay /home/user/proj overlay rw,relatime 0 0\n\
			ecryptfs /home/user ecryptfs rw 0 0\n";
		let mounts = parse_mounts(table);
		assert_eq!(mounts.len(), 3);
		assert_eq!(mounts[0].mount_point, PathBuf::from("/sys/"));
		assert_eq!(mounts[2].fstype, "ecryptfs");
	}

	#[test]
	fn unescapes_octal_space() {
		assert_eq!(unescape_mount_field("/mnt/my\\040drive"), "/mnt/my drive");
	}

	#[test]
	fn realpath_stem_resolves_existing_paths_like_canonicalize() {
		let dir = tempfile::tempdir().unwrap();
		let canonical = std::fs::canonicalize(dir.path()).unwrap();
		assert_eq!(realpath_stem(dir.path()).unwrap(), canonical);
	}

	#[test]
	fn realpath_stem_tolerates_missing_leaf() {
		let dir = tempfile::tempdir().unwrap();
		let canonical = std::fs::canonicalize(dir.path()).unwrap();
		let missing = dir.path().join("does-not-exist-yet");
		assert_eq!(realpath_stem(&missing).unwrap(), canonical.join("does-not-exist-yet"));
	}

	#[test]
	fn longest_covering_mount_prefers_deepest() {
		let table = vec![
			Mount { mount_point: PathBuf::from("/"), fstype: "ext4".into() },
			Mount { mount_point: PathBuf::from("/home/"), fstype: "ecryptfs".into() },
		];
		let covering = longest_covering_mount(&table, Path::new("/home/user/file")).unwrap();
		assert_eq!(covering.fstype, "ecryptfs");
	}

	#[test]
	fn is_encrypted_returns_original_path_when_no_mount_covers_it() {
		let path = Path::new("/nowhere/in/the/table");
		assert_eq!(is_encrypted_against(path, &[]), (false, path.to_path_buf()));
	}
}
