//! Environment-variable-or-preference resolution, shared by the persistence
//! root selector and the container runtime executor.
//!
//! Each setting is resolved at most once per process: first an explicit
//! environment variable, then a user preference location, then a hardcoded
//! default. Results are memoized behind a [`std::sync::OnceLock`] rather than
//! recomputed on every call, matching how this crate memoizes the
//! root-escalation wrapper choice (see [`crate::executor::privileged`]).

use std::path::PathBuf;
use std::sync::OnceLock;

/// `$HOME`, treated as a resolution failure (not a silent empty path) when
/// unset or empty.
pub fn home_directory() -> anyhow::Result<PathBuf> {
	match std::env::var("HOME") {
		Ok(value) if !value.is_empty() => Ok(PathBuf::from(value)),
		Ok(_) => Err(anyhow::anyhow!("the \"HOME\" environment variable is set but empty")),
		Err(_) => Err(anyhow::anyhow!("the \"HOME\" environment variable is not set")),
	}
}

/// `$XDG_CACHE_HOME`, falling back to `$HOME/.cache`.
pub fn user_cache_directory() -> anyhow::Result<PathBuf> {
	if let Ok(value) = std::env::var("XDG_CACHE_HOME") {
		if !value.is_empty() {
			return Ok(PathBuf::from(value));
		}
	}
	Ok(home_directory()?.join(".cache"))
}

/// `$XDG_CONFIG_HOME`, falling back to `$HOME/.config`.
pub fn user_config_directory() -> anyhow::Result<PathBuf> {
	if let Ok(value) = std::env::var("XDG_CONFIG_HOME") {
		if !value.is_empty() {
			return Ok(PathBuf::from(value));
		}
	}
	Ok(home_directory()?.join(".config"))
}

/// Hint directories for the persistence root selector, in priority order:
/// `SANDBOX_PERSISTENCE_DIR` if set, then a per-user cache location, then a
/// process-unique scratch directory under the system temp dir.
pub fn persistence_root_hints() -> Vec<PathBuf> {
	static HINTS: OnceLock<Vec<PathBuf>> = OnceLock::new();
	HINTS
		.get_or_init(|| {
			let mut hints = Vec::new();
			if let Ok(value) = std::env::var("SANDBOX_PERSISTENCE_DIR") {
				if !value.is_empty() {
					hints.push(PathBuf::from(value));
				}
			}
			if let Ok(cache) = user_cache_directory() {
				hints.push(cache.join("nsbox/persist"));
			}
			hints.push(std::env::temp_dir().join(format!("nsbox-persist-{}", std::process::id())));
			hints
		})
		.clone()
}

/// Whether the caller's `verbose` flag should be forced on by
/// `SANDBOX_VERBOSE`, for out-of-band debugging without touching call sites.
#[must_use]
pub fn verbose_override() -> bool {
	std::env::var("SANDBOX_VERBOSE").is_ok_and(|value| !value.is_empty())
}

/// The container runtime binary to use for the [`crate::executor::ExecutorKind::ContainerRuntime`]
/// executor: `SANDBOX_CONTAINER_RUNTIME` if set, otherwise the first of
/// `docker`/`podman` found on `PATH`.
pub fn container_runtime_binary() -> Option<String> {
	static BINARY: OnceLock<Option<String>> = OnceLock::new();
	BINARY
		.get_or_init(|| {
			if let Ok(value) = std::env::var("SANDBOX_CONTAINER_RUNTIME") {
				if !value.is_empty() {
					return Some(value);
				}
			}
			["docker", "podman"]
				.into_iter()
				.find(|candidate| resolve_on_path(candidate).is_some())
				.map(str::to_owned)
		})
		.clone()
}

/// The namespace helper binary: `SANDBOX_NAMESPACE_HELPER` if set, otherwise
/// `nsbox-helper` resolved to its absolute path on `PATH`.
///
/// Returns the resolved directory joined with the name, not the bare name,
/// so the helper still launches correctly if the caller's `PATH` ever
/// differs from the one this process resolved it against.
pub fn namespace_helper_binary() -> Option<PathBuf> {
	if let Ok(value) = std::env::var("SANDBOX_NAMESPACE_HELPER") {
		if !value.is_empty() {
			return Some(PathBuf::from(value));
		}
	}
	resolve_on_path("nsbox-helper")
}

fn resolve_on_path(name: &str) -> Option<PathBuf> {
	let path_var = std::env::var_os("PATH")?;
	std::env::split_paths(&path_var).map(|dir| dir.join(name)).find(|candidate| candidate.is_file())
}
