use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

#[derive(Parser)]
struct Args {
	/// Host directory to use as the overlay's lower layer for "/".
	#[clap(long, default_value("/"))]
	rootfs: PathBuf,

	/// Extra read-only bind mount, given as sandbox_path=host_path. Repeatable.
	#[clap(long("ro"), value_parser = parse_key_val::<PathBuf, PathBuf>, number_of_values = 1)]
	read_only: Vec<(PathBuf, PathBuf)>,

	/// Extra read-write bind mount, given as sandbox_path=host_path. Repeatable.
	#[clap(long("rw"), value_parser = parse_key_val::<PathBuf, PathBuf>, number_of_values = 1)]
	read_write: Vec<(PathBuf, PathBuf)>,

	/// Environment variable to set in the sandbox, given as KEY=VALUE. Repeatable.
	#[clap(long, value_parser = parse_key_val::<String, String>, number_of_values = 1)]
	env: Vec<(String, String)>,

	/// Don't keep the root overlay's upper/work directories across runs.
	#[clap(long)]
	no_persist: bool,

	/// Use a specific executor instead of the first one available.
	#[clap(long)]
	executor: Option<String>,

	program: String,

	args: Vec<String>,
}

fn main() -> Result<()> {
	setup_tracing();
	let args = Args::parse();

	let mut mounts = BTreeMap::new();
	mounts.insert(
		PathBuf::from("/"),
		nsbox::MountInfo { host_path: args.rootfs.clone(), r#type: nsbox::MountType::Overlayed },
	);
	for (sandbox_path, host_path) in &args.read_only {
		mounts.insert(
			sandbox_path.clone(),
			nsbox::MountInfo { host_path: host_path.clone(), r#type: nsbox::MountType::ReadOnly },
		);
	}
	for (sandbox_path, host_path) in &args.read_write {
		mounts.insert(
			sandbox_path.clone(),
			nsbox::MountInfo { host_path: host_path.clone(), r#type: nsbox::MountType::ReadWrite },
		);
	}

	let config = nsbox::SandboxConfig::new(mounts)
		.context("invalid mount graph")?
		.env(args.env.into_iter().collect())
		.persist(!args.no_persist)
		.build();

	let mut argv = vec![args.program.clone()];
	argv.extend(args.args.clone());

	eprintln!("sandbox: run '{}' rooted at {}", args.program, args.rootfs.display());

	let executor_kind = args.executor.as_deref().map(parse_executor_kind).transpose()?;
	let output = nsbox::with_executor(executor_kind, |executor| nsbox::run(executor, &config, &argv))
		.context("sandbox run failed")?;

	match output.status.code() {
		Some(code) => std::process::exit(code),
		None => {
			eprintln!("run_sandboxed: child exited without a status code (likely killed by a signal)");
			std::process::exit(1);
		},
	}
}

fn parse_executor_kind(name: &str) -> Result<nsbox::ExecutorKind> {
	match name {
		"unprivileged-userns" => Ok(nsbox::ExecutorKind::UnprivilegedUserNamespaces),
		"privileged-userns" => Ok(nsbox::ExecutorKind::PrivilegedUserNamespaces),
		"container-runtime" => Ok(nsbox::ExecutorKind::ContainerRuntime),
		other => anyhow::bail!("unknown executor {other:?}"),
	}
}

fn setup_tracing() {
	use tracing_subscriber::prelude::*;
	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
		.with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
		.init();
}

/// Parse a single key-value pair
/// From: <https://github.com/clap-rs/clap_derive/blob/master/examples/keyvalue.rs>
fn parse_key_val<T, U>(s: &str) -> Result<(T, U)>
where
	T: std::str::FromStr,
	T::Err: std::error::Error + 'static + Send + Sync,
	U: std::str::FromStr,
	U::Err: std::error::Error + 'static + Send + Sync,
{
	let pos = s.find('=').context("failed to split")?;
	Ok((
		s[..pos].parse().context("failed to parse key")?,
		s[pos + 1..].parse().context("failed to parse value")?,
	))
}
