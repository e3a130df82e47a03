use std::path::{Path, PathBuf};

use serde::Deserialize;

pub const DEFAULTS_FILE: &str = ".shoal";
pub const DEFAULT_PROCFILE: &str = "Procfile";
pub const DEFAULT_ENV_FILE: &str = ".env";

/// Option defaults read from `.shoal` in the working directory. Every field
/// is optional; command line flags take precedence.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Defaults {
	pub procfile: Option<PathBuf>,
	pub root: Option<PathBuf>,
	/// Comma-separated env files.
	pub env: Option<String>,
	pub formation: Option<String>,
	pub port: Option<u16>,
	pub timeout: Option<u64>,
	pub color: Option<bool>,
	pub timestamp: Option<bool>,
}

pub fn parse_defaults(content: &str) -> Result<Defaults, serde_yaml::Error> {
	if content.trim().is_empty() {
		return Ok(Defaults::default());
	}
	serde_yaml::from_str(content)
}

pub fn load_defaults(dir: &Path) -> Defaults {
	let path = dir.join(DEFAULTS_FILE);
	if path.exists() {
		match std::fs::read_to_string(&path) {
			Ok(content) => match parse_defaults(&content) {
				Ok(defaults) => return defaults,
				Err(e) => tracing::warn!("failed to parse {}: {}", path.display(), e),
			},
			Err(e) => tracing::warn!("failed to read {}: {}", path.display(), e),
		}
	}
	Defaults::default()
}

/// Where to find the Procfile, where workers run, and which env files to
/// read. `env_required` is false only when falling back to the implicit
/// `.env`.
#[derive(Debug, Clone, PartialEq)]
pub struct Files {
	pub procfile: PathBuf,
	pub root: PathBuf,
	pub env: Vec<PathBuf>,
	pub env_required: bool,
}

pub fn resolve_files(
	procfile: Option<PathBuf>,
	root: Option<PathBuf>,
	env: Vec<PathBuf>,
	defaults: &Defaults,
) -> Files {
	let procfile = procfile
		.or_else(|| defaults.procfile.clone())
		.unwrap_or_else(|| PathBuf::from(DEFAULT_PROCFILE));

	let root = root.or_else(|| defaults.root.clone()).unwrap_or_else(|| {
		procfile
			.parent()
			.filter(|p| !p.as_os_str().is_empty())
			.map(Path::to_path_buf)
			.unwrap_or_else(|| PathBuf::from("."))
	});

	let (env, env_required) = if !env.is_empty() {
		(env, true)
	} else if let Some(list) = &defaults.env {
		(split_list(list), true)
	} else {
		(vec![PathBuf::from(DEFAULT_ENV_FILE)], false)
	};

	Files {
		procfile,
		root,
		env,
		env_required,
	}
}

fn split_list(list: &str) -> Vec<PathBuf> {
	list.split(',')
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.map(PathBuf::from)
		.collect()
}

/// Base port: flag, then defaults file, then `PORT` from the env files, then
/// the inherited `PORT`, then 5000.
pub fn resolve_port(
	flag: Option<u16>,
	defaults: &Defaults,
	file_port: Option<&str>,
	ambient_port: Option<&str>,
) -> Result<u16, String> {
	if let Some(port) = flag.or(defaults.port) {
		return Ok(port);
	}
	match file_port.or(ambient_port) {
		Some(raw) => raw
			.trim()
			.parse()
			.map_err(|_| format!("PORT '{}' is not a valid port", raw)),
		None => Ok(shoal::port::DEFAULT_BASE_PORT),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_from_yaml() {
		let defaults = parse_defaults(
			"procfile: Procfile.dev\nformation: web=2,worker=1\nport: 3000\ncolor: false\nenv: .env,.env.local\n",
		)
		.unwrap();
		assert_eq!(defaults.procfile, Some(PathBuf::from("Procfile.dev")));
		assert_eq!(defaults.formation.as_deref(), Some("web=2,worker=1"));
		assert_eq!(defaults.port, Some(3000));
		assert_eq!(defaults.color, Some(false));
		assert_eq!(defaults.timeout, None);

		assert_eq!(parse_defaults("").unwrap(), Defaults::default());
		assert!(parse_defaults("port: not-a-number").is_err());
	}

	#[test]
	fn root_follows_procfile() {
		let files = resolve_files(Some("apps/api/Procfile".into()), None, vec![], &Defaults::default());
		assert_eq!(files.root, PathBuf::from("apps/api"));
		assert_eq!(files.env, vec![PathBuf::from(".env")]);
		assert!(!files.env_required);

		let files = resolve_files(None, None, vec![], &Defaults::default());
		assert_eq!(files.procfile, PathBuf::from("Procfile"));
		assert_eq!(files.root, PathBuf::from("."));
	}

	#[test]
	fn flags_beat_defaults() {
		let defaults = Defaults {
			procfile: Some("Procfile.dev".into()),
			env: Some("a.env, b.env".into()),
			..Defaults::default()
		};
		let files = resolve_files(None, Some("/srv".into()), vec![], &defaults);
		assert_eq!(files.procfile, PathBuf::from("Procfile.dev"));
		assert_eq!(files.root, PathBuf::from("/srv"));
		assert_eq!(files.env, vec![PathBuf::from("a.env"), PathBuf::from("b.env")]);
		assert!(files.env_required);

		let files = resolve_files(Some("P".into()), None, vec!["c.env".into()], &defaults);
		assert_eq!(files.procfile, PathBuf::from("P"));
		assert_eq!(files.env, vec![PathBuf::from("c.env")]);
	}

	#[test]
	fn port_precedence() {
		let defaults = Defaults {
			port: Some(4000),
			..Defaults::default()
		};
		assert_eq!(resolve_port(Some(3000), &defaults, Some("1"), Some("2")), Ok(3000));
		assert_eq!(resolve_port(None, &defaults, Some("1"), Some("2")), Ok(4000));
		assert_eq!(resolve_port(None, &Defaults::default(), Some("6000"), Some("7000")), Ok(6000));
		assert_eq!(resolve_port(None, &Defaults::default(), None, Some("7000")), Ok(7000));
		assert_eq!(resolve_port(None, &Defaults::default(), None, None), Ok(5000));
		assert!(resolve_port(None, &Defaults::default(), Some("x"), None).is_err());
	}
}
