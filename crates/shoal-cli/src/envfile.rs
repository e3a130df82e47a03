use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

/// Reads env files in order into one map; later files override earlier
/// ones. Nothing is written to this process's own environment.
///
/// With `required` unset, missing files are skipped (the implicit `.env`).
pub fn load(paths: &[PathBuf], required: bool) -> Result<BTreeMap<String, String>> {
	let mut env = BTreeMap::new();
	for path in paths {
		if !path.exists() {
			if required {
				bail!("env file {} not found", path.display());
			}
			tracing::debug!("no env file at {}, skipping", path.display());
			continue;
		}

		let items = dotenvy::from_path_iter(path)
			.with_context(|| format!("failed to open env file {}", path.display()))?;
		for item in items {
			let (key, value) =
				item.with_context(|| format!("failed to parse env file {}", path.display()))?;
			env.insert(key, value);
		}
	}
	Ok(env)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};

	static COUNTER: AtomicU32 = AtomicU32::new(0);

	fn write_temp(content: &str) -> PathBuf {
		let n = COUNTER.fetch_add(1, Ordering::SeqCst);
		let path = std::env::temp_dir().join(format!("shoal-env-{}-{}.env", std::process::id(), n));
		std::fs::write(&path, content).unwrap();
		path
	}

	#[test]
	fn later_files_override() {
		let a = write_temp("# base\nFOO=one\nBAR=\"quoted value\"\n");
		let b = write_temp("export FOO=two\n");
		let env = load(&[a.clone(), b.clone()], true).unwrap();
		assert_eq!(env.get("FOO").map(String::as_str), Some("two"));
		assert_eq!(env.get("BAR").map(String::as_str), Some("quoted value"));
		let _ = std::fs::remove_file(a);
		let _ = std::fs::remove_file(b);
	}

	#[test]
	fn missing_files() {
		let missing = std::env::temp_dir().join("shoal-env-does-not-exist.env");
		assert!(load(&[missing.clone()], false).unwrap().is_empty());
		assert!(load(&[missing], true).is_err());
	}
}
