use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};

/// Parses `name: command` lines in file order. Comments, blank lines and
/// lines that don't look like an entry are skipped. If a name repeats, the
/// first entry wins.
pub fn parse(content: &str) -> Vec<(String, String)> {
	let mut seen = HashSet::new();
	let mut entries = Vec::new();

	for line in content.lines() {
		let line = line.trim();
		if line.is_empty() || line.starts_with('#') {
			continue;
		}

		let Some(pos) = line.find(':') else {
			continue;
		};
		let name = line[..pos].trim();
		let command = line[pos + 1..].trim();
		if name.is_empty() || command.is_empty() || !valid_name(name) {
			continue;
		}

		if !seen.insert(name.to_string()) {
			tracing::warn!("Procfile defines '{}' more than once, keeping the first", name);
			continue;
		}
		entries.push((name.to_string(), command.to_string()));
	}
	entries
}

fn valid_name(name: &str) -> bool {
	name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

pub fn load(path: &Path) -> Result<Vec<(String, String)>> {
	let content = std::fs::read_to_string(path)
		.with_context(|| format!("failed to read procfile {}", path.display()))?;
	Ok(parse(&content))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_entries_in_order() {
		let content = "\
# comment
web: bundle exec puma -b tcp://0.0.0.0:$PORT

worker:   ./bin/worker --queue default
clock:bin/clock
";
		assert_eq!(
			parse(content),
			vec![
				("web".to_string(), "bundle exec puma -b tcp://0.0.0.0:$PORT".to_string()),
				("worker".to_string(), "./bin/worker --queue default".to_string()),
				("clock".to_string(), "bin/clock".to_string()),
			]
		);
	}

	#[test]
	fn skips_malformed_lines() {
		let content = "no colon here\n: no name\nempty:\nbad name: x\nok-1_a: run\n";
		assert_eq!(parse(content), vec![("ok-1_a".to_string(), "run".to_string())]);
	}

	#[test]
	fn first_duplicate_wins() {
		let content = "web: one\nweb: two\n";
		assert_eq!(parse(content), vec![("web".to_string(), "one".to_string())]);
	}
}
