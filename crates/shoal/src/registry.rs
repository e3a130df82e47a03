use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use crate::error::ConfigError;
use crate::types::ServiceDescriptor;

/// How many workers each service gets. Unlisted services get `default`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formation {
	pub default: usize,
	pub counts: HashMap<String, usize>,
}

impl Default for Formation {
	fn default() -> Self {
		Self {
			default: 1,
			counts: HashMap::new(),
		}
	}
}

impl Formation {
	pub fn count_for(&self, tag: &str) -> usize {
		self.counts.get(tag).copied().unwrap_or(self.default)
	}
}

impl FromStr for Formation {
	type Err = ConfigError;

	/// Parses `web=2,worker=1`. The name `all` sets the default count.
	fn from_str(value: &str) -> Result<Self, Self::Err> {
		let invalid = |reason: &str| ConfigError::Formation {
			value: value.to_string(),
			reason: reason.to_string(),
		};

		let mut formation = Formation::default();
		for item in value.split(',') {
			let item = item.trim();
			if item.is_empty() {
				continue;
			}
			let (name, count) = item
				.split_once('=')
				.ok_or_else(|| invalid(&format!("expected name=count, got '{}'", item)))?;
			let name = name.trim();
			if name.is_empty() {
				return Err(invalid("blank service name"));
			}
			let count: usize = count
				.trim()
				.parse()
				.map_err(|_| invalid(&format!("'{}' is not a worker count", count.trim())))?;

			if name == "all" {
				formation.default = count;
			} else {
				formation.counts.insert(name.to_string(), count);
			}
		}
		Ok(formation)
	}
}

/// Builds the ordered service list. With `only` set, every other service is
/// kept but forced to zero workers so indices (and therefore port blocks)
/// do not shift.
pub fn build(
	entries: &[(String, String)],
	formation: &Formation,
	only: Option<&str>,
	block_size: u16,
) -> Result<Vec<ServiceDescriptor>, ConfigError> {
	if entries.is_empty() {
		return Err(ConfigError::NoServices);
	}

	let mut seen = HashSet::new();
	let mut services = Vec::with_capacity(entries.len());

	for (index, (tag, command)) in entries.iter().enumerate() {
		let tag = tag.trim();
		if tag.is_empty() {
			return Err(ConfigError::BlankTag { index });
		}
		if command.trim().is_empty() {
			return Err(ConfigError::BlankCommand { tag: tag.to_string() });
		}
		if !seen.insert(tag.to_string()) {
			return Err(ConfigError::DuplicateTag { tag: tag.to_string() });
		}

		let worker_count = match only {
			Some(selected) if selected != tag => 0,
			_ => formation.count_for(tag),
		};
		if worker_count >= block_size as usize {
			return Err(ConfigError::TooManyWorkers {
				tag: tag.to_string(),
				count: worker_count,
				block_size,
			});
		}

		services.push(ServiceDescriptor {
			tag: tag.to_string(),
			command: command.trim().to_string(),
			worker_count,
			index,
		});
	}

	if let Some(selected) = only {
		if !seen.contains(selected) {
			return Err(ConfigError::UnknownService {
				tag: selected.to_string(),
			});
		}
	}

	for name in formation.counts.keys() {
		if !seen.contains(name.as_str()) {
			tracing::warn!("formation names unknown service '{}', ignoring", name);
		}
	}

	Ok(services)
}
