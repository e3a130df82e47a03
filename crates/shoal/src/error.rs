use thiserror::Error;

/// Problems with the supervisor's input. Any of these stops startup before a
/// single worker is launched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
	#[error("no services defined")]
	NoServices,
	#[error("service #{index} has a blank name")]
	BlankTag { index: usize },
	#[error("service '{tag}' has a blank command")]
	BlankCommand { tag: String },
	#[error("service '{tag}' is defined more than once")]
	DuplicateTag { tag: String },
	#[error("unknown service '{tag}'")]
	UnknownService { tag: String },
	#[error("invalid formation '{value}': {reason}")]
	Formation { value: String, reason: String },
	#[error("service '{tag}' asks for {count} workers but a port block only holds {block_size}")]
	TooManyWorkers {
		tag: String,
		count: usize,
		block_size: u16,
	},
	#[error("port {port} for {worker} is out of range")]
	PortOutOfRange { worker: String, port: u64 },
	#[error("nothing to run: every service has zero workers")]
	NothingToRun,
}
