use std::fmt;

use nix::sys::signal::Signal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
	pub tag: String,
	pub command: String,
	pub worker_count: usize,
	pub index: usize,
}

/// Identity of one worker: which service it belongs to, its zero-based
/// instance number and the port it was handed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId {
	pub tag: String,
	pub service_index: usize,
	pub worker_index: usize,
	pub port: u16,
}

impl WorkerId {
	/// Human-readable instance name, exported to the worker as `PS`.
	/// Instance numbers shown to users start at 1.
	pub fn name(&self) -> String {
		format!("{}.{}", self.tag, self.worker_index + 1)
	}
}

impl fmt::Display for WorkerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.name())
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
	Starting,
	Running { pid: u32 },
	Signaled { pid: u32, signal: Signal },
	Exited(WorkerExit),
}

impl WorkerState {
	pub fn is_live(&self) -> bool {
		matches!(self, WorkerState::Running { .. } | WorkerState::Signaled { .. })
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
	Code(i32),
	Killed(Signal),
	SpawnFailed(String),
	/// The wait itself failed; the process is gone but its status is unknown.
	Lost(String),
}

impl WorkerExit {
	pub fn is_spawn_failure(&self) -> bool {
		matches!(self, WorkerExit::SpawnFailed(_))
	}
}

impl fmt::Display for WorkerExit {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			WorkerExit::Code(code) => write!(f, "exited with code {}", code),
			WorkerExit::Killed(signal) => write!(f, "terminated by {}", signal),
			WorkerExit::SpawnFailed(e) => write!(f, "failed to spawn: {}", e),
			WorkerExit::Lost(e) => write!(f, "lost: {}", e),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
	Idle,
	Running,
	Draining,
	Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
	/// Every worker exited on its own.
	Voluntary,
	/// A relayed signal started the shutdown while workers were live.
	Signaled(Signal),
}

#[derive(Debug, Clone)]
pub struct Outcome {
	pub shutdown: Shutdown,
	pub exits: Vec<(WorkerId, WorkerExit)>,
}

impl Outcome {
	pub fn spawn_failures(&self) -> usize {
		self.exits.iter().filter(|(_, e)| e.is_spawn_failure()).count()
	}

	pub fn success(&self) -> bool {
		self.exit_code() == 0
	}

	/// Exit status for the supervisor process itself.
	pub fn exit_code(&self) -> i32 {
		match self.shutdown {
			Shutdown::Signaled(signal) => 128 + signal as i32,
			Shutdown::Voluntary if self.spawn_failures() > 0 => 1,
			Shutdown::Voluntary => 0,
		}
	}
}
