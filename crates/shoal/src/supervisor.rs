use std::collections::BTreeMap;
use std::io::{self, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::command::Launch;
use crate::error::ConfigError;
use crate::output::{Multiplexer, SourceId, Style};
use crate::port;
use crate::types::*;

/// How long to keep reading pipes after the last worker is reaped. A
/// backgrounded grandchild can hold a pipe open forever.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

pub struct SupervisorConfig {
	pub base_port: u16,
	pub block_size: u16,
	pub root: PathBuf,
	/// Extra variables for every worker, on top of the inherited environment.
	pub env: BTreeMap<String, String>,
	pub style: Style,
	/// Send SIGKILL to workers still alive this long after the first relay.
	pub shutdown_timeout: Option<Duration>,
	/// Install SIGINT/SIGTERM/SIGHUP handlers when starting.
	pub trap_signals: bool,
}

impl Default for SupervisorConfig {
	fn default() -> Self {
		Self {
			base_port: port::DEFAULT_BASE_PORT,
			block_size: port::DEFAULT_BLOCK_SIZE,
			root: PathBuf::from("."),
			env: BTreeMap::new(),
			style: Style::default(),
			shutdown_timeout: None,
			trap_signals: true,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedWorker {
	pub id: WorkerId,
	pub command: String,
}

/// Expands descriptors into one entry per worker, in launch order.
pub fn plan(
	descriptors: &[ServiceDescriptor],
	base_port: u16,
	block_size: u16,
) -> Result<Vec<PlannedWorker>, ConfigError> {
	let mut planned = Vec::new();
	for service in descriptors {
		for worker_index in 0..service.worker_count {
			let port = port::allocate(base_port, block_size, service.index, worker_index);
			let port = u16::try_from(port).map_err(|_| ConfigError::PortOutOfRange {
				worker: format!("{}.{}", service.tag, worker_index + 1),
				port,
			})?;
			planned.push(PlannedWorker {
				id: WorkerId {
					tag: service.tag.clone(),
					service_index: service.index,
					worker_index,
					port,
				},
				command: service.command.clone(),
			});
		}
	}
	Ok(planned)
}

struct WorkerSlot {
	id: WorkerId,
	command: String,
	source: SourceId,
	state: WorkerState,
	signals: Option<mpsc::UnboundedSender<Signal>>,
	via_shell: bool,
}

struct Reaped {
	worker: usize,
	status: io::Result<ExitStatus>,
}

/// Injects a signal into the relay as if the supervisor had received it.
#[derive(Clone)]
pub struct RelayHandle(mpsc::UnboundedSender<Signal>);

impl RelayHandle {
	pub fn send(&self, signal: Signal) {
		let _ = self.0.send(signal);
	}
}

pub struct Supervisor {
	config: SupervisorConfig,
	state: SupervisorState,
	workers: Vec<WorkerSlot>,
	output: Multiplexer,
	exits_tx: mpsc::Sender<Reaped>,
	exits_rx: mpsc::Receiver<Reaped>,
	relay_tx: mpsc::UnboundedSender<Signal>,
	relay_rx: mpsc::UnboundedReceiver<Signal>,
}

impl Supervisor {
	pub fn new(config: SupervisorConfig, sink: Box<dyn Write + Send>) -> Self {
		let output = Multiplexer::new(sink, config.style);
		let (exits_tx, exits_rx) = mpsc::channel(256);
		let (relay_tx, relay_rx) = mpsc::unbounded_channel();
		Self {
			config,
			state: SupervisorState::Idle,
			workers: Vec::new(),
			output,
			exits_tx,
			exits_rx,
			relay_tx,
			relay_rx,
		}
	}

	pub fn state(&self) -> SupervisorState {
		self.state
	}

	pub fn workers(&self) -> impl Iterator<Item = (&WorkerId, &WorkerState)> + '_ {
		self.workers.iter().map(|w| (&w.id, &w.state))
	}

	pub fn relay_handle(&self) -> RelayHandle {
		RelayHandle(self.relay_tx.clone())
	}

	/// Launches every worker. Must be called inside a tokio runtime.
	///
	/// Only configuration problems are returned; a worker that fails to
	/// spawn is recorded as exited and the others are still launched.
	pub fn start(&mut self, descriptors: &[ServiceDescriptor]) -> Result<(), ConfigError> {
		if self.state != SupervisorState::Idle {
			tracing::warn!("supervisor already started, ignoring");
			return Ok(());
		}

		let planned = plan(descriptors, self.config.base_port, self.config.block_size)?;
		if planned.is_empty() {
			self.state = SupervisorState::Terminated;
			return Err(ConfigError::NothingToRun);
		}

		if self.config.trap_signals {
			self.trap_signals();
		}

		// Register every identity before launching so prefix padding is
		// settled before the first line is written.
		for PlannedWorker { id, command } in planned {
			let source = self.output.add_source(id.name(), id.service_index);
			self.workers.push(WorkerSlot {
				id,
				command,
				source,
				state: WorkerState::Starting,
				signals: None,
				via_shell: false,
			});
		}

		for worker in 0..self.workers.len() {
			self.launch(worker);
		}

		self.state = SupervisorState::Running;
		tracing::debug!("supervisor running {} workers", self.workers.len());
		Ok(())
	}

	fn launch(&mut self, worker: usize) {
		let slot = &mut self.workers[worker];
		let name = slot.id.name();
		let launch = Launch {
			command: &slot.command,
			port: slot.id.port,
			name: &name,
			dir: &self.config.root,
			env: &self.config.env,
		};

		slot.via_shell = launch.via_shell();
		match launch.build().spawn() {
			Ok(mut child) => {
				let pid = child.id().unwrap_or(0);
				if let Some(stdout) = child.stdout.take() {
					self.output.attach(slot.source, stdout);
				}
				if let Some(stderr) = child.stderr.take() {
					self.output.attach(slot.source, stderr);
				}

				let (signals_tx, signals_rx) = mpsc::unbounded_channel();
				slot.signals = Some(signals_tx);
				slot.state = WorkerState::Running { pid };
				tokio::spawn(monitor(worker, child, signals_rx, self.exits_tx.clone()));

				self.output.system(&format!(
					"{} started with pid {} on port {}",
					name, pid, slot.id.port
				));
			}
			Err(e) => {
				tracing::warn!("failed to spawn {}: {}", name, e);
				let exit = WorkerExit::SpawnFailed(e.to_string());
				self.output.emit(slot.source, exit.to_string().as_bytes());
				slot.state = WorkerState::Exited(exit);
			}
		}
	}

	fn trap_signals(&self) {
		use tokio::signal::unix::{signal, SignalKind};

		let trapped = [
			(SignalKind::interrupt(), Signal::SIGINT),
			(SignalKind::terminate(), Signal::SIGTERM),
			(SignalKind::hangup(), Signal::SIGHUP),
		];
		for (kind, sig) in trapped {
			let mut stream = match signal(kind) {
				Ok(s) => s,
				Err(e) => {
					tracing::warn!("cannot trap {}: {}", sig, e);
					continue;
				}
			};
			let relay = self.relay_tx.clone();
			tokio::spawn(async move {
				while stream.recv().await.is_some() {
					if relay.send(sig).is_err() {
						break;
					}
				}
			});
		}
	}

	fn live(&self) -> usize {
		self.workers.iter().filter(|w| w.state.is_live()).count()
	}

	/// Drives output, exits and signals until every worker has exited.
	pub async fn run(mut self) -> Outcome {
		let mut shutdown = Shutdown::Voluntary;
		let mut kill_at: Option<Instant> = None;
		let mut drain_until: Option<Instant> = None;

		loop {
			if self.live() == 0 {
				if self.output.open_streams() == 0 {
					break;
				}
				if drain_until.is_none() {
					drain_until = Some(Instant::now() + DRAIN_GRACE);
					kill_at = None;
				}
			}

			tokio::select! {
				Some(event) = self.output.recv(), if self.output.open_streams() > 0 => {
					self.output.deliver(event);
				}
				Some(reaped) = self.exits_rx.recv() => {
					self.reap(reaped);
				}
				Some(signal) = self.relay_rx.recv() => {
					if self.relay(signal) && shutdown == Shutdown::Voluntary {
						shutdown = Shutdown::Signaled(signal);
						kill_at = self.config.shutdown_timeout.map(|t| Instant::now() + t);
					}
				}
				_ = sleep_until(kill_at) => {
					kill_at = None;
					self.relay(Signal::SIGKILL);
				}
				_ = sleep_until(drain_until) => {
					tracing::debug!(
						"{} output streams still open after last exit, giving up",
						self.output.open_streams()
					);
					break;
				}
			}
		}

		self.state = SupervisorState::Terminated;
		let exits = self
			.workers
			.iter()
			.filter_map(|w| match &w.state {
				WorkerState::Exited(exit) => Some((w.id.clone(), exit.clone())),
				_ => None,
			})
			.collect();
		Outcome { shutdown, exits }
	}

	/// Sends `signal` once to every live worker. Returns false when there was
	/// nobody to send it to.
	fn relay(&mut self, signal: Signal) -> bool {
		if self.live() == 0 {
			tracing::debug!("{} with no live workers, ignoring", signal);
			return false;
		}

		if self.state == SupervisorState::Running {
			self.state = SupervisorState::Draining;
			tracing::debug!("supervisor draining");
		}
		self.output.system(&format!("sending {} to all processes", signal));

		for slot in &mut self.workers {
			let pid = match slot.state {
				WorkerState::Running { pid } | WorkerState::Signaled { pid, .. } => pid,
				_ => continue,
			};
			if let Some(signals) = &slot.signals {
				if signals.send(signal).is_err() {
					tracing::debug!("{} already reaped, skipping", slot.id);
				}
			}
			slot.state = WorkerState::Signaled { pid, signal };
		}
		true
	}

	fn reap(&mut self, reaped: Reaped) {
		let Some(slot) = self.workers.get_mut(reaped.worker) else {
			return;
		};
		let exit = classify(reaped.status, slot.via_shell);
		slot.signals = None;
		self.output.system(&format!("{} {}", slot.id.name(), exit));
		slot.state = WorkerState::Exited(exit);
	}
}

/// Owns one child: waits for it and delivers relayed signals to its process
/// group. Keeping both here means a signal can never reach a pid that has
/// already been reaped and possibly reused.
async fn monitor(
	worker: usize,
	mut child: Child,
	mut signals: mpsc::UnboundedReceiver<Signal>,
	exits: mpsc::Sender<Reaped>,
) {
	let status = loop {
		tokio::select! {
			status = child.wait() => break status,
			Some(signal) = signals.recv() => deliver(&child, signal),
		}
	};
	let _ = exits.send(Reaped { worker, status }).await;
}

fn deliver(child: &Child, signal: Signal) {
	let Some(pid) = child.id() else {
		return;
	};
	match killpg(Pid::from_raw(pid as i32), signal) {
		Ok(()) => {}
		Err(Errno::ESRCH) => tracing::debug!("process group {} already gone", pid),
		Err(e) => tracing::warn!("failed to send {} to {}: {}", signal, pid, e),
	}
}

/// `sh -c` cannot fail to spawn on our side, so a program it could not run
/// only shows up as its conventional exit code.
fn classify(status: io::Result<ExitStatus>, via_shell: bool) -> WorkerExit {
	match status {
		Ok(status) => match (status.code(), status.signal()) {
			(Some(127), _) if via_shell => WorkerExit::SpawnFailed("command not found".to_string()),
			(Some(126), _) if via_shell => {
				WorkerExit::SpawnFailed("command not executable".to_string())
			}
			(Some(code), _) => WorkerExit::Code(code),
			(None, Some(sig)) => match Signal::try_from(sig) {
				Ok(signal) => WorkerExit::Killed(signal),
				Err(_) => WorkerExit::Code(128 + sig),
			},
			(None, None) => WorkerExit::Lost("no exit code or signal".to_string()),
		},
		Err(e) => WorkerExit::Lost(e.to_string()),
	}
}

async fn sleep_until(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => tokio::time::sleep_until(deadline).await,
		None => std::future::pending().await,
	}
}
