mod config;
mod envfile;
mod procfile;

use std::io::IsTerminal;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use owo_colors::OwoColorize;
use shoal::command::Invocation;
use shoal::{port, registry, Formation, Style, Supervisor, SupervisorConfig};

#[derive(Debug, Parser)]
#[command(name = "shoal", version, about = "Run every process of a Procfile with one tagged output stream")]
struct Cli {
	/// Print supervisor debug logs to stderr
	#[arg(short, long, global = true)]
	verbose: bool,

	#[command(subcommand)]
	command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
	/// Start every process, or only SERVICE
	Start(StartArgs),
	/// Validate a Procfile
	Check(CheckArgs),
	/// Run one command (or Procfile entry) with the env files applied
	Run(RunArgs),
}

#[derive(Debug, Args)]
struct FileArgs {
	/// Procfile to read [default: Procfile]
	#[arg(short = 'f', long)]
	procfile: Option<PathBuf>,

	/// Directory processes run in [default: the Procfile's directory]
	#[arg(short = 'd', long)]
	root: Option<PathBuf>,

	/// Env files to load, comma separated [default: .env]
	#[arg(short = 'e', long, value_delimiter = ',')]
	env: Vec<PathBuf>,
}

#[derive(Debug, Args)]
struct StartArgs {
	/// Only run this service; every other one gets zero workers
	service: Option<String>,

	#[command(flatten)]
	files: FileArgs,

	/// Workers per service, e.g. web=2,worker=1 (all=N sets the default)
	#[arg(short = 'c', long, visible_alias = "concurrency")]
	formation: Option<String>,

	/// Base port; worker K of service N gets PORT + N*100 + K
	#[arg(short, long)]
	port: Option<u16>,

	/// Seconds to wait after relaying a signal before sending SIGKILL
	#[arg(short, long)]
	timeout: Option<u64>,

	/// Always color prefixes
	#[arg(long, conflicts_with = "no_color")]
	color: bool,

	/// Never color prefixes
	#[arg(long)]
	no_color: bool,

	/// Leave the time of day out of prefixes
	#[arg(long)]
	no_timestamp: bool,
}

#[derive(Debug, Args)]
struct CheckArgs {
	/// Procfile to read [default: Procfile]
	#[arg(short = 'f', long)]
	procfile: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct RunArgs {
	#[command(flatten)]
	files: FileArgs,

	/// Command to run, or the name of a Procfile entry
	#[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
	command: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
	let cli = Cli::parse();
	init_logging(cli.verbose);

	let result = match cli.command {
		Command::Start(args) => cmd_start(args).await,
		Command::Check(args) => cmd_check(args),
		Command::Run(args) => cmd_run(args).await,
	};

	match result {
		Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
		Err(e) => {
			eprintln!("{} {:#}", "error:".red().bold(), e);
			ExitCode::FAILURE
		}
	}
}

fn init_logging(verbose: bool) {
	let level = if verbose {
		tracing::Level::DEBUG
	} else {
		tracing::Level::WARN
	};
	tracing_subscriber::fmt()
		.with_max_level(level)
		.with_target(false)
		.with_writer(std::io::stderr)
		.init();
}

async fn cmd_start(args: StartArgs) -> Result<i32> {
	let defaults = config::load_defaults(Path::new("."));
	let files = config::resolve_files(args.files.procfile, args.files.root, args.files.env, &defaults);

	let entries = procfile::load(&files.procfile)?;
	let env = envfile::load(&files.env, files.env_required)?;

	let formation: Formation = args
		.formation
		.or_else(|| defaults.formation.clone())
		.unwrap_or_default()
		.parse()?;
	let services = registry::build(
		&entries,
		&formation,
		args.service.as_deref(),
		port::DEFAULT_BLOCK_SIZE,
	)?;

	let ambient_port = std::env::var("PORT").ok();
	let base_port = config::resolve_port(
		args.port,
		&defaults,
		env.get("PORT").map(String::as_str),
		ambient_port.as_deref(),
	)
	.map_err(|e| anyhow!(e))?;

	let color = if args.no_color {
		false
	} else if args.color {
		true
	} else {
		defaults.color.unwrap_or_else(|| std::io::stdout().is_terminal())
	};
	let style = Style {
		color,
		timestamp: !args.no_timestamp && defaults.timestamp.unwrap_or(true),
	};

	let config = SupervisorConfig {
		base_port,
		block_size: port::DEFAULT_BLOCK_SIZE,
		root: files.root,
		env,
		style,
		shutdown_timeout: args.timeout.or(defaults.timeout).map(Duration::from_secs),
		trap_signals: true,
	};
	tracing::debug!("base port {}, root {}", config.base_port, config.root.display());

	let mut supervisor = Supervisor::new(config, Box::new(std::io::stdout()));
	supervisor.start(&services)?;
	let outcome = supervisor.run().await;

	let failed = outcome.spawn_failures();
	if failed > 0 {
		let names: Vec<String> = outcome
			.exits
			.iter()
			.filter(|(_, exit)| exit.is_spawn_failure())
			.map(|(id, _)| id.name())
			.collect();
		eprintln!(
			"{} {} worker(s) failed to spawn: {}",
			"error:".red().bold(),
			failed,
			names.join(", ")
		);
	}
	Ok(outcome.exit_code())
}

fn cmd_check(args: CheckArgs) -> Result<i32> {
	let defaults = config::load_defaults(Path::new("."));
	let path = args
		.procfile
		.or(defaults.procfile)
		.unwrap_or_else(|| PathBuf::from(config::DEFAULT_PROCFILE));

	let entries = procfile::load(&path)?;
	if entries.is_empty() {
		bail!("no processes defined in {}", path.display());
	}
	let names: Vec<&str> = entries.iter().map(|(name, _)| name.as_str()).collect();
	println!("{} ({})", "valid procfile detected".green(), names.join(", "));
	Ok(0)
}

async fn cmd_run(args: RunArgs) -> Result<i32> {
	let defaults = config::load_defaults(Path::new("."));
	let files = config::resolve_files(args.files.procfile, args.files.root, args.files.env, &defaults);
	let env = envfile::load(&files.env, files.env_required)?;

	let entry = match args.command.as_slice() {
		[name] => procfile::load(&files.procfile)
			.ok()
			.and_then(|entries| entries.into_iter().find(|(n, _)| n == name))
			.map(|(_, command)| command),
		_ => None,
	};

	let mut cmd = match entry {
		Some(line) => match Invocation::parse(&line) {
			Invocation::Direct { program, args } => {
				let mut cmd = tokio::process::Command::new(program);
				cmd.args(args);
				cmd
			}
			Invocation::Shell(script) => {
				let mut cmd = tokio::process::Command::new("sh");
				cmd.args(["-c", &script]);
				cmd
			}
		},
		None => {
			let mut cmd = tokio::process::Command::new(&args.command[0]);
			cmd.args(&args.command[1..]);
			cmd
		}
	};
	cmd.current_dir(&files.root).envs(&env);

	// The child shares our terminal and receives Ctrl-C itself; keep the
	// default handler from killing us before it exits.
	let _sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
		.context("failed to install SIGINT handler")?;

	let status = cmd
		.status()
		.await
		.with_context(|| format!("failed to run {}", args.command.join(" ")))?;
	Ok(status
		.code()
		.unwrap_or_else(|| 128 + status.signal().unwrap_or(0)))
}
