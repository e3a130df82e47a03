//! Turning a service's command template into something `tokio::process` can
//! launch for one worker.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

/// Characters that only mean something to a shell. Commands without any of
/// them are executed directly, which lets a bad executable path surface as a
/// spawn error instead of a shell exiting with 127.
const SHELL_META: &[char] = &[
	'*', '?', '{', '}', '[', ']', '<', '>', '(', ')', '~', '&', '|', '\\', '$', ';', '\'', '`',
	'"', '\n', '#', '=', '%',
];

/// Words that are builtins or keywords in `sh` and cannot be exec'd.
const SHELL_WORDS: &[&str] = &[
	".", "alias", "case", "cd", "do", "done", "elif", "else", "esac", "eval", "exec", "exit",
	"export", "fi", "for", "if", "set", "source", "then", "trap", "ulimit", "umask", "unset",
	"until", "wait", "while",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
	Direct { program: String, args: Vec<String> },
	Shell(String),
}

impl Invocation {
	pub fn parse(command: &str) -> Self {
		let needs_shell = command.contains(SHELL_META);
		let mut words = command.split_whitespace();
		match words.next() {
			Some(program) if !needs_shell && !SHELL_WORDS.contains(&program) => Invocation::Direct {
				program: program.to_string(),
				args: words.map(str::to_string).collect(),
			},
			_ => Invocation::Shell(command.to_string()),
		}
	}
}

/// Substitutes the worker's port into the template, for commands written
/// like `server --port $PORT`.
pub fn expand(template: &str, port: u16) -> String {
	let port = port.to_string();
	template.replace("${PORT}", &port).replace("$PORT", &port)
}

/// Everything that differs from one worker to the next.
pub struct Launch<'a> {
	pub command: &'a str,
	pub port: u16,
	pub name: &'a str,
	pub dir: &'a Path,
	pub env: &'a BTreeMap<String, String>,
}

impl Launch<'_> {
	/// Whether the command runs under `sh -c` rather than being exec'd.
	pub fn via_shell(&self) -> bool {
		matches!(Invocation::parse(&expand(self.command, self.port)), Invocation::Shell(_))
	}

	/// Builds the child command: its own process group, piped output, no
	/// stdin, ambient environment plus the explicit extras, `PORT` and `PS`.
	pub fn build(&self) -> Command {
		let expanded = expand(self.command, self.port);
		let mut cmd = match Invocation::parse(&expanded) {
			Invocation::Direct { program, args } => {
				let mut cmd = Command::new(program);
				cmd.args(args);
				cmd
			}
			Invocation::Shell(script) => {
				let mut cmd = Command::new("sh");
				cmd.args(["-c", &script]);
				cmd
			}
		};

		cmd.current_dir(self.dir)
			.envs(self.env)
			.env("PORT", self.port.to_string())
			.env("PS", self.name)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.process_group(0);
		cmd
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn plain_commands_run_directly() {
		assert_eq!(
			Invocation::parse("bundle exec  puma -p 5000"),
			Invocation::Direct {
				program: "bundle".into(),
				args: vec!["exec".into(), "puma".into(), "-p".into(), "5000".into()],
			}
		);
	}

	#[test]
	fn shell_syntax_goes_through_sh() {
		for cmd in [
			"echo $HOME",
			"a && b",
			"FOO=1 server",
			"echo 'quoted'",
			"cd web; npm start",
			"exec server",
			"cat < in",
		] {
			assert_eq!(Invocation::parse(cmd), Invocation::Shell(cmd.into()), "{}", cmd);
		}
	}

	#[test]
	fn port_substitution() {
		assert_eq!(expand("serve -p $PORT", 5100), "serve -p 5100");
		assert_eq!(expand("serve -p ${PORT}", 5100), "serve -p 5100");
		assert_eq!(Invocation::parse(&expand("serve -p $PORT", 5100)), Invocation::Direct {
			program: "serve".into(),
			args: vec!["-p".into(), "5100".into()],
		});
	}

	#[test]
	fn via_shell_follows_expanded_command() {
		let env = BTreeMap::new();
		for (command, shell) in [
			("serve -p $PORT", false),
			("serve --port=$PORT", true),
			("serve > log", true),
		] {
			let launch = Launch {
				command,
				port: 5000,
				name: "web.1",
				dir: Path::new("."),
				env: &env,
			};
			assert_eq!(launch.via_shell(), shell, "{}", command);
		}
	}
}
