use std::io::Write;

use owo_colors::{AnsiColors, OwoColorize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

const READ_CHUNK: usize = 4096;
/// Longest line kept in memory; anything longer is emitted in pieces.
pub const MAX_LINE: usize = 64 * 1024;

const PALETTE: &[AnsiColors] = &[
	AnsiColors::Cyan,
	AnsiColors::Yellow,
	AnsiColors::Green,
	AnsiColors::Magenta,
	AnsiColors::Red,
	AnsiColors::Blue,
	AnsiColors::BrightCyan,
	AnsiColors::BrightYellow,
	AnsiColors::BrightGreen,
	AnsiColors::BrightMagenta,
	AnsiColors::BrightRed,
	AnsiColors::BrightBlue,
];

pub const SYSTEM: SourceId = 0;

pub type SourceId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Style {
	pub color: bool,
	pub timestamp: bool,
}

impl Default for Style {
	fn default() -> Self {
		Self {
			color: false,
			timestamp: true,
		}
	}
}

#[derive(Debug)]
pub enum StreamEvent {
	Line { source: SourceId, line: Vec<u8> },
	Closed { source: SourceId },
}

struct Source {
	label: String,
	color: AnsiColors,
}

/// Merges the output of every attached stream into one sink.
///
/// Reader tasks only split bytes into lines; the lines travel over a channel
/// and are written by whoever owns the multiplexer, one `write_all` per line.
/// That single writer is what keeps lines from different workers from being
/// fused together.
pub struct Multiplexer {
	sink: Box<dyn Write + Send>,
	style: Style,
	sources: Vec<Source>,
	width: usize,
	open: usize,
	tx: mpsc::Sender<StreamEvent>,
	rx: mpsc::Receiver<StreamEvent>,
}

impl Multiplexer {
	pub fn new(sink: Box<dyn Write + Send>, style: Style) -> Self {
		let (tx, rx) = mpsc::channel(1024);
		let mut mux = Self {
			sink,
			style,
			sources: Vec::new(),
			width: 0,
			open: 0,
			tx,
			rx,
		};
		mux.sources.push(Source {
			label: "system".to_string(),
			color: AnsiColors::BrightWhite,
		});
		mux.width = "system".len();
		mux
	}

	/// Registers an identity. `color_index` picks the prefix color, so all
	/// workers of one service share a color.
	pub fn add_source(&mut self, label: impl Into<String>, color_index: usize) -> SourceId {
		let label = label.into();
		self.width = self.width.max(label.len());
		self.sources.push(Source {
			label,
			color: PALETTE[color_index % PALETTE.len()],
		});
		self.sources.len() - 1
	}

	/// Starts draining `stream` on its own task. The stream detaches itself
	/// when it hits end of data or a read error.
	pub fn attach<R>(&mut self, source: SourceId, stream: R)
	where
		R: AsyncRead + Unpin + Send + 'static,
	{
		self.open += 1;
		let tx = self.tx.clone();
		tokio::spawn(async move {
			pump_stream(source, stream, tx).await;
		});
	}

	pub fn open_streams(&self) -> usize {
		self.open
	}

	/// Waits for the next line or detach from any attached stream.
	/// Cancel safe.
	pub async fn recv(&mut self) -> Option<StreamEvent> {
		self.rx.recv().await
	}

	pub fn deliver(&mut self, event: StreamEvent) {
		match event {
			StreamEvent::Line { source, line } => self.emit(source, &line),
			StreamEvent::Closed { source } => {
				self.open = self.open.saturating_sub(1);
				tracing::trace!("stream for source {} detached", source);
			}
		}
	}

	pub fn system(&mut self, message: &str) {
		self.emit(SYSTEM, message.as_bytes());
	}

	pub fn emit(&mut self, source: SourceId, line: &[u8]) {
		let Some(src) = self.sources.get(source) else {
			tracing::warn!("dropping line for unknown source {}", source);
			return;
		};

		let prefix = format_prefix(src, self.width, self.style);
		let mut out = Vec::with_capacity(prefix.len() + line.len() + 2);
		out.extend_from_slice(prefix.as_bytes());
		out.push(b' ');
		out.extend_from_slice(line);
		out.push(b'\n');

		if let Err(e) = self.sink.write_all(&out).and_then(|_| self.sink.flush()) {
			tracing::debug!("output sink write failed: {}", e);
		}
	}
}

fn format_prefix(source: &Source, width: usize, style: Style) -> String {
	let mut head = String::new();
	if style.timestamp {
		head.push_str(&chrono::Local::now().format("%H:%M:%S ").to_string());
	}
	head.push_str(&format!("{:<width$} |", source.label, width = width));
	if style.color {
		head.color(source.color).to_string()
	} else {
		head
	}
}

async fn pump_stream<R>(source: SourceId, mut reader: R, tx: mpsc::Sender<StreamEvent>)
where
	R: AsyncRead + Unpin,
{
	let mut buf = [0u8; READ_CHUNK];
	let mut lines = LineBuffer::default();
	loop {
		match reader.read(&mut buf).await {
			Ok(0) => break,
			Ok(n) => {
				for line in lines.push(&buf[..n]) {
					if tx.send(StreamEvent::Line { source, line }).await.is_err() {
						return;
					}
				}
			}
			Err(e) => {
				tracing::debug!("read error on source {}, detaching: {}", source, e);
				break;
			}
		}
	}
	if let Some(line) = lines.finish() {
		let _ = tx.send(StreamEvent::Line { source, line }).await;
	}
	let _ = tx.send(StreamEvent::Closed { source }).await;
}

/// Accumulates bytes from one stream and hands back complete lines, without
/// their terminator.
#[derive(Debug, Default)]
pub struct LineBuffer {
	pending: Vec<u8>,
}

impl LineBuffer {
	pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
		let mut lines = Vec::new();
		let mut rest = data;
		while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
			self.pending.extend_from_slice(&rest[..pos]);
			self.spill(&mut lines);
			lines.push(self.take());
			rest = &rest[pos + 1..];
		}
		self.pending.extend_from_slice(rest);
		self.spill(&mut lines);
		lines
	}

	/// Whatever is left once the stream ends.
	pub fn finish(&mut self) -> Option<Vec<u8>> {
		if self.pending.is_empty() {
			None
		} else {
			Some(self.take())
		}
	}

	fn spill(&mut self, lines: &mut Vec<Vec<u8>>) {
		while self.pending.len() > MAX_LINE {
			let tail = self.pending.split_off(MAX_LINE);
			lines.push(std::mem::replace(&mut self.pending, tail));
		}
	}

	fn take(&mut self) -> Vec<u8> {
		let mut line = std::mem::take(&mut self.pending);
		if line.last() == Some(&b'\r') {
			line.pop();
		}
		line
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::{Arc, Mutex};

	#[derive(Clone, Default)]
	struct Capture(Arc<Mutex<Vec<u8>>>);

	impl Write for Capture {
		fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
			self.0.lock().unwrap().extend_from_slice(buf);
			Ok(buf.len())
		}

		fn flush(&mut self) -> std::io::Result<()> {
			Ok(())
		}
	}

	impl Capture {
		fn text(&self) -> String {
			String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
		}
	}

	fn plain() -> Style {
		Style {
			color: false,
			timestamp: false,
		}
	}

	#[test]
	fn splits_across_chunks() {
		let mut buf = LineBuffer::default();
		assert!(buf.push(b"hel").is_empty());
		assert_eq!(buf.push(b"lo\nwor"), vec![b"hello".to_vec()]);
		assert_eq!(buf.push(b"ld\r\n\nx"), vec![b"world".to_vec(), Vec::new()]);
		assert_eq!(buf.finish(), Some(b"x".to_vec()));
		assert_eq!(buf.finish(), None);
	}

	#[test]
	fn long_lines_are_chunked() {
		let mut buf = LineBuffer::default();
		let data = vec![b'a'; MAX_LINE * 2 + 10];
		let lines = buf.push(&data);
		assert_eq!(lines.len(), 2);
		assert!(lines.iter().all(|l| l.len() == MAX_LINE));
		assert_eq!(buf.finish().map(|l| l.len()), Some(10));
	}

	#[test]
	fn prefixes_are_padded() {
		let capture = Capture::default();
		let mut mux = Multiplexer::new(Box::new(capture.clone()), plain());
		let web = mux.add_source("web.1", 0);
		mux.emit(web, b"listening");
		mux.system("sending SIGTERM to all processes");
		assert_eq!(
			capture.text(),
			"web.1  | listening\nsystem | sending SIGTERM to all processes\n"
		);
	}

	#[test]
	fn colored_prefix_keeps_text() {
		let capture = Capture::default();
		let mut mux = Multiplexer::new(
			Box::new(capture.clone()),
			Style {
				color: true,
				timestamp: false,
			},
		);
		let web = mux.add_source("web.1", 0);
		mux.emit(web, b"hi");
		let text = capture.text();
		assert!(text.contains("\x1b["));
		assert!(text.contains("web.1  |"));
		assert!(text.ends_with(" hi\n"));
	}

	#[tokio::test]
	async fn attached_streams_never_fuse_lines() {
		let capture = Capture::default();
		let mut mux = Multiplexer::new(Box::new(capture.clone()), plain());
		let a = mux.add_source("a.1", 0);
		let b = mux.add_source("b.1", 1);

		let (mut wa, ra) = tokio::io::duplex(64);
		let (mut wb, rb) = tokio::io::duplex(64);
		mux.attach(a, ra);
		mux.attach(b, rb);

		let writer = tokio::spawn(async move {
			use tokio::io::AsyncWriteExt;
			for i in 0..50 {
				wa.write_all(format!("aaaa-{}", i).as_bytes()).await.unwrap();
				wb.write_all(format!("bbbb-{}", i).as_bytes()).await.unwrap();
				wa.write_all(b"-end\n").await.unwrap();
				wb.write_all(b"-end\n").await.unwrap();
			}
			wa.write_all(b"tail").await.unwrap();
		});

		while mux.open_streams() > 0 {
			if let Some(event) = mux.recv().await {
				mux.deliver(event);
			}
		}
		writer.await.unwrap();

		let text = capture.text();
		let lines: Vec<_> = text.lines().collect();
		assert_eq!(lines.len(), 101);
		for line in &lines {
			let ok = (line.starts_with("a.1    | aaaa-") && line.ends_with("-end"))
				|| (line.starts_with("b.1    | bbbb-") && line.ends_with("-end"))
				|| *line == "a.1    | tail";
			assert!(ok, "fused line: {:?}", line);
		}
		let a_order: Vec<_> = lines.iter().filter(|l| l.starts_with("a.1    | aaaa")).collect();
		assert_eq!(a_order[0], &"a.1    | aaaa-0-end");
		assert_eq!(a_order[49], &"a.1    | aaaa-49-end");
	}
}
