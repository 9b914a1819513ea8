//! Line-framed host protocol.
//!
//! One control message in per line, one completion message out per published
//! payload. Each stream sits behind its own mutex so concurrent stages never
//! interleave partial lines; diagnostics go to stderr through `tracing` and
//! are not part of this contract.
use std::io::{self, BufRead, Write};
use std::sync::Mutex;

use serde::Serialize;
use tracing::error;

/// Completion line for one published image payload.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ImageDone {
    pub version: u64,
    pub tags: String,
    #[serde(rename = "loop")]
    pub looping: bool,
    pub description: String,
    pub width: usize,
    pub height: usize,
    pub count: usize,
    pub offset: usize,
    pub size: usize,
    pub generation: u64,
}

/// Completion line for one published audio payload.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SoundDone {
    pub version: u64,
    pub tags: String,
    #[serde(rename = "loop")]
    pub looping: bool,
    pub description: String,
    pub overlap: f32,
    pub rate: u32,
    pub samples: usize,
    pub channels: usize,
    pub count: usize,
    pub offset: usize,
    pub size: usize,
    pub generation: u64,
}

pub struct Console {
    input: Mutex<Box<dyn BufRead + Send>>,
    output: Mutex<Box<dyn Write + Send>>,
}

impl Console {
    pub fn stdio() -> Self {
        Self::new(io::BufReader::new(io::stdin()), io::stdout())
    }

    pub fn new(
        input: impl BufRead + Send + 'static,
        output: impl Write + Send + 'static,
    ) -> Self {
        Self {
            input: Mutex::new(Box::new(input)),
            output: Mutex::new(Box::new(output)),
        }
    }

    /// Blocks for one line. `None` means EOF, the clean-shutdown signal.
    pub fn read_line(&self) -> io::Result<Option<String>> {
        let mut line = String::new();
        let mut input = self.input.lock().expect("input stream poisoned");
        match input.read_line(&mut line)? {
            0 => Ok(None),
            _ => {
                while line.ends_with('\n') || line.ends_with('\r') {
                    line.pop();
                }
                Ok(Some(line))
            }
        }
    }

    /// Serializes and writes one message as an atomic, flushed line.
    pub fn emit<T: Serialize>(&self, message: &T) {
        let line = match serde_json::to_string(message) {
            Ok(line) => line,
            Err(e) => {
                error!("completion line did not serialize: {e}");
                return;
            }
        };
        let mut output = self.output.lock().expect("output stream poisoned");
        if let Err(e) = writeln!(output, "{line}").and_then(|_| output.flush()) {
            error!("completion line was not delivered: {e}");
        }
    }
}
