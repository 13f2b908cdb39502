//! Signal sources feeding the engine.
//!
//! A source is lazy and non-restartable: each signal is handed out once,
//! and `None` means nothing is ready this cycle.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::models::AISignal;

/// Producer of AI trade signals.
#[async_trait]
pub trait SignalSource: Send {
    /// Next ready signal, or `None` if nothing is ready right now.
    async fn next_signal(&mut self) -> Option<AISignal>;
}

/// Signals pushed in-process through an mpsc channel.
pub struct ChannelSignalSource {
    rx: mpsc::Receiver<AISignal>,
}

impl ChannelSignalSource {
    pub fn channel(capacity: usize) -> (mpsc::Sender<AISignal>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }
}

#[async_trait]
impl SignalSource for ChannelSignalSource {
    async fn next_signal(&mut self) -> Option<AISignal> {
        self.rx.try_recv().ok()
    }
}

/// Signals read from a file with one JSON object per line.
///
/// Reading stops at end of file; lines appended later are picked up by a
/// later call. Malformed lines are logged and skipped.
pub struct JsonLinesSignalSource {
    lines: Lines<BufReader<File>>,
    line_no: usize,
}

impl JsonLinesSignalSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .await
            .with_context(|| format!("Failed to open signal file {}", path.display()))?;

        Ok(Self {
            lines: BufReader::new(file).lines(),
            line_no: 0,
        })
    }
}

#[async_trait]
impl SignalSource for JsonLinesSignalSource {
    async fn next_signal(&mut self) -> Option<AISignal> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => {
                    warn!(error = %e, "Failed to read signal file");
                    return None;
                }
            };
            self.line_no += 1;

            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match serde_json::from_str::<AISignal>(line) {
                Ok(signal) => {
                    debug!(line = self.line_no, id = %signal.id, symbol = %signal.symbol, "Read signal");
                    return Some(signal);
                }
                Err(e) => {
                    warn!(line = self.line_no, error = %e, "Skipping malformed signal");
                }
            }
        }
    }
}
