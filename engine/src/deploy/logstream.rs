//! Per-deployment build log streams
//!
//! Every line gets a sequence number under the stream's lock, is appended to
//! `deployment-logs/{id}.log` as one JSON object and then broadcast to live
//! subscribers, so readers always observe lines in order.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::errors::ShipyardError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::deployment::BuildStep;

/// Lines kept per deployment; later lines are dropped
const MAX_LINES_PER_DEPLOYMENT: u64 = 50_000;
/// Lines kept in memory for failure summaries
const TAIL_CAPACITY: usize = 200;
const BROADCAST_CAPACITY: usize = 1024;

/// Origin of a log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
    /// Emitted by the engine itself
    System,
}

/// One line of a deployment log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub source: LogSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<BuildStep>,
    pub message: String,
}

struct StreamState {
    next_seq: u64,
    tail: VecDeque<LogLine>,
    limit_reached: bool,
}

/// Writer for one deployment's log
pub struct LogStream {
    deployment_id: String,
    file: File,
    state: tokio::sync::Mutex<StreamState>,
    sender: broadcast::Sender<LogLine>,
}

impl LogStream {
    /// Append a line
    pub async fn write(&self, source: LogSource, step: Option<BuildStep>, message: impl Into<String>) {
        let mut state = self.state.lock().await;
        if state.limit_reached {
            return;
        }
        if state.next_seq >= MAX_LINES_PER_DEPLOYMENT {
            state.limit_reached = true;
            warn!(
                deployment_id = %self.deployment_id,
                "Log line limit reached, dropping subsequent lines"
            );
            return;
        }

        let line = LogLine {
            seq: state.next_seq,
            at: Utc::now(),
            source,
            step,
            message: message.into(),
        };

        let encoded = match serde_json::to_string(&line) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(deployment_id = %self.deployment_id, "Unable to encode log line: {}", e);
                return;
            }
        };
        if let Err(e) = self.file.append_line(&encoded).await {
            warn!(deployment_id = %self.deployment_id, "Unable to persist log line: {}", e);
        }

        state.next_seq += 1;
        if state.tail.len() == TAIL_CAPACITY {
            state.tail.pop_front();
        }
        state.tail.push_back(line.clone());
        // no receivers is fine
        let _ = self.sender.send(line);
    }

    /// Engine-generated line
    pub async fn system(&self, step: Option<BuildStep>, message: impl Into<String>) {
        self.write(LogSource::System, step, message).await;
    }

    /// Last `n` lines of command output, oldest first
    pub async fn tail(&self, n: usize) -> Vec<String> {
        let state = self.state.lock().await;
        let output: Vec<&LogLine> = state
            .tail
            .iter()
            .filter(|l| l.source != LogSource::System)
            .collect();
        output
            .iter()
            .skip(output.len().saturating_sub(n))
            .map(|l| l.message.clone())
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.sender.subscribe()
    }
}

/// Registry of log streams, one per deployment
pub struct LogHub {
    dir: Dir,
    streams: Mutex<HashMap<String, Arc<LogStream>>>,
}

impl LogHub {
    pub fn new(dir: Dir) -> Self {
        Self {
            dir,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// File that durably holds a deployment's log
    pub fn log_file(&self, deployment_id: &str) -> File {
        self.dir.file(&format!("{}.log", deployment_id))
    }

    /// Open (or reuse) the stream for a deployment
    pub async fn open(&self, deployment_id: &str) -> Arc<LogStream> {
        if let Some(stream) = self.live(deployment_id) {
            return stream;
        }

        let file = self.log_file(deployment_id);
        let next_seq = match file.read_string().await {
            Ok(contents) => contents.lines().count() as u64,
            Err(_) => 0,
        };

        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        let stream = Arc::new(LogStream {
            deployment_id: deployment_id.to_string(),
            file,
            state: tokio::sync::Mutex::new(StreamState {
                next_seq,
                tail: VecDeque::with_capacity(TAIL_CAPACITY),
                limit_reached: false,
            }),
            sender,
        });

        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        streams
            .entry(deployment_id.to_string())
            .or_insert(stream)
            .clone()
    }

    /// Stream currently being written, if any
    pub fn live(&self, deployment_id: &str) -> Option<Arc<LogStream>> {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        streams.get(deployment_id).cloned()
    }

    /// Close a stream; live subscribers see the channel end
    pub fn finish(&self, deployment_id: &str) {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        streams.remove(deployment_id);
    }

    /// Read up to `limit` persisted lines starting at sequence `offset`
    pub async fn read(
        &self,
        deployment_id: &str,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<LogLine>, ShipyardError> {
        let file = self.log_file(deployment_id);
        if !file.exists().await {
            return Ok(Vec::new());
        }
        let contents = file.read_string().await?;
        let mut lines = Vec::new();
        for raw in contents.lines().skip(offset as usize).take(limit) {
            match serde_json::from_str::<LogLine>(raw) {
                Ok(line) => lines.push(line),
                // a torn last line after a crash
                Err(e) => warn!(deployment_id, "Skipping unreadable log line: {}", e),
            }
        }
        Ok(lines)
    }
}
