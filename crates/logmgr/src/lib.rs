//! Per-app log pipeline.
//!
//! Each app gets a bounded ingestion queue, an append-only file under the
//! log directory, and a set of bounded subscriber channels. A handler task
//! per app drains the queue while traffic arrives and exits after an idle
//! period; the next write revives it. Delivery to subscribers is
//! best-effort: a full channel drops the line rather than back-pressuring
//! ingestion.

pub mod error;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

pub use error::{LogError, Result};

/// Depth of the per-app ingestion queue. Writers awaiting a slot
/// back-pressure the internal log endpoint, never the sandbox itself.
const INPUT_QUEUE_DEPTH: usize = 1024;

/// Minimum capacity of a tail subscriber channel.
const MIN_TAIL_CAPACITY: usize = 16;

#[derive(Debug)]
struct AppLogState {
    /// Parked receiver while no handler is running; the running handler
    /// owns it otherwise.
    input_rx: Option<mpsc::Receiver<Bytes>>,
    subscribers: HashMap<u64, mpsc::Sender<String>>,
    next_id: u64,
    handler_active: bool,
}

#[derive(Debug)]
struct AppLog {
    id: String,
    input_tx: mpsc::Sender<Bytes>,
    state: Mutex<AppLogState>,
}

/// Fan-out engine for all apps' logs.
#[derive(Debug)]
pub struct LogFanout {
    base_dir: PathBuf,
    idle: Duration,
    apps: Mutex<HashMap<String, Arc<AppLog>>>,
}

impl LogFanout {
    /// Create the engine, probing that the log directory is writable
    /// before accepting any traffic.
    pub fn new(base_dir: impl Into<PathBuf>, idle: Duration) -> Result<Self> {
        let base_dir = base_dir.into();
        let probe = base_dir.join(".probe");
        std::fs::write(&probe, b"")
            .and_then(|_| std::fs::remove_file(&probe))
            .map_err(|source| LogError::Unwritable {
                dir: base_dir.display().to_string(),
                source,
            })?;

        Ok(Self {
            base_dir,
            idle,
            apps: Mutex::new(HashMap::new()),
        })
    }

    /// Append one line for an app and fan it out to live subscribers.
    ///
    /// The line is raw bytes: non-UTF-8 content is persisted but skipped
    /// on delivery. Embedded newlines are rejected.
    pub async fn write(&self, app_id: &str, line: Bytes) -> Result<()> {
        if line.contains(&b'\n') {
            return Err(LogError::LineContainsNewline);
        }

        let app = self.app(app_id);
        // The receiver is always alive (parked or owned by a handler), so
        // this only waits when the queue is full.
        if app.input_tx.send(line).await.is_err() {
            tracing::error!(app = %app_id, "Log queue receiver vanished");
        }
        self.maybe_start_handler(&app);
        Ok(())
    }

    /// Read up to the last `lines` persisted lines into a fresh channel,
    /// then register it as a live subscriber.
    ///
    /// Lines written between the file read and the registration reach the
    /// disk but not this subscriber. That window is accepted: closing it
    /// would mean back-pressuring ingestion on subscriber registration.
    pub async fn tail(&self, app_id: &str, lines: usize) -> Result<(u64, mpsc::Receiver<String>)> {
        let capacity = std::cmp::max(lines * 2, MIN_TAIL_CAPACITY);
        let (tx, rx) = mpsc::channel(capacity);

        match tokio::fs::read(self.base_dir.join(app_id)).await {
            Ok(contents) => {
                let backlog: Vec<&[u8]> = contents
                    .split(|&b| b == b'\n')
                    .filter(|l| !l.is_empty())
                    .collect();
                let skip = backlog.len().saturating_sub(lines);
                for &raw in &backlog[skip..] {
                    if let Ok(text) = std::str::from_utf8(raw) {
                        // Capacity is at least twice the backlog we keep.
                        let _ = tx.try_send(text.to_string());
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(LogError::Io(err)),
        }

        let app = self.app(app_id);
        let mut state = app.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.insert(id, tx);
        Ok((id, rx))
    }

    /// Unregister a subscriber created by [`tail`](Self::tail).
    pub fn close_tail(&self, app_id: &str, id: u64) {
        let app = self.app(app_id);
        app.state.lock().subscribers.remove(&id);
    }

    /// Path of an app's persisted log.
    pub fn log_path(&self, app_id: &str) -> PathBuf {
        self.base_dir.join(app_id)
    }

    fn app(&self, app_id: &str) -> Arc<AppLog> {
        let mut apps = self.apps.lock();
        apps.entry(app_id.to_string())
            .or_insert_with(|| {
                let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
                Arc::new(AppLog {
                    id: app_id.to_string(),
                    input_tx,
                    state: Mutex::new(AppLogState {
                        input_rx: Some(input_rx),
                        subscribers: HashMap::new(),
                        next_id: 0,
                        handler_active: false,
                    }),
                })
            })
            .clone()
    }

    fn maybe_start_handler(&self, app: &Arc<AppLog>) {
        let mut state = app.state.lock();
        if state.handler_active {
            return;
        }
        let Some(rx) = state.input_rx.take() else {
            // The exiting handler still holds the receiver; it parks it
            // under this lock before clearing the flag, so this cannot
            // happen while the flag is down.
            return;
        };
        state.handler_active = true;
        drop(state);

        let path = self.base_dir.join(&app.id);
        tokio::spawn(handle_app_log(app.clone(), path, self.idle, rx));
    }
}

/// Per-app handler: persists and fans out lines until the queue stays
/// quiet for the idle duration.
async fn handle_app_log(
    app: Arc<AppLog>,
    path: PathBuf,
    idle: Duration,
    mut rx: mpsc::Receiver<Bytes>,
) {
    let mut file: Option<tokio::fs::File> = None;

    loop {
        let line = tokio::select! {
            line = rx.recv() => match line {
                Some(line) => line,
                None => break,
            },
            _ = tokio::time::sleep(idle) => break,
        };

        if file.is_none() {
            file = open_log_file(&app.id, &path).await;
        }

        if let Some(f) = file.as_mut() {
            let mut framed = Vec::with_capacity(line.len() + 1);
            framed.extend_from_slice(&line);
            framed.push(b'\n');
            let written = async {
                f.write_all(&framed).await?;
                f.flush().await
            }
            .await;
            if let Err(err) = written {
                tracing::error!(app = %app.id, error = %err, "Cannot write log file");
                // Drop the handle; the next line retries the open.
                file = None;
            }
        }

        // Live delivery is UTF-8 only; the raw bytes are already on disk.
        if let Ok(text) = std::str::from_utf8(&line) {
            let state = app.state.lock();
            for (id, tx) in &state.subscribers {
                if tx.try_send(text.to_string()).is_err() {
                    tracing::warn!(app = %app.id, subscriber = id, "Log subscriber channel full, dropping line");
                }
            }
        }
    }

    drop(file);
    let mut state = app.state.lock();
    state.input_rx = Some(rx);
    state.handler_active = false;
}

async fn open_log_file(app_id: &str, path: &Path) -> Option<tokio::fs::File> {
    match tokio::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .await
    {
        Ok(file) => Some(file),
        Err(err) => {
            tracing::error!(app = %app_id, error = %err, "Cannot open log file");
            None
        }
    }
}
