//! Persistence collaborator
//!
//! The engine only needs `load_state`/`save_state` keyed by charge point id. Saves
//! happen off the actors: a persister task receives change notifications, folds them
//! into its own copy of the state and writes it on the blocking pool. Failures are
//! logged and otherwise ignored; the engine never waits for durability.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{ChargePointConfig, RuntimeConfig};
use crate::error::EngineError;
use crate::frame_log::{FrameLog, LogEntry};

/// Everything kept for a charge point between runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub config: ChargePointConfig,
    pub runtime: RuntimeConfig,
    /// Frame log, most recent first
    pub frames: Vec<LogEntry>,
    /// Battery level at the end of the last session
    pub soc_percent: Option<f64>,
}

pub trait StateStore: Send + Sync + 'static {
    fn load_state(&self, cp_id: &str) -> Result<Option<PersistedState>, EngineError>;

    fn save_state(&self, cp_id: &str, state: &PersistedState) -> Result<(), EngineError>;
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryStore {
    states: Mutex<HashMap<String, PersistedState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.lock().is_empty()
    }
}

impl StateStore for MemoryStore {
    fn load_state(&self, cp_id: &str) -> Result<Option<PersistedState>, EngineError> {
        Ok(self.states.lock().get(cp_id).cloned())
    }

    fn save_state(&self, cp_id: &str, state: &PersistedState) -> Result<(), EngineError> {
        self.states.lock().insert(cp_id.to_string(), state.clone());
        Ok(())
    }
}

/// One `<dir>/<cp_id>.json` file per charge point
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, cp_id: &str) -> PathBuf {
        let name: String = cp_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", name))
    }
}

fn persistence_error(context: &str, path: &Path, e: impl std::fmt::Display) -> EngineError {
    EngineError::Persistence(format!("{} {}: {}", context, path.display(), e))
}

impl StateStore for JsonFileStore {
    fn load_state(&self, cp_id: &str) -> Result<Option<PersistedState>, EngineError> {
        let path = self.path_for(cp_id);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(persistence_error("read", &path, e)),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| persistence_error("parse", &path, e))
    }

    fn save_state(&self, cp_id: &str, state: &PersistedState) -> Result<(), EngineError> {
        fs::create_dir_all(&self.dir).map_err(|e| persistence_error("create", &self.dir, e))?;

        let path = self.path_for(cp_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(state)?;

        let mut file = fs::File::create(&tmp).map_err(|e| persistence_error("create", &tmp, e))?;
        file.write_all(&bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| persistence_error("write", &tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| persistence_error("rename", &path, e))?;

        debug!("Saved state to {}", path.display());
        Ok(())
    }
}

/// State changes reported to the persister
#[derive(Debug, Clone)]
pub enum PersistEvent {
    Frame(LogEntry),
    ClearFrames,
    Config(ChargePointConfig),
    Runtime(RuntimeConfig),
    Soc(f64),
}

/// Start the persister for one charge point.
///
/// Events queued while a save is running are folded into the next save.
pub fn spawn_persister(
    store: Arc<dyn StateStore>,
    initial: PersistedState,
    frame_capacity: usize,
) -> (mpsc::UnboundedSender<PersistEvent>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_persister(store, initial, frame_capacity, rx));
    (tx, task)
}

async fn run_persister(
    store: Arc<dyn StateStore>,
    initial: PersistedState,
    frame_capacity: usize,
    mut events: mpsc::UnboundedReceiver<PersistEvent>,
) {
    let mut frames = FrameLog::new(frame_capacity);
    frames.restore(initial.frames.clone());
    let mut state = initial;

    while let Some(event) = events.recv().await {
        apply(&mut state, &mut frames, event);
        while let Ok(event) = events.try_recv() {
            apply(&mut state, &mut frames, event);
        }

        state.frames = frames.snapshot();
        let cp_id = state.config.effective_cp_id().to_string();
        let snapshot = state.clone();
        let store = store.clone();

        match tokio::task::spawn_blocking(move || store.save_state(&cp_id, &snapshot)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to save state: {}", e),
            Err(e) => warn!("State save task failed: {}", e),
        }
    }

    debug!("Persister stopped");
}

fn apply(state: &mut PersistedState, frames: &mut FrameLog, event: PersistEvent) {
    match event {
        PersistEvent::Frame(entry) => {
            frames.append(entry);
        }
        PersistEvent::ClearFrames => frames.clear(),
        PersistEvent::Config(config) => state.config = config,
        PersistEvent::Runtime(runtime) => state.runtime = runtime,
        PersistEvent::Soc(soc) => state.soc_percent = Some(soc),
    }
}
