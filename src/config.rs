//! Session and worker configuration

use crate::arena::{DEFAULT_CAPACITY, HEADER_BYTES};
use crate::codec::InputSpec;
use crate::error::{BridgeError, Result};
use crate::handshake::Timeouts;
use crate::shm::ShmKey;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_ENGINE_PIPE: &str = "engine_pipe";
pub const DEFAULT_MODULE_PIPE: &str = "module_pipe";
pub const DEFAULT_SHM_KEY_PATH: &str = "/tmp";
pub const DEFAULT_SHM_PROJECT_ID: i32 = 1;

/// Configuration shared by both sides of a session
///
/// Every field has a default, so a TOML file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Directory the pipe names are resolved against
    pub work_dir: PathBuf,
    /// FIFO carrying module -> engine signals
    pub engine_pipe: PathBuf,
    /// FIFO carrying engine -> module signals
    pub module_pipe: PathBuf,
    /// Path fed to `ftok`; `None` creates a private segment reachable by id
    pub shm_key_path: Option<PathBuf>,
    pub shm_project_id: i32,
    /// Attach to this segment id instead of deriving a key (engine side)
    pub shm_id: Option<i32>,
    /// Arena size in bytes, header included
    pub capacity: usize,
    pub connect_timeout_ms: u64,
    pub signal_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Pause between cycles when polling
    pub cycle_interval_ms: u64,
    /// Remove the segment when the creating session closes
    pub destroy_arena_on_close: bool,
    /// Model input layout, in encoding order
    pub inputs: Vec<InputSpec>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let timeouts = Timeouts::default();
        Self {
            work_dir: PathBuf::from("."),
            engine_pipe: PathBuf::from(DEFAULT_ENGINE_PIPE),
            module_pipe: PathBuf::from(DEFAULT_MODULE_PIPE),
            shm_key_path: Some(PathBuf::from(DEFAULT_SHM_KEY_PATH)),
            shm_project_id: DEFAULT_SHM_PROJECT_ID,
            shm_id: None,
            capacity: DEFAULT_CAPACITY,
            connect_timeout_ms: timeouts.connect.as_millis() as u64,
            signal_timeout_ms: timeouts.signal.as_millis() as u64,
            poll_interval_ms: timeouts.poll_interval.as_millis() as u64,
            cycle_interval_ms: 1000,
            destroy_arena_on_close: false,
            inputs: Vec::new(),
        }
    }
}

impl SessionConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| BridgeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Builder for tests and demos that keep both pipes in one directory
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: dir.into(),
            ..Self::default()
        }
    }

    pub fn engine_pipe_path(&self) -> PathBuf {
        self.work_dir.join(&self.engine_pipe)
    }

    pub fn module_pipe_path(&self) -> PathBuf {
        self.work_dir.join(&self.module_pipe)
    }

    /// Key for the arena segment
    pub fn shm_key(&self) -> Result<ShmKey> {
        match &self.shm_key_path {
            Some(path) => ShmKey::from_path(path, self.shm_project_id),
            None => Ok(ShmKey::private()),
        }
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            signal: Duration::from_millis(self.signal_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity <= HEADER_BYTES {
            return Err(BridgeError::Config(format!(
                "capacity must exceed the {}-byte frame header, got {}",
                HEADER_BYTES, self.capacity
            )));
        }
        for (name, value) in [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("signal_timeout_ms", self.signal_timeout_ms),
            ("poll_interval_ms", self.poll_interval_ms),
        ] {
            if value == 0 {
                return Err(BridgeError::Config(format!("{} must be non-zero", name)));
            }
        }
        if !(1..=255).contains(&self.shm_project_id) {
            return Err(BridgeError::Config(format!(
                "shm_project_id must fit in one non-zero byte, got {}",
                self.shm_project_id
            )));
        }
        if self.engine_pipe == self.module_pipe {
            return Err(BridgeError::Config(
                "engine_pipe and module_pipe must differ".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for input in &self.inputs {
            if !seen.insert(input.name.as_str()) {
                return Err(BridgeError::DuplicateTensor(input.name.clone()));
            }
        }
        Ok(())
    }
}

/// Configuration for an [`EngineWorker`](crate::worker::EngineWorker)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Results kept before the oldest unread one is dropped
    pub result_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { result_capacity: 4 }
    }
}
