//! Run configuration shared by the simulator and emulator.

use std::{
    io::BufRead,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use relaynet_replay::{Replay, ReplayError};
use relaynet_trace::TraceLogger;

use crate::FailureLvl;

/// Environment variable that pins the RNG seed when none is configured.
pub const SEED_ENV: &str = "RELAYNET_SEED";

/// Configuration for a simulator or emulator run.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How much decision-making is handed to the operator.
    pub failure_lvl: FailureLvl,
    /// RNG seed. Falls back to [`SEED_ENV`], then to a random seed.
    pub seed: Option<u64>,
    /// Replay log to read inputs from instead of the keyboard and network.
    pub replay_input: Option<PathBuf>,
    /// Replay log to record inputs to. Must not exist yet.
    pub replay_output: Option<PathBuf>,
    /// Partially ordered (vector clock) trace file.
    pub partial_trace: Option<PathBuf>,
    /// Totally ordered trace file (simulator only).
    pub total_trace: Option<PathBuf>,
    /// Command script read instead of prompting for commands.
    pub command_file: Option<PathBuf>,
    /// Root directory of per-node persistent storage.
    pub storage_root: PathBuf,
    /// Stop after this many rounds (`None` for unlimited).
    pub max_rounds: Option<u64>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            failure_lvl: FailureLvl::default(),
            seed: None,
            replay_input: None,
            replay_output: None,
            partial_trace: None,
            total_trace: None,
            command_file: None,
            storage_root: PathBuf::from("storage"),
            max_rounds: None,
        }
    }

    pub const fn failure_lvl(&mut self, failure_lvl: FailureLvl) -> &mut Self {
        self.failure_lvl = failure_lvl;
        self
    }

    pub const fn seed(&mut self, seed: u64) -> &mut Self {
        self.seed = Some(seed);
        self
    }

    pub const fn max_rounds(&mut self, max_rounds: u64) -> &mut Self {
        self.max_rounds = Some(max_rounds);
        self
    }

    pub fn replay_input(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.replay_input = Some(path.into());
        self
    }

    pub fn replay_output(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.replay_output = Some(path.into());
        self
    }

    pub fn partial_trace(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.partial_trace = Some(path.into());
        self
    }

    pub fn total_trace(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.total_trace = Some(path.into());
        self
    }

    pub fn command_file(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.command_file = Some(path.into());
        self
    }

    pub fn storage_root(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.storage_root = path.into();
        self
    }

    /// Opens the replay logs, reading live lines from `lines`.
    ///
    /// # Errors
    ///
    /// * If the replay output already exists
    /// * If either replay log cannot be opened
    pub fn open_replay(&self, lines: impl BufRead + Send + 'static) -> Result<Replay, ReplayError> {
        Replay::open(
            resolve_seed(self.seed),
            self.replay_input.as_deref(),
            self.replay_output.as_deref(),
            lines,
        )
    }

    #[must_use]
    pub fn open_partial_trace(&self) -> TraceLogger {
        open_trace(self.partial_trace.as_deref())
    }

    #[must_use]
    pub fn open_total_trace(&self) -> TraceLogger {
        open_trace(self.total_trace.as_deref())
    }
}

fn open_trace(path: Option<&Path>) -> TraceLogger {
    path.map_or_else(TraceLogger::disabled, TraceLogger::create)
}

/// Picks the RNG seed: `explicit`, else [`SEED_ENV`], else a random one.
#[must_use]
pub fn resolve_seed(explicit: Option<u64>) -> u64 {
    static ENV_SEED: LazyLock<Option<u64>> = LazyLock::new(|| {
        std::env::var(SEED_ENV).ok().and_then(|x| {
            x.parse::<u64>()
                .inspect_err(|e| log::warn!("resolve_seed: ignoring {SEED_ENV}={x}: {e:?}"))
                .ok()
        })
    });

    explicit.or(*ENV_SEED).unwrap_or_else(rand::random)
}
