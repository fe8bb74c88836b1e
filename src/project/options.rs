//! Per-verb option structs.

use std::time::Duration;

/// Options for `build`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    pub no_cache: bool,
    pub force_rm: bool,
    pub pull: bool,
}

/// Options for `create`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateOptions {
    /// Reuse existing containers even when out of sync.
    pub no_recreate: bool,
    /// Recreate containers regardless of sync state.
    pub force_recreate: bool,
    /// Fail instead of building a missing image.
    pub no_build: bool,
}

/// Options for `up`; subsumes create.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpOptions {
    pub create: CreateOptions,
}

/// Options for `delete` (compose `rm`).
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOptions {
    pub remove_volumes: bool,
    /// Remove containers even while running.
    pub remove_running: bool,
}

/// Options for `down`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DownOptions {
    pub remove_volumes: bool,
    pub timeout: Option<Duration>,
}

/// Options for one-off `run`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Start the container and return immediately instead of waiting for
    /// its exit code.
    pub detached: bool,
}

impl CreateOptions {
    pub fn forced() -> Self {
        CreateOptions {
            force_recreate: true,
            ..CreateOptions::default()
        }
    }
}

/// Default grace period for stop/restart.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
