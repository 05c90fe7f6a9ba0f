use std::env;
use std::path::PathBuf;

fn env_flag(name: &str) -> bool {
    let Ok(value) = env::var(name) else {
        return false;
    };
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// `MARL_SHOW_STATS=1` makes the evaluator report its counters at shutdown.
pub fn show_stats_from_env() -> bool {
    env_flag("MARL_SHOW_STATS")
}

/// Any non-empty `MARL_NO_UNSAFE_EQ` disables the permissive equality mode.
pub fn unsafe_eq_disabled_from_env() -> bool {
    env::var("MARL_NO_UNSAFE_EQ")
        .map(|value| !value.is_empty())
        .unwrap_or(false)
}

fn default_store_dir() -> PathBuf {
    env::var("MARL_STORE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp/marl-store"))
}

#[derive(Clone, Debug)]
pub struct EvalOptions {
    /// Compute store paths without inserting anything into the store.
    pub read_only: bool,
    /// Root of the local object store.
    pub store_dir: PathBuf,
    /// Recursion ceiling for the dispatcher; exceeding it is reported as
    /// infinite recursion rather than overflowing the host stack.
    pub max_depth: usize,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            store_dir: default_store_dir(),
            max_depth: 10_000,
        }
    }
}
