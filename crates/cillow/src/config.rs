//! Broker configuration and capacity derivation.
//!
//! All capacities have host-derived defaults and can be overridden
//! individually (CLI flags or `CILLOW_*` environment variables, wired up in
//! the CLI crate):
//!
//! - `Nmax` (max interpreters)        = `min(max(2, cpus - 1), 8)`
//! - `Cmax` (interpreters per client) = `1`
//! - `W`    (broker worker tasks)     = `max(2, 2 * Nmax)`
//! - `Q`    (job queue size)          = `W`

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 5556;

/// Runtime configuration of the broker process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface the ROUTER socket binds to.
    pub host: String,
    /// Port the ROUTER socket binds to.
    pub port: u16,
    /// Global interpreter cap (`Nmax`).
    pub max_interpreters: usize,
    /// Per-client interpreter cap (`Cmax`).
    pub interpreters_per_client: usize,
    /// Number of broker worker tasks pulling from the job queue (`W`).
    pub worker_tasks: usize,
    /// Bound of the job queue (`Q`). A full queue refuses with `ServerBusy`.
    pub queue_size: usize,
    /// How long to wait for a freshly spawned worker's ready frame.
    pub ready_timeout: Duration,
    /// How long a terminating worker gets to exit before it is killed.
    pub grace_period: Duration,
    /// Executable spawned as `<program> worker --env <env>`. `None` means
    /// the broker's own executable.
    pub worker_program: Option<PathBuf>,
    /// Capture hooks passed to every worker spawned from now on.
    pub hooks: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let max_interpreters = default_max_interpreters();
        let worker_tasks = default_worker_tasks(max_interpreters);
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_interpreters,
            interpreters_per_client: 1,
            worker_tasks,
            queue_size: worker_tasks,
            ready_timeout: Duration::from_secs(30),
            grace_period: Duration::from_secs(5),
            worker_program: None,
            hooks: crate::hooks::DEFAULT_HOOKS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ServerConfig {
    /// The ZeroMQ endpoint string the broker binds to.
    pub fn endpoint(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

/// `Nmax` default: one interpreter per core minus one for the broker itself,
/// clamped to `[2, 8]`.
pub fn default_max_interpreters() -> usize {
    let cpus = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    cpus.saturating_sub(1).max(2).min(8)
}

/// `W` default: two broker tasks per pooled interpreter, at least two.
pub fn default_worker_tasks(max_interpreters: usize) -> usize {
    (2 * max_interpreters).max(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    // (1) Nmax stays within the documented clamp.
    #[test]
    fn test_default_max_interpreters_bounds() {
        let n = default_max_interpreters();
        assert!((2..=8).contains(&n), "Nmax {n} outside [2, 8]");
    }

    // (2) W and Q derive from Nmax.
    #[test]
    fn test_default_capacity_derivation() {
        let config = ServerConfig::default();
        assert_eq!(
            config.worker_tasks,
            (2 * config.max_interpreters).max(2),
            "W should be max(2, 2*Nmax)"
        );
        assert_eq!(config.queue_size, config.worker_tasks, "Q should equal W");
        assert_eq!(config.interpreters_per_client, 1, "Cmax should default to 1");
    }

    // (3) Endpoint formatting.
    #[test]
    fn test_endpoint() {
        let config = ServerConfig::default();
        assert_eq!(config.endpoint(), "tcp://127.0.0.1:5556");
    }

    #[test]
    fn test_worker_tasks_floor() {
        assert_eq!(default_worker_tasks(0), 2);
        assert_eq!(default_worker_tasks(4), 8);
    }
}
