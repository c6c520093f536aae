//! Runtime configuration, loaded from YAML.
//!
//! A path argument wins; an empty path falls back to the `SERVER_CONF` /
//! `CLIENT_CONF` environment variables; if neither is set the compiled
//! defaults apply.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::RuntimeError;

pub const SERVER_CONF_ENV: &str = "SERVER_CONF";
pub const CLIENT_CONF_ENV: &str = "CLIENT_CONF";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkOrchestratorConfig {
    /// Workers with a dedicated core.
    pub max_dworkers: usize,
    /// Workers sharing leftover cores.
    pub max_oworkers: usize,
    /// Overlapped workers per shared core.
    pub owork_per_core: usize,
    /// Spin workers instead of sleeping between iterations.
    pub continuous_polling: bool,
    /// Sleep between iterations when not continuously polling.
    pub worker_sleep_us: u64,
    /// Inner loop repetitions before a worker yields.
    pub worker_retries: u32,
}

impl WorkOrchestratorConfig {
    /// Total workers spawned at init.
    #[must_use]
    pub fn max_workers(&self) -> usize {
        (self.max_dworkers + self.max_oworkers).max(2)
    }
}

impl Default for WorkOrchestratorConfig {
    fn default() -> Self {
        Self {
            max_dworkers: 2,
            max_oworkers: 2,
            owork_per_core: 2,
            continuous_polling: true,
            worker_sleep_us: 0,
            worker_retries: 1,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueManagerConfig {
    /// Default depth of every lane.
    pub queue_depth: u32,
    /// Depth of the process queue's lanes.
    pub proc_queue_depth: u32,
    /// Maximum lanes per priority group.
    pub max_lanes: u32,
    /// Capacity of the queue directory.
    pub max_queues: u32,
    /// Name of the shared-memory region file.
    pub shm_name: String,
    /// Directory holding region files.
    pub shm_dir: String,
    /// Region size in bytes.
    pub shm_size: usize,
}

impl Default for QueueManagerConfig {
    fn default() -> Self {
        Self {
            queue_depth: 1024,
            proc_queue_depth: 8192,
            max_lanes: 16,
            max_queues: 1024,
            shm_name: "quarry_shm".to_string(),
            shm_dir: "/dev/shm".to_string(),
            shm_size: 64 << 20,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Plain-text host file, one hostname per line; the 1-based line number
    /// is the NodeId.
    pub host_file: String,
    /// Inline host list, used when `host_file` is empty.
    pub host_names: Vec<String>,
    /// Transport protocol name. Only "tcp" is implemented.
    pub protocol: String,
    /// Interface domain hint (unused by the tcp transport).
    pub domain: String,
    pub port: u16,
    /// Number of server handler threads.
    pub num_threads: usize,
    /// Explicit node id, overriding interface-address detection. Required
    /// when several nodes of one cluster share a host (loopback tests).
    pub node_id: Option<u32>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            host_file: String::new(),
            host_names: Vec::new(),
            protocol: "tcp".to_string(),
            domain: String::new(),
            port: 9410,
            num_threads: 4,
            node_id: None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub work_orchestrator: WorkOrchestratorConfig,
    pub queue_manager: QueueManagerConfig,
    pub rpc: RpcConfig,
    /// Task libraries registered at startup.
    pub task_libs: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Thread model hint for client-side waits: "spin" or "park".
    pub thread_model: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            thread_model: "park".to_string(),
        }
    }
}

fn load_yaml<T: serde::de::DeserializeOwned + Default>(
    path: &str,
    env_var: &str,
) -> Result<T, RuntimeError> {
    let effective = if path.is_empty() {
        std::env::var(env_var).unwrap_or_default()
    } else {
        path.to_string()
    };
    if effective.is_empty() {
        tracing::debug!(env_var, "no config path; using defaults");
        return Ok(T::default());
    }
    let text =
        std::fs::read_to_string(Path::new(&effective)).map_err(|source| RuntimeError::Config {
            path: effective.clone(),
            detail: source.to_string(),
        })?;
    serde_yml::from_str(&text).map_err(|source| RuntimeError::Config {
        path: effective,
        detail: source.to_string(),
    })
}

impl ServerConfig {
    pub fn load(path: &str) -> Result<Self, RuntimeError> {
        load_yaml(path, SERVER_CONF_ENV)
    }
}

impl ClientConfig {
    pub fn load(path: &str) -> Result<Self, RuntimeError> {
        load_yaml(path, CLIENT_CONF_ENV)
    }
}

#[cfg(test)]
mod test_config {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn defaults_when_nothing_is_set() {
        std::env::remove_var(SERVER_CONF_ENV);
        let config = ServerConfig::load("").unwrap();
        assert_eq!(config.queue_manager.queue_depth, 1024);
        assert_eq!(config.rpc.protocol, "tcp");
        assert!(config.task_libs.is_empty());
    }

    #[test]
    #[serial]
    fn parses_partial_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.yaml");
        std::fs::write(
            &path,
            r#"
queue_manager:
  queue_depth: 64
  shm_name: test_region
rpc:
  port: 4444
  host_names: ["alpha", "beta"]
task_libs: ["bdev"]
"#,
        )
        .unwrap();
        let config = ServerConfig::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.queue_manager.queue_depth, 64);
        assert_eq!(config.queue_manager.shm_name, "test_region");
        assert_eq!(config.rpc.port, 4444);
        assert_eq!(config.rpc.host_names, vec!["alpha", "beta"]);
        assert_eq!(config.task_libs, vec!["bdev"]);
        // Untouched sections keep defaults.
        assert_eq!(config.work_orchestrator.max_dworkers, 2);
    }

    #[test]
    #[serial]
    fn env_var_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env.yaml");
        std::fs::write(&path, "rpc:\n  port: 5555\n").unwrap();
        std::env::set_var(SERVER_CONF_ENV, path.to_str().unwrap());
        let config = ServerConfig::load("").unwrap();
        assert_eq!(config.rpc.port, 5555);
        std::env::remove_var(SERVER_CONF_ENV);
    }

    #[test]
    #[serial]
    fn bad_file_is_an_error() {
        assert!(ServerConfig::load("/definitely/not/here.yaml").is_err());
    }
}
