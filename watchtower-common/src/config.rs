// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::time::Duration;

use crate::process::ProcessType;

const ENV_CONTROL_SOCKET_PATH: &str = "WATCHTOWER_CONTROL_SOCKET_PATH";
const ENV_CONTROL_PORT: &str = "WATCHTOWER_CONTROL_PORT";
const ENV_STAGGER_INTERVAL_MS: &str = "WATCHTOWER_STAGGER_INTERVAL_MS";
const ENV_KILL_TIME_MS: &str = "WATCHTOWER_KILL_TIME_MS";
const ENV_MIN_RESTART_DELAY_MS: &str = "WATCHTOWER_MIN_RESTART_DELAY_MS";
const ENV_MAX_RESTART_DELAY_MS: &str = "WATCHTOWER_MAX_RESTART_DELAY_MS";
const ENV_RESTART_THRESHOLD_MS: &str = "WATCHTOWER_RESTART_THRESHOLD_MS";
const ENV_MAX_ACCEPTS: &str = "WATCHTOWER_MAX_ACCEPTS";
const ENV_MAX_REQUESTS: &str = "WATCHTOWER_MAX_REQUESTS";
const ENV_MEMORY_LIMIT_BYTES: &str = "WATCHTOWER_MEMORY_LIMIT_BYTES";
const ENV_MEMORY_LIMIT_RESIDENT_ONLY: &str = "WATCHTOWER_MEMORY_LIMIT_RESIDENT_ONLY";
const ENV_MEMORY_LIMIT_PERIOD_MS: &str = "WATCHTOWER_MEMORY_LIMIT_PERIOD_MS";
const ENV_WORKER_COUNT: &str = "WATCHTOWER_WORKER_COUNT";
const ENV_PID_FILE_DIR: &str = "WATCHTOWER_PID_FILE_DIR";
const ENV_PLUGIN_NAME: &str = "WATCHTOWER_PLUGIN_NAME";
const ENV_SERVICE_DISABLING_PROGRAM: &str = "WATCHTOWER_SERVICE_DISABLING_PROGRAM";

/// One listening endpoint the master owns, plus whether accepted connections
/// on it must be handed to a worker already wrapped in TLS.
#[derive(Debug, Clone)]
pub struct ListenerSpec {
    pub address: std::net::SocketAddr,
    pub backlog: i32,
    pub tls: bool,
}

/// The resolved, immutable configuration the process core is constructed
/// from. Full config-file parsing is out of scope; this is the typed shape
/// that parsing is expected to produce, plus an env-driven loader for the
/// handful of knobs the core legitimately owns.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub process_type: ProcessType,
    pub control_socket_path: Option<PathBuf>,
    pub control_port: u16,
    pub listeners: Vec<ListenerSpec>,
    pub stagger_interval: Duration,
    pub kill_time: Duration,
    pub min_restart_delay: Duration,
    pub max_restart_delay: Duration,
    pub restart_threshold: Duration,
    pub max_accepts: usize,
    pub max_requests: usize,
    pub memory_limit_bytes: Option<u64>,
    pub memory_limit_resident_only: bool,
    pub memory_limit_period: Duration,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Number of `Slave` worker processes the Combined-mode orchestrator
    /// starts and supervises, one `LogID` slot per worker.
    pub worker_count: u32,
    /// Directory workers write their per-instance `<plugin>-instance-<id>.pid`
    /// files to. The master's own PID file lives elsewhere and is
    /// single-writer; this directory is many-writer, one file per worker.
    pub pid_file_dir: PathBuf,
    /// The twistd-style plugin name passed to each worker's argv and used
    /// in its PID filename.
    pub plugin_name: String,
    /// Executable invoked when a start-up step reports
    /// `WatchtowerError::StoreNotAvailable`, so the supervising init system
    /// stops relaunching a job whose store will never become usable. `None`
    /// means skip straight to the shutdown grace period.
    pub service_disabling_program: Option<PathBuf>,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        ConfigSnapshot {
            process_type: ProcessType::Combined,
            control_socket_path: None,
            control_port: 0,
            listeners: Vec::new(),
            stagger_interval: Duration::from_millis(500),
            kill_time: Duration::from_secs(5),
            min_restart_delay: Duration::from_secs(1),
            max_restart_delay: Duration::from_secs(3600),
            restart_threshold: Duration::from_secs(1),
            max_accepts: 100,
            max_requests: 600,
            memory_limit_bytes: None,
            memory_limit_resident_only: true,
            memory_limit_period: Duration::from_secs(60),
            uid: None,
            gid: None,
            worker_count: 2,
            pid_file_dir: PathBuf::from("/var/run/watchtower"),
            plugin_name: "caldav".to_string(),
            service_disabling_program: None,
        }
    }
}

impl ConfigSnapshot {
    /// Loads overrides from the environment on top of [`ConfigSnapshot::default`].
    /// Unlike the teacher's `ENV_CONFIG: LazyLock<Config>` global, this
    /// workspace does not reach for a global snapshot: `from_env` is called
    /// once at startup and the result is threaded explicitly into every
    /// component that needs it, matching the "no ambient mutable globals"
    /// design note.
    pub fn from_env() -> Self {
        let mut cfg = ConfigSnapshot::default();
        if let Ok(path) = std::env::var(ENV_CONTROL_SOCKET_PATH) {
            cfg.control_socket_path = Some(PathBuf::from(path));
        }
        if let Some(v) = parse_env::<u16>(ENV_CONTROL_PORT) {
            cfg.control_port = v;
        }
        if let Some(v) = parse_env::<u64>(ENV_STAGGER_INTERVAL_MS) {
            cfg.stagger_interval = Duration::from_millis(v);
        }
        if let Some(v) = parse_env::<u64>(ENV_KILL_TIME_MS) {
            cfg.kill_time = Duration::from_millis(v);
        }
        if let Some(v) = parse_env::<u64>(ENV_MIN_RESTART_DELAY_MS) {
            cfg.min_restart_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse_env::<u64>(ENV_MAX_RESTART_DELAY_MS) {
            cfg.max_restart_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse_env::<u64>(ENV_RESTART_THRESHOLD_MS) {
            cfg.restart_threshold = Duration::from_millis(v);
        }
        if let Some(v) = parse_env::<usize>(ENV_MAX_ACCEPTS) {
            cfg.max_accepts = v;
        }
        if let Some(v) = parse_env::<usize>(ENV_MAX_REQUESTS) {
            cfg.max_requests = v;
        }
        if let Some(v) = parse_env::<u64>(ENV_MEMORY_LIMIT_BYTES) {
            cfg.memory_limit_bytes = Some(v);
        }
        if let Some(v) = parse_env::<bool>(ENV_MEMORY_LIMIT_RESIDENT_ONLY) {
            cfg.memory_limit_resident_only = v;
        }
        if let Some(v) = parse_env::<u64>(ENV_MEMORY_LIMIT_PERIOD_MS) {
            cfg.memory_limit_period = Duration::from_millis(v);
        }
        if let Some(v) = parse_env::<u32>(ENV_WORKER_COUNT) {
            cfg.worker_count = v;
        }
        if let Ok(path) = std::env::var(ENV_PID_FILE_DIR) {
            cfg.pid_file_dir = PathBuf::from(path);
        }
        if let Ok(name) = std::env::var(ENV_PLUGIN_NAME) {
            cfg.plugin_name = name;
        }
        if let Ok(path) = std::env::var(ENV_SERVICE_DISABLING_PROGRAM) {
            cfg.service_disabling_program = Some(PathBuf::from(path));
        }
        cfg
    }

    /// Applies one `-o key=value` CLI override (see `watchtower-orchestrator`
    /// for the flag parser) to a clone of this snapshot. Applying the same
    /// override twice is idempotent by construction, since each key maps to
    /// one scalar field.
    pub fn with_override(mut self, key: &str, value: &str) -> Result<Self, String> {
        match key {
            "ProcessType" => self.process_type = value.parse().map_err(|e| format!("{e}"))?,
            "ControlPort" => self.control_port = value.parse().map_err(|e| format!("{e}"))?,
            "StaggerIntervalMs" => {
                self.stagger_interval =
                    Duration::from_millis(value.parse().map_err(|e| format!("{e}"))?)
            }
            "KillTimeMs" => {
                self.kill_time = Duration::from_millis(value.parse().map_err(|e| format!("{e}"))?)
            }
            "MaxRequests" => self.max_requests = value.parse().map_err(|e| format!("{e}"))?,
            "MaxAccepts" => self.max_accepts = value.parse().map_err(|e| format!("{e}"))?,
            "MemoryLimitResidentOnly" => self.memory_limit_resident_only = parse_bool(value)?,
            "MemoryLimitBytes" => self.memory_limit_bytes = Some(value.parse().map_err(|e| format!("{e}"))?),
            "WorkerCount" => self.worker_count = value.parse().map_err(|e| format!("{e}"))?,
            "ServiceDisablingProgram" => self.service_disabling_program = Some(PathBuf::from(value)),
            other => return Err(format!("unknown configuration key `{other}`")),
        }
        Ok(self)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// CLI overrides spell booleans `True`/`False`, matching the source
/// option parser's convention rather than Rust's lowercase `bool::FromStr`.
fn parse_bool(value: &str) -> Result<bool, String> {
    match value {
        "True" => Ok(true),
        "False" => Ok(false),
        other => Err(format!("expected `True` or `False`, got `{other}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_max_restart_delay_matches_original_monitor_default() {
        assert_eq!(
            ConfigSnapshot::default().max_restart_delay,
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn override_is_idempotent() {
        let base = ConfigSnapshot::default();
        let once = base.clone().with_override("MaxRequests", "42").unwrap();
        let twice = once.clone().with_override("MaxRequests", "42").unwrap();
        assert_eq!(once.max_requests, twice.max_requests);
    }

    #[test]
    fn unknown_override_key_is_rejected() {
        let base = ConfigSnapshot::default();
        assert!(base.with_override("NotARealKey", "1").is_err());
    }

    #[test]
    fn bool_override_accepts_capitalized_true_false() {
        let base = ConfigSnapshot::default();
        let off = base
            .clone()
            .with_override("MemoryLimitResidentOnly", "False")
            .unwrap();
        assert!(!off.memory_limit_resident_only);
        let on = off.with_override("MemoryLimitResidentOnly", "True").unwrap();
        assert!(on.memory_limit_resident_only);
    }

    #[test]
    fn bool_override_rejects_lowercase() {
        let base = ConfigSnapshot::default();
        assert!(base.with_override("MemoryLimitResidentOnly", "false").is_err());
    }

    #[test]
    fn process_type_override_accepts_the_slave_spawner_convention() {
        let base = ConfigSnapshot::default();
        let slave = base.with_override("ProcessType", "Slave").unwrap();
        assert_eq!(slave.process_type, ProcessType::Slave);
    }

    #[test]
    fn service_disabling_program_override_sets_a_path() {
        let base = ConfigSnapshot::default();
        let configured = base
            .with_override("ServiceDisablingProgram", "/usr/libexec/disable-service")
            .unwrap();
        assert_eq!(
            configured.service_disabling_program,
            Some(PathBuf::from("/usr/libexec/disable-service"))
        );
    }
}
