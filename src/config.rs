use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the supervisor.
///
/// The daemon takes no command-line arguments; everything is a directory
/// location or tuning constant. Each field has the built-in default and an
/// environment override so test harnesses can redirect paths without
/// touching the real system directories.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory of service executables, scanned flat.
    pub init_dir: PathBuf,
    /// Directory of boot-phase scripts (startup, reboot, shutdown, poweroff, failure).
    pub boot_dir: PathBuf,
    /// Path of the control socket.
    pub control_path: PathBuf,
    /// Capacity of each service's output ring buffer.
    pub ring_capacity: usize,
    /// Minimum uptime below which a crashed service is not auto-restarted.
    pub restart_cooldown: Duration,
    /// Interval between shutdown escalation alarms.
    pub escalate_interval: Duration,
    /// Alarm fires tolerated before force-killing remaining services.
    pub escalate_retries: u32,
    /// Debounce window for service-directory change events.
    pub reload_debounce: Duration,
}

/// Longest accepted service name, matching the table's fixed name width.
pub const NAME_MAX: usize = 63;

/// Fixed capacity of the process table.
pub const MAX_SERVICES: usize = 70;

/// Fixed capacity of the control connection table.
pub const MAX_CONNECTIONS: usize = 16;

impl Default for Config {
    fn default() -> Self {
        Self {
            init_dir: PathBuf::from("/etc/svchub/services"),
            boot_dir: PathBuf::from("/etc/svchub/boot"),
            control_path: PathBuf::from("/run/svchub/control"),
            ring_capacity: 4096,
            restart_cooldown: Duration::from_secs(10),
            escalate_interval: Duration::from_secs(2),
            escalate_retries: 3,
            reload_debounce: Duration::from_millis(500),
        }
    }
}

impl Config {
    /// Build the configuration from environment overrides over the defaults.
    pub fn from_env() -> Self {
        let d = Config::default();
        Config {
            init_dir: env_path("SVCHUB_INIT_DIR", d.init_dir),
            boot_dir: env_path("SVCHUB_BOOT_DIR", d.boot_dir),
            control_path: env_path("SVCHUB_CONTROL_SOCKET", d.control_path),
            ring_capacity: env_num("SVCHUB_RING_CAPACITY", d.ring_capacity),
            restart_cooldown: Duration::from_millis(env_num(
                "SVCHUB_COOLDOWN_MS",
                d.restart_cooldown.as_millis() as u64,
            )),
            escalate_interval: Duration::from_millis(env_num(
                "SVCHUB_ESCALATE_MS",
                d.escalate_interval.as_millis() as u64,
            )),
            escalate_retries: env_num("SVCHUB_ESCALATE_RETRIES", d.escalate_retries),
            reload_debounce: Duration::from_millis(env_num(
                "SVCHUB_RELOAD_DEBOUNCE_MS",
                d.reload_debounce.as_millis() as u64,
            )),
        }
    }

    /// Default control socket path, also used by the client.
    pub fn control_path_from_env() -> PathBuf {
        env_path(
            "SVCHUB_CONTROL_SOCKET",
            Config::default().control_path,
        )
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    env::var_os(key).map(PathBuf::from).unwrap_or(default)
}

fn env_num<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
