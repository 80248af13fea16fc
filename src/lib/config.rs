use std::env;
use std::time::Duration;

/// Runtime configuration. Every field has a default that matches a plain
/// snap-installed LXD host; `LXDASH_*` environment variables override them.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the API server binds to.
    pub bind_addr: String,
    /// LXD_DIR exported to every `lxc` invocation. None uses the ambient value.
    pub lxd_dir: Option<String>,
    /// Distros surfaced by GET /images.
    pub os_whitelist: Vec<String>,
    /// How long a fetched image catalog is served before refetching.
    pub image_cache_ttl: Duration,
    /// Terminal tasks older than this are garbage collected.
    pub task_retention: Duration,
    /// Interval between registry sweeps.
    pub sweep_interval: Duration,
    /// Upper bound on concurrently executing workers.
    pub max_workers: usize,
    /// Upper bound on live (unswept) tasks; create fails past it.
    pub max_live_tasks: usize,
    /// Per-invocation timeout for ordinary `lxc` commands.
    pub command_timeout: Duration,
    /// Timeout for `lxc launch`, which may download an image first.
    pub launch_timeout: Duration,
    /// How long a freshly launched container gets to obtain an ipv4 address.
    pub network_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: "0.0.0.0:8080".to_string(),
            lxd_dir: Some("/var/snap/lxd/common/lxd".to_string()),
            os_whitelist: vec![
                "debian".to_string(),
                "ubuntu".to_string(),
                "kali".to_string(),
            ],
            image_cache_ttl: Duration::from_secs(3600),
            task_retention: Duration::from_secs(900),
            sweep_interval: Duration::from_secs(60),
            max_workers: 8,
            max_live_tasks: 1024,
            command_timeout: Duration::from_secs(60),
            launch_timeout: Duration::from_secs(600),
            network_timeout: Duration::from_secs(60),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(addr) = env::var("LXDASH_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(dir) = env::var("LXD_DIR") {
            config.lxd_dir = Some(dir);
        }
        if let Ok(list) = env::var("LXDASH_OS_WHITELIST") {
            config.os_whitelist = list
                .split(',')
                .map(|os| os.trim().to_lowercase())
                .filter(|os| !os.is_empty())
                .collect();
        }
        if let Some(secs) = env_secs("LXDASH_IMAGE_CACHE_SECS") {
            config.image_cache_ttl = secs;
        }
        if let Some(secs) = env_secs("LXDASH_TASK_RETENTION_SECS") {
            config.task_retention = secs;
        }
        if let Some(secs) = env_secs("LXDASH_SWEEP_INTERVAL_SECS") {
            config.sweep_interval = secs;
        }
        if let Some(n) = env_usize("LXDASH_MAX_WORKERS") {
            config.max_workers = n.max(1);
        }
        if let Some(n) = env_usize("LXDASH_MAX_LIVE_TASKS") {
            config.max_live_tasks = n.max(1);
        }
        if let Some(secs) = env_secs("LXDASH_COMMAND_TIMEOUT_SECS") {
            config.command_timeout = secs;
        }
        if let Some(secs) = env_secs("LXDASH_LAUNCH_TIMEOUT_SECS") {
            config.launch_timeout = secs;
        }
        if let Some(secs) = env_secs("LXDASH_NETWORK_TIMEOUT_SECS") {
            config.network_timeout = secs;
        }

        config
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    env::var(key).ok()?.parse().ok().map(Duration::from_secs)
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok()?.parse().ok()
}
