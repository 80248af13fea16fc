use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time;
use tracing::{debug, warn};

use super::types::{
    BackendError, ContainerBackend, ContainerListing, ContainerSummary, ImageCatalog, ImageRef,
    PortRedirect, UserSpec,
};
use crate::lib::config::Config;

const MEMINFO_FALLBACK: &str =
    "awk '/MemTotal/ {t=$2} /MemAvailable/ {a=$2} END {print (t-a)*1024}' /proc/meminfo";
const DISK_FALLBACK: &str = "df -P / | tail -n 1 | awk '{print $3 * 1024}'";

/// Drives LXD through the `lxc` CLI with JSON output. Safe for concurrent
/// use: every call spawns an independent process, and the only shared
/// state is the cpu sample cache behind its own lock.
pub struct LxdClient {
    lxd_dir: Option<String>,
    os_whitelist: Vec<String>,
    command_timeout: Duration,
    launch_timeout: Duration,
    network_timeout: Duration,
    cpu_samples: Mutex<HashMap<String, CpuSample>>,
}

struct CpuSample {
    at: Instant,
    usage_ns: u64,
}

// Partial views of `lxc ... --format=json` output. Stopped instances
// report null for the state sub-objects, hence the Options.

#[derive(Debug, Deserialize)]
struct LxcInstance {
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    config: HashMap<String, String>,
    #[serde(default)]
    devices: HashMap<String, HashMap<String, String>>,
    #[serde(default)]
    state: Option<LxcState>,
}

#[derive(Debug, Default, Deserialize)]
struct LxcState {
    #[serde(default)]
    network: Option<HashMap<String, LxcNetwork>>,
    #[serde(default)]
    memory: Option<LxcMemory>,
    #[serde(default)]
    disk: Option<HashMap<String, LxcDisk>>,
    #[serde(default)]
    cpu: Option<LxcCpu>,
}

#[derive(Debug, Deserialize)]
struct LxcNetwork {
    #[serde(default)]
    addresses: Vec<LxcAddress>,
}

#[derive(Debug, Deserialize)]
struct LxcAddress {
    #[serde(default)]
    family: String,
    #[serde(default)]
    address: String,
}

#[derive(Debug, Default, Deserialize)]
struct LxcMemory {
    #[serde(default)]
    usage: u64,
}

#[derive(Debug, Deserialize)]
struct LxcDisk {
    #[serde(default)]
    usage: u64,
}

#[derive(Debug, Default, Deserialize)]
struct LxcCpu {
    #[serde(default)]
    usage: u64,
}

#[derive(Debug, Deserialize)]
struct LxcImage {
    #[serde(default)]
    properties: HashMap<String, String>,
}

impl LxdClient {
    pub fn new(config: &Config) -> Self {
        LxdClient {
            lxd_dir: config.lxd_dir.clone(),
            os_whitelist: config.os_whitelist.clone(),
            command_timeout: config.command_timeout,
            launch_timeout: config.launch_timeout,
            network_timeout: config.network_timeout,
            cpu_samples: Mutex::new(HashMap::new()),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("lxc");
        cmd.args(args);
        if let Some(dir) = &self.lxd_dir {
            cmd.env("LXD_DIR", dir);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    async fn run(&self, args: &[&str], limit: Duration) -> Result<String, BackendError> {
        let command = format!("lxc {}", args.join(" "));
        let output = time::timeout(limit, self.command(args).output())
            .await
            .map_err(|_| BackendError::Timeout {
                command: command.clone(),
                secs: limit.as_secs(),
            })?
            .map_err(|source| BackendError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(%command, %stderr, "lxc command failed");
            return Err(BackendError::CommandFailed { command, stderr });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Like `run`, but feeds `input` to the child's stdin. Used where the
    /// payload must not pass through a shell (chpasswd).
    async fn run_with_input(
        &self,
        args: &[&str],
        input: &str,
        limit: Duration,
    ) -> Result<(), BackendError> {
        let command = format!("lxc {}", args.join(" "));
        let spawn_err = |source| BackendError::Spawn {
            command: command.clone(),
            source,
        };

        let mut cmd = self.command(args);
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(spawn_err)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).await.map_err(spawn_err)?;
        }

        let output = time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| BackendError::Timeout {
                command: command.clone(),
                secs: limit.as_secs(),
            })?
            .map_err(spawn_err)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(%command, %stderr, "lxc command failed");
            return Err(BackendError::CommandFailed { command, stderr });
        }
        Ok(())
    }

    fn parse_json<T: DeserializeOwned>(command: &str, payload: &str) -> Result<T, BackendError> {
        serde_json::from_str(payload).map_err(|source| BackendError::Parse {
            command: command.to_string(),
            source,
        })
    }

    /// Runs a shell snippet inside the container, returning trimmed stdout.
    /// Failures are swallowed: the callers use this only for best-effort
    /// metric fallbacks.
    async fn exec_shell(&self, name: &str, script: &str) -> Option<String> {
        let out = self
            .run(&["exec", name, "--", "sh", "-c", script], self.command_timeout)
            .await
            .ok()?;
        let trimmed = out.trim().to_string();
        if trimmed.is_empty() { None } else { Some(trimmed) }
    }

    fn summarize(&self, inst: &LxcInstance, now: Instant) -> (ContainerSummary, Vec<PortRedirect>) {
        let (os, release, architecture) = if inst.config.is_empty() {
            ("-".to_string(), "-".to_string(), "-".to_string())
        } else {
            let field = |key: &str| {
                inst.config
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| "Unknown".to_string())
            };
            (
                field("image.os"),
                field("image.release"),
                field("image.architecture"),
            )
        };

        let mut ipv4 = "-".to_string();
        let mut memory = 0;
        let mut disk = 0;
        let mut cpu_usage = 0.0;
        let mut redirections = Vec::new();

        if inst.status == "Running" {
            if let Some(state) = &inst.state {
                if let Some(addr) = first_inet(state) {
                    ipv4 = addr;
                }

                memory = state.memory.as_ref().map(|m| m.usage).unwrap_or(0);

                if let Some(disks) = &state.disk {
                    disk = disks.values().map(|d| d.usage).sum();
                }

                let current_ns = state.cpu.as_ref().map(|c| c.usage).unwrap_or(0);
                let mut samples = self.cpu_samples.lock();
                if let Some(prev) = samples.get(&inst.name) {
                    let elapsed = now.saturating_duration_since(prev.at).as_secs_f64();
                    if elapsed > 0.0 {
                        let spent = current_ns.saturating_sub(prev.usage_ns) as f64 / 1e9;
                        cpu_usage = ((spent / elapsed) * 100.0 * 100.0).round() / 100.0;
                    }
                }
                samples.insert(
                    inst.name.clone(),
                    CpuSample {
                        at: now,
                        usage_ns: current_ns,
                    },
                );
            }

            for (device_name, device) in &inst.devices {
                if device.get("type").map(String::as_str) == Some("proxy") {
                    redirections.push(PortRedirect {
                        container: inst.name.clone(),
                        device_name: device_name.clone(),
                        listen: device.get("listen").cloned().unwrap_or_default(),
                        connect: device.get("connect").cloned().unwrap_or_default(),
                    });
                }
            }
        }

        let summary = ContainerSummary {
            name: inst.name.clone(),
            status: inst.status.clone(),
            ipv4,
            memory,
            disk,
            cpu_time: format!("{}%", cpu_usage),
            os,
            release,
            architecture,
        };
        (summary, redirections)
    }

    /// Drop cpu samples for containers that no longer exist, so the cache
    /// does not keep names of long-deleted containers.
    fn prune_samples(&self, live: &[ContainerSummary]) {
        let mut samples = self.cpu_samples.lock();
        samples.retain(|name, _| live.iter().any(|c| &c.name == name));
    }

    async fn ipv4_of(&self, name: &str) -> Result<Option<String>, BackendError> {
        let stdout = self
            .run(&["list", name, "--format=json"], self.command_timeout)
            .await?;
        let raw: Vec<LxcInstance> = Self::parse_json("lxc list", &stdout)?;
        Ok(raw
            .iter()
            .find(|inst| inst.name == name)
            .and_then(|inst| inst.state.as_ref())
            .and_then(first_inet))
    }

    async fn wait_for_ipv4(&self, name: &str) -> Result<String, BackendError> {
        let deadline = Instant::now() + self.network_timeout;
        loop {
            if let Some(addr) = self.ipv4_of(name).await? {
                debug!(container = name, %addr, "container is reachable");
                return Ok(addr);
            }
            if Instant::now() >= deadline {
                return Err(BackendError::NoAddress(name.to_string()));
            }
            time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn provision_user(&self, name: &str, user: &UserSpec) -> Result<(), BackendError> {
        self.run(
            &["exec", name, "--", "useradd", "-m", "-s", "/bin/bash", &user.user],
            self.command_timeout,
        )
        .await?;
        self.run_with_input(
            &["exec", name, "--", "chpasswd"],
            &format!("{}:{}\n", user.user, user.password),
            self.command_timeout,
        )
        .await
    }
}

fn first_inet(state: &LxcState) -> Option<String> {
    let network = state.network.as_ref()?;
    for (ifname, net) in network {
        if ifname == "lo" {
            continue;
        }
        for addr in &net.addresses {
            if addr.family == "inet" && !addr.address.is_empty() {
                return Some(addr.address.clone());
            }
        }
    }
    None
}

#[async_trait::async_trait]
impl ContainerBackend for LxdClient {
    async fn launch(
        &self,
        image: &ImageRef,
        name: &str,
        user: Option<&UserSpec>,
    ) -> Result<(), BackendError> {
        self.run(&["launch", &image.remote_spec(), name], self.launch_timeout)
            .await?;
        let addr = self.wait_for_ipv4(name).await?;
        debug!(container = name, %addr, "container launched");
        if let Some(user) = user {
            self.provision_user(name, user).await?;
        }
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), BackendError> {
        self.run(&["start", name], self.command_timeout).await?;
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), BackendError> {
        self.run(&["stop", name], self.command_timeout).await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), BackendError> {
        self.run(&["delete", name, "--force"], self.command_timeout)
            .await?;
        Ok(())
    }

    async fn list(&self) -> Result<ContainerListing, BackendError> {
        let stdout = self
            .run(&["list", "--format=json"], self.command_timeout)
            .await?;
        let raw: Vec<LxcInstance> = Self::parse_json("lxc list", &stdout)?;

        let now = Instant::now();
        let mut listing = ContainerListing::default();
        for inst in &raw {
            let (mut summary, redirections) = self.summarize(inst, now);

            // LXD sometimes reports zero usage for a running container;
            // ask the container itself before giving up on the metric.
            if summary.status == "Running" {
                if summary.memory == 0 {
                    if let Some(out) = self.exec_shell(&summary.name, MEMINFO_FALLBACK).await {
                        if let Ok(bytes) = out.parse::<f64>() {
                            summary.memory = bytes as u64;
                        }
                    }
                }
                if summary.disk == 0 {
                    if let Some(out) = self.exec_shell(&summary.name, DISK_FALLBACK).await {
                        if let Ok(bytes) = out.parse::<f64>() {
                            summary.disk = bytes as u64;
                        }
                    }
                }
            }

            listing.redirections.extend(redirections);
            listing.containers.push(summary);
        }

        self.prune_samples(&listing.containers);
        Ok(listing)
    }

    async fn list_images(&self) -> Result<ImageCatalog, BackendError> {
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        debug!(%arch, "fetching image catalog");

        let filter = format!("architecture={arch}");
        let stdout = self
            .run(
                &["image", "list", "images:", "type=container", &filter, "--format=json"],
                self.command_timeout,
            )
            .await?;
        let raw: Vec<LxcImage> = Self::parse_json("lxc image list", &stdout)?;

        let mut catalog = ImageCatalog::new();
        for image in raw {
            let Some(os) = image.properties.get("os") else {
                continue;
            };
            let Some(release) = image.properties.get("release") else {
                continue;
            };
            let os = os.to_lowercase();
            if !self.os_whitelist.contains(&os) {
                continue;
            }
            let releases = catalog.entry(os).or_default();
            if !releases.contains(release) {
                releases.push(release.clone());
            }
        }
        for releases in catalog.values_mut() {
            releases.sort_by(|a, b| b.cmp(a));
        }
        Ok(catalog)
    }

    async fn add_port_forward(
        &self,
        name: &str,
        host_port: u16,
        container_port: u16,
    ) -> Result<String, BackendError> {
        let device_name = format!("proxy-{container_port}");
        let listen = format!("listen=tcp:0.0.0.0:{host_port}");
        let connect = format!("connect=tcp:127.0.0.1:{container_port}");
        self.run(
            &["config", "device", "add", name, &device_name, "proxy", &listen, &connect],
            self.command_timeout,
        )
        .await?;
        Ok(device_name)
    }

    async fn remove_port_forward(&self, name: &str, device_name: &str) -> Result<(), BackendError> {
        self.run(
            &["config", "device", "remove", name, device_name],
            self.command_timeout,
        )
        .await?;
        Ok(())
    }
}
