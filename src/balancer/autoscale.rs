//! Load-driven backend scaling

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use super::pool::{BackendLoad, BackendPool};

pub const DEFAULT_AUTOSCALE_INTERVAL: Duration = Duration::from_secs(5);

/// Floor for the evaluation period; `interval_at` rejects zero
const MIN_AUTOSCALE_INTERVAL: Duration = Duration::from_millis(100);

/// How long a freshly launched backend gets to start listening
const READY_ATTEMPTS: u32 = 50;
const READY_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoscalePolicy {
    pub interval: Duration,
    pub min_backends: usize,
    pub max_backends: usize,
    /// Add a backend when aggregate connections exceed this many per backend
    pub scale_up_per_backend: usize,
    /// Remove one when aggregate connections drop below this many per backend
    pub scale_down_per_backend: usize,
}

impl Default for AutoscalePolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_AUTOSCALE_INTERVAL,
            min_backends: 1,
            max_backends: 4,
            scale_up_per_backend: 16,
            scale_down_per_backend: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleDecision {
    Hold,
    Up,
    /// Remove this (idle) backend
    Down { id: u64, url: String },
}

/// Decide what to do given the current per-backend load (insertion order)
pub fn plan(load: &[BackendLoad], policy: &AutoscalePolicy) -> ScaleDecision {
    let backends = load.len();
    if backends < policy.min_backends {
        return ScaleDecision::Up;
    }

    let total: usize = load.iter().map(|l| l.active).sum();
    if backends < policy.max_backends && total > policy.scale_up_per_backend * backends {
        return ScaleDecision::Up;
    }

    if backends > policy.min_backends && total < policy.scale_down_per_backend * backends {
        // Newest idle backend goes first
        if let Some(idle) = load.iter().rev().find(|l| l.active == 0) {
            return ScaleDecision::Down {
                id: idle.id,
                url: idle.url.clone(),
            };
        }
    }

    ScaleDecision::Hold
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("No free port at or above {0}")]
    NoFreePort(u16),

    #[error("Launch command is empty")]
    EmptyCommand,

    #[error("Failed to start backend: {0}")]
    Spawn(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub base_port: u16,
    /// Backend URL with a `{port}` placeholder
    pub url_template: String,
    /// Optional command with a `{port}` placeholder, run once per new backend
    pub launch_cmd: Option<String>,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            base_port: 9001,
            url_template: "ws://127.0.0.1:{port}".to_string(),
            launch_cmd: None,
        }
    }
}

/// Port in a `scheme://host:port/path` URL
pub fn port_of(url: &str) -> Option<u16> {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split('/').next()?;
    let (_, port) = authority.rsplit_once(':')?;
    port.parse().ok()
}

/// Starts backend processes and remembers them so they can be stopped
pub struct BackendLauncher {
    settings: LaunchSettings,
    children: HashMap<String, Child>,
}

impl BackendLauncher {
    pub fn new(settings: LaunchSettings) -> Self {
        Self {
            settings,
            children: HashMap::new(),
        }
    }

    fn next_port(&self, used: &HashSet<u16>) -> Result<u16, LaunchError> {
        (self.settings.base_port..=u16::MAX)
            .find(|p| !used.contains(p))
            .ok_or(LaunchError::NoFreePort(self.settings.base_port))
    }

    /// Start a backend on the first port not used by `existing`. Returns its URL.
    pub fn launch(&mut self, existing: &[String]) -> Result<String, LaunchError> {
        let used: HashSet<u16> = existing.iter().filter_map(|u| port_of(u)).collect();
        let port = self.next_port(&used)?.to_string();
        let url = self.settings.url_template.replace("{port}", &port);

        if let Some(template) = &self.settings.launch_cmd {
            let command = template.replace("{port}", &port);
            let mut parts = command.split_whitespace();
            let program = parts.next().ok_or(LaunchError::EmptyCommand)?;
            let child = Command::new(program)
                .args(parts)
                .kill_on_drop(true)
                .spawn()?;
            info!(backend = %url, pid = ?child.id(), "Launched backend process");
            self.children.insert(url.clone(), child);
        }
        Ok(url)
    }

    /// Wait until something accepts TCP connections on the backend's port
    pub async fn wait_ready(&self, url: &str) -> bool {
        if !self.children.contains_key(url) {
            return true;
        }
        let Some(port) = port_of(url) else {
            return false;
        };
        for _ in 0..READY_ATTEMPTS {
            if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                return true;
            }
            tokio::time::sleep(READY_POLL).await;
        }
        false
    }

    /// Stop the process behind `url`, if this launcher started it
    pub async fn stop(&mut self, url: &str) {
        if let Some(mut child) = self.children.remove(url) {
            if let Err(e) = child.kill().await {
                warn!(backend = %url, "Failed to stop backend process: {}", e);
            }
        }
    }

    pub fn managed(&self) -> usize {
        self.children.len()
    }
}

/// Control loop adding and removing pool entries
pub struct Autoscaler {
    pool: Arc<BackendPool>,
    policy: AutoscalePolicy,
    launcher: BackendLauncher,
}

impl Autoscaler {
    pub fn new(pool: Arc<BackendPool>, policy: AutoscalePolicy, launcher: BackendLauncher) -> Self {
        Self {
            pool,
            policy,
            launcher,
        }
    }

    /// Run forever; failures are logged and retried on the next interval
    pub async fn run(mut self) {
        info!(
            min = self.policy.min_backends,
            max = self.policy.max_backends,
            interval_secs = self.policy.interval.as_secs(),
            "Autoscaler started"
        );
        self.top_up().await;

        let period = self.policy.interval.max(MIN_AUTOSCALE_INTERVAL);
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            self.step().await;
        }
    }

    /// Bring the pool up to the configured minimum
    pub async fn top_up(&mut self) {
        while self.pool.len() < self.policy.min_backends {
            if !self.scale_up().await {
                break;
            }
        }
    }

    /// One evaluation of the policy
    pub async fn step(&mut self) -> ScaleDecision {
        let decision = plan(&self.pool.load(), &self.policy);
        match &decision {
            ScaleDecision::Hold => debug!(backends = self.pool.len(), "Autoscale: hold"),
            ScaleDecision::Up => {
                self.scale_up().await;
            }
            ScaleDecision::Down { id, url } => {
                // Load may have changed since it was read; only idle backends go
                if !self.pool.remove_if_idle(*id) {
                    debug!(backend = %url, "Autoscale: backend picked up work, keeping it");
                    return ScaleDecision::Hold;
                }
                info!(backend = %url, "Autoscale: removed idle backend");
                self.launcher.stop(url).await;
            }
        }
        decision
    }

    async fn scale_up(&mut self) -> bool {
        let existing: Vec<String> = self.pool.load().into_iter().map(|l| l.url).collect();
        let url = match self.launcher.launch(&existing) {
            Ok(url) => url,
            Err(e) => {
                warn!("Autoscale: launch failed: {}", e);
                return false;
            }
        };

        if !self.launcher.wait_ready(&url).await {
            warn!(backend = %url, "Autoscale: backend not ready yet, adding anyway");
        }
        match self.pool.add_backend(url.clone()) {
            Ok(_) => {
                info!(backend = %url, backends = self.pool.len(), "Autoscale: added backend");
                true
            }
            Err(e) => {
                warn!("Autoscale: {}", e);
                false
            }
        }
    }
}
