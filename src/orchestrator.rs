//! Startup orchestrator
//!
//! Walks the startup state machine: port validation, best-effort network
//! probes, directory checks, waiting for Snapcast, the initial
//! reconciliation, and the initial full-state publish. Each validation step
//! retries up to 5 times with exponential backoff (base 1 s, factor 2,
//! +0-1 s jitter, cap 30 s); a final failure asks the process to stop with
//! the startup-failure exit code rather than unwinding across the boundary.

use std::path::Path;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Exit code for a clean stop.
pub const EXIT_OK: i32 = 0;
/// Exit code for an unhandled error.
pub const EXIT_ERROR: i32 = 1;
/// Exit code for a startup validation failure.
pub const EXIT_STARTUP_FAILURE: i32 = 2;

const STEP_ATTEMPTS: u32 = 5;
const STEP_BASE_DELAY: Duration = Duration::from_secs(1);
const STEP_DELAY_CAP: Duration = Duration::from_secs(30);
const NETWORK_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const SNAPCAST_WAIT: Duration = Duration::from_secs(30);
const SNAPCAST_POLL: Duration = Duration::from_secs(1);
const PORT_PROBE_RANGE: u16 = 100;

/// Startup phases, observable through [`Orchestrator::state_watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupState {
    ValidatingPorts,
    ValidatingNetwork,
    ValidatingDirectories,
    WaitingForSnapcast,
    Reconciling,
    Publishing,
    Running,
    Shutdown,
}

/// One `(host, port)` the network validator should probe.
#[derive(Debug, Clone)]
pub struct NetworkTarget {
    pub service: &'static str,
    pub host: String,
    pub port: u16,
}

pub struct Orchestrator {
    state_tx: watch::Sender<StartupState>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(StartupState::ValidatingPorts);
        Self { state_tx }
    }

    pub fn state_watch(&self) -> watch::Receiver<StartupState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> StartupState {
        *self.state_tx.borrow()
    }

    fn enter(&self, state: StartupState) {
        info!(?state, "startup");
        let _ = self.state_tx.send(state);
    }

    pub fn mark_running(&self) {
        self.enter(StartupState::Running);
    }

    pub fn mark_reconciling(&self) {
        self.enter(StartupState::Reconciling);
    }

    pub fn mark_publishing(&self) {
        self.enter(StartupState::Publishing);
    }

    pub fn mark_shutdown(&self) {
        self.enter(StartupState::Shutdown);
    }

    /// Run one validation step under the bounded-retry policy.
    async fn retry_step<F, Fut>(&self, what: &str, mut step: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let mut last = Error::internal("step did not run");
        for attempt in 0..STEP_ATTEMPTS {
            match step().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let backoff = STEP_BASE_DELAY
                        .saturating_mul(2u32.saturating_pow(attempt))
                        .min(STEP_DELAY_CAP);
                    let jitter = Duration::from_millis((rand::random::<f64>() * 1000.0) as u64);
                    warn!(
                        step = what,
                        attempt = attempt + 1,
                        error = %e,
                        retry_in = ?(backoff + jitter),
                        "validation step failed"
                    );
                    last = e;
                    tokio::time::sleep(backoff + jitter).await;
                }
            }
        }
        error!(step = what, error = %last, "validation step exhausted retries");
        Err(last)
    }

    /// Every port this process (or a service it supervises locally) must be
    /// able to bind. A conflict probes offsets 1..100 for a free alternative
    /// and fails startup with the suggestion logged.
    pub async fn validate_ports(&self, ports: &[(&'static str, u16)]) -> Result<()> {
        self.enter(StartupState::ValidatingPorts);
        for &(what, port) in ports {
            self.retry_step(what, || async move {
                match TcpListener::bind(("127.0.0.1", port)).await {
                    Ok(listener) => {
                        drop(listener);
                        debug!(what, port, "port free");
                        Ok(())
                    }
                    Err(e) => {
                        let alternative = find_free_port(port).await;
                        match alternative {
                            Some(free) => warn!(
                                what,
                                port,
                                alternative = free,
                                "port is in use; {} would be free",
                                free
                            ),
                            None => warn!(what, port, "port is in use; no free alternative within {} offsets", PORT_PROBE_RANGE),
                        }
                        Err(Error::unavailable(format!(
                            "{} port {} is in use: {}",
                            what, port, e
                        )))
                    }
                }
            })
            .await?;
        }
        Ok(())
    }

    /// Best-effort TCP reachability probe per enabled service; failures
    /// warn but never block startup.
    pub async fn validate_network(&self, targets: &[NetworkTarget]) {
        self.enter(StartupState::ValidatingNetwork);
        for target in targets {
            let addr = format!("{}:{}", target.host, target.port);
            match tokio::time::timeout(NETWORK_PROBE_TIMEOUT, TcpStream::connect(&addr)).await {
                Ok(Ok(_)) => debug!(service = target.service, addr = %addr, "reachable"),
                Ok(Err(e)) => {
                    warn!(service = target.service, addr = %addr, error = %e, "not reachable")
                }
                Err(_) => warn!(service = target.service, addr = %addr, "probe timed out"),
            }
        }
    }

    /// Create-if-absent plus a write test per configured directory.
    pub async fn validate_directories(&self, directories: &[std::path::PathBuf]) -> Result<()> {
        self.enter(StartupState::ValidatingDirectories);
        for dir in directories {
            let dir = dir.clone();
            self.retry_step("directory", || {
                let dir = dir.clone();
                async move { probe_directory(&dir) }
            })
            .await?;
        }
        Ok(())
    }

    /// Poll until Snapcast answers or the bounded wait elapses; a timeout
    /// logs and proceeds, steady-state reconciliation takes over.
    pub async fn wait_for_snapcast(
        &self,
        snapcast: &crate::adapters::snapcast::SnapcastAdapter,
    ) {
        self.enter(StartupState::WaitingForSnapcast);
        let deadline = tokio::time::Instant::now() + SNAPCAST_WAIT;
        loop {
            if snapcast.is_connected() && snapcast.get_server_status().await.is_ok() {
                info!("snapcast is reachable");
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("snapcast not reachable within {:?}, proceeding", SNAPCAST_WAIT);
                return;
            }
            tokio::time::sleep(SNAPCAST_POLL).await;
        }
    }
}

/// Probe offsets 1..=100 above the configured port for a free one.
async fn find_free_port(base: u16) -> Option<u16> {
    for offset in 1..=PORT_PROBE_RANGE {
        let candidate = base.checked_add(offset)?;
        if let Ok(listener) = TcpListener::bind(("127.0.0.1", candidate)).await {
            drop(listener);
            return Some(candidate);
        }
    }
    None
}

fn probe_directory(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .map_err(|e| Error::invalid(format!("create {}: {}", dir.display(), e)))?;
    let probe = dir.join(".snapdog-write-test");
    std::fs::write(&probe, b"probe")
        .map_err(|e| Error::invalid(format!("write test in {}: {}", dir.display(), e)))?;
    std::fs::remove_file(&probe)
        .map_err(|e| Error::invalid(format!("cleanup in {}: {}", dir.display(), e)))?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_free_port_validates() {
        let orchestrator = Orchestrator::new();
        // Grab an ephemeral port, release it, then validate it
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(orchestrator.validate_ports(&[("api", port)]).await.is_ok());
    }

    #[tokio::test]
    async fn test_find_free_port_skips_bound() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bound = listener.local_addr().unwrap().port();
        let free = find_free_port(bound).await.unwrap();
        assert!(free > bound);
        assert!(free <= bound + PORT_PROBE_RANGE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bound_port_exhausts_retries() {
        let orchestrator = Orchestrator::new();
        // Hold the port for the duration of the test
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let err = orchestrator
            .validate_ports(&[("snapcast", port)])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Unavailable);
        drop(listener);
    }

    #[tokio::test]
    async fn test_directory_probe_creates_and_cleans() {
        let orchestrator = Orchestrator::new();
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("nested/cache");
        orchestrator
            .validate_directories(&[target.clone()])
            .await
            .unwrap();
        assert!(target.is_dir());
        assert!(!target.join(".snapdog-write-test").exists());
    }

    #[tokio::test]
    async fn test_state_progression_is_observable() {
        let orchestrator = Orchestrator::new();
        let watch = orchestrator.state_watch();
        assert_eq!(*watch.borrow(), StartupState::ValidatingPorts);
        orchestrator.mark_reconciling();
        assert_eq!(*watch.borrow(), StartupState::Reconciling);
        orchestrator.mark_running();
        assert_eq!(orchestrator.state(), StartupState::Running);
    }

    #[tokio::test]
    async fn test_network_probe_never_fails() {
        let orchestrator = Orchestrator::new();
        // Unroutable target; must warn, not error
        orchestrator
            .validate_network(&[NetworkTarget {
                service: "snapcast",
                host: "127.0.0.1".into(),
                port: 1,
            }])
            .await;
    }
}
