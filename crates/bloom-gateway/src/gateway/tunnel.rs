//! Tunnel Manager — Shared Local Forward to the Remote Inference Host
//!
//! Owns at most one live local-forward process per `(remote_host,
//! remote_port)` target for the lifetime of the process. Many concurrent
//! callers needing the same target share the one tunnel; the first caller
//! pays the establishment cost, everyone else takes the fast probe path.
//!
//! ## State machine (per target)
//!
//! ```text
//! NoTunnel ──establish──▶ Starting ──probe ok──▶ Healthy
//!                            │                      │
//!                            │ probe exhausted      │ probe fails later
//!                            ▼                      ▼
//!                          (error)                Dead ──teardown──▶ NoTunnel
//! ```
//!
//! ## Locking
//!
//! Two levels, mirroring the adapter registry: a manager mutex guards the
//! *map* of per-target slots and is held only for the lookup/insert; the
//! per-target mutex serializes probe/establish for that one target.
//! Establishment I/O runs under the per-target lock — waiters for the same
//! target would have to wait for the tunnel anyway, and the wait is bounded
//! by the health-poll budget. Unrelated targets are never blocked.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::types::GatewayError;

/// Ports probed beyond the base before giving up on allocation.
const PORT_SCAN_ATTEMPTS: u16 = 50;

/// Timeout for a single HTTP liveness probe against the forwarded port.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Subprocess seam
// ============================================================================

/// A running forward process. The default implementation wraps an `ssh`
/// child; tests substitute an in-process forwarder.
pub trait TunnelProcess: Send {
    /// Whether the process is still running.
    fn is_alive(&mut self) -> bool;

    /// Terminate the process. Must be safe to call more than once.
    fn terminate(&mut self);

    /// OS process id, for logging.
    fn id(&self) -> Option<u32>;
}

/// Spawns forward processes. The seam exists so the establishment logic is
/// testable without an SSH host.
pub trait TunnelSpawner: Send + Sync {
    fn spawn(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<Box<dyn TunnelProcess>, GatewayError>;
}

/// Default spawner: `ssh -N -L {local}:127.0.0.1:{remote} {host}`.
///
/// The host alias carries its own authentication context via the user's SSH
/// config. `kill_on_drop` guarantees the child is terminated even on
/// abnormal process exit paths that skip [`TunnelManager::shutdown`].
pub struct SshSpawner;

struct SshProcess {
    child: Child,
}

impl TunnelProcess for SshProcess {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn terminate(&mut self) {
        // start_kill errors once the child has already exited.
        let _ = self.child.start_kill();
    }

    fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

impl TunnelSpawner for SshSpawner {
    fn spawn(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<Box<dyn TunnelProcess>, GatewayError> {
        let child = Command::new("ssh")
            .arg("-N")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("ExitOnForwardFailure=yes")
            .arg("-o")
            .arg("ServerAliveInterval=30")
            .arg("-L")
            .arg(format!("{local_port}:127.0.0.1:{remote_port}"))
            .arg(remote_host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                GatewayError::TunnelEstablishment(format!(
                    "failed to spawn ssh forward to {remote_host}:{remote_port}: {e}"
                ))
            })?;

        Ok(Box::new(SshProcess { child }))
    }
}

// ============================================================================
// TunnelHandle
// ============================================================================

/// Lifecycle state of a tunnel handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Starting,
    Healthy,
    Dead,
}

/// A live tunnel to one `(remote_host, remote_port)` target.
pub struct TunnelHandle {
    process: Box<dyn TunnelProcess>,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub state: TunnelState,
}

impl std::fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("pid", &self.process.id())
            .field("local_port", &self.local_port)
            .field("remote_host", &self.remote_host)
            .field("remote_port", &self.remote_port)
            .field("state", &self.state)
            .finish()
    }
}

// ============================================================================
// TunnelManager
// ============================================================================

type TargetKey = (String, u16);
type Slot = Arc<Mutex<Option<TunnelHandle>>>;

/// Owns every tunnel for the process lifetime.
///
/// Construct once (inside [`Gateway`](super::executor::Gateway)) and share;
/// all methods take `&self`.
pub struct TunnelManager {
    spawner: Arc<dyn TunnelSpawner>,
    http: reqwest::Client,
    local_port_base: u16,
    health_poll_attempts: u32,
    health_poll_interval: Duration,
    slots: Mutex<HashMap<TargetKey, Slot>>,
}

impl std::fmt::Debug for TunnelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelManager")
            .field("local_port_base", &self.local_port_base)
            .finish()
    }
}

impl TunnelManager {
    /// Create a manager using the default SSH spawner.
    pub fn new(local_port_base: u16) -> Self {
        Self::with_spawner(local_port_base, Arc::new(SshSpawner))
    }

    /// Create a manager with a custom spawner (used by tests).
    pub fn with_spawner(local_port_base: u16, spawner: Arc<dyn TunnelSpawner>) -> Self {
        Self {
            spawner,
            http: reqwest::Client::new(),
            local_port_base,
            health_poll_attempts: 20,
            health_poll_interval: Duration::from_millis(500),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Override the health-poll budget for establishment.
    pub fn with_health_poll(mut self, attempts: u32, interval: Duration) -> Self {
        self.health_poll_attempts = attempts;
        self.health_poll_interval = interval;
        self
    }

    /// Return a healthy local port forwarding to the target, establishing
    /// the tunnel on first use or after a dead probe.
    ///
    /// Establishment failures are bounded and surface as
    /// [`GatewayError::TunnelEstablishment`]; the slot is left empty so a
    /// later call starts fresh.
    pub async fn acquire(&self, remote_host: &str, remote_port: u16) -> Result<u16, GatewayError> {
        let slot = {
            let mut slots = self.slots.lock().await;
            slots
                .entry((remote_host.to_string(), remote_port))
                .or_insert_with(|| Arc::new(Mutex::new(None)))
                .clone()
        };

        let mut guard = slot.lock().await;

        // Fast path: existing handle, still healthy.
        if let Some(handle) = guard.as_mut() {
            if self.probe(handle).await {
                return Ok(handle.local_port);
            }
            handle.state = TunnelState::Dead;
            handle.process.terminate();
            tracing::warn!(
                "TunnelManager: tunnel to {}:{} died (pid={:?}), re-establishing",
                handle.remote_host,
                handle.remote_port,
                handle.process.id(),
            );
            *guard = None;
        }

        let handle = self.establish(remote_host, remote_port).await?;
        let local_port = handle.local_port;
        *guard = Some(handle);
        Ok(local_port)
    }

    /// Process-alive check plus a lightweight HTTP probe of the forwarded
    /// port. Any HTTP response counts — the probe tests the forward, not
    /// the server's mood.
    async fn probe(&self, handle: &mut TunnelHandle) -> bool {
        if !handle.process.is_alive() {
            return false;
        }
        self.http_probe(handle.local_port).await
    }

    async fn http_probe(&self, local_port: u16) -> bool {
        let url = format!("http://127.0.0.1:{local_port}/v1/models");
        self.http
            .get(&url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .is_ok()
    }

    async fn establish(
        &self,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<TunnelHandle, GatewayError> {
        let local_port = self.find_free_local_port()?;

        tracing::info!(
            "TunnelManager: establishing tunnel {local_port} -> {remote_host}:{remote_port}"
        );

        let mut handle = TunnelHandle {
            process: self.spawner.spawn(local_port, remote_host, remote_port)?,
            local_port,
            remote_host: remote_host.to_string(),
            remote_port,
            state: TunnelState::Starting,
        };

        for attempt in 1..=self.health_poll_attempts {
            if !handle.process.is_alive() {
                return Err(GatewayError::TunnelEstablishment(format!(
                    "forward process to {remote_host}:{remote_port} exited during startup"
                )));
            }
            if self.http_probe(local_port).await {
                handle.state = TunnelState::Healthy;
                tracing::info!(
                    "TunnelManager: tunnel healthy on port {local_port} (pid={:?}, {attempt} probes)",
                    handle.process.id(),
                );
                return Ok(handle);
            }
            tokio::time::sleep(self.health_poll_interval).await;
        }

        handle.process.terminate();
        Err(GatewayError::TunnelEstablishment(format!(
            "tunnel to {remote_host}:{remote_port} failed health check after {} probes",
            self.health_poll_attempts
        )))
    }

    /// Scan for a free local port starting at the base, skipping ports that
    /// are already bound. Bounded attempts.
    fn find_free_local_port(&self) -> Result<u16, GatewayError> {
        for offset in 0..PORT_SCAN_ATTEMPTS {
            let port = self.local_port_base + offset;
            if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
                return Ok(port);
            }
        }
        Err(GatewayError::TunnelEstablishment(format!(
            "no free local port in {}..{}",
            self.local_port_base,
            self.local_port_base + PORT_SCAN_ATTEMPTS
        )))
    }

    /// Terminate every live tunnel. Called once at process exit; safe to
    /// call again (each handle is taken out of its slot before teardown).
    pub async fn shutdown(&self) {
        let slots: Vec<Slot> = self.slots.lock().await.values().cloned().collect();
        let mut killed = 0usize;
        for slot in slots {
            if let Some(mut handle) = slot.lock().await.take() {
                handle.process.terminate();
                killed += 1;
            }
        }
        if killed > 0 {
            tracing::info!("TunnelManager: shut down {killed} tunnel(s)");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A process that is "alive" until terminated but never serves HTTP.
    struct InertProcess {
        alive: bool,
    }

    impl TunnelProcess for InertProcess {
        fn is_alive(&mut self) -> bool {
            self.alive
        }
        fn terminate(&mut self) {
            self.alive = false;
        }
        fn id(&self) -> Option<u32> {
            None
        }
    }

    struct InertSpawner {
        spawns: AtomicUsize,
    }

    impl TunnelSpawner for InertSpawner {
        fn spawn(
            &self,
            _local_port: u16,
            _remote_host: &str,
            _remote_port: u16,
        ) -> Result<Box<dyn TunnelProcess>, GatewayError> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(InertProcess { alive: true }))
        }
    }

    struct FailingSpawner;

    impl TunnelSpawner for FailingSpawner {
        fn spawn(
            &self,
            _local_port: u16,
            _remote_host: &str,
            _remote_port: u16,
        ) -> Result<Box<dyn TunnelProcess>, GatewayError> {
            Err(GatewayError::TunnelEstablishment("spawn refused".into()))
        }
    }

    #[test]
    fn test_find_free_port_skips_bound() {
        let manager = TunnelManager::new(19200);
        let blocker = std::net::TcpListener::bind(("127.0.0.1", 19200)).unwrap();
        let port = manager.find_free_local_port().unwrap();
        assert_ne!(port, 19200);
        assert!(port > 19200 && port < 19200 + PORT_SCAN_ATTEMPTS);
        drop(blocker);
    }

    #[tokio::test]
    async fn test_spawn_failure_surfaces_and_slot_stays_empty() {
        let manager = TunnelManager::with_spawner(19300, Arc::new(FailingSpawner))
            .with_health_poll(2, Duration::from_millis(10));

        let err = manager.acquire("inference-box", 8000).await.unwrap_err();
        assert!(matches!(err, GatewayError::TunnelEstablishment(_)));

        // A second call must attempt establishment again, not hang.
        let err = manager.acquire("inference-box", 8000).await.unwrap_err();
        assert!(matches!(err, GatewayError::TunnelEstablishment(_)));
    }

    #[tokio::test]
    async fn test_unhealthy_process_exhausts_bounded_probes() {
        let spawner = Arc::new(InertSpawner {
            spawns: AtomicUsize::new(0),
        });
        let manager = TunnelManager::with_spawner(19400, spawner.clone())
            .with_health_poll(3, Duration::from_millis(10));

        let err = manager.acquire("inference-box", 8000).await.unwrap_err();
        match err {
            GatewayError::TunnelEstablishment(msg) => {
                assert!(msg.contains("health check"), "{msg}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(spawner.spawns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_with_no_tunnels_is_noop() {
        let manager = TunnelManager::new(19500);
        manager.shutdown().await;
    }

    #[test]
    fn test_manager_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TunnelManager>();
    }
}
