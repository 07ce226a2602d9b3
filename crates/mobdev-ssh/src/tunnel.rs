use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use mobdev_process::{find_free_port, wait_for_port, PortWait};
use mobdev_traits::config::Config;
use mobdev_traits::process::{CommandRunner, CommandSpec, ProcessError, ProcessHandle};

struct Tunnel {
    generation: u64,
    local_port: u16,
    refs: usize,
    handle: Box<dyn ProcessHandle>,
}

/// At most one forward per device. Startup holds only that device's lock.
type Slot = Arc<Mutex<Option<Tunnel>>>;

struct PoolInner {
    config: Config,
    runner: Arc<dyn CommandRunner>,
    slots: Mutex<HashMap<String, Slot>>,
    generations: AtomicU64,
}

/// Shares one `iproxy` forward per device among all holders of a lease.
#[derive(Clone)]
pub struct TunnelPool {
    inner: Arc<PoolInner>,
}

/// A claim on a local port forwarded to a device's SSH port.
///
/// Call [`TunnelLease::release`] when done. A lease dropped without release is
/// returned to the pool from a background task.
pub struct TunnelLease {
    pub udid: String,
    pub local_port: u16,
    generation: u64,
    pool: Option<TunnelPool>,
}

impl TunnelLease {
    pub async fn release(mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release_entry(&self.udid, self.generation).await;
        }
    }
}

impl Drop for TunnelLease {
    fn drop(&mut self) {
        let Some(pool) = self.pool.take() else {
            return;
        };
        let udid = self.udid.clone();
        let generation = self.generation;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { pool.release_entry(&udid, generation).await });
            }
            Err(_) => warn!("Tunnel lease for {} dropped outside a runtime", udid),
        }
    }
}

impl TunnelPool {
    pub fn new(config: &Config, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config: config.clone(),
                runner,
                slots: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
            }),
        }
    }

    async fn slot(&self, udid: &str) -> Slot {
        let mut slots = self.inner.slots.lock().await;
        Arc::clone(slots.entry(udid.to_string()).or_default())
    }

    /// Reuses the device's live forward or starts a new one and waits for it to listen.
    pub async fn acquire(&self, udid: &str) -> Result<TunnelLease, ProcessError> {
        let slot = self.slot(udid).await;
        let mut entry = slot.lock().await;

        if let Some(tunnel) = entry.as_mut() {
            if tunnel.handle.is_alive() {
                tunnel.refs += 1;
                debug!("Reusing tunnel to {} on port {} ({} leases)", udid, tunnel.local_port, tunnel.refs);
                return Ok(self.lease(udid, tunnel.local_port, tunnel.generation));
            }
            warn!("iproxy for {} on port {} has exited, starting a new one", udid, tunnel.local_port);
            *entry = None;
        }

        let config = &self.inner.config;
        let local_port = find_free_port().await?;
        let spec = CommandSpec::new(config.iproxy())
            .arg(format!("{}:{}", local_port, config.device_ssh_port()))
            .args(["-u", udid]);
        let mut handle = self.inner.runner.spawn(&spec).await?;

        if let Err(e) = wait_for_port("127.0.0.1", local_port, PortWait::from_config(config)).await {
            error!("Tunnel to {} did not come up: {}", udid, e);
            if let Err(kill_err) = handle.kill().await {
                error!("Failed to stop iproxy: {}", kill_err);
            }
            return Err(e);
        }

        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        info!("Forwarding 127.0.0.1:{} to {} port {}", local_port, udid, config.device_ssh_port());
        *entry = Some(Tunnel {
            generation,
            local_port,
            refs: 1,
            handle,
        });
        Ok(self.lease(udid, local_port, generation))
    }

    /// Number of devices with a live forward.
    pub async fn active(&self) -> usize {
        let slots: Vec<Slot> = self.inner.slots.lock().await.values().cloned().collect();
        let mut count = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }

    fn lease(&self, udid: &str, local_port: u16, generation: u64) -> TunnelLease {
        TunnelLease {
            udid: udid.to_string(),
            local_port,
            generation,
            pool: Some(self.clone()),
        }
    }

    async fn release_entry(&self, udid: &str, generation: u64) {
        let slot = self.slot(udid).await;
        let mut entry = slot.lock().await;
        let Some(tunnel) = entry.as_mut().filter(|t| t.generation == generation) else {
            debug!("Tunnel to {} was already replaced or closed", udid);
            return;
        };

        tunnel.refs -= 1;
        if tunnel.refs > 0 {
            return;
        }

        if let Some(mut tunnel) = entry.take() {
            info!("Closing tunnel to {} on port {}", udid, tunnel.local_port);
            if let Err(e) = tunnel.handle.kill().await {
                error!("Failed to stop iproxy for {}: {}", udid, e);
            }
        }
    }
}
