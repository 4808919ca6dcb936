//! Lease allocation and persistence.
//!
//! [`Leases`] is the authoritative in-memory view of every MAC → IP binding
//! and of the free part of the allocation range. Allocation decisions are
//! made under a single write lock; every mutation is also queued and pushed
//! to the [`LeaseBackend`] by [`Leases::flush`], which the
//! [`PersistenceWorker`] calls on a fixed interval.
//!
//! Leases are never expired or reclaimed: once a MAC holds an address it
//! keeps it for the lifetime of the lease table.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::packet::MacAddress;
use crate::storage::LeaseBackend;

/// A durable MAC → IP assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub mac_address: MacAddress,
    pub ip_address: Ipv4Addr,
    /// Client-provided hostname (option 12), sanitized.
    pub hostname: Option<String>,
    /// Set when the lease is created, refreshed on every later Discover.
    pub allocated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct InternalState {
    leases: HashMap<MacAddress, Lease>,
    /// Unassigned, non-reserved range addresses; ordered so allocation is
    /// deterministic.
    free_ips: BTreeSet<Ipv4Addr>,
    /// Mutations not yet handed to the backend, latest row per MAC.
    pending: HashMap<MacAddress, Lease>,
}

/// Thread-safe lease table backed by a [`LeaseBackend`].
#[derive(Debug)]
pub struct Leases {
    state: RwLock<InternalState>,
    backend: Arc<dyn LeaseBackend>,
    /// Serializes flushes so batches reach the backend in order.
    flush_lock: Mutex<()>,
}

impl Leases {
    /// Builds the table from every row the backend holds.
    ///
    /// Rows whose address is outside the range, reserved, or already bound
    /// to another MAC are skipped with a warning.
    pub async fn new(config: &Config, backend: Arc<dyn LeaseBackend>) -> Result<Self> {
        let loader = Arc::clone(&backend);
        let rows = tokio::task::spawn_blocking(move || loader.load_all())
            .await
            .map_err(|error| Error::Persistence(format!("lease loader failed: {}", error)))??;

        let mut state = InternalState {
            free_ips: config.allocatable_addresses().collect(),
            ..Default::default()
        };

        for lease in rows {
            if !state.free_ips.contains(&lease.ip_address) {
                warn!(
                    "Ignoring stored lease {} -> {}: address unavailable in current range",
                    lease.mac_address, lease.ip_address
                );
                continue;
            }
            if state.leases.contains_key(&lease.mac_address) {
                warn!("Ignoring duplicate stored lease for {}", lease.mac_address);
                continue;
            }
            state.free_ips.remove(&lease.ip_address);
            state.leases.insert(lease.mac_address, lease);
        }

        info!(
            "Loaded {} lease(s); {} of {} addresses free",
            state.leases.len(),
            state.free_ips.len(),
            config.pool_size()
        );

        Ok(Self {
            state: RwLock::new(state),
            backend,
            flush_lock: Mutex::new(()),
        })
    }

    /// Returns the IP bound to `mac`, allocating one if needed.
    ///
    /// # Allocation order
    ///
    /// 1. The existing lease for `mac` (hostname and timestamp refreshed)
    /// 2. `requested_ip` if it is in range and unassigned
    /// 3. The lowest free address in the range
    ///
    /// Returns `None` when the range is exhausted. The whole decision runs
    /// under the write lock, so concurrent callers never share an address.
    pub async fn find_or_allocate(
        &self,
        mac: MacAddress,
        requested_ip: Option<Ipv4Addr>,
        hostname: Option<String>,
    ) -> Option<Ipv4Addr> {
        let mut state = self.state.write().await;

        if let Some(lease) = state.leases.get_mut(&mac) {
            if hostname.is_some() {
                lease.hostname = hostname;
            }
            lease.allocated_at = Utc::now();
            let lease = lease.clone();
            let ip = lease.ip_address;
            state.pending.insert(mac, lease);
            return Some(ip);
        }

        let ip = requested_ip
            .filter(|ip| state.free_ips.contains(ip))
            .or_else(|| state.free_ips.first().copied())?;

        let lease = Lease {
            mac_address: mac,
            ip_address: ip,
            hostname,
            allocated_at: Utc::now(),
        };

        state.free_ips.remove(&ip);
        state.leases.insert(mac, lease.clone());
        state.pending.insert(mac, lease);

        debug!("Allocated {} to {}", ip, mac);
        Some(ip)
    }

    /// Returns the lease for `mac`, if one exists.
    pub async fn get(&self, mac: &MacAddress) -> Option<Lease> {
        self.state.read().await.leases.get(mac).cloned()
    }

    /// Pushes every queued mutation to the backend and makes it durable.
    ///
    /// On failure the batch is put back in the queue (unless a newer row for
    /// the same MAC has been queued meanwhile) so the next flush retries it.
    pub async fn flush(&self) -> Result<()> {
        let _flush = self.flush_lock.lock().await;

        let batch: Vec<Lease> = {
            let mut state = self.state.write().await;
            state.pending.drain().map(|(_, lease)| lease).collect()
        };
        if batch.is_empty() {
            return Ok(());
        }

        let batch = Arc::new(batch);
        let rows = Arc::clone(&batch);
        let backend = Arc::clone(&self.backend);
        let result = tokio::task::spawn_blocking(move || {
            backend.upsert(&rows)?;
            backend.flush()
        })
        .await
        .map_err(|error| Error::Persistence(format!("lease writer failed: {}", error)))
        .and_then(|result| result);

        match result {
            Ok(()) => {
                debug!("Persisted {} lease(s)", batch.len());
                Ok(())
            }
            Err(error) => {
                let mut state = self.state.write().await;
                for lease in batch.iter() {
                    state
                        .pending
                        .entry(lease.mac_address)
                        .or_insert_with(|| lease.clone());
                }
                Err(error)
            }
        }
    }

    /// Every lease, ordered by address.
    pub async fn list_leases(&self) -> Vec<Lease> {
        let state = self.state.read().await;
        let mut leases: Vec<Lease> = state.leases.values().cloned().collect();
        leases.sort_by_key(|lease| lease.ip_address);
        leases
    }

    pub async fn lease_count(&self) -> usize {
        self.state.read().await.leases.len()
    }

    pub async fn free_ip_count(&self) -> usize {
        self.state.read().await.free_ips.len()
    }

    /// Number of mutations waiting for the next flush.
    pub async fn pending_count(&self) -> usize {
        self.state.read().await.pending.len()
    }
}

/// Background task flushing [`Leases`] on a fixed interval.
///
/// Stopped with [`shutdown`](Self::shutdown), which signals the task, waits
/// for its final flush and joins it.
#[derive(Debug)]
pub struct PersistenceWorker {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PersistenceWorker {
    pub fn spawn(leases: Arc<Leases>, interval: Duration) -> Self {
        let (stop, mut stopped) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(error) = leases.flush().await {
                            error!("Failed to persist leases (will retry): {}", error);
                        }
                    }
                    _ = stopped.changed() => break,
                }
            }

            if let Err(error) = leases.flush().await {
                error!("Final lease flush failed: {}", error);
            }
            debug!("Lease persistence worker stopped");
        });

        Self { stop, handle }
    }

    /// Signals the worker to stop and waits for it to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(error) = self.handle.await {
            error!("Lease persistence worker panicked: {}", error);
        }
    }
}
