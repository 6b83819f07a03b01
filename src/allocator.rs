//! Port Allocator (component A) — a fixed range of loopback TCP ports,
//! liveness-probed before handing one out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::error::{GatewayError, Result};

const DEFAULT_START: u16 = 3001;
const DEFAULT_END: u16 = 3099;
const DEFAULT_RESERVATION_TIMEOUT: Duration = Duration::from_secs(60);

/// A single name↔port mapping and its reservation state.
#[derive(Debug, Clone)]
pub struct PortAllocation {
    pub port: u16,
    pub name: String,
    pub allocated_at: Instant,
    pub reserved: bool,
    /// When `reserved` was last set; expiry is measured from here, not
    /// from `allocated_at`.
    pub reserved_at: Option<Instant>,
}

/// Snapshot of the allocator's range occupancy.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RangeInfo {
    pub start: u16,
    pub end: u16,
    pub total: u32,
    pub allocated: u32,
    pub available: u32,
}

struct AllocatorState {
    port_to_alloc: HashMap<u16, PortAllocation>,
    name_to_port: HashMap<String, u16>,
}

/// Owns the `[start, end]` port pool for stdio backends.
pub struct PortAllocator {
    start: u16,
    end: u16,
    reservation_timeout: Duration,
    // `Arc`-wrapped so the reservation timer task below can clear its own
    // expiry directly instead of only marking time and waiting for a
    // caller to sweep.
    state: Arc<RwLock<AllocatorState>>,
    // keyed by name so `releasePort` can cancel a still-armed timer.
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start == 0 || end == 0 || start >= end {
            return Err(GatewayError::InvalidPortRange(start, end));
        }
        Ok(Self {
            start,
            end,
            reservation_timeout: DEFAULT_RESERVATION_TIMEOUT,
            state: Arc::new(RwLock::new(AllocatorState {
                port_to_alloc: HashMap::new(),
                name_to_port: HashMap::new(),
            })),
            timers: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_START, DEFAULT_END).expect("default port range is always valid")
    }

    /// Like [`PortAllocator::new`] with a non-default `reservationTimeout`.
    pub fn with_reservation_timeout(start: u16, end: u16, reservation_timeout: Duration) -> Result<Self> {
        let mut allocator = Self::new(start, end)?;
        allocator.reservation_timeout = reservation_timeout;
        Ok(allocator)
    }

    /// Probe whether `port` is currently free by binding and dropping a
    /// loopback listener. Does not eliminate TOCTOU races; the eventual
    /// consumer (the adapter) is the one that durably binds the port.
    async fn probe_free(port: u16) -> bool {
        TcpListener::bind(("127.0.0.1", port)).await.is_ok()
    }

    /// Allocate a port for `name`, idempotently.
    pub async fn allocate(&self, name: &str, preferred: Option<u16>) -> Result<u16> {
        {
            let state = self.state.read().await;
            if let Some(&port) = state.name_to_port.get(name) {
                return Ok(port);
            }
        }

        if let Some(p) = preferred {
            if p >= self.start && p <= self.end {
                let taken = {
                    let state = self.state.read().await;
                    state.port_to_alloc.contains_key(&p)
                };
                if !taken && Self::probe_free(p).await {
                    return self.commit(name, p).await;
                }
            }
        }

        for port in self.start..=self.end {
            let taken = {
                let state = self.state.read().await;
                state.port_to_alloc.contains_key(&port)
            };
            if taken {
                continue;
            }
            if Self::probe_free(port).await {
                return self.commit(name, port).await;
            }
        }

        Err(GatewayError::NoPortsAvailable)
    }

    async fn commit(&self, name: &str, port: u16) -> Result<u16> {
        let mut state = self.state.write().await;
        state.port_to_alloc.insert(
            port,
            PortAllocation {
                port,
                name: name.to_string(),
                allocated_at: Instant::now(),
                reserved: false,
                reserved_at: None,
            },
        );
        state.name_to_port.insert(name.to_string(), port);
        Ok(port)
    }

    /// Mark the named allocation `reserved`, arming a single-shot timer that
    /// clears the flag (not the allocation) after `reservationTimeout`.
    pub async fn reserve_port(&self, name: &str, port: Option<u16>) -> Result<()> {
        let target_port = {
            let state = self.state.read().await;
            match port {
                Some(p) => match state.port_to_alloc.get(&p) {
                    Some(alloc) if alloc.name == name => p,
                    Some(_) => {
                        return Err(GatewayError::InvalidConfig(
                            name.to_string(),
                            format!("port {p} is allocated to a different name"),
                        ));
                    }
                    None => {
                        return Err(GatewayError::InvalidConfig(
                            name.to_string(),
                            format!("port {p} is not allocated"),
                        ));
                    }
                },
                None => *state.name_to_port.get(name).ok_or_else(|| {
                    GatewayError::InvalidConfig(name.to_string(), "no port allocated".into())
                })?,
            }
        };

        {
            let mut state = self.state.write().await;
            if let Some(alloc) = state.port_to_alloc.get_mut(&target_port) {
                alloc.reserved = true;
                alloc.reserved_at = Some(Instant::now());
            }
        }

        let timeout = self.reservation_timeout;
        let name_owned = name.to_string();
        // The timer task holds a clone of the shared state `Arc` (not `self`)
        // and clears the flag itself once `reservationTimeout` elapses,
        // measured from this call rather than from the original allocation.
        // It only touches the allocation still held by this name — if the
        // port was released and reallocated elsewhere in the meantime, the
        // name lookup below simply won't find it.
        let state = self.state.clone();
        let timer_name = name_owned.clone();
        let mut timers = self.timers.lock().await;
        if let Some(old) = timers.insert(name_owned, tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut state = state.write().await;
            if let Some(&port) = state.name_to_port.get(&timer_name) {
                if let Some(alloc) = state.port_to_alloc.get_mut(&port) {
                    if alloc.name == timer_name {
                        alloc.reserved = false;
                        alloc.reserved_at = None;
                    }
                }
            }
        })) {
            old.abort();
        }
        Ok(())
    }

    /// Backstop for `reserve_port`'s own timer: clears any `reserved` flag
    /// whose `reserved_at` is older than `reservationTimeout`. Harmless to
    /// call redundantly — the timer normally gets there first.
    pub async fn sweep_expired_reservations(&self) {
        let mut state = self.state.write().await;
        let now = Instant::now();
        for alloc in state.port_to_alloc.values_mut() {
            if alloc.reserved
                && alloc
                    .reserved_at
                    .is_some_and(|at| now.duration_since(at) > self.reservation_timeout)
            {
                alloc.reserved = false;
                alloc.reserved_at = None;
            }
        }
    }

    /// Cancel the timer if any, remove both mappings. Returns true iff a
    /// mapping existed.
    pub async fn release_port(&self, name: &str) -> bool {
        let mut timers = self.timers.lock().await;
        if let Some(t) = timers.remove(name) {
            t.abort();
        }
        drop(timers);

        let mut state = self.state.write().await;
        match state.name_to_port.remove(name) {
            Some(port) => {
                state.port_to_alloc.remove(&port);
                true
            }
            None => false,
        }
    }

    pub async fn port_for_name(&self, name: &str) -> Option<u16> {
        self.state.read().await.name_to_port.get(name).copied()
    }

    pub async fn name_for_port(&self, port: u16) -> Option<String> {
        self.state
            .read()
            .await
            .port_to_alloc
            .get(&port)
            .map(|a| a.name.clone())
    }

    pub async fn allocations(&self) -> Vec<PortAllocation> {
        self.state.read().await.port_to_alloc.values().cloned().collect()
    }

    pub async fn reserved_ports(&self) -> Vec<u16> {
        self.state
            .read()
            .await
            .port_to_alloc
            .values()
            .filter(|a| a.reserved)
            .map(|a| a.port)
            .collect()
    }

    pub async fn range_info(&self) -> RangeInfo {
        let state = self.state.read().await;
        let total = (self.end - self.start + 1) as u32;
        let allocated = state.port_to_alloc.len() as u32;
        RangeInfo {
            start: self.start,
            end: self.end,
            total,
            allocated,
            available: total.saturating_sub(allocated),
        }
    }

    /// The next `k` ports in range that are not currently allocated,
    /// without probing the OS (a cheap hint, not a reservation).
    pub async fn next_available_ports(&self, k: usize) -> Vec<u16> {
        let state = self.state.read().await;
        (self.start..=self.end)
            .filter(|p| !state.port_to_alloc.contains_key(p))
            .take(k)
            .collect()
    }

    /// Cancel all timers and empty both maps.
    pub async fn cleanup(&self) {
        let mut timers = self.timers.lock().await;
        for (_, t) in timers.drain() {
            t.abort();
        }
        drop(timers);
        let mut state = self.state.write().await;
        state.port_to_alloc.clear();
        state.name_to_port.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construction_rejects_invalid_range() {
        assert!(matches!(PortAllocator::new(0, 100), Err(GatewayError::InvalidPortRange(_, _))));
        assert!(matches!(PortAllocator::new(100, 50), Err(GatewayError::InvalidPortRange(_, _))));
        assert!(PortAllocator::new(3001, 3099).is_ok());
    }

    #[tokio::test]
    async fn allocate_is_idempotent() {
        let a = PortAllocator::new(13001, 13010).unwrap();
        let p1 = a.allocate("mem", None).await.unwrap();
        let p2 = a.allocate("mem", None).await.unwrap();
        assert_eq!(p1, p2);
    }

    #[tokio::test]
    async fn name_and_port_mappings_stay_in_lockstep() {
        let a = PortAllocator::new(13101, 13110).unwrap();
        let port = a.allocate("svc", None).await.unwrap();
        assert_eq!(a.port_for_name("svc").await, Some(port));
        assert_eq!(a.name_for_port(port).await, Some("svc".to_string()));
    }

    #[tokio::test]
    async fn release_returns_true_once_then_false() {
        let a = PortAllocator::new(13201, 13210).unwrap();
        a.allocate("svc", None).await.unwrap();
        assert!(a.release_port("svc").await);
        assert!(!a.release_port("svc").await);
    }

    #[tokio::test]
    async fn exhausted_range_fails() {
        let a = PortAllocator::new(13301, 13302).unwrap();
        a.allocate("one", None).await.unwrap();
        a.allocate("two", None).await.unwrap();
        assert!(matches!(a.allocate("three", None).await, Err(GatewayError::NoPortsAvailable)));
    }

    #[tokio::test]
    async fn reserve_requires_existing_allocation() {
        let a = PortAllocator::new(13401, 13410).unwrap();
        assert!(a.reserve_port("ghost", None).await.is_err());
        a.allocate("svc", None).await.unwrap();
        assert!(a.reserve_port("svc", None).await.is_ok());
        assert_eq!(a.reserved_ports().await, vec![a.port_for_name("svc").await.unwrap()]);
    }

    #[tokio::test]
    async fn reservation_expires_after_timeout_measured_from_reserve_call() {
        let a = PortAllocator::with_reservation_timeout(13451, 13460, Duration::from_millis(50)).unwrap();
        a.allocate("svc", None).await.unwrap();
        a.reserve_port("svc", None).await.unwrap();
        assert!(!a.reserved_ports().await.is_empty());

        // The timer installed by `reserve_port` clears the flag itself, with
        // no caller needing to poll `sweep_expired_reservations`.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(a.reserved_ports().await.is_empty());
        // ...and the allocation itself is untouched, per §4.A: the
        // reservation timer releases only the `reserved` flag.
        assert_eq!(a.port_for_name("svc").await, a.allocations().await.first().map(|x| x.port));
    }

    #[tokio::test]
    async fn cleanup_empties_all_state() {
        let a = PortAllocator::new(13501, 13510).unwrap();
        a.allocate("svc", None).await.unwrap();
        a.cleanup().await;
        assert!(a.allocations().await.is_empty());
        assert_eq!(a.port_for_name("svc").await, None);
    }
}
