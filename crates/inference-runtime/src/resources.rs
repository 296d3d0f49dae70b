//! Resource Manager
//!
//! Size-based accounting of device memory across loaded models. Several
//! small models may share a device; every grant is all-or-nothing and the
//! per-device sum of grants never exceeds capacity. The ledger sits behind
//! its own mutex, independent of the registry lock.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use nvml_wrapper::Nvml;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sysinfo::System;
use tracing::{debug, info, warn};

use crate::error::ResourceExhausted;
use crate::plugin::ModelKey;

/// A physical compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceId {
    Gpu(u32),
    Cpu,
}

impl DeviceId {
    pub fn is_gpu(&self) -> bool {
        matches!(self, DeviceId::Gpu(_))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Gpu(index) => write!(f, "cuda:{}", index),
            DeviceId::Cpu => f.write_str("cpu"),
        }
    }
}

impl FromStr for DeviceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "cpu" {
            return Ok(DeviceId::Cpu);
        }
        s.strip_prefix("cuda:")
            .and_then(|index| index.parse().ok())
            .map(DeviceId::Gpu)
            .ok_or_else(|| format!("unknown device '{}'", s))
    }
}

impl Serialize for DeviceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Where a model would like to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DevicePreference {
    /// Any GPU, most free memory first.
    Gpu,
    Cpu,
    /// GPUs first, then CPU.
    #[default]
    Any,
    /// Exactly this device.
    Device(DeviceId),
}

impl fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DevicePreference::Gpu => f.write_str("gpu"),
            DevicePreference::Cpu => f.write_str("cpu"),
            DevicePreference::Any => f.write_str("any"),
            DevicePreference::Device(id) => write!(f, "{}", id),
        }
    }
}

impl FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gpu" | "cuda" => Ok(DevicePreference::Gpu),
            "cpu" => Ok(DevicePreference::Cpu),
            "any" | "" => Ok(DevicePreference::Any),
            other => other.parse().map(DevicePreference::Device),
        }
    }
}

impl Serialize for DevicePreference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DevicePreference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Capacity of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub id: DeviceId,
    pub total_mb: u64,
}

/// Accounting record for memory reserved on behalf of one model instance.
/// Holding a ticket does not own the memory; the manager's ledger does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocationTicket {
    pub id: u64,
    pub device: DeviceId,
    pub amount_mb: u64,
    pub owner: ModelKey,
}

/// Point-in-time usage of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceUsage {
    pub device: DeviceId,
    pub total_mb: u64,
    pub used_mb: u64,
    pub allocations: usize,
}

#[derive(Debug, Clone, Copy)]
struct DeviceCapacity {
    total_mb: u64,
    used_mb: u64,
}

impl DeviceCapacity {
    fn free_mb(&self) -> u64 {
        self.total_mb.saturating_sub(self.used_mb)
    }
}

#[derive(Debug, Default)]
struct Ledger {
    devices: BTreeMap<DeviceId, DeviceCapacity>,
    allocations: HashMap<u64, AllocationTicket>,
    next_id: u64,
}

impl Ledger {
    fn candidates(&self, preference: DevicePreference) -> Vec<DeviceId> {
        let mut gpus: Vec<(DeviceId, u64)> = self
            .devices
            .iter()
            .filter(|(id, _)| id.is_gpu())
            .map(|(id, cap)| (*id, cap.free_mb()))
            .collect();
        // Most free memory first; ties keep index order.
        gpus.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let gpus = gpus.into_iter().map(|(id, _)| id);

        match preference {
            DevicePreference::Gpu => gpus.collect(),
            DevicePreference::Cpu => vec![DeviceId::Cpu],
            DevicePreference::Any => gpus.chain(std::iter::once(DeviceId::Cpu)).collect(),
            DevicePreference::Device(id) => vec![id],
        }
    }

    fn release(&mut self, ticket_id: u64) -> bool {
        let Some(ticket) = self.allocations.remove(&ticket_id) else {
            return false;
        };
        if let Some(cap) = self.devices.get_mut(&ticket.device) {
            cap.used_mb = cap.used_mb.saturating_sub(ticket.amount_mb);
        }
        true
    }
}

/// Thread-safe device memory accounting.
pub struct ResourceManager {
    ledger: Mutex<Ledger>,
}

impl ResourceManager {
    /// Build a manager over a fixed device inventory.
    pub fn new(devices: Vec<DeviceSpec>) -> anyhow::Result<Self> {
        if devices.is_empty() {
            return Err(anyhow::anyhow!("resource manager needs at least one device"));
        }

        let mut ledger = Ledger::default();
        for spec in devices {
            if ledger
                .devices
                .insert(spec.id, DeviceCapacity { total_mb: spec.total_mb, used_mb: 0 })
                .is_some()
            {
                return Err(anyhow::anyhow!("device {} declared twice", spec.id));
            }
            info!("Device {}: {} MiB", spec.id, spec.total_mb);
        }

        Ok(Self {
            ledger: Mutex::new(ledger),
        })
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve `amount_mb` on the first device matching `preference` that
    /// can hold it entirely.
    pub fn allocate(
        &self,
        preference: DevicePreference,
        amount_mb: u64,
        owner: ModelKey,
    ) -> Result<AllocationTicket, ResourceExhausted> {
        let mut ledger = self.ledger();

        let chosen = ledger.candidates(preference).into_iter().find(|id| {
            ledger
                .devices
                .get(id)
                .map(|cap| cap.free_mb() >= amount_mb)
                .unwrap_or(false)
        });

        let Some(device) = chosen else {
            let largest_free_mb = ledger
                .candidates(preference)
                .iter()
                .filter_map(|id| ledger.devices.get(id))
                .map(DeviceCapacity::free_mb)
                .max()
                .unwrap_or(0);
            drop(ledger);

            warn!(
                owner = %owner,
                "Allocation of {} MiB on {} denied (largest free: {} MiB)",
                amount_mb, preference, largest_free_mb
            );
            return Err(ResourceExhausted {
                preference,
                requested_mb: amount_mb,
                largest_free_mb,
            });
        };

        ledger.next_id += 1;
        let ticket = AllocationTicket {
            id: ledger.next_id,
            device,
            amount_mb,
            owner,
        };
        if let Some(cap) = ledger.devices.get_mut(&device) {
            cap.used_mb += amount_mb;
        }
        ledger.allocations.insert(ticket.id, ticket.clone());
        let used = ledger.devices.get(&device).map(|c| c.used_mb).unwrap_or(0);
        drop(ledger);

        crate::metrics::set_device_memory(&device.to_string(), used);
        debug!(owner = %ticket.owner, device = %device, "Allocated {} MiB (ticket {})", amount_mb, ticket.id);
        Ok(ticket)
    }

    /// Return a ticket's memory. Releasing an unknown or already released
    /// ticket is a no-op and returns `false`.
    pub fn release(&self, ticket: &AllocationTicket) -> bool {
        let mut ledger = self.ledger();
        let released = ledger.release(ticket.id);
        let used = ledger.devices.get(&ticket.device).map(|c| c.used_mb).unwrap_or(0);
        drop(ledger);

        if released {
            crate::metrics::set_device_memory(&ticket.device.to_string(), used);
            debug!(owner = %ticket.owner, device = %ticket.device, "Released {} MiB (ticket {})", ticket.amount_mb, ticket.id);
        } else {
            debug!("Ticket {} already released", ticket.id);
        }
        released
    }

    /// Release every outstanding allocation. Safe to call repeatedly.
    pub fn release_all(&self) -> usize {
        let mut ledger = self.ledger();
        let ids: Vec<u64> = ledger.allocations.keys().copied().collect();
        let count = ids.into_iter().filter(|id| ledger.release(*id)).count();
        let devices: Vec<DeviceId> = ledger.devices.keys().copied().collect();
        drop(ledger);

        for device in devices {
            crate::metrics::set_device_memory(&device.to_string(), 0);
        }
        if count > 0 {
            info!("Released {} outstanding allocations", count);
        }
        count
    }

    pub fn usage(&self) -> Vec<DeviceUsage> {
        let ledger = self.ledger();
        ledger
            .devices
            .iter()
            .map(|(id, cap)| DeviceUsage {
                device: *id,
                total_mb: cap.total_mb,
                used_mb: cap.used_mb,
                allocations: ledger.allocations.values().filter(|t| t.device == *id).count(),
            })
            .collect()
    }

    pub fn used_mb(&self) -> u64 {
        self.ledger().devices.values().map(|c| c.used_mb).sum()
    }

    /// Tickets currently held for one model.
    pub fn allocations_for(&self, owner: &ModelKey) -> Vec<AllocationTicket> {
        self.ledger()
            .allocations
            .values()
            .filter(|t| &t.owner == owner)
            .cloned()
            .collect()
    }

    pub fn outstanding(&self) -> usize {
        self.ledger().allocations.len()
    }

    /// True when no device has any free memory left.
    pub fn is_exhausted(&self) -> bool {
        self.ledger().devices.values().all(|cap| cap.free_mb() == 0)
    }
}

/// Enumerate GPUs through NVML.
pub fn detect_gpus() -> Vec<DeviceSpec> {
    let Ok(nvml) = Nvml::init() else {
        warn!("NVML unavailable, no GPUs detected");
        return Vec::new();
    };
    let count = nvml.device_count().unwrap_or(0);
    let mut gpus = Vec::new();
    for index in 0..count {
        match nvml.device_by_index(index).and_then(|d| d.memory_info()) {
            Ok(memory) => {
                let total_mb = memory.total / 1024 / 1024;
                info!("Auto‑detected GPU {}: {} MiB", index, total_mb);
                gpus.push(DeviceSpec {
                    id: DeviceId::Gpu(index),
                    total_mb,
                });
            }
            Err(e) => warn!("Skipping GPU {}: {}", index, e),
        }
    }
    gpus
}

/// Available system memory, used as the CPU pool when not configured.
pub fn detect_cpu_memory_mb() -> u64 {
    let mut system = System::new_all();
    system.refresh_memory();
    let available_mb = system.available_memory() / 1024 / 1024;
    info!("Auto‑detected available RAM: {} MiB", available_mb);
    available_mb
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(id: &str) -> ModelKey {
        ModelKey::new(id, semver::Version::new(1, 0, 0))
    }

    fn manager() -> ResourceManager {
        ResourceManager::new(vec![
            DeviceSpec { id: DeviceId::Gpu(0), total_mb: 4096 },
            DeviceSpec { id: DeviceId::Gpu(1), total_mb: 8192 },
            DeviceSpec { id: DeviceId::Cpu, total_mb: 16384 },
        ])
        .unwrap()
    }

    #[test]
    fn test_requires_a_device() {
        assert!(ResourceManager::new(Vec::new()).is_err());
    }

    #[test]
    fn test_rejects_duplicate_devices() {
        let specs = vec![
            DeviceSpec { id: DeviceId::Gpu(0), total_mb: 1 },
            DeviceSpec { id: DeviceId::Gpu(0), total_mb: 2 },
        ];
        assert!(ResourceManager::new(specs).is_err());
    }

    #[test]
    fn test_gpu_preference_picks_most_free() {
        let rm = manager();
        let ticket = rm.allocate(DevicePreference::Gpu, 1000, key("a")).unwrap();
        assert_eq!(ticket.device, DeviceId::Gpu(1));
    }

    #[test]
    fn test_models_share_a_device() {
        let rm = manager();
        let a = rm.allocate(DevicePreference::Device(DeviceId::Gpu(0)), 2000, key("a")).unwrap();
        let b = rm.allocate(DevicePreference::Device(DeviceId::Gpu(0)), 2000, key("b")).unwrap();
        assert_eq!(a.device, b.device);
        let err = rm
            .allocate(DevicePreference::Device(DeviceId::Gpu(0)), 200, key("c"))
            .unwrap_err();
        assert_eq!(err.largest_free_mb, 96);
    }

    #[test]
    fn test_any_falls_back_to_cpu() {
        let rm = manager();
        let ticket = rm.allocate(DevicePreference::Any, 12000, key("big")).unwrap();
        assert_eq!(ticket.device, DeviceId::Cpu);
    }

    #[test]
    fn test_all_or_nothing() {
        let rm = manager();
        let err = rm.allocate(DevicePreference::Gpu, 9000, key("huge")).unwrap_err();
        assert_eq!(err.requested_mb, 9000);
        assert_eq!(err.largest_free_mb, 8192);
        assert_eq!(rm.used_mb(), 0);
        assert_eq!(rm.outstanding(), 0);
    }

    #[test]
    fn test_oversized_denial_does_not_exhaust() {
        let rm = manager();
        assert!(rm.allocate(DevicePreference::Any, 1_000_000, key("huge")).is_err());
        assert!(!rm.is_exhausted());
    }

    #[test]
    fn test_exhausted_only_when_every_device_is_full() {
        let rm = manager();
        let gpu0 = rm.allocate(DevicePreference::Device(DeviceId::Gpu(0)), 4096, key("a")).unwrap();
        rm.allocate(DevicePreference::Device(DeviceId::Gpu(1)), 8192, key("b")).unwrap();
        assert!(!rm.is_exhausted());

        rm.allocate(DevicePreference::Cpu, 16384, key("c")).unwrap();
        assert!(rm.is_exhausted());

        assert!(rm.release(&gpu0));
        assert!(!rm.is_exhausted());
    }

    #[test]
    fn test_double_release_is_noop() {
        let rm = manager();
        let ticket = rm.allocate(DevicePreference::Cpu, 100, key("a")).unwrap();
        assert!(rm.release(&ticket));
        assert!(!rm.release(&ticket));
        assert_eq!(rm.used_mb(), 0);
    }

    #[test]
    fn test_allocations_for_owner() {
        let rm = manager();
        rm.allocate(DevicePreference::Cpu, 100, key("a")).unwrap();
        rm.allocate(DevicePreference::Cpu, 100, key("b")).unwrap();
        assert_eq!(rm.allocations_for(&key("a")).len(), 1);
    }

    #[test]
    fn test_device_strings() {
        assert_eq!("cuda:2".parse::<DeviceId>().unwrap(), DeviceId::Gpu(2));
        assert_eq!("CPU".parse::<DeviceId>().unwrap(), DeviceId::Cpu);
        assert!("tpu:0".parse::<DeviceId>().is_err());
        assert_eq!(
            "cuda:1".parse::<DevicePreference>().unwrap(),
            DevicePreference::Device(DeviceId::Gpu(1))
        );
        let json = serde_json::to_string(&DevicePreference::Gpu).unwrap();
        assert_eq!(json, "\"gpu\"");
    }

    #[test]
    fn test_concurrent_allocations_never_overcommit() {
        let rm = std::sync::Arc::new(
            ResourceManager::new(vec![DeviceSpec { id: DeviceId::Gpu(0), total_mb: 1000 }]).unwrap(),
        );
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let rm = rm.clone();
                std::thread::spawn(move || {
                    rm.allocate(DevicePreference::Gpu, 100, key(&format!("m{}", i))).is_ok()
                })
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(granted, 10);
        assert_eq!(rm.outstanding(), 10);
        assert_eq!(rm.used_mb(), 1000);
    }

    proptest! {
        #[test]
        fn prop_release_all_then_releases_leaves_zero(
            sizes in proptest::collection::vec(1u64..2048, 0..24),
            early in proptest::collection::vec(any::<bool>(), 24),
        ) {
            let rm = manager();
            let tickets: Vec<_> = sizes
                .iter()
                .enumerate()
                .filter_map(|(i, size)| rm.allocate(DevicePreference::Any, *size, key(&format!("m{}", i))).ok())
                .collect();

            for (ticket, release_early) in tickets.iter().zip(early.iter()) {
                if *release_early {
                    rm.release(ticket);
                }
            }

            rm.release_all();
            for ticket in &tickets {
                prop_assert!(!rm.release(ticket));
            }
            prop_assert_eq!(rm.used_mb(), 0);
            prop_assert_eq!(rm.outstanding(), 0);
            prop_assert!(rm.usage().iter().all(|u| u.used_mb == 0 && u.allocations == 0));
        }
    }
}
