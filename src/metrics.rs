//! System metrics feeding heartbeat reports. Pluggable so tests can
//! substitute fixed values.

use std::sync::Mutex;

use sysinfo::System;

pub trait SystemMetrics: Send + Sync {
    /// Used memory in bytes.
    fn memory_usage(&self) -> u64;
    /// Aggregate CPU usage in percent.
    fn cpu_usage(&self) -> f32;
}

pub struct SysinfoMetrics {
    system: Mutex<System>,
}

impl SysinfoMetrics {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMetrics for SysinfoMetrics {
    fn memory_usage(&self) -> u64 {
        let mut sys = self.system.lock().expect("metrics mutex poisoned");
        sys.refresh_memory();
        sys.used_memory()
    }

    fn cpu_usage(&self) -> f32 {
        let mut sys = self.system.lock().expect("metrics mutex poisoned");
        sys.refresh_cpu_usage();
        sys.global_cpu_usage()
    }
}

/// Fixed-value metrics source for tests.
pub struct StaticMetrics {
    pub memory: u64,
    pub cpu: f32,
}

impl SystemMetrics for StaticMetrics {
    fn memory_usage(&self) -> u64 {
        self.memory
    }

    fn cpu_usage(&self) -> f32 {
        self.cpu
    }
}
