//! Host snapshot attached to metrics jobs.

use serde::{Deserialize, Serialize};
use sysinfo::System;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub cpu_count: usize,
    /// 1, 5 and 15 minute load averages.
    pub load_avg: [f64; 3],
    pub host_uptime_secs: u64,
    /// Seconds since the engine started.
    pub engine_uptime_secs: u64,
}

impl SystemSnapshot {
    pub fn capture(engine_uptime_secs: u64) -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu_usage();

        let load = System::load_average();

        Self {
            memory_used_mb: sys.used_memory() / (1024 * 1024),
            memory_total_mb: sys.total_memory() / (1024 * 1024),
            cpu_count: sys.cpus().len(),
            load_avg: [load.one, load.five, load.fifteen],
            host_uptime_secs: System::uptime(),
            engine_uptime_secs,
        }
    }
}
