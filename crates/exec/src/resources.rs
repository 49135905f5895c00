//! Host memory/load probe backing think preconditions.

use async_trait::async_trait;
use sysinfo::System;
use tokio::sync::Mutex;

use foreman_core::{ResourceProbe, ResourceSnapshot};

pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self { system: Mutex::new(System::new()) }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceProbe for SysinfoProbe {
    async fn snapshot(&self) -> ResourceSnapshot {
        let mut system = self.system.lock().await;
        system.refresh_memory();
        ResourceSnapshot {
            free_memory_mb: system.available_memory() / (1024 * 1024),
            total_memory_mb: system.total_memory() / (1024 * 1024),
            load_average: System::load_average().one,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_reports_plausible_memory() {
        let probe = SysinfoProbe::new();
        let snapshot = probe.snapshot().await;
        assert!(snapshot.total_memory_mb > 0);
        assert!(snapshot.free_memory_mb <= snapshot.total_memory_mb);
    }
}
