//! Memory watchdog (backpressure, §5).
//!
//! Samples this process's resident memory on a fixed interval via
//! `sysinfo`, publishes it as a gauge, and forces a compaction cycle across
//! the three sharded stores when it crosses `config.memory_ceiling_bytes`.
//! This is a coarse remedial action, not a scheduling primitive: it never
//! blocks the pipeline or reorg resolver, it just shrinks their RocksDB
//! footprint out of band.

use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Pid, System};
use tokio::sync::watch;

use crate::config::Config;
use crate::shard_store::ShardedStore;

const SAMPLE_INTERVAL_SECS: u64 = 30;

pub struct MemoryWatchdog {
    config: Arc<Config>,
    utxo_store: Arc<ShardedStore>,
    address_store: Arc<ShardedStore>,
    spend_store: Arc<ShardedStore>,
}

impl MemoryWatchdog {
    pub fn new(
        config: Arc<Config>,
        utxo_store: Arc<ShardedStore>,
        address_store: Arc<ShardedStore>,
        spend_store: Arc<ShardedStore>,
    ) -> Self {
        Self { config, utxo_store, address_store, spend_store }
    }

    /// One sample-and-react tick. Returns the sampled resident byte count.
    async fn tick(&self, system: &mut System) -> u64 {
        let pid = Pid::from_u32(std::process::id());
        system.refresh_process(pid);
        let resident_bytes = system.process(pid).map(|p| p.memory()).unwrap_or(0);

        crate::metrics::set_process_resident_memory_bytes(resident_bytes);

        if self.config.memory_ceiling_bytes > 0 && resident_bytes >= self.config.memory_ceiling_bytes {
            tracing::warn!(
                resident_bytes,
                ceiling_bytes = self.config.memory_ceiling_bytes,
                "resident memory over ceiling, forcing compaction"
            );
            for (name, store) in [
                ("utxo", &self.utxo_store),
                ("income", &self.address_store),
                ("spend", &self.spend_store),
            ] {
                if let Err(e) = store.compact_all().await {
                    tracing::warn!(store = name, error = %e, "forced compaction failed");
                }
            }
        }

        resident_bytes
    }

    /// Samples on a fixed interval until `stop` flips to true.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        let mut system = System::new();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(SAMPLE_INTERVAL_SECS)) => {}
                _ = stop.changed() => {
                    if *stop.borrow() {
                        return;
                    }
                    continue;
                }
            }

            if *stop.borrow() {
                return;
            }

            self.tick(&mut system).await;
        }
    }
}
