//! Tuning constants. These are reference defaults, not
//! correctness boundaries — all are overridable via [`crate::config::Config`].

/// Default shard count for the sharded KV stores (C1). Power of two.
pub const DEFAULT_SHARD_COUNT: usize = 16;

/// Default transactions-per-batch allocation hint for income/spend phases (C5).
pub const DEFAULT_BATCH_SIZE: usize = 2_000;

/// Default worker count for `bulk_merge_concurrent`.
pub const DEFAULT_WORKERS: usize = 8;

/// `query_addresses_for_outpoints` worker pool multiplier (≈ cores × 4).
pub const QUERY_WORKER_CORES_MULTIPLIER: usize = 4;

/// Checkpoint sync cadence: call `sync()` on the data/metadata stores every K blocks.
pub const DEFAULT_SYNC_EVERY_BLOCKS: u64 = 30;

/// Default in-memory UTXO cache capacity. 0 disables the cache.
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 2_000_000;

/// Fraction of the cache evicted once it reaches capacity.
pub const CACHE_EVICTION_FRACTION: f64 = 0.10;

/// First-pass eviction threshold: entries older than `current_height - this` are dropped outright.
pub const CACHE_EVICTION_HEIGHT_WINDOW: u64 = 10_000;

/// Reorg detection window: compare the last W heights against the node on each tick.
pub const DEFAULT_REORG_WINDOW: u64 = 20;

/// Reorg polling interval.
pub const DEFAULT_REORG_POLL_SECS: u64 = 15;

/// Archive retention window, in blocks beyond the reorg window, before pruning (C2).
pub const DEFAULT_ARCHIVE_RETENTION_MARGIN: u64 = 500;

/// Number of most-recent blocks replayed into the cache on startup (C9).
pub const DEFAULT_WARMUP_DEPTH: u64 = 2_000;

/// Resident-memory ceiling that triggers a forced compaction cycle.
pub const DEFAULT_MEMORY_CEILING_BYTES: u64 = 6 * 1024 * 1024 * 1024;

/// Fixed backoff between retries of a failed block.
pub const BLOCK_RETRY_BACKOFF_SECS: u64 = 5;

/// Background counter (C8) sweep interval.
pub const DEFAULT_COUNTER_SWEEP_SECS: u64 = 60;

/// Bounded capacity of the fire-and-forget structured-log queue.
pub const LOG_QUEUE_CAPACITY: usize = 4_096;

/// Sample one in every N income-phase batches for a debug progress log.
pub const PROGRESS_LOG_SAMPLE_BATCHES: u64 = 100;
