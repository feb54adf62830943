use once_cell::sync::Lazy;
use std::time::Duration;

static CHUNK_SIZE: Lazy<usize> = Lazy::new(|| {
    std::env::var("IMPORT_CHUNK_SIZE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(500)
});

static CONCURRENCY: Lazy<usize> = Lazy::new(|| {
    std::env::var("IMPORT_CONCURRENCY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(4)
});

static STALE_AFTER_MINUTES: Lazy<u64> = Lazy::new(|| {
    std::env::var("IMPORT_STALE_AFTER_MINUTES")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(30)
});

#[derive(Clone, Debug)]
pub struct ImportConfig {
    /// Rows per batch handed to the upsert engine.
    pub chunk_size: usize,
    /// Concurrent chunk workers per run.
    pub concurrency: usize,
    pub retry_attempts: usize,
    pub retry_backoff: Duration,
    /// A RUNNING run older than this is considered stranded.
    pub stale_after: Duration,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            chunk_size: *CHUNK_SIZE,
            concurrency: *CONCURRENCY,
            retry_attempts: 4,
            retry_backoff: Duration::from_millis(150),
            stale_after: Duration::from_secs(*STALE_AFTER_MINUTES * 60),
        }
    }
}
