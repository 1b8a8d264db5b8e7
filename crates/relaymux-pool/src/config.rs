use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BACKOFF_RESET: Duration = Duration::from_secs(600);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(6);
pub const DEFAULT_MAPPING_TTL: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_millis(2400);
pub const DEFAULT_CLIENT_QUEUE: usize = 1024;
pub const DEFAULT_UPSTREAM_QUEUE: usize = 1024;

/// Plain values the pool runs with. Loading them is the caller's job.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    // Upstream relay URLs; fixed for the pool's lifetime.
    pub relays: Vec<String>,
    // Consecutive failed attempts before an upstream pauses.
    pub max_attempts: u32,
    // Length of that pause.
    pub backoff_reset: Duration,
    // Bound on a single dial.
    pub connect_timeout: Duration,
    // Lifetime of a duplicate-suppression record.
    pub dedup_ttl: Duration,
    // Lifetime of a subscription or publish mapping.
    pub mapping_ttl: Duration,
    // Deadline for end-of-stored-events and acknowledgement aggregation.
    pub completion_timeout: Duration,
    // Optional early-exit cap on deliveries before end-of-stored-events.
    pub event_limit: Option<usize>,
    // Per-client outbound queue depth; frames beyond it are dropped.
    pub client_queue: usize,
    // Per-upstream outbound queue depth.
    pub upstream_queue: usize,
}

impl PoolConfig {
    pub fn new(relays: Vec<String>) -> Self {
        Self {
            relays,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_reset: DEFAULT_BACKOFF_RESET,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            dedup_ttl: DEFAULT_DEDUP_TTL,
            mapping_ttl: DEFAULT_MAPPING_TTL,
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
            event_limit: None,
            client_queue: DEFAULT_CLIENT_QUEUE,
            upstream_queue: DEFAULT_UPSTREAM_QUEUE,
        }
    }
}
