// Upstream relay pool and subscription multiplexing.
// Many client sessions share one connection per configured relay. Client
// subscription ids are rewritten to be unique upstream, inbound frames are
// deduplicated across relays and routed back to the owning session, and
// completion signals from N relays are folded into one per operation.
use relaymux_storage::StorageError;

pub mod aggregator;
pub mod config;
pub mod pool;
pub mod rewriter;
pub mod session;
pub mod upstream;

pub use aggregator::{Completion, CompletionAggregator, CompletionReason};
pub use config::PoolConfig;
pub use pool::{FanIn, Pool, PoolStats};
pub use rewriter::{ClientId, Rewriter, SubscriptionMapping};
pub use session::ClientSession;
pub use upstream::{UpstreamSnapshot, UpstreamState};

pub type Result<T> = std::result::Result<T, PoolError>;

#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    #[error(transparent)]
    MalformedFrame(#[from] relaymux_wire::Error),
    #[error("unknown subscription: {0}")]
    UnknownSubscription(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("cache fault: {0}")]
    CacheUnavailable(#[from] StorageError),
}

impl PoolError {
    /// Short label used for the dropped-frame metric.
    pub fn reason(&self) -> &'static str {
        match self {
            PoolError::MalformedFrame(_) => "malformed",
            PoolError::UnknownSubscription(_) => "unknown_subscription",
            PoolError::UpstreamUnavailable(_) => "upstream_unavailable",
            PoolError::CacheUnavailable(_) => "cache",
        }
    }
}

/// Relay lifecycle notifications published by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    RelayAvailable { url: String },
    RelayLost { url: String },
    RelayBackoff { url: String, retry_in_ms: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_frames_keep_the_wire_message() {
        let wire = relaymux_wire::Message::parse("[]").expect_err("empty frame");
        let text = wire.to_string();
        let err = PoolError::from(wire);
        assert_eq!(err.to_string(), text);
        assert_eq!(err.reason(), "malformed");
    }

    #[test]
    fn cache_faults_are_wrapped() {
        let err = PoolError::from(StorageError::Unavailable("down".to_string()));
        assert_eq!(err.to_string(), "cache fault: cache unavailable: down");
        assert_eq!(err.reason(), "cache");
    }
}
