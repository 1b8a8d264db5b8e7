// Completion aggregation across upstream relays.
// One pending operation (a subscription waiting for end-of-stored-events, or
// a publish waiting for acknowledgements) is fanned out to N upstreams. The
// tracker fires its consolidated signal exactly once: when every expected
// upstream has reported, when the optional delivery limit is reached, or
// when the deadline elapses.
//
// Firing removes the tracker from the registry under the lock, so the
// consolidated signal cannot be emitted twice. A generation number keeps a
// stale deadline from firing a tracker re-registered under the same key.
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    // Every expected upstream reported.
    Covered,
    // The delivery cap was reached first.
    LimitReached,
    // The deadline elapsed first.
    TimedOut,
}

impl CompletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionReason::Covered => "covered",
            CompletionReason::LimitReached => "limit",
            CompletionReason::TimedOut => "timeout",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub reason: CompletionReason,
    pub reported: usize,
    pub expected: usize,
}

type OnFire = Box<dyn FnOnce(Completion) + Send>;

struct Tracker {
    generation: u64,
    expected: usize,
    reporters: HashSet<String>,
    deliveries: usize,
    limit: Option<usize>,
    on_fire: OnFire,
    deadline: AbortHandle,
}

struct Registry<K> {
    trackers: HashMap<K, Tracker>,
    next_generation: u64,
}

/// Registry of pending completion trackers keyed by operation id.
pub struct CompletionAggregator<K> {
    registry: Arc<Mutex<Registry<K>>>,
    window: Duration,
    op: &'static str,
}

impl<K> CompletionAggregator<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new(op: &'static str, window: Duration) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                trackers: HashMap::new(),
                next_generation: 0,
            })),
            window,
            op,
        }
    }

    /// Start tracking `key`. A tracker already registered under the same key
    /// is cancelled without firing.
    ///
    /// With `expected == 0` the tracker can only complete by limit or deadline.
    pub fn track<F>(&self, key: K, expected: usize, limit: Option<usize>, on_fire: F)
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        let mut registry = self.registry.lock();
        let generation = registry.next_generation;
        registry.next_generation += 1;

        let deadline = {
            let registry = Arc::downgrade(&self.registry);
            let key = key.clone();
            let window = self.window;
            let op = self.op;
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                expire(registry, key, generation, op);
            })
            .abort_handle()
        };

        let tracker = Tracker {
            generation,
            expected,
            reporters: HashSet::new(),
            deliveries: 0,
            limit,
            on_fire: Box::new(on_fire),
            deadline,
        };
        if let Some(previous) = registry.trackers.insert(key, tracker) {
            previous.deadline.abort();
        }
    }

    /// Record a completion signal from `source`. Repeated signals from the
    /// same source count once. Returns the completion if this signal fired it.
    pub fn signal(&self, key: &K, source: &str) -> Option<Completion> {
        let tracker = {
            let mut registry = self.registry.lock();
            let tracker = registry.trackers.get_mut(key)?;
            tracker.reporters.insert(source.to_string());
            if tracker.expected == 0 || tracker.reporters.len() < tracker.expected {
                return None;
            }
            registry.trackers.remove(key)?
        };
        Some(finish(tracker, CompletionReason::Covered, self.op, true))
    }

    /// Count one forwarded delivery toward the optional limit.
    pub fn record_delivery(&self, key: &K) -> Option<Completion> {
        let tracker = {
            let mut registry = self.registry.lock();
            let tracker = registry.trackers.get_mut(key)?;
            tracker.deliveries += 1;
            let limit = tracker.limit?;
            if tracker.deliveries < limit {
                return None;
            }
            registry.trackers.remove(key)?
        };
        Some(finish(tracker, CompletionReason::LimitReached, self.op, true))
    }

    /// Drop a pending tracker without firing it.
    pub fn cancel(&self, key: &K) -> bool {
        let removed = self.registry.lock().trackers.remove(key);
        match removed {
            Some(tracker) => {
                tracker.deadline.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.registry.lock().trackers.contains_key(key)
    }

    pub fn pending(&self) -> usize {
        self.registry.lock().trackers.len()
    }
}

impl<K> Drop for CompletionAggregator<K> {
    fn drop(&mut self) {
        for (_, tracker) in self.registry.lock().trackers.drain() {
            tracker.deadline.abort();
        }
    }
}

fn expire<K>(registry: Weak<Mutex<Registry<K>>>, key: K, generation: u64, op: &'static str)
where
    K: Eq + Hash,
{
    let Some(registry) = registry.upgrade() else {
        return;
    };
    let tracker = {
        let mut registry = registry.lock();
        match registry.trackers.get(&key) {
            Some(tracker) if tracker.generation == generation => registry.trackers.remove(&key),
            _ => None,
        }
    };
    if let Some(tracker) = tracker {
        finish(tracker, CompletionReason::TimedOut, op, false);
    }
}

// Runs outside the registry lock so callbacks may touch the aggregator.
fn finish(
    tracker: Tracker,
    reason: CompletionReason,
    op: &'static str,
    abort_deadline: bool,
) -> Completion {
    if abort_deadline {
        tracker.deadline.abort();
    }
    let completion = Completion {
        reason,
        reported: tracker.reporters.len(),
        expected: tracker.expected,
    };
    metrics::counter!("relaymux_completions_total", "op" => op, "reason" => reason.as_str())
        .increment(1);
    (tracker.on_fire)(completion);
    completion
}
