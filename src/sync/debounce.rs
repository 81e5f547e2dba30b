//! Debounced mid-run flush scheduling.
//!
//! Each observed `tool_result` schedules a background sync-out. Bursts
//! of writes coalesce into a single object-store pass: a trigger inside
//! the debounce window extends the window, and only one flush runs per
//! sandbox at a time. A trigger that lands while a flush is in flight
//! re-arms the window so nothing is lost.

use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

/// Factory for one flush pass. Failures are logged and retried on the
/// next trigger; they never abort the agent turn.
pub type FlushFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug)]
struct Entry {
    deadline: Instant,
    running: bool,
    rearmed: bool,
}

/// Coalesces flush triggers per key (one key per sandbox). Clones
/// share the same schedule.
#[derive(Clone)]
pub struct FlushScheduler {
    debounce: Duration,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl FlushScheduler {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Schedule (or extend) a debounced flush for `key`.
    pub async fn trigger(&self, key: &str, flush: FlushFn) {
        let mut entries = self.entries.lock().await;
        let deadline = Instant::now() + self.debounce;
        match entries.get_mut(key) {
            Some(entry) if entry.running => {
                entry.rearmed = true;
                entry.deadline = deadline;
            }
            Some(entry) => {
                entry.deadline = deadline;
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        deadline,
                        running: false,
                        rearmed: false,
                    },
                );
                let key = key.to_string();
                let entries = Arc::clone(&self.entries);
                tokio::spawn(run_flusher(key, entries, flush));
            }
        }
    }

    /// Number of keys with a pending or in-flight flush.
    pub async fn pending(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Wait until the key has no pending or in-flight flush. Used on
    /// the end-of-turn path so the final sync starts from quiet state.
    pub async fn settle(&self, key: &str) {
        loop {
            {
                let entries = self.entries.lock().await;
                if !entries.contains_key(key) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

async fn run_flusher(key: String, entries: Arc<Mutex<HashMap<String, Entry>>>, flush: FlushFn) {
    loop {
        // Wait out the (possibly extended) debounce window.
        loop {
            let deadline = {
                let mut map = entries.lock().await;
                let Some(entry) = map.get_mut(&key) else {
                    return;
                };
                if Instant::now() >= entry.deadline {
                    entry.running = true;
                    entry.rearmed = false;
                    break;
                }
                entry.deadline
            };
            tokio::time::sleep_until(deadline).await;
        }

        if let Err(e) = flush().await {
            warn!(key, "mid-run flush failed, will retry on next trigger: {e}");
        }

        let mut map = entries.lock().await;
        match map.get_mut(&key) {
            Some(entry) if entry.rearmed => {
                entry.running = false;
                entry.rearmed = false;
                entry.deadline = entry.deadline.max(Instant::now());
            }
            _ => {
                map.remove(&key);
                return;
            }
        }
    }
}
