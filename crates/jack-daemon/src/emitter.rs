// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! The log emitter: one in-process bus, fan-out to
//! in-process backends and to every loaded plugin via `OnLogEvent`.
//! Delivery is best-effort and asynchronous — a full per-subscriber queue
//! drops the oldest record and increments a counter rather than blocking the
//! caller.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use dashmap::DashMap;
use jack_types::{LogLevel, LogRecord};
use jack_types::RpcRequest;
use tokio::sync::Notify;
use tokio::time::Duration;
use tracing::warn;

use crate::plugin::registry::PluginHandle;

const QUEUE_CAPACITY: usize = 256;
const PLUGIN_DEADLINE: Duration = Duration::from_secs(2);

/// Something the emitter can deliver a record to. Boxed/dyn since the bus
/// holds a heterogeneous set of subscribers (in-process backends, plugins).
pub trait LogSubscriber: Send + Sync {
    fn deliver(&self, record: LogRecord) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>>;
}

/// An in-process backend that records everything it receives — stands in
/// for the file/journal backends in tests.
#[derive(Default)]
pub struct NullBackend {
    received: StdMutex<Vec<LogRecord>>,
}

impl NullBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn received(&self) -> Vec<LogRecord> {
        self.received.lock().unwrap().clone()
    }
}

impl LogSubscriber for NullBackend {
    fn deliver(&self, record: LogRecord) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>> {
        self.received.lock().unwrap().push(record);
        Box::pin(async { Ok(()) })
    }
}

/// Fans a record out to one plugin's `OnLogEvent`. A plugin whose call
/// errors or times out is flagged `log_suppressed` and skipped by every
/// subsequent delivery until it is reloaded.
pub struct PluginSubscriber {
    pub handle: Arc<PluginHandle>,
}

impl LogSubscriber for PluginSubscriber {
    fn deliver(&self, record: LogRecord) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>> {
        Box::pin(async move {
            if self.handle.is_log_suppressed() {
                return Ok(());
            }
            let event = serde_json::to_value(&record).map_err(|e| e.to_string())?;
            match self.handle.client.call(RpcRequest::OnLogEvent { event }, PLUGIN_DEADLINE).await {
                Ok(_) => Ok(()),
                Err(e) => {
                    warn!(namespace = %self.handle.namespace, error = %e, "plugin rejected log event, suppressing");
                    self.handle.suppress_log();
                    Err(e.to_string())
                }
            }
        })
    }
}

/// A fixed-capacity FIFO guarded by a std mutex plus a `Notify` to wake the
/// draining task. Enqueue never blocks: a full queue drops its oldest entry.
struct BoundedQueue {
    items: StdMutex<VecDeque<LogRecord>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl BoundedQueue {
    fn new() -> Self {
        Self {
            items: StdMutex::new(VecDeque::with_capacity(QUEUE_CAPACITY)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, record: LogRecord) {
        let mut items = self.items.lock().unwrap();
        if items.len() >= QUEUE_CAPACITY {
            items.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        items.push_back(record);
        drop(items);
        self.notify.notify_one();
    }

    async fn pop(&self) -> LogRecord {
        loop {
            if let Some(record) = self.items.lock().unwrap().pop_front() {
                return record;
            }
            self.notify.notified().await;
        }
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct Emitter {
    queues: DashMap<String, Arc<BoundedQueue>>,
}

impl Emitter {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
        }
    }

    /// Register `subscriber` under `id`, spawning the task that drains its
    /// queue for the lifetime of the emitter (or until [`Self::unsubscribe`]).
    pub fn subscribe(&self, id: impl Into<String>, subscriber: Arc<dyn LogSubscriber>) {
        let id = id.into();
        let queue = Arc::new(BoundedQueue::new());
        self.queues.insert(id, queue.clone());

        tokio::spawn(async move {
            loop {
                let record = queue.pop().await;
                let _ = subscriber.deliver(record).await;
            }
        });
    }

    pub fn unsubscribe(&self, id: &str) {
        self.queues.remove(id);
    }

    /// Publish `record` to every subscriber. Non-blocking: this only
    /// enqueues.
    pub fn emit(&self, record: LogRecord) {
        for entry in self.queues.iter() {
            entry.value().push(record.clone());
        }
    }

    pub fn log(
        &self,
        level: LogLevel,
        component: impl Into<String>,
        message: impl Into<String>,
        fields: std::collections::BTreeMap<String, serde_json::Value>,
    ) {
        self.emit(LogRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level,
            component: component.into(),
            message: message.into(),
            fields,
        });
    }

    pub fn dropped_count(&self, id: &str) -> Option<u64> {
        self.queues.get(id).map(|q| q.dropped())
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record(message: &str) -> LogRecord {
        LogRecord {
            timestamp: "2026-01-01T00:00:00Z".into(),
            level: LogLevel::Info,
            component: "test".into(),
            message: message.into(),
            fields: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn delivers_to_subscribed_backend() {
        let emitter = Emitter::new();
        let backend = NullBackend::new();
        emitter.subscribe("null", backend.clone());

        emitter.emit(record("hello"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(backend.received().len(), 1);
        assert_eq!(backend.received()[0].message, "hello");
    }

    #[tokio::test]
    async fn full_queue_drops_oldest_and_counts() {
        let queue = BoundedQueue::new();
        for i in 0..QUEUE_CAPACITY + 5 {
            queue.push(record(&i.to_string()));
        }
        assert_eq!(queue.dropped(), 5);
        let first = queue.pop().await;
        assert_eq!(first.message, "5");
    }

    #[tokio::test]
    async fn unsubscribe_stops_future_delivery() {
        let emitter = Emitter::new();
        let backend = NullBackend::new();
        emitter.subscribe("null", backend.clone());
        emitter.unsubscribe("null");

        emitter.emit(record("after unsubscribe"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(backend.received().is_empty());
    }
}
