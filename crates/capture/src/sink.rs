//! Emission sink: the bounded queue and the line-oriented diagnostic stream.
//!
//! One JSON object per line is the whole contract with the out-of-process
//! consumer; the queue exists so diagnostics can show recent traffic without
//! re-reading the stream.

use std::{
    collections::VecDeque,
    io::Write,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use {
    serde::Serialize,
    tracing::{debug, warn},
};

use crate::{dedup::DedupStore, message::CapturedMessage};

/// Non-message status event on the emission stream.
#[derive(Debug, Clone, Serialize)]
pub struct SystemRecord {
    pub system: bool,
    pub content: String,
    pub important: bool,
}

impl SystemRecord {
    #[must_use]
    pub fn new(content: impl Into<String>, important: bool) -> Self {
        Self {
            system: true,
            content: content.into(),
            important,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum EmittedRecord {
    Message(CapturedMessage),
    System(SystemRecord),
}

pub struct EmissionSink {
    dedup: Arc<DedupStore>,
    capacity: usize,
    queue: Mutex<VecDeque<EmittedRecord>>,
    writer: Mutex<Box<dyn Write + Send>>,
    emitted: AtomicU64,
    suppressed: AtomicU64,
    dropped_empty: AtomicU64,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl EmissionSink {
    #[must_use]
    pub fn new(dedup: Arc<DedupStore>, capacity: usize, writer: Box<dyn Write + Send>) -> Self {
        Self {
            dedup,
            capacity,
            queue: Mutex::new(VecDeque::new()),
            writer: Mutex::new(writer),
            emitted: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            dropped_empty: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn to_stdout(dedup: Arc<DedupStore>, capacity: usize) -> Self {
        Self::new(dedup, capacity, Box::new(std::io::stdout()))
    }

    /// Emit one message. Empty content is dropped, already-seen identifiers
    /// are suppressed; returns whether a record was written.
    pub fn emit(&self, message: CapturedMessage) -> bool {
        if message.content.trim().is_empty() {
            self.dropped_empty.fetch_add(1, Ordering::Relaxed);
            debug!(id = %message.id, source = %message.source, "dropped empty-content message");
            return false;
        }
        if let Some(key) = message.dedup_key() {
            if !self.dedup.should_emit(&key) {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, source = %message.source, "suppressed duplicate");
                return false;
            }
        }
        debug!(id = %message.id, source = %message.source, "emit");
        self.emitted.fetch_add(1, Ordering::Relaxed);
        self.push(EmittedRecord::Message(message));
        true
    }

    pub fn emit_system(&self, content: impl Into<String>, important: bool) {
        self.push(EmittedRecord::System(SystemRecord::new(content, important)));
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        lock(&self.queue).len()
    }

    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn dropped_empty(&self) -> u64 {
        self.dropped_empty.load(Ordering::Relaxed)
    }

    fn push(&self, record: EmittedRecord) {
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(error) => {
                warn!(error = %error, "record serialization failed");
                return;
            },
        };

        {
            let mut queue = lock(&self.queue);
            queue.push_back(record);
            while queue.len() > self.capacity {
                queue.pop_front();
            }
        }

        let mut writer = lock(&self.writer);
        if let Err(error) = writeln!(writer, "{line}").and_then(|()| writer.flush()) {
            warn!(error = %error, "emission stream write failed");
        }
    }
}
