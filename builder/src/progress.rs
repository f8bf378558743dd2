//! Throttled byte-progress reporting for blob transfers.

use std::time::{Duration, Instant};

use lateen_core::event::{BuildEvent, EventEmitter};

const EMIT_INTERVAL: Duration = Duration::from_millis(200);

/// Accumulates byte deltas and emits [`BuildEvent::BlobProgress`] at most
/// once per interval, plus a final event with the exact total on finish.
pub struct ThrottledProgress {
    emitter: EventEmitter,
    description: String,
    total_bytes: Option<u64>,
    bytes: u64,
    last_emit: Instant,
}

impl ThrottledProgress {
    pub fn new(
        emitter: EventEmitter,
        description: impl Into<String>,
        total_bytes: Option<u64>,
    ) -> Self {
        Self {
            emitter,
            description: description.into(),
            total_bytes,
            bytes: 0,
            last_emit: Instant::now(),
        }
    }

    pub fn advance(&mut self, delta: u64) {
        self.bytes += delta;
        if self.last_emit.elapsed() >= EMIT_INTERVAL {
            self.emit();
            self.last_emit = Instant::now();
        }
    }

    pub fn finish(mut self) {
        // Force the final count out even when inside the throttle window.
        self.emit();
    }

    fn emit(&mut self) {
        self.emitter.emit(BuildEvent::BlobProgress {
            description: self.description.clone(),
            bytes: self.bytes,
            total_bytes: self.total_bytes,
        });
    }
}
