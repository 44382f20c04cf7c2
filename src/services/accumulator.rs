//! Stream accumulator: coalesces token deltas into flush units.
//!
//! Providers push raw deltas via [`StreamAccumulator::add`]; the executor's
//! streaming path drains flush units bounded by size, elapsed time, newline,
//! or sentence terminator, so the transport sees a handful of readable
//! chunks instead of a flood of single tokens.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Buffer rune count that forces a flush.
const FLUSH_MAX_CHARS: usize = 200;
/// Elapsed time since the last flush that forces a flush.
const FLUSH_MAX_INTERVAL: Duration = Duration::from_millis(300);
/// Sentence terminators (ASCII and CJK full-width).
const SENTENCE_TERMINATORS: [char; 6] = ['.', '?', '!', '。', '？', '！'];

#[derive(Debug)]
struct AccumulatorState {
    buffer: String,
    accumulated: String,
    last_flush: Instant,
}

/// Thread-safe coalescing buffer. All state sits under one mutex.
#[derive(Debug)]
pub struct StreamAccumulator {
    state: Mutex<AccumulatorState>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AccumulatorState {
                buffer: String::new(),
                accumulated: String::new(),
                last_flush: Instant::now(),
            }),
        }
    }

    /// Append streamed text to the pending buffer.
    pub fn add(&self, text: &str) {
        let mut state = self.state.lock().expect("accumulator mutex poisoned");
        state.buffer.push_str(text);
        state.accumulated.push_str(text);
    }

    /// Whether the pending buffer is ready to emit.
    pub fn should_flush(&self) -> bool {
        let state = self.state.lock().expect("accumulator mutex poisoned");
        if state.buffer.is_empty() {
            return false;
        }
        if state.buffer.chars().count() >= FLUSH_MAX_CHARS {
            return true;
        }
        if state.last_flush.elapsed() >= FLUSH_MAX_INTERVAL {
            return true;
        }
        if state.buffer.ends_with('\n') {
            return true;
        }
        state
            .buffer
            .trim_end_matches(' ')
            .chars()
            .last()
            .is_some_and(|c| SENTENCE_TERMINATORS.contains(&c))
    }

    /// Return and clear the pending buffer; None if empty.
    pub fn flush(&self) -> Option<String> {
        let mut state = self.state.lock().expect("accumulator mutex poisoned");
        if state.buffer.is_empty() {
            return None;
        }
        state.last_flush = Instant::now();
        Some(std::mem::take(&mut state.buffer))
    }

    /// Terminal flush: drain whatever is pending.
    pub fn flush_all(&self) -> Option<String> {
        self.flush()
    }

    /// Total text seen since creation. Never cleared.
    pub fn get_accumulated(&self) -> String {
        self.state
            .lock()
            .expect("accumulator mutex poisoned")
            .accumulated
            .clone()
    }

    pub fn has_pending(&self) -> bool {
        !self
            .state
            .lock()
            .expect("accumulator mutex poisoned")
            .buffer
            .is_empty()
    }
}

impl Default for StreamAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
