//! Session cursor: a read/write position over the session event stream.

use std::sync::atomic::{AtomicU64, Ordering};

/// A position over the session's event stream, projected into two domains:
/// `frame` is the session-relative playback position (moved by seeks and
/// loop wraps), while `frame_time` is a monotonic counter of processed
/// frames that seeks never touch. The audio/MIDI drift check compares the
/// two engines' `frame_time` counters, so it keeps working across locates.
///
/// All fields are atomic so the owning engine can share one cursor between
/// its output thread (writer) and the audio callback's `sync()` predicate
/// (reader).
#[derive(Debug, Default)]
pub struct SessionCursor {
    frame: AtomicU64,
    frame_time: AtomicU64,
}

impl SessionCursor {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    #[inline]
    pub fn frame_time(&self) -> u64 {
        self.frame_time.load(Ordering::Acquire)
    }

    /// Move the playback position. `frame_time` is left alone.
    #[inline]
    pub fn seek(&self, frame: u64) {
        self.frame.store(frame, Ordering::Release);
    }

    /// Account for `frames` processed frames.
    #[inline]
    pub fn advance(&self, frames: u64) {
        self.frame_time.fetch_add(frames, Ordering::AcqRel);
    }

    /// Rewind both projections to zero.
    pub fn reset(&self) {
        self.frame.store(0, Ordering::Release);
        self.frame_time.store(0, Ordering::Release);
    }
}
