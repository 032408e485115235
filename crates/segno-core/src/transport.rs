//! Shared transport state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Play/loop state shared by the UI, the audio callback and the MIDI
/// threads. Every field is atomic; readers tolerate values that are one
/// period stale.
#[derive(Debug, Default)]
pub struct TransportState {
    playing: AtomicBool,
    looping: AtomicBool,
    loop_start: AtomicU64,
    loop_end: AtomicU64,
    play_head: AtomicU64,
}

impl TransportState {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    pub fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::Release);
    }

    #[inline]
    pub fn is_looping(&self) -> bool {
        self.looping.load(Ordering::Acquire)
    }

    #[inline]
    pub fn loop_start(&self) -> u64 {
        self.loop_start.load(Ordering::Acquire)
    }

    #[inline]
    pub fn loop_end(&self) -> u64 {
        self.loop_end.load(Ordering::Acquire)
    }

    /// Set the loop range in frames. An empty range disables looping.
    pub fn set_loop(&self, start: u64, end: u64) {
        if end > start {
            self.loop_start.store(start, Ordering::Release);
            self.loop_end.store(end, Ordering::Release);
            self.looping.store(true, Ordering::Release);
        } else {
            self.looping.store(false, Ordering::Release);
        }
    }

    pub fn clear_loop(&self) {
        self.looping.store(false, Ordering::Release);
    }

    #[inline]
    pub fn play_head(&self) -> u64 {
        self.play_head.load(Ordering::Acquire)
    }

    pub fn set_play_head(&self, frame: u64) {
        self.play_head.store(frame, Ordering::Release);
    }
}
