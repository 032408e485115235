//! Sliding-window MIDI activity monitor.
//!
//! Feeds the UI meters: producers (the scheduler and the input thread)
//! enqueue `(kind, value, tick)` triples, consumers read a peak `value()`
//! and an event `count()` at frame granularity. Scheduled events land in a
//! ring of time slots so a meter reads the peak of what is *sounding now*
//! rather than of what was *scheduled a second ahead*; unscheduled events
//! go to a direct slot read on the next sweep.
//!
//! Each slot is a pair of atomics touched by exactly one producer and one
//! consumer. A racing producer may lose a max to a concurrent sweep; that
//! costs one meter flicker, never correctness, so everything is relaxed.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::event::EventKind;
use segno_core::AtomicFloat;

/// Number of ring slots. Must be a power of two.
pub const QUEUE_SIZE: usize = 16;
const QUEUE_MASK: usize = QUEUE_SIZE - 1;

/// Process-wide slot geometry, derived from the read-ahead window and the
/// current tempo. Recomputed by the transport facade on every transport
/// change and swapped in atomically; monitors read an immutable snapshot
/// per call.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonitorClock {
    /// Audio frames covered by one slot.
    pub frame_slot: u64,
    /// MIDI ticks covered by one slot.
    pub tick_slot: u64,
}

/// Shared handle to the monitor clock snapshot.
pub type SharedMonitorClock = Arc<ArcSwap<MonitorClock>>;

pub fn shared_monitor_clock() -> SharedMonitorClock {
    Arc::new(ArcSwap::from_pointee(MonitorClock::default()))
}

#[derive(Debug, Default)]
struct Slot {
    value: AtomicU8,
    count: AtomicU32,
}

#[derive(Debug)]
pub struct MidiMonitor {
    clock: SharedMonitorClock,
    slots: [Slot; QUEUE_SIZE],
    direct_value: AtomicU8,
    direct_count: AtomicU32,
    queue_index: AtomicUsize,
    frame_start: AtomicU64,
    tick_start: AtomicU64,
    gain: AtomicFloat,
    panning: AtomicFloat,
}

impl MidiMonitor {
    pub fn new(clock: SharedMonitorClock) -> Self {
        Self {
            clock,
            slots: std::array::from_fn(|_| Slot::default()),
            direct_value: AtomicU8::new(0),
            direct_count: AtomicU32::new(0),
            queue_index: AtomicUsize::new(0),
            frame_start: AtomicU64::new(0),
            tick_start: AtomicU64::new(0),
            gain: AtomicFloat::new(1.0),
            panning: AtomicFloat::new(0.0),
        }
    }

    pub fn gain(&self) -> f32 {
        self.gain.get()
    }

    pub fn set_gain(&self, gain: f32) {
        self.gain.set(gain);
    }

    pub fn panning(&self) -> f32 {
        self.panning.get()
    }

    pub fn set_panning(&self, panning: f32) {
        self.panning.set(panning);
    }

    /// Producer side. Scheduled values (tick beyond the queue head) land
    /// in their time slot; everything else is a direct value. Only NoteOn
    /// velocities compete for the peak, but every event is counted.
    pub fn enqueue(&self, kind: EventKind, value: u8, tick: u64) {
        let clock = **self.clock.load();
        let tick_start = self.tick_start.load(Ordering::Relaxed);
        if tick_start < tick && clock.tick_slot > 0 {
            // Out-of-window stragglers clamp into the last slot rather
            // than aliasing back onto the queue head.
            let offset = (((tick - tick_start) / clock.tick_slot) as usize).min(QUEUE_MASK);
            let index = (self.queue_index.load(Ordering::Relaxed) + offset) & QUEUE_MASK;
            let slot = &self.slots[index];
            if kind == EventKind::NoteOn {
                slot.value.fetch_max(value, Ordering::Relaxed);
            }
            slot.count.fetch_add(1, Ordering::Relaxed);
        } else {
            if kind == EventKind::NoteOn {
                self.direct_value.fetch_max(value, Ordering::Relaxed);
            }
            self.direct_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Consumer side: sweep every slot that has fallen due by
    /// `frame_time` (the audio engine's monotonic counter), fold their
    /// peaks into the direct value and their counts into the direct
    /// count, and return the gain-scaled peak in `[0, gain]`.
    pub fn value(&self, frame_time: u64) -> f32 {
        let mut value = self.direct_value.swap(0, Ordering::Relaxed);

        let clock = **self.clock.load();
        if clock.frame_slot > 0 {
            let mut frame_start = self.frame_start.load(Ordering::Relaxed);
            while frame_start < frame_time {
                let index = self.queue_index.load(Ordering::Relaxed);
                let slot = &self.slots[index];
                value = value.max(slot.value.swap(0, Ordering::Relaxed));
                let count = slot.count.swap(0, Ordering::Relaxed);
                if count > 0 {
                    self.direct_count.fetch_add(count, Ordering::Relaxed);
                }
                self.queue_index
                    .store((index + 1) & QUEUE_MASK, Ordering::Relaxed);
                frame_start += clock.frame_slot;
                self.tick_start.fetch_add(clock.tick_slot, Ordering::Relaxed);
            }
            self.frame_start.store(frame_start, Ordering::Relaxed);
        }

        self.gain.get() * value as f32 / 127.0
    }

    /// Events seen since the last call. Resets on read.
    pub fn count(&self) -> u32 {
        self.direct_count.swap(0, Ordering::Relaxed)
    }

    /// Re-anchor the ring. `frame_start` is the audio engine's current
    /// frame-time; `tick_start` the tick distance of that point from the
    /// play head.
    pub fn reset(&self, frame_start: u64, tick_start: u64) {
        self.direct_value.store(0, Ordering::Relaxed);
        self.direct_count.store(0, Ordering::Relaxed);
        self.queue_index.store(0, Ordering::Relaxed);
        self.frame_start.store(frame_start, Ordering::Relaxed);
        self.tick_start.store(tick_start, Ordering::Relaxed);
        for slot in &self.slots {
            slot.value.store(0, Ordering::Relaxed);
            slot.count.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const _: () = assert!(QUEUE_SIZE.is_power_of_two());

    fn clock(frame_slot: u64, tick_slot: u64) -> SharedMonitorClock {
        Arc::new(ArcSwap::from_pointee(MonitorClock {
            frame_slot,
            tick_slot,
        }))
    }

    #[test]
    fn test_direct_value_without_clock() {
        let monitor = MidiMonitor::new(shared_monitor_clock());
        monitor.enqueue(EventKind::NoteOn, 100, 0);
        assert!((monitor.value(0) - 100.0 / 127.0).abs() < 1e-6);
        // Value resets on read.
        assert_eq!(monitor.value(0), 0.0);
        assert_eq!(monitor.count(), 1);
        assert_eq!(monitor.count(), 0);
    }

    #[test]
    fn test_peak_within_window() {
        // frame_slot = 3000 frames; three NoteOns spread over two slots.
        let monitor = MidiMonitor::new(clock(3_000, 24));
        monitor.reset(0, 0);

        monitor.enqueue(EventKind::NoteOn, 90, 24);
        monitor.enqueue(EventKind::NoteOn, 120, 24);
        monitor.enqueue(EventKind::NoteOn, 40, 48);

        let value = monitor.value(3 * 3_000);
        assert!((value - 120.0 / 127.0).abs() < 1e-6, "value = {}", value);
        assert_eq!(monitor.count(), 3);
    }

    #[test]
    fn test_value_bounded_by_gain() {
        let monitor = MidiMonitor::new(shared_monitor_clock());
        monitor.set_gain(0.5);
        monitor.enqueue(EventKind::NoteOn, 127, 0);
        let value = monitor.value(0);
        assert!(value > 0.0 && value <= 0.5);
    }

    #[test]
    fn test_only_note_on_competes_for_peak() {
        let monitor = MidiMonitor::new(shared_monitor_clock());
        monitor.enqueue(EventKind::Controller, 127, 0);
        assert_eq!(monitor.value(0), 0.0);
        assert_eq!(monitor.count(), 1);
    }

    #[test]
    fn test_far_future_tick_clamps_to_last_slot() {
        let monitor = MidiMonitor::new(clock(3_000, 24));
        monitor.reset(0, 0);

        // 10_000 ticks is far beyond the 16-slot window.
        monitor.enqueue(EventKind::NoteOn, 99, 10_000);

        // Sweeping 15 slots must not surface it yet...
        let value = monitor.value(15 * 3_000);
        assert_eq!(value, 0.0);
        // ...the 16th sweep does.
        let value = monitor.value(16 * 3_000);
        assert!((value - 99.0 / 127.0).abs() < 1e-6);
    }

    #[test]
    fn test_reset_clears_everything() {
        let monitor = MidiMonitor::new(clock(3_000, 24));
        monitor.reset(0, 0);
        monitor.enqueue(EventKind::NoteOn, 90, 24);
        monitor.enqueue(EventKind::NoteOn, 80, 0);

        monitor.reset(96_000, 192);
        assert_eq!(monitor.value(96_000), 0.0);
        assert_eq!(monitor.count(), 0);
    }

    #[test]
    fn test_counts_fold_into_direct_on_sweep() {
        let monitor = MidiMonitor::new(clock(3_000, 24));
        monitor.reset(0, 0);

        monitor.enqueue(EventKind::NoteOn, 60, 24);
        monitor.enqueue(EventKind::NoteOff, 0, 24);
        assert_eq!(monitor.count(), 0, "scheduled counts not visible yet");

        let _ = monitor.value(2 * 3_000);
        assert_eq!(monitor.count(), 2);
    }
}
