//! Frame/tick timebase conversions.

use crate::AtomicFloat;

/// Conversion between the audio frame domain and the musical tick domain.
///
/// The sequencing core only ever converts through this trait; sessions with
/// tempo maps provide their own implementation.
pub trait Timebase: Send + Sync {
    fn sample_rate(&self) -> u32;

    /// Current tempo in beats per minute.
    fn tempo(&self) -> f32;

    /// Ticks per quarter note (PPQ).
    fn ticks_per_beat(&self) -> u32;

    fn tick_from_frame(&self, frame: u64) -> u64;

    fn frame_from_tick(&self, tick: u64) -> u64;
}

/// Fixed-tempo timebase: one tempo, one meter, no tempo map.
#[derive(Debug)]
pub struct LinearTimebase {
    sample_rate: u32,
    ticks_per_beat: u32,
    tempo: AtomicFloat,
}

impl LinearTimebase {
    pub fn new(sample_rate: u32, tempo: f32, ticks_per_beat: u32) -> Self {
        Self {
            sample_rate,
            ticks_per_beat,
            tempo: AtomicFloat::new(tempo),
        }
    }

    pub fn set_tempo(&self, tempo: f32) {
        self.tempo.set(tempo);
    }

    #[inline]
    fn ticks_per_frame(&self) -> f64 {
        let ticks_per_second =
            (self.tempo.get() as f64 / 60.0) * self.ticks_per_beat as f64;
        ticks_per_second / self.sample_rate as f64
    }
}

impl Timebase for LinearTimebase {
    #[inline]
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[inline]
    fn tempo(&self) -> f32 {
        self.tempo.get()
    }

    #[inline]
    fn ticks_per_beat(&self) -> u32 {
        self.ticks_per_beat
    }

    #[inline]
    fn tick_from_frame(&self, frame: u64) -> u64 {
        (frame as f64 * self.ticks_per_frame()).round() as u64
    }

    #[inline]
    fn frame_from_tick(&self, tick: u64) -> u64 {
        (tick as f64 / self.ticks_per_frame()).round() as u64
    }
}

impl Default for LinearTimebase {
    fn default() -> Self {
        Self::new(48_000, 120.0, 96)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_second_of_ticks() {
        // 120 BPM at 96 PPQ: one second is two beats, 192 ticks.
        let tb = LinearTimebase::new(48_000, 120.0, 96);
        assert_eq!(tb.tick_from_frame(48_000), 192);
        assert_eq!(tb.frame_from_tick(192), 48_000);
    }

    #[test]
    fn test_roundtrip() {
        let tb = LinearTimebase::new(44_100, 140.0, 960);
        for tick in [0u64, 1, 480, 960, 123_456] {
            let frame = tb.frame_from_tick(tick);
            let back = tb.tick_from_frame(frame);
            assert!(
                back.abs_diff(tick) <= 1,
                "tick {} -> frame {} -> tick {}",
                tick,
                frame,
                back
            );
        }
    }

    #[test]
    fn test_tempo_change_rescales() {
        let tb = LinearTimebase::new(48_000, 120.0, 96);
        tb.set_tempo(240.0);
        assert_eq!(tb.tick_from_frame(48_000), 384);
    }
}
