//! Shared fixtures: a fixed-tempo session over in-memory clips and a
//! hand-cranked audio clock.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use segno_midi::{
    AudioClock, EventSink, LinearTimebase, MidiEvent, Session, SessionCursor, Timebase, TrackId,
    TransportState,
};

/// Audio clock the tests advance by hand.
#[derive(Default)]
pub struct TestClock {
    frame: AtomicU64,
    frame_time: AtomicU64,
}

impl TestClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn advance(&self, frames: u64) {
        self.frame.fetch_add(frames, Ordering::AcqRel);
        self.frame_time.fetch_add(frames, Ordering::AcqRel);
    }

    pub fn set_frame_time(&self, frame_time: u64) {
        self.frame_time.store(frame_time, Ordering::Release);
    }
}

impl AudioClock for TestClock {
    fn frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    fn frame_time(&self) -> u64 {
        self.frame_time.load(Ordering::Acquire)
    }
}

pub struct Clip {
    pub track: TrackId,
    pub events: Vec<MidiEvent>,
}

/// Fixed-tempo session emitting clip events by absolute frame position.
pub struct TestSession {
    pub timebase: LinearTimebase,
    pub transport: TransportState,
    pub clips: RwLock<Vec<Clip>>,
    pub gain: f32,
}

impl TestSession {
    pub fn new(sample_rate: u32, tempo: f32, ticks_per_beat: u32) -> Arc<Self> {
        Arc::new(Self {
            timebase: LinearTimebase::new(sample_rate, tempo, ticks_per_beat),
            transport: TransportState::new(),
            clips: RwLock::new(Vec::new()),
            gain: 1.0,
        })
    }

    pub fn add_clip(&self, track: TrackId, events: Vec<MidiEvent>) {
        self.clips.write().push(Clip { track, events });
    }

    fn emit_window(
        &self,
        only: Option<TrackId>,
        start_frame: u64,
        end_frame: u64,
        sink: &mut dyn EventSink,
    ) {
        for clip in self.clips.read().iter() {
            if only.is_some_and(|track| track != clip.track) {
                continue;
            }
            for event in &clip.events {
                let frame = self.timebase.frame_from_tick(event.tick as u64);
                if frame >= start_frame && frame < end_frame {
                    sink.emit(clip.track, event, event.tick as u64, self.gain);
                }
            }
        }
    }
}

impl Timebase for TestSession {
    fn sample_rate(&self) -> u32 {
        self.timebase.sample_rate()
    }

    fn tempo(&self) -> f32 {
        self.timebase.tempo()
    }

    fn ticks_per_beat(&self) -> u32 {
        self.timebase.ticks_per_beat()
    }

    fn tick_from_frame(&self, frame: u64) -> u64 {
        self.timebase.tick_from_frame(frame)
    }

    fn frame_from_tick(&self, tick: u64) -> u64 {
        self.timebase.frame_from_tick(tick)
    }
}

impl Session for TestSession {
    fn transport(&self) -> &TransportState {
        &self.transport
    }

    fn process(
        &self,
        _cursor: &SessionCursor,
        start_frame: u64,
        end_frame: u64,
        sink: &mut dyn EventSink,
    ) {
        self.emit_window(None, start_frame, end_frame, sink);
    }

    fn process_track(
        &self,
        track: TrackId,
        start_frame: u64,
        end_frame: u64,
        sink: &mut dyn EventSink,
    ) {
        self.emit_window(Some(track), start_frame, end_frame, sink);
    }
}
