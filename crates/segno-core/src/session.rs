//! Trait seams towards the session model and the audio engine.

use crate::{MidiEvent, SessionCursor, Timebase, TransportState};

/// Stable identifier of a MIDI track view inside the engine's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub usize);

/// Receives the events a session emits while rendering a frame window.
///
/// `time` is the event's absolute position in ticks; `gain` is the track's
/// current output gain, folded into note velocities by the scheduler.
pub trait EventSink {
    fn emit(&mut self, track: TrackId, event: &MidiEvent, time: u64, gain: f32);
}

impl<F> EventSink for F
where
    F: FnMut(TrackId, &MidiEvent, u64, f32),
{
    fn emit(&mut self, track: TrackId, event: &MidiEvent, time: u64, gain: f32) {
        self(track, event, time, gain)
    }
}

/// The session as the sequencing core sees it: a timebase, a transport,
/// and an iterable stream of clip events.
pub trait Session: Timebase {
    fn transport(&self) -> &TransportState;

    /// Emit every clip event that falls in `[start_frame, end_frame)` to
    /// `sink`, in session iteration order.
    fn process(
        &self,
        cursor: &SessionCursor,
        start_frame: u64,
        end_frame: u64,
        sink: &mut dyn EventSink,
    );

    /// Re-emit a single track's events in `[start_frame, end_frame)`.
    /// Used to re-render the already-scheduled window after an unmute.
    fn process_track(
        &self,
        track: TrackId,
        start_frame: u64,
        end_frame: u64,
        sink: &mut dyn EventSink,
    );
}

/// Read-only view of the audio engine's clock, the authoritative time
/// source the MIDI queue is slaved to.
pub trait AudioClock: Send + Sync {
    /// Current frame of the audio session cursor (the play head).
    fn frame(&self) -> u64;

    /// Monotonic processed-frame counter, unaffected by seeks.
    fn frame_time(&self) -> u64;
}
