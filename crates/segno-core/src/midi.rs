//! MIDI event model shared by the capture and playback paths.
//!
//! Core types live here and are re-exported by `segno-midi`, keeping the
//! session traits below free of a dependency cycle.

/// Channel-voice and system-exclusive event kinds the core schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NoteOn,
    NoteOff,
    KeyPressure,
    Controller,
    ProgramChange,
    ChannelPressure,
    PitchBend,
    Sysex,
}

/// A timestamped MIDI event.
///
/// `tick` is musical time relative to the owning clip or capture queue.
/// `data1`/`data2` carry note/velocity, controller/value or plain values
/// depending on `kind`. Note events may carry a `duration` in ticks, in
/// which case the backend owes a matching note-off. Sysex payloads are
/// owned by the event; the backend only ever borrows them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiEvent {
    pub tick: u32,
    pub kind: EventKind,
    pub channel: u8,
    pub data1: u8,
    pub data2: u8,
    pub duration: u32,
    pub sysex: Option<Box<[u8]>>,
}

impl MidiEvent {
    pub fn new(tick: u32, kind: EventKind, channel: u8, data1: u8, data2: u8) -> Self {
        Self {
            tick,
            kind,
            channel: channel & 0x0f,
            data1,
            data2,
            duration: 0,
            sysex: None,
        }
    }

    pub fn note_on(tick: u32, channel: u8, note: u8, velocity: u8) -> Self {
        Self::new(tick, EventKind::NoteOn, channel, note & 0x7f, velocity & 0x7f)
    }

    pub fn note_off(tick: u32, channel: u8, note: u8, velocity: u8) -> Self {
        Self::new(tick, EventKind::NoteOff, channel, note & 0x7f, velocity & 0x7f)
    }

    pub fn key_pressure(tick: u32, channel: u8, note: u8, pressure: u8) -> Self {
        Self::new(tick, EventKind::KeyPressure, channel, note & 0x7f, pressure & 0x7f)
    }

    pub fn controller(tick: u32, channel: u8, controller: u8, value: u8) -> Self {
        Self::new(tick, EventKind::Controller, channel, controller & 0x7f, value & 0x7f)
    }

    pub fn program_change(tick: u32, channel: u8, program: u8) -> Self {
        Self::new(tick, EventKind::ProgramChange, channel, 0, program & 0x7f)
    }

    pub fn channel_pressure(tick: u32, channel: u8, pressure: u8) -> Self {
        Self::new(tick, EventKind::ChannelPressure, channel, 0, pressure & 0x7f)
    }

    pub fn pitch_bend(tick: u32, channel: u8, value: u8) -> Self {
        Self::new(tick, EventKind::PitchBend, channel, 0, value)
    }

    pub fn sysex(tick: u32, bytes: impl Into<Box<[u8]>>) -> Self {
        let mut event = Self::new(tick, EventKind::Sysex, 0, 0, 0);
        event.sysex = Some(bytes.into());
        event
    }

    pub fn with_duration(mut self, duration: u32) -> Self {
        self.duration = duration;
        self
    }

    /// Ingress normalisation: a NoteOn with velocity 0 is a NoteOff, and
    /// must be indistinguishable from one downstream of capture.
    pub fn normalized(mut self) -> Self {
        if self.kind == EventKind::NoteOn && self.data2 == 0 {
            self.kind = EventKind::NoteOff;
        }
        self
    }

    #[inline]
    pub fn note(&self) -> u8 {
        self.data1
    }

    #[inline]
    pub fn velocity(&self) -> u8 {
        self.data2
    }

    #[inline]
    pub fn controller_number(&self) -> u8 {
        self.data1
    }

    /// The event's primary value byte, whatever its kind.
    #[inline]
    pub fn value(&self) -> u8 {
        self.data2
    }

    /// Sysex frames must start with `0xF0` and end with `0xF7`.
    pub fn is_well_framed_sysex(&self) -> bool {
        match self.sysex.as_deref() {
            Some([0xf0, .., 0xf7]) => true,
            _ => false,
        }
    }
}

/// An ordered sequence of captured events; the record target of a track.
#[derive(Debug, Default)]
pub struct MidiSequence {
    events: Vec<MidiEvent>,
}

impl MidiSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append in arrival order.
    pub fn add_event(&mut self, event: MidiEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[MidiEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_on_zero_velocity_normalizes_to_note_off() {
        let event = MidiEvent::note_on(0, 0, 60, 0).normalized();
        assert_eq!(event.kind, EventKind::NoteOff);
        assert_eq!(event.note(), 60);
    }

    #[test]
    fn test_note_on_keeps_kind_when_audible() {
        let event = MidiEvent::note_on(0, 0, 60, 1).normalized();
        assert_eq!(event.kind, EventKind::NoteOn);
    }

    #[test]
    fn test_channel_masked_to_four_bits() {
        let event = MidiEvent::note_on(0, 0x1f, 60, 100);
        assert_eq!(event.channel, 0x0f);
    }

    #[test]
    fn test_sysex_framing() {
        let good = MidiEvent::sysex(0, vec![0xf0, 0x7e, 0x00, 0xf7]);
        assert!(good.is_well_framed_sysex());

        let bad = MidiEvent::sysex(0, vec![0x7e, 0x00]);
        assert!(!bad.is_well_framed_sysex());

        let plain = MidiEvent::note_on(0, 0, 60, 100);
        assert!(!plain.is_well_framed_sysex());
    }

    #[test]
    fn test_sequence_preserves_arrival_order() {
        let mut seq = MidiSequence::new();
        seq.add_event(MidiEvent::note_on(10, 0, 60, 100));
        seq.add_event(MidiEvent::note_on(5, 0, 64, 90));
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.events()[0].note(), 60);
        assert_eq!(seq.events()[1].note(), 64);
    }
}
