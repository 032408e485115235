//! MIDI event types.
//!
//! The core event model (`MidiEvent`, `EventKind`, `MidiSequence`) is
//! defined in `segno-core` and re-exported here; this module adds the wire
//! constants the scheduler and buses share.

pub use segno_core::midi::{EventKind, MidiEvent, MidiSequence};

/// Controller numbers with engine-level meaning.
pub mod controllers {
    pub const BANK_SELECT_MSB: u8 = 0x00;
    pub const CHANNEL_VOLUME: u8 = 0x07;
    pub const CHANNEL_PANNING: u8 = 0x0a;
    pub const BANK_SELECT_LSB: u8 = 0x20;
    pub const ALL_SOUND_OFF: u8 = 0x78;
    pub const ALL_CONTROLLERS_OFF: u8 = 0x79;
    pub const ALL_NOTES_OFF: u8 = 0x7b;
}

/// Sysex frame delimiters.
pub const SYSEX_START: u8 = 0xf0;
pub const SYSEX_END: u8 = 0xf7;
