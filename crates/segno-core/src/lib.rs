//! Transport, timebase and session substrate for the segno MIDI core.
//!
//! This crate holds everything the MIDI scheduling core consumes but does
//! not own: the session cursor, the frame/tick timebase, the shared
//! transport state, and the trait seams towards the audio engine and the
//! session's clip model.

pub mod cursor;
pub use cursor::SessionCursor;

pub mod lockfree;
pub use lockfree::AtomicFloat;

pub mod midi;
pub use midi::{EventKind, MidiEvent, MidiSequence};

pub mod session;
pub use session::{AudioClock, EventSink, Session, TrackId};

pub mod timebase;
pub use timebase::{LinearTimebase, Timebase};

pub mod transport;
pub use transport::TransportState;
