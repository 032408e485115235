//! Transport-aware MIDI scheduling, capture and monitoring.
//!
//! The sequencing core of a multi-track session: an output thread that
//! schedules clip events one read-ahead window ahead of the audio clock,
//! an input thread that routes captured events to clips and meters, a
//! drift controller slaving the backend tick queue to the audio frame
//! clock, buses with direct dispatch and patch persistence, and a
//! lock-free sliding-window monitor feed.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use segno_midi::{BusMode, MemorySequencer, MidiEngine, TrackConfig};
//!
//! let backend = Arc::new(MemorySequencer::new());
//! let engine = MidiEngine::new(backend, session, audio);
//! engine.init("segno")?;
//! let bus = engine.create_bus("Master", BusMode::Duplex)?;
//! let track = engine.add_track(TrackConfig::new(0, 1, bus, bus))?;
//! engine.activate()?;
//! engine.start()?;
//! // The audio engine calls engine.sync() once per period.
//! ```

pub mod error;
pub use error::{Error, Result};

pub mod event;
pub use event::{EventKind, MidiEvent, MidiSequence};

pub mod backend;
pub use backend::{
    BackendError, ClientId, InputEvent, MemorySequencer, OutputEvent, PortAddr, PortCaps, PortId,
    QueueId, RemoveFilter, Schedule, SequencerBackend,
};

pub mod monitor;
pub use monitor::{
    shared_monitor_clock, MidiMonitor, MonitorClock, SharedMonitorClock, QUEUE_SIZE,
};

pub mod bus;
pub use bus::{BankSelMethod, BusDocument, BusId, BusMode, Connect, MidiBus, Patch, PatchEntry};

pub mod mmc;
pub use mmc::{MmcCommand, MmcEvent, MmcSubCommand};

pub mod engine;
pub use engine::{MidiEngine, MmcListener, TrackConfig};

pub use segno_core::{
    AudioClock, EventSink, LinearTimebase, Session, SessionCursor, Timebase, TrackId,
    TransportState,
};
