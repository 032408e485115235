//! Sequencer backend abstraction.
//!
//! The core schedules against a kernel-style MIDI sequencer: a client with
//! duplex ports, a tick-driven queue, tag/channel bulk removal and a
//! pollable input side. Everything the rest of the crate needs from such a
//! sequencer is captured by [`SequencerBackend`]; the reference target is a
//! kernel sequencer, but the core never assumes one, and an in-process
//! implementation ships in [`mem`] for offline rendering and tests.
//!
//! The handle is shared by the input and output threads. Implementations
//! must accept a concurrent input poll alongside output submission, which
//! is why every method takes `&self`.

pub mod mem;
pub use mem::MemorySequencer;

use std::time::Duration;

use thiserror::Error;

use crate::event::{EventKind, MidiEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(pub u32);

/// A fully qualified sequencer address, used by the subscription graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortAddr {
    pub client: u32,
    pub port: u32,
}

/// Capabilities requested when creating a port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortCaps {
    pub write: bool,
    pub read: bool,
    pub subs_write: bool,
    pub subs_read: bool,
    pub no_export: bool,
}

impl PortCaps {
    /// Writable by others and open for write subscriptions (an input port).
    pub fn input() -> Self {
        Self {
            write: true,
            subs_write: true,
            ..Self::default()
        }
    }

    /// Readable by others and open for read subscriptions (an output port).
    pub fn output() -> Self {
        Self {
            read: true,
            subs_read: true,
            ..Self::default()
        }
    }

    pub fn merge(self, other: Self) -> Self {
        Self {
            write: self.write || other.write,
            read: self.read || other.read,
            subs_write: self.subs_write || other.subs_write,
            subs_read: self.subs_read || other.subs_read,
            no_export: self.no_export || other.no_export,
        }
    }
}

/// Delivery timing of an outbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Deliver when the queue reaches this tick.
    Tick(u32),
    /// Deliver immediately, bypassing the queue.
    Direct,
}

/// An outbound event as handed to the backend.
///
/// Sysex payloads are borrowed for the duration of `event_output` only;
/// the backend copies what it needs.
#[derive(Debug, Clone, Copy)]
pub struct OutputEvent<'a> {
    pub source: PortId,
    pub tag: u8,
    pub schedule: Schedule,
    pub kind: EventKind,
    pub channel: u8,
    pub data1: u8,
    pub data2: u8,
    pub duration: u32,
    pub sysex: Option<&'a [u8]>,
}

/// An inbound event with the queue tick it arrived at and the local port
/// it was delivered to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputEvent {
    pub tick: u32,
    pub dest: PortId,
    pub event: MidiEvent,
}

/// Bulk removal filter for queued output events.
///
/// `tag`/`channel` of `None` match everything. With `skip_noteoff` set,
/// note-off events — explicit ones and the implicit off owed by a
/// duration-carrying note — survive the sweep, so notes already sounding
/// are not left hanging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveFilter {
    pub queue: QueueId,
    pub after_tick: u32,
    pub tag: Option<u8>,
    pub channel: Option<u8>,
    pub skip_noteoff: bool,
}

#[derive(Error, Debug)]
pub enum BackendError {
    /// The sequencer client could not be opened. Fatal during engine init.
    #[error("failed to open sequencer client: {0}")]
    Open(String),

    /// A single operation failed; the transport continues without it.
    #[error("sequencer operation failed: {0}")]
    Transient(String),

    #[error("unknown port {0:?}")]
    UnknownPort(PortId),

    #[error("unknown queue {0:?}")]
    UnknownQueue(QueueId),

    #[error("subscription refused: {sender:?} -> {dest:?}")]
    SubscribeFailed { sender: PortAddr, dest: PortAddr },
}

/// The capability surface the sequencing core depends on. See the module
/// docs for the concurrency contract.
pub trait SequencerBackend: Send + Sync {
    fn open_client(&self, name: &str) -> Result<ClientId, BackendError>;

    fn alloc_queue(&self) -> Result<QueueId, BackendError>;

    fn create_port(&self, name: &str, caps: PortCaps) -> Result<PortId, BackendError>;

    fn delete_port(&self, port: PortId) -> Result<(), BackendError>;

    /// Stamp events delivered to `port` with the tick of `queue` (`ticks`
    /// true) or with real time.
    fn set_port_timestamping(
        &self,
        port: PortId,
        queue: QueueId,
        ticks: bool,
    ) -> Result<(), BackendError>;

    fn set_queue_tempo(
        &self,
        queue: QueueId,
        ppq: u32,
        micros_per_quarter: u32,
    ) -> Result<(), BackendError>;

    fn start_queue(&self, queue: QueueId) -> Result<(), BackendError>;

    fn stop_queue(&self, queue: QueueId) -> Result<(), BackendError>;

    fn drop_input(&self) -> Result<(), BackendError>;

    fn drop_output(&self) -> Result<(), BackendError>;

    /// Stage one event. Staged events reach the wire on `drain_output`.
    fn event_output(&self, event: OutputEvent<'_>) -> Result<(), BackendError>;

    fn drain_output(&self) -> Result<(), BackendError>;

    fn queue_tick_now(&self, queue: QueueId) -> Result<u64, BackendError>;

    fn remove_events(&self, filter: &RemoveFilter) -> Result<(), BackendError>;

    fn subscribe(&self, sender: PortAddr, dest: PortAddr) -> Result<(), BackendError>;

    fn unsubscribe(&self, sender: PortAddr, dest: PortAddr) -> Result<(), BackendError>;

    fn query_subscribers(&self, port: PortId) -> Result<Vec<PortAddr>, BackendError>;

    /// Block until input is pending or `timeout` elapses. `Ok(true)` means
    /// `event_input` will yield at least one event.
    fn poll_input(&self, timeout: Duration) -> Result<bool, BackendError>;

    /// Fetch one pending input event, or `None` when the input side would
    /// block.
    fn event_input(&self) -> Result<Option<InputEvent>, BackendError>;

    /// Block until a system-announce event (port hot-plug) is pending.
    fn poll_announce(&self, timeout: Duration) -> Result<bool, BackendError>;

    /// Drain and discard pending announce events.
    fn announce_ack(&self) -> Result<(), BackendError>;
}
