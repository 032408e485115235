//! In-process sequencer backend.
//!
//! A software rendition of the kernel sequencer contract: a client-side
//! staging buffer, a tick-ordered delivery queue per queue handle, direct
//! event passthrough, the bulk-removal filter, and a channel-fed input
//! side whose poll blocks like a descriptor poll would. Used by the test
//! suites and for offline rendering; the queue tick is advanced by the
//! embedder rather than by a timer.

use std::collections::VecDeque;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use super::{
    BackendError, ClientId, InputEvent, OutputEvent, PortAddr, PortCaps, PortId, QueueId,
    RemoveFilter, Schedule, SequencerBackend,
};
use crate::event::EventKind;

/// An event as held by the sequencer, with owned sysex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedEvent {
    pub source: PortId,
    pub tag: u8,
    pub schedule: Schedule,
    pub kind: EventKind,
    pub channel: u8,
    pub data1: u8,
    pub data2: u8,
    pub duration: u32,
    pub sysex: Option<Box<[u8]>>,
}

impl QueuedEvent {
    fn from_output(event: &OutputEvent<'_>) -> Self {
        Self {
            source: event.source,
            tag: event.tag,
            schedule: event.schedule,
            kind: event.kind,
            channel: event.channel,
            data1: event.data1,
            data2: event.data2,
            duration: event.duration,
            sysex: event.sysex.map(Box::from),
        }
    }

    fn tick(&self) -> u32 {
        match self.schedule {
            Schedule::Tick(tick) => tick,
            Schedule::Direct => 0,
        }
    }
}

#[derive(Debug, Clone)]
struct Queued {
    event: QueuedEvent,
    /// The note-off owed by a duration-carrying note. Cancelled together
    /// with its note by a removal sweep, unlike explicit note-offs.
    synthetic_off: bool,
}

struct PortRecord {
    name: String,
    caps: PortCaps,
}

struct QueueRecord {
    running: bool,
    tick: u64,
    ppq: u32,
    micros_per_quarter: u32,
}

#[derive(Default)]
struct SeqState {
    client: Option<(ClientId, String)>,
    fail_open: bool,
    ports: Vec<Option<PortRecord>>,
    queues: Vec<QueueRecord>,
    staged: Vec<Queued>,
    queued: Vec<Queued>,
    delivered: Vec<QueuedEvent>,
    subscriptions: Vec<(PortAddr, PortAddr)>,
    refused: Vec<PortAddr>,
    pending_input: VecDeque<InputEvent>,
    pending_announce: usize,
}

pub struct MemorySequencer {
    state: Mutex<SeqState>,
    input_tx: Sender<InputEvent>,
    input_rx: Receiver<InputEvent>,
    announce_tx: Sender<()>,
    announce_rx: Receiver<()>,
}

impl MemorySequencer {
    const CLIENT_ID: u32 = 128;

    pub fn new() -> Self {
        let (input_tx, input_rx) = unbounded();
        let (announce_tx, announce_rx) = unbounded();
        Self {
            state: Mutex::new(SeqState::default()),
            input_tx,
            input_rx,
            announce_tx,
            announce_rx,
        }
    }

    // ==================== Embedder Controls ====================

    /// Make the next `open_client` fail, for exercising fatal-init paths.
    pub fn set_fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }

    /// Refuse future subscriptions towards `dest`.
    pub fn refuse_subscriptions_to(&self, dest: PortAddr) {
        self.state.lock().refused.push(dest);
    }

    /// Stop refusing subscriptions (hot-plugged peer came back).
    pub fn accept_all_subscriptions(&self) {
        self.state.lock().refused.clear();
    }

    /// Inject an inbound event, waking any blocked input poll.
    pub fn feed_input(&self, event: InputEvent) {
        let _ = self.input_tx.send(event);
    }

    /// Inject a system-announce event, waking any blocked announce poll.
    pub fn feed_announce(&self) {
        let _ = self.announce_tx.send(());
    }

    /// Set the queue tick counter without delivering anything.
    pub fn set_queue_tick(&self, queue: QueueId, tick: u64) {
        let mut state = self.state.lock();
        if let Some(q) = state.queues.get_mut(queue.0 as usize) {
            q.tick = tick;
        }
    }

    /// Advance the queue to `tick`, delivering every due event. Notes
    /// carrying a duration schedule their implicit note-off on delivery.
    pub fn advance_to(&self, queue: QueueId, tick: u64) {
        let mut state = self.state.lock();
        if let Some(q) = state.queues.get_mut(queue.0 as usize) {
            q.tick = tick;
        }
        loop {
            let due = state
                .queued
                .iter()
                .position(|entry| entry.event.tick() as u64 <= tick);
            let Some(index) = due else { break };
            let entry = state.queued.remove(index);
            if entry.event.kind == EventKind::NoteOn && entry.event.duration > 0 {
                let off_tick = entry.event.tick() + entry.event.duration;
                let off = Queued {
                    event: QueuedEvent {
                        schedule: Schedule::Tick(off_tick),
                        kind: EventKind::NoteOff,
                        data2: 0,
                        duration: 0,
                        sysex: None,
                        ..entry.event.clone()
                    },
                    synthetic_off: true,
                };
                insert_by_tick(&mut state.queued, off);
            }
            state.delivered.push(entry.event);
        }
    }

    // ==================== Inspection ====================

    /// Events staged by `event_output` but not yet drained.
    pub fn staged_len(&self) -> usize {
        self.state.lock().staged.len()
    }

    /// Scheduled events sitting in the delivery queue, tick order.
    pub fn queued_events(&self) -> Vec<QueuedEvent> {
        self.state
            .lock()
            .queued
            .iter()
            .map(|entry| entry.event.clone())
            .collect()
    }

    /// Everything that has reached the wire so far.
    pub fn delivered_events(&self) -> Vec<QueuedEvent> {
        self.state.lock().delivered.clone()
    }

    pub fn clear_delivered(&self) {
        self.state.lock().delivered.clear();
    }

    pub fn subscriptions(&self) -> Vec<(PortAddr, PortAddr)> {
        self.state.lock().subscriptions.clone()
    }

    pub fn queue_tempo(&self, queue: QueueId) -> Option<(u32, u32)> {
        self.state
            .lock()
            .queues
            .get(queue.0 as usize)
            .map(|q| (q.ppq, q.micros_per_quarter))
    }

    pub fn is_queue_running(&self, queue: QueueId) -> bool {
        self.state
            .lock()
            .queues
            .get(queue.0 as usize)
            .map(|q| q.running)
            .unwrap_or(false)
    }
}

impl Default for MemorySequencer {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_by_tick(queue: &mut Vec<Queued>, entry: Queued) {
    let tick = entry.event.tick();
    // Stable: equal ticks keep submission order.
    let index = queue.partition_point(|other| other.event.tick() <= tick);
    queue.insert(index, entry);
}

fn matches(filter: &RemoveFilter, entry: &Queued) -> bool {
    if (entry.event.tick() as u64) < filter.after_tick as u64 {
        return false;
    }
    if let Some(tag) = filter.tag {
        if entry.event.tag != tag {
            return false;
        }
    }
    if let Some(channel) = filter.channel {
        if entry.event.channel != channel {
            return false;
        }
    }
    if filter.skip_noteoff && entry.event.kind == EventKind::NoteOff && !entry.synthetic_off {
        return false;
    }
    true
}

impl SequencerBackend for MemorySequencer {
    fn open_client(&self, name: &str) -> Result<ClientId, BackendError> {
        let mut state = self.state.lock();
        if state.fail_open {
            return Err(BackendError::Open(format!(
                "client '{}' refused by sequencer",
                name
            )));
        }
        let id = ClientId(Self::CLIENT_ID);
        state.client = Some((id, name.to_string()));
        Ok(id)
    }

    fn alloc_queue(&self) -> Result<QueueId, BackendError> {
        let mut state = self.state.lock();
        let id = QueueId(state.queues.len() as u32);
        state.queues.push(QueueRecord {
            running: false,
            tick: 0,
            ppq: 96,
            micros_per_quarter: 500_000,
        });
        Ok(id)
    }

    fn create_port(&self, name: &str, caps: PortCaps) -> Result<PortId, BackendError> {
        let mut state = self.state.lock();
        let id = PortId(state.ports.len() as u32);
        state.ports.push(Some(PortRecord {
            name: name.to_string(),
            caps,
        }));
        Ok(id)
    }

    fn delete_port(&self, port: PortId) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        match state.ports.get_mut(port.0 as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                state
                    .subscriptions
                    .retain(|(sender, dest)| sender.port != port.0 && dest.port != port.0);
                Ok(())
            }
            _ => Err(BackendError::UnknownPort(port)),
        }
    }

    fn set_port_timestamping(
        &self,
        port: PortId,
        queue: QueueId,
        _ticks: bool,
    ) -> Result<(), BackendError> {
        let state = self.state.lock();
        if state
            .ports
            .get(port.0 as usize)
            .map_or(true, Option::is_none)
        {
            return Err(BackendError::UnknownPort(port));
        }
        if state.queues.get(queue.0 as usize).is_none() {
            return Err(BackendError::UnknownQueue(queue));
        }
        Ok(())
    }

    fn set_queue_tempo(
        &self,
        queue: QueueId,
        ppq: u32,
        micros_per_quarter: u32,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let record = state
            .queues
            .get_mut(queue.0 as usize)
            .ok_or(BackendError::UnknownQueue(queue))?;
        record.ppq = ppq;
        record.micros_per_quarter = micros_per_quarter;
        Ok(())
    }

    fn start_queue(&self, queue: QueueId) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let record = state
            .queues
            .get_mut(queue.0 as usize)
            .ok_or(BackendError::UnknownQueue(queue))?;
        record.running = true;
        record.tick = 0;
        Ok(())
    }

    fn stop_queue(&self, queue: QueueId) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let record = state
            .queues
            .get_mut(queue.0 as usize)
            .ok_or(BackendError::UnknownQueue(queue))?;
        record.running = false;
        Ok(())
    }

    fn drop_input(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.pending_input.clear();
        while self.input_rx.try_recv().is_ok() {}
        Ok(())
    }

    fn drop_output(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.staged.clear();
        state.queued.clear();
        Ok(())
    }

    fn event_output(&self, event: OutputEvent<'_>) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if state
            .ports
            .get(event.source.0 as usize)
            .map_or(true, Option::is_none)
        {
            return Err(BackendError::UnknownPort(event.source));
        }
        state.staged.push(Queued {
            event: QueuedEvent::from_output(&event),
            synthetic_off: false,
        });
        Ok(())
    }

    fn drain_output(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let staged = std::mem::take(&mut state.staged);
        for entry in staged {
            match entry.event.schedule {
                Schedule::Direct => state.delivered.push(entry.event),
                Schedule::Tick(_) => insert_by_tick(&mut state.queued, entry),
            }
        }
        Ok(())
    }

    fn queue_tick_now(&self, queue: QueueId) -> Result<u64, BackendError> {
        let state = self.state.lock();
        state
            .queues
            .get(queue.0 as usize)
            .map(|q| q.tick)
            .ok_or(BackendError::UnknownQueue(queue))
    }

    fn remove_events(&self, filter: &RemoveFilter) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if state.queues.get(filter.queue.0 as usize).is_none() {
            return Err(BackendError::UnknownQueue(filter.queue));
        }
        state.staged.retain(|entry| !matches(filter, entry));
        state.queued.retain(|entry| !matches(filter, entry));
        Ok(())
    }

    fn subscribe(&self, sender: PortAddr, dest: PortAddr) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if state.refused.contains(&dest) || state.refused.contains(&sender) {
            return Err(BackendError::SubscribeFailed { sender, dest });
        }
        if !state.subscriptions.contains(&(sender, dest)) {
            state.subscriptions.push((sender, dest));
        }
        Ok(())
    }

    fn unsubscribe(&self, sender: PortAddr, dest: PortAddr) -> Result<(), BackendError> {
        self.state
            .lock()
            .subscriptions
            .retain(|pair| *pair != (sender, dest));
        Ok(())
    }

    fn query_subscribers(&self, port: PortId) -> Result<Vec<PortAddr>, BackendError> {
        let state = self.state.lock();
        Ok(state
            .subscriptions
            .iter()
            .filter_map(|(sender, dest)| {
                if sender.client == Self::CLIENT_ID && sender.port == port.0 {
                    Some(*dest)
                } else if dest.client == Self::CLIENT_ID && dest.port == port.0 {
                    Some(*sender)
                } else {
                    None
                }
            })
            .collect())
    }

    fn poll_input(&self, timeout: Duration) -> Result<bool, BackendError> {
        if !self.state.lock().pending_input.is_empty() {
            return Ok(true);
        }
        match self.input_rx.recv_timeout(timeout) {
            Ok(event) => {
                self.state.lock().pending_input.push_back(event);
                Ok(true)
            }
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => {
                Err(BackendError::Transient("input feed closed".into()))
            }
        }
    }

    fn event_input(&self) -> Result<Option<InputEvent>, BackendError> {
        if let Some(event) = self.state.lock().pending_input.pop_front() {
            return Ok(Some(event));
        }
        Ok(self.input_rx.try_recv().ok())
    }

    fn poll_announce(&self, timeout: Duration) -> Result<bool, BackendError> {
        if self.state.lock().pending_announce > 0 {
            return Ok(true);
        }
        match self.announce_rx.recv_timeout(timeout) {
            Ok(()) => {
                self.state.lock().pending_announce += 1;
                Ok(true)
            }
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => {
                Err(BackendError::Transient("announce feed closed".into()))
            }
        }
    }

    fn announce_ack(&self) -> Result<(), BackendError> {
        self.state.lock().pending_announce = 0;
        while self.announce_rx.try_recv().is_ok() {}
        Ok(())
    }
}
