//! The MIDI engine: transport facade over the sequencer backend.
//!
//! Owns the bus and track arenas, the producer/consumer thread pair, and
//! the sync state that slaves the backend's tick queue to the audio
//! engine's frame clock. Lifecycle is `init` (open the backend client,
//! fatal on failure), `activate` (spawn the threads), `start`/`stop`
//! (transport), `deactivate` and `clean`.
//!
//! Lock order, outermost first: output mutex, control buses, tracks,
//! buses. The audio callback only ever calls [`MidiEngine::sync`], which
//! is wait-free: a failed try-lock drops the wake and the next period
//! retries.

mod input;
mod output;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::backend::{
    ClientId, InputEvent, OutputEvent, QueueId, RemoveFilter, Schedule, SequencerBackend,
};
use crate::bus::{BusDocument, BusId, BusMode, MidiBus};
use crate::error::{Error, Result};
use crate::event::controllers::{ALL_NOTES_OFF, CHANNEL_PANNING, CHANNEL_VOLUME};
use crate::event::{EventKind, MidiEvent, MidiSequence};
use crate::mmc::{self, MmcCommand, MmcEvent, MmcSubCommand};
use crate::monitor::{shared_monitor_clock, MidiMonitor, MonitorClock, SharedMonitorClock, QUEUE_SIZE};
use segno_core::{AudioClock, Session, SessionCursor, TrackId};

/// Receiver of trapped MIDI Machine Control messages. The UI adapter
/// implements this; the engine posts from the input thread.
pub trait MmcListener: Send + Sync {
    fn on_mmc(&self, event: MmcEvent);
}

/// Construction parameters of a MIDI track view.
#[derive(Debug, Clone, Copy)]
pub struct TrackConfig {
    pub channel: u8,
    /// Stable 8-bit token attached to every scheduled event, so a track's
    /// queued future can be cancelled wholesale.
    pub tag: u8,
    pub input_bus: BusId,
    pub output_bus: BusId,
}

impl TrackConfig {
    pub fn new(channel: u8, tag: u8, input_bus: BusId, output_bus: BusId) -> Self {
        Self {
            channel: channel & 0x0f,
            tag,
            input_bus,
            output_bus,
        }
    }
}

pub(crate) struct MidiTrack {
    channel: u8,
    tag: u8,
    input_bus: BusId,
    output_bus: BusId,
    record: bool,
    mute: bool,
    monitor: Arc<MidiMonitor>,
    record_clip: Option<Arc<Mutex<MidiSequence>>>,
}

#[derive(Default)]
struct ControlBuses {
    input: Option<BusId>,
    output: Option<BusId>,
}

struct SeqIds {
    client: ClientId,
    queue: QueueId,
}

pub(crate) struct OutputShared {
    pub(crate) mutex: Mutex<()>,
    pub(crate) cond: Condvar,
    pub(crate) run: AtomicBool,
    pub(crate) read_ahead: AtomicU64,
}

#[derive(Default)]
struct WorkerHandles {
    input: Option<JoinHandle<()>>,
    output: Option<JoinHandle<()>>,
}

pub(crate) struct EngineInner {
    pub(crate) backend: Arc<dyn SequencerBackend>,
    pub(crate) session: Arc<dyn Session>,
    pub(crate) audio: Arc<dyn AudioClock>,
    ids: RwLock<Option<SeqIds>>,
    buses: RwLock<Vec<MidiBus>>,
    tracks: RwLock<Vec<MidiTrack>>,
    pub(crate) cursor: SessionCursor,
    time_start: AtomicI64,
    time_delta: AtomicI64,
    monitor_clock: SharedMonitorClock,
    control: RwLock<ControlBuses>,
    mmc_listener: RwLock<Option<Arc<dyn MmcListener>>>,
    pub(crate) output: OutputShared,
    pub(crate) input_run: AtomicBool,
    threads: Mutex<WorkerHandles>,
    activated: AtomicBool,
}

/// The MIDI sequencing engine. Clone is cheap (`Arc` internally).
#[derive(Clone)]
pub struct MidiEngine {
    inner: Arc<EngineInner>,
}

impl MidiEngine {
    pub fn new(
        backend: Arc<dyn SequencerBackend>,
        session: Arc<dyn Session>,
        audio: Arc<dyn AudioClock>,
    ) -> Self {
        // Default read-ahead of one second.
        let read_ahead = session.sample_rate() as u64;
        Self {
            inner: Arc::new(EngineInner {
                backend,
                session,
                audio,
                ids: RwLock::new(None),
                buses: RwLock::new(Vec::new()),
                tracks: RwLock::new(Vec::new()),
                cursor: SessionCursor::new(),
                time_start: AtomicI64::new(0),
                time_delta: AtomicI64::new(0),
                monitor_clock: shared_monitor_clock(),
                control: RwLock::new(ControlBuses::default()),
                mmc_listener: RwLock::new(None),
                output: OutputShared {
                    mutex: Mutex::new(()),
                    cond: Condvar::new(),
                    run: AtomicBool::new(false),
                    read_ahead: AtomicU64::new(read_ahead),
                },
                input_run: AtomicBool::new(false),
                threads: Mutex::new(WorkerHandles::default()),
                activated: AtomicBool::new(false),
            }),
        }
    }

    // ==================== Lifecycle ====================

    /// Open the backend client and allocate the scheduling queue. Any
    /// failure here aborts engine bring-up.
    pub fn init(&self, client_name: &str) -> Result<()> {
        let client = self.inner.backend.open_client(client_name)?;
        let queue = self.inner.backend.alloc_queue()?;
        *self.inner.ids.write() = Some(SeqIds { client, queue });
        info!(name = client_name, ?client, "MIDI engine initialized");
        Ok(())
    }

    /// Spawn the input and output threads and prime the sync state.
    pub fn activate(&self) -> Result<()> {
        if self.inner.ids.read().is_none() {
            return Err(Error::NotInitialized);
        }
        if self.inner.activated.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.inner.time_start.store(0, Ordering::Release);
        self.inner.time_delta.store(0, Ordering::Release);
        self.inner.input_run.store(true, Ordering::Release);
        self.inner.output.run.store(true, Ordering::Release);

        let mut threads = self.inner.threads.lock();
        threads.input = Some(input::spawn(self.inner.clone())?);
        threads.output = Some(output::spawn(self.inner.clone())?);
        drop(threads);

        self.reset_control_bus();
        self.reset_all_monitors();
        info!("MIDI engine activated");
        Ok(())
    }

    /// Begin playback: hard-align the MIDI cursor to audio, re-anchor
    /// the queue timer and run the first read-ahead cycle.
    pub fn start(&self) -> Result<()> {
        if !self.inner.activated.load(Ordering::Acquire) {
            return Err(Error::NotActivated);
        }
        let queue = self.queue()?;

        // Hard alignment always yields a cursor.
        let frame = self
            .inner
            .midi_cursor_sync(true)
            .unwrap_or_else(|| self.inner.cursor.frame());

        self.reset_tempo()?;
        self.sync_reset();
        self.reset_all_monitors();

        self.inner
            .time_start
            .store(self.inner.session.tick_from_frame(frame) as i64, Ordering::Release);
        self.inner.time_delta.store(0, Ordering::Release);

        self.inner.backend.start_queue(queue)?;
        self.process_sync();
        Ok(())
    }

    /// Halt playback: drop pending queue contents, stop the timer, and
    /// quiet every bus.
    pub fn stop(&self) {
        if !self.inner.activated.load(Ordering::Acquire) {
            return;
        }
        if let Err(error) = self.inner.backend.drop_input() {
            warn!(%error, "drop_input failed");
        }
        if let Err(error) = self.inner.backend.drop_output() {
            warn!(%error, "drop_output failed");
        }
        if let Ok(queue) = self.queue() {
            if let Err(error) = self.inner.backend.stop_queue(queue) {
                warn!(%error, "stop_queue failed");
            }
        }
        let buses = self.inner.buses.read();
        for bus in buses.iter() {
            if let Err(error) = bus.shut_off(&*self.inner.backend, false) {
                warn!(bus = bus.name(), %error, "shut-off failed");
            }
        }
    }

    /// Stop the worker threads (they notice within one poll timeout).
    pub fn deactivate(&self) {
        self.inner.session.transport().set_playing(false);
        self.inner.input_run.store(false, Ordering::Release);
        self.inner.output.run.store(false, Ordering::Release);
        self.inner.wake_output();
        self.inner.activated.store(false, Ordering::Release);
        *self.inner.control.write() = ControlBuses::default();
    }

    /// Join the worker threads and release backend resources.
    pub fn clean(&self) {
        self.inner.input_run.store(false, Ordering::Release);
        self.inner.output.run.store(false, Ordering::Release);
        self.inner.wake_output();

        let mut threads = self.inner.threads.lock();
        // Give the workers a moment to notice the flag, then nudge the
        // output thread once more in case the first wake raced its
        // run-state check.
        if threads.input.is_some() || threads.output.is_some() {
            std::thread::sleep(Duration::from_millis(100));
            self.inner.wake_output();
        }
        if let Some(handle) = threads.input.take() {
            let _ = handle.join();
        }
        if let Some(handle) = threads.output.take() {
            let _ = handle.join();
        }
        drop(threads);

        let mut buses = self.inner.buses.write();
        for bus in buses.iter_mut() {
            bus.close(&*self.inner.backend);
        }
        drop(buses);

        *self.inner.ids.write() = None;
        self.inner.time_start.store(0, Ordering::Release);
        self.inner.time_delta.store(0, Ordering::Release);
        info!("MIDI engine cleaned up");
    }

    // ==================== Audio-Callback Hook ====================

    /// Called by the audio engine once per period. Wakes the output
    /// thread unless the MIDI cursor is already a full read-ahead window
    /// ahead. Wait-free: contention drops the wake, the next period
    /// retries.
    pub fn sync(&self) {
        if self.inner.midi_cursor_sync(false).is_some() {
            self.inner.wake_output();
        }
    }

    // ==================== Read-Ahead ====================

    pub fn read_ahead(&self) -> u64 {
        self.inner.output.read_ahead.load(Ordering::Acquire)
    }

    pub fn set_read_ahead(&self, frames: u64) {
        let frames = frames.max(1);
        self.inner.output.read_ahead.store(frames, Ordering::Release);
        self.sync_reset();
    }

    // ==================== Sync State ====================

    /// Tick offset subtracted from event times at scheduling.
    pub fn time_start(&self) -> i64 {
        self.inner.time_start.load(Ordering::Acquire)
    }

    /// Accumulated drift correction applied so far.
    pub fn time_delta(&self) -> i64 {
        self.inner.time_delta.load(Ordering::Acquire)
    }

    pub fn cursor(&self) -> &SessionCursor {
        &self.inner.cursor
    }

    /// Push the session tempo into the backend queue.
    pub fn reset_tempo(&self) -> Result<()> {
        let queue = self.queue()?;
        let tempo = self.inner.session.tempo();
        self.inner.backend.set_queue_tempo(
            queue,
            self.inner.session.ticks_per_beat(),
            (60_000_000.0 / tempo as f64) as u32,
        )?;
        Ok(())
    }

    /// Recompute the process-wide monitor clock from the read-ahead
    /// window and the tempo at the play head. Run on every transport
    /// change.
    pub fn sync_reset(&self) {
        let _guard = self.inner.output.mutex.lock();
        let read_ahead = self.inner.output.read_ahead.load(Ordering::Acquire);
        let frame_slot = (read_ahead * 2) / QUEUE_SIZE as u64;
        let play_head = self.inner.session.transport().play_head();
        let origin = self.inner.session.tick_from_frame(play_head);
        let tick_slot = self
            .inner
            .session
            .tick_from_frame(play_head + frame_slot)
            .saturating_sub(origin);
        self.inner
            .monitor_clock
            .store(Arc::new(MonitorClock {
                frame_slot,
                tick_slot,
            }));
    }

    /// Reset every bus and track monitor and re-emit the mixer state they
    /// mirror (master volume per bus, channel volume/pan per track).
    pub fn reset_all_monitors(&self) {
        let (frame_start, tick_start) = self.inner.monitor_reset_origin();

        {
            let buses = self.inner.buses.read();
            for bus in buses.iter() {
                if let Some(monitor) = bus.monitor_in() {
                    monitor.reset(frame_start, tick_start);
                    if bus.monitor_out().is_none() {
                        if let Err(error) =
                            bus.set_master_volume(&*self.inner.backend, monitor.gain())
                        {
                            debug!(bus = bus.name(), %error, "master volume skipped");
                        }
                    }
                }
                if let Some(monitor) = bus.monitor_out() {
                    monitor.reset(frame_start, tick_start);
                    if let Err(error) = bus.set_master_volume(&*self.inner.backend, monitor.gain())
                    {
                        debug!(bus = bus.name(), %error, "master volume skipped");
                    }
                }
            }
        }

        let tracks = self.inner.tracks.read();
        let buses = self.inner.buses.read();
        for track in tracks.iter() {
            track.monitor.reset(frame_start, tick_start);
            if let Some(bus) = buses.get(track.output_bus.0) {
                if let Err(error) =
                    bus.set_volume(&*self.inner.backend, track.channel, track.monitor.gain())
                {
                    debug!(%error, "channel volume skipped");
                }
                if let Err(error) =
                    bus.set_panning(&*self.inner.backend, track.channel, track.monitor.panning())
                {
                    debug!(%error, "channel panning skipped");
                }
            }
        }
    }

    /// Pick the first input-capable and first output-capable buses as the
    /// control pair carrying MMC traffic.
    pub fn reset_control_bus(&self) {
        let mut input = None;
        let mut output = None;
        {
            let buses = self.inner.buses.read();
            for (index, bus) in buses.iter().enumerate() {
                if input.is_none() && bus.mode().is_input() {
                    input = Some(BusId(index));
                }
                if output.is_none() && bus.mode().is_output() {
                    output = Some(BusId(index));
                }
            }
        }
        *self.inner.control.write() = ControlBuses { input, output };
    }

    /// Drain the staged backend output and apply the drift correction:
    /// nudge `time_start` so the next window's events land where the
    /// audio clock says they should.
    pub fn flush(&self) {
        self.inner.flush();
    }

    /// Fold the queue timer back by one loop length so the next loop
    /// iteration's events land at correct backend ticks.
    pub fn restart_loop(&self) {
        self.inner.restart_loop();
    }

    // ==================== Output Cycles ====================

    /// Run one read-ahead cycle under the output-thread mutex.
    pub fn process_sync(&self) {
        let _guard = self.inner.output.mutex.lock();
        self.inner.process();
    }

    /// Re-render one track's already-scheduled window, from `frame_start`
    /// up to the MIDI cursor. The unmute path.
    pub fn track_sync(&self, track: TrackId, frame_start: u64) {
        let _guard = self.inner.output.mutex.lock();
        let frame_end = self.inner.cursor.frame();
        debug!(?track, frame_start, frame_end, "track resync");
        let inner = &*self.inner;
        let mut sink = |track: TrackId, event: &MidiEvent, time: u64, gain: f32| {
            inner.enqueue(track, event, time, gain);
        };
        self.inner
            .session
            .process_track(track, frame_start, frame_end, &mut sink);
        self.inner.flush();
    }

    // ==================== Capture & Enqueue ====================

    /// Route one inbound event: MMC trap, capture clips, monitors.
    pub fn capture(&self, event: InputEvent) {
        self.inner.capture(event);
    }

    /// Schedule one clip event onto its track's output bus.
    pub fn enqueue(&self, track: TrackId, event: &MidiEvent, time: u64, gain: f32) {
        self.inner.enqueue(track, event, time, gain);
    }

    // ==================== Buses ====================

    /// Create a bus and register its backend port.
    pub fn create_bus(&self, name: impl Into<String>, mode: BusMode) -> Result<BusId> {
        let queue = self.queue()?;
        let mut bus = MidiBus::new(name, mode, &self.inner.monitor_clock);
        bus.open(&*self.inner.backend, queue)?;
        let mut buses = self.inner.buses.write();
        let id = BusId(buses.len());
        buses.push(bus);
        Ok(id)
    }

    /// Restore a bus from its persisted subtree, register its port and
    /// attempt its saved connections.
    pub fn load_bus_document(&self, document: BusDocument) -> Result<BusId> {
        let queue = self.queue()?;
        let client = self.client()?;
        let mut bus = MidiBus::from_document(document, &self.inner.monitor_clock);
        bus.open(&*self.inner.backend, queue)?;
        if bus.mode().is_input() {
            bus.update_connects(&*self.inner.backend, client.0, true);
        }
        if bus.mode().is_output() {
            bus.update_connects(&*self.inner.backend, client.0, false);
        }
        let mut buses = self.inner.buses.write();
        let id = BusId(buses.len());
        buses.push(bus);
        Ok(id)
    }

    pub fn save_bus_document(&self, id: BusId) -> Result<BusDocument> {
        let client = self.client()?;
        let buses = self.inner.buses.read();
        let bus = buses.get(id.0).ok_or(Error::UnknownBus(id))?;
        Ok(bus.save_document(&*self.inner.backend, client.0))
    }

    /// Shared access to a bus together with the backend handle its direct
    /// dispatch helpers need.
    pub fn with_bus<R>(
        &self,
        id: BusId,
        f: impl FnOnce(&MidiBus, &dyn SequencerBackend) -> R,
    ) -> Result<R> {
        let buses = self.inner.buses.read();
        let bus = buses.get(id.0).ok_or(Error::UnknownBus(id))?;
        Ok(f(bus, &*self.inner.backend))
    }

    pub fn with_bus_mut<R>(
        &self,
        id: BusId,
        f: impl FnOnce(&mut MidiBus, &dyn SequencerBackend) -> R,
    ) -> Result<R> {
        let mut buses = self.inner.buses.write();
        let bus = buses.get_mut(id.0).ok_or(Error::UnknownBus(id))?;
        Ok(f(bus, &*self.inner.backend))
    }

    // ==================== Tracks ====================

    pub fn add_track(&self, config: TrackConfig) -> Result<TrackId> {
        {
            let buses = self.inner.buses.read();
            if buses.get(config.input_bus.0).is_none() {
                return Err(Error::UnknownBus(config.input_bus));
            }
            if buses.get(config.output_bus.0).is_none() {
                return Err(Error::UnknownBus(config.output_bus));
            }
        }
        let mut tracks = self.inner.tracks.write();
        let id = TrackId(tracks.len());
        tracks.push(MidiTrack {
            channel: config.channel,
            tag: config.tag,
            input_bus: config.input_bus,
            output_bus: config.output_bus,
            record: false,
            mute: false,
            monitor: Arc::new(MidiMonitor::new(self.inner.monitor_clock.clone())),
            record_clip: None,
        });
        Ok(id)
    }

    pub fn set_track_record(&self, track: TrackId, record: bool) -> Result<()> {
        let mut tracks = self.inner.tracks.write();
        let entry = tracks.get_mut(track.0).ok_or(Error::UnknownTrack(track))?;
        entry.record = record;
        Ok(())
    }

    /// Install (or clear) the clip capturing this track's input.
    pub fn set_record_clip(
        &self,
        track: TrackId,
        clip: Option<Arc<Mutex<MidiSequence>>>,
    ) -> Result<()> {
        let mut tracks = self.inner.tracks.write();
        let entry = tracks.get_mut(track.0).ok_or(Error::UnknownTrack(track))?;
        entry.record_clip = clip;
        Ok(())
    }

    pub fn track_monitor(&self, track: TrackId) -> Result<Arc<MidiMonitor>> {
        let tracks = self.inner.tracks.read();
        let entry = tracks.get(track.0).ok_or(Error::UnknownTrack(track))?;
        Ok(entry.monitor.clone())
    }

    pub fn is_track_muted(&self, track: TrackId) -> Result<bool> {
        let tracks = self.inner.tracks.read();
        let entry = tracks.get(track.0).ok_or(Error::UnknownTrack(track))?;
        Ok(entry.mute)
    }

    /// Immediate mute or unmute.
    ///
    /// Muting removes the track's queued future from the backend (sparing
    /// note-offs owed to sounding notes), sends all-notes-off, and resets
    /// the track monitor. Unmuting re-renders the already-scheduled
    /// window instead of replaying withheld events.
    pub fn track_mute(&self, track: TrackId, mute: bool) -> Result<()> {
        let frame = self.inner.session.transport().play_head();
        debug!(?track, mute, frame, "track mute");

        let (tag, channel, output_bus, monitor) = {
            let mut tracks = self.inner.tracks.write();
            let entry = tracks.get_mut(track.0).ok_or(Error::UnknownTrack(track))?;
            entry.mute = mute;
            (
                entry.tag,
                entry.channel,
                entry.output_bus,
                entry.monitor.clone(),
            )
        };

        if mute {
            let queue = self.queue()?;
            let time = self.inner.session.tick_from_frame(frame) as i64;
            let after = (time - self.inner.time_start.load(Ordering::Acquire)).max(0) as u32;
            self.inner.backend.remove_events(&RemoveFilter {
                queue,
                after_tick: after,
                tag: Some(tag),
                channel: Some(channel),
                skip_noteoff: true,
            })?;

            let buses = self.inner.buses.read();
            if let Some(bus) = buses.get(output_bus.0) {
                if let Err(error) =
                    bus.set_controller(&*self.inner.backend, channel, ALL_NOTES_OFF, 0)
                {
                    warn!(%error, "all-notes-off failed");
                }
            }
            drop(buses);

            let (frame_start, tick_start) = self.inner.monitor_reset_origin();
            monitor.reset(frame_start, tick_start);
        } else {
            self.track_sync(track, frame);
        }
        Ok(())
    }

    // ==================== MMC ====================

    pub fn set_mmc_listener(&self, listener: Arc<dyn MmcListener>) {
        *self.inner.mmc_listener.write() = Some(listener);
    }

    pub fn clear_mmc_listener(&self) {
        *self.inner.mmc_listener.write() = None;
    }

    /// Emit an MMC locate for a position in 30ths of a second.
    pub fn send_mmc_locate(&self, position: u64) -> Result<()> {
        self.send_mmc_command(MmcCommand::Locate, &mmc::locate_payload(position))
    }

    pub fn send_mmc_masked_write(
        &self,
        subcmd: MmcSubCommand,
        track: usize,
        on: bool,
    ) -> Result<()> {
        self.send_mmc_command(
            MmcCommand::MaskedWrite,
            &mmc::masked_write_payload(subcmd, track, on),
        )
    }

    /// Send an MMC command on the output control bus. A no-op when no
    /// control bus is assigned.
    pub fn send_mmc_command(&self, command: MmcCommand, payload: &[u8]) -> Result<()> {
        let output = self.inner.control.read().output;
        let Some(id) = output else { return Ok(()) };
        let sysex = mmc::encode(mmc::ALL_DEVICES, command, payload);
        let buses = self.inner.buses.read();
        let bus = buses.get(id.0).ok_or(Error::UnknownBus(id))?;
        bus.send_sysex(&*self.inner.backend, &sysex)
    }

    // ==================== Hot-Plug ====================

    /// Block until the backend reports a system-announce event.
    pub fn poll_announce(&self, timeout: Duration) -> Result<bool> {
        Ok(self.inner.backend.poll_announce(timeout)?)
    }

    /// Acknowledge pending announce events and retry every bus's pending
    /// connections against the refreshed port graph.
    pub fn announce_ack(&self) -> Result<()> {
        self.inner.backend.announce_ack()?;
        let client = self.client()?;
        let mut buses = self.inner.buses.write();
        for bus in buses.iter_mut() {
            if bus.mode().is_input() {
                bus.update_connects(&*self.inner.backend, client.0, true);
            }
            if bus.mode().is_output() {
                bus.update_connects(&*self.inner.backend, client.0, false);
            }
        }
        Ok(())
    }

    // ==================== Internal ====================

    fn queue(&self) -> Result<QueueId> {
        self.inner
            .ids
            .read()
            .as_ref()
            .map(|ids| ids.queue)
            .ok_or(Error::NotInitialized)
    }

    fn client(&self) -> Result<ClientId> {
        self.inner
            .ids
            .read()
            .as_ref()
            .map(|ids| ids.client)
            .ok_or(Error::NotInitialized)
    }
}

impl EngineInner {
    fn queue_id(&self) -> Option<QueueId> {
        self.ids.read().as_ref().map(|ids| ids.queue)
    }

    /// MIDI/audio sync predicate. `start` hard-aligns the MIDI cursor to
    /// the audio cursor; otherwise the cursor is withheld while MIDI has
    /// outrun audio by more than the read-ahead window.
    pub(crate) fn midi_cursor_sync(&self, start: bool) -> Option<u64> {
        if start {
            self.cursor.seek(self.audio.frame());
            return Some(self.cursor.frame());
        }
        let read_ahead = self.output.read_ahead.load(Ordering::Acquire);
        if self.cursor.frame_time() > self.audio.frame_time() + read_ahead {
            return None;
        }
        Some(self.cursor.frame())
    }

    /// Wake the output thread, dropping the wake on contention.
    pub(crate) fn wake_output(&self) {
        if let Some(_guard) = self.output.mutex.try_lock() {
            self.output.cond.notify_all();
        }
    }

    /// One read-ahead cycle. The caller holds the output mutex.
    pub(crate) fn process(&self) {
        let Some(frame) = self.midi_cursor_sync(false) else {
            // Too far ahead of audio; back off until the next wake.
            return;
        };
        let read_ahead = self.output.read_ahead.load(Ordering::Acquire);
        let mut start = frame;
        let mut end = start + read_ahead;

        let transport = self.session.transport();
        let looping = transport.is_looping();
        let loop_start = transport.loop_start();
        let loop_end = transport.loop_end();

        let mut sink = |track: TrackId, event: &MidiEvent, time: u64, gain: f32| {
            self.enqueue(track, event, time, gain);
        };

        // Split processing across loop iterations; the loop may be
        // shorter than the read-ahead window.
        if looping && start < loop_end {
            while end >= loop_end {
                self.session.process(&self.cursor, start, loop_end, &mut sink);
                start = loop_start;
                end = start + (end - loop_end);
                self.cursor.seek(start);
                self.restart_loop();
            }
        }

        self.session.process(&self.cursor, start, end, &mut sink);

        // Fold a window that still straddles the loop end back in.
        if looping && start < loop_end && end >= loop_end {
            end = loop_start + (end - loop_end);
        }

        self.cursor.seek(end);
        self.cursor.advance(read_ahead);

        self.flush();
    }

    pub(crate) fn restart_loop(&self) {
        let transport = self.session.transport();
        if transport.is_looping() {
            let length = transport.loop_end() - transport.loop_start();
            let ticks = self.session.tick_from_frame(length) as i64;
            self.time_start.fetch_sub(ticks, Ordering::AcqRel);
        }
    }

    /// Drain staged output and correct clock drift: compare the backend
    /// queue tick with the audio frame clock projected into ticks, and
    /// absorb any new difference into `time_start`.
    pub(crate) fn flush(&self) {
        if let Err(error) = self.backend.drain_output() {
            warn!(%error, "drain failed");
        }
        let Some(queue) = self.queue_id() else { return };
        let midi_time = match self.backend.queue_tick_now(queue) {
            Ok(tick) => tick,
            Err(error) => {
                warn!(%error, "queue status unavailable");
                return;
            }
        };
        let audio_time = self.session.tick_from_frame(self.audio.frame_time());
        let delta = (audio_time as i64 - midi_time as i64) - self.time_delta.load(Ordering::Acquire);
        if delta != 0 && audio_time > 0 && midi_time > 0 {
            self.time_start.fetch_add(delta, Ordering::AcqRel);
            self.time_delta.fetch_add(delta, Ordering::AcqRel);
            debug!(audio_time, midi_time, delta, "clock correction");
        }
    }

    /// Schedule one event onto the track's output bus, tag it for bulk
    /// cancellation, and feed the monitors.
    pub(crate) fn enqueue(&self, track_id: TrackId, event: &MidiEvent, time: u64, gain: f32) {
        // The mixer's own monitor state comes back through clips as
        // volume/pan controllers; re-emitting those would feed back.
        if event.kind == EventKind::Controller
            && matches!(event.data1, CHANNEL_VOLUME | CHANNEL_PANNING)
        {
            return;
        }

        let tracks = self.tracks.read();
        let Some(track) = tracks.get(track_id.0) else {
            return;
        };
        let buses = self.buses.read();
        let Some(bus) = buses.get(track.output_bus.0) else {
            return;
        };
        let Some(port) = bus.port() else { return };

        let tick = (time as i64 - self.time_start.load(Ordering::Acquire)).max(0) as u32;
        let mut value = event.data2;
        if event.kind == EventKind::NoteOn {
            value = (gain * value as f32) as u8 & 0x7f;
        }

        let result = self.backend.event_output(OutputEvent {
            source: port,
            tag: track.tag,
            schedule: Schedule::Tick(tick),
            kind: event.kind,
            channel: track.channel,
            data1: event.data1,
            data2: value,
            duration: event.duration,
            sysex: event.sysex.as_deref(),
        });
        if let Err(error) = result {
            warn!(%error, tick, "scheduled event dropped");
            return;
        }

        track.monitor.enqueue(event.kind, value, tick as u64);
        if let Some(monitor) = bus.monitor_out() {
            monitor.enqueue(event.kind, value, tick as u64);
        }
    }

    /// Route one inbound event to the MMC trap, the recording clips and
    /// the monitors. Runs on the input thread.
    pub(crate) fn capture(&self, input: InputEvent) {
        let event = input.event.normalized();

        if event.kind == EventKind::Sysex {
            if let Some(bytes) = event.sysex.as_deref() {
                if mmc::is_mmc(bytes) && self.is_control_input_port(input.dest) {
                    // Signature match on the control port ends routing,
                    // whether or not the command is one we understand.
                    match MmcEvent::decode(bytes) {
                        Some(mmc_event) => {
                            debug!(command = ?mmc_event.command, "MMC trapped");
                            let listener = self.mmc_listener.read().clone();
                            if let Some(listener) = listener {
                                listener.on_mmc(mmc_event);
                            }
                        }
                        None => {
                            warn!(command = bytes[4], "unrecognized MMC command dropped");
                        }
                    }
                    return;
                }
            }
        }

        let tracks = self.tracks.read();
        let buses = self.buses.read();
        for track in tracks.iter() {
            if !track.record || track.channel != event.channel {
                continue;
            }
            let Some(bus) = buses.get(track.input_bus.0) else {
                continue;
            };
            if bus.port() != Some(input.dest) {
                continue;
            }
            if let Some(clip) = &track.record_clip {
                let mut captured = event.clone();
                captured.tick = input.tick;
                clip.lock().add_event(captured);
            }
            track.monitor.enqueue(event.kind, event.value(), 0);
        }

        for bus in buses.iter() {
            if bus.port() == Some(input.dest) {
                if let Some(monitor) = bus.monitor_in() {
                    monitor.enqueue(event.kind, event.value(), 0);
                }
            }
        }
    }

    fn is_control_input_port(&self, port: crate::backend::PortId) -> bool {
        let input = self.control.read().input;
        let Some(id) = input else { return false };
        let buses = self.buses.read();
        buses.get(id.0).and_then(MidiBus::port) == Some(port)
    }

    /// Anchor for monitor resets: the audio engine's frame-time and its
    /// tick distance from the play head.
    pub(crate) fn monitor_reset_origin(&self) -> (u64, u64) {
        let frame_start = self.audio.frame_time();
        let play_head = self.session.transport().play_head();
        let origin = self.session.tick_from_frame(play_head);
        let tick_start = self
            .session
            .tick_from_frame(play_head + frame_start)
            .saturating_sub(origin);
        (frame_start, tick_start)
    }
}
