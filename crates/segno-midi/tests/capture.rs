//! Input-side integration: capture routing, velocity-0 normalisation,
//! the MMC trap, and the input thread end to end.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{TestClock, TestSession};
use parking_lot::Mutex;
use segno_midi::{
    mmc, BusId, BusMode, EventKind, InputEvent, MemorySequencer, MidiEngine, MidiEvent,
    MidiSequence, MmcCommand, MmcEvent, MmcListener, PortId, TrackConfig, TrackId,
};

struct Rig {
    seq: Arc<MemorySequencer>,
    engine: MidiEngine,
    bus: BusId,
    track: TrackId,
    clip: Arc<Mutex<MidiSequence>>,
}

impl Rig {
    /// One duplex bus, one armed track on channel 2 with a record clip.
    fn new() -> Self {
        let seq = Arc::new(MemorySequencer::new());
        let session = TestSession::new(48_000, 120.0, 96);
        let clock = TestClock::new();
        let engine = MidiEngine::new(seq.clone(), session, clock);
        engine.init("segno-capture-test").unwrap();
        let bus = engine.create_bus("Capture", BusMode::Duplex).unwrap();
        let track = engine
            .add_track(TrackConfig::new(2, 1, bus, bus))
            .unwrap();
        engine.set_track_record(track, true).unwrap();
        let clip = Arc::new(Mutex::new(MidiSequence::new()));
        engine.set_record_clip(track, Some(clip.clone())).unwrap();
        Self {
            seq,
            engine,
            bus,
            track,
            clip,
        }
    }

    fn port(&self) -> PortId {
        self.engine
            .with_bus(self.bus, |bus, _| bus.port())
            .unwrap()
            .unwrap()
    }

    fn inbound(&self, tick: u32, event: MidiEvent) -> InputEvent {
        InputEvent {
            tick,
            dest: self.port(),
            event,
        }
    }
}

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<MmcEvent>>,
}

impl MmcListener for RecordingListener {
    fn on_mmc(&self, event: MmcEvent) {
        self.events.lock().push(event);
    }
}

#[test]
fn test_capture_records_to_clip_and_monitors() {
    let rig = Rig::new();
    rig.engine
        .capture(rig.inbound(120, MidiEvent::note_on(0, 2, 60, 100)));

    let clip = rig.clip.lock();
    assert_eq!(clip.len(), 1);
    assert_eq!(clip.events()[0].tick, 120);
    assert_eq!(clip.events()[0].kind, EventKind::NoteOn);
    drop(clip);

    // Track monitor and bus input monitor both counted the event.
    let monitor = rig.engine.track_monitor(rig.track).unwrap();
    assert_eq!(monitor.count(), 1);
    rig.engine
        .with_bus(rig.bus, |bus, _| {
            assert_eq!(bus.monitor_in().unwrap().count(), 1);
        })
        .unwrap();
}

#[test]
fn test_capture_normalizes_zero_velocity_note_on() {
    let rig = Rig::new();
    rig.engine
        .capture(rig.inbound(0, MidiEvent::note_on(0, 2, 60, 0)));

    // Downstream of capture a velocity-0 NoteOn does not exist.
    let clip = rig.clip.lock();
    assert_eq!(clip.events()[0].kind, EventKind::NoteOff);
}

#[test]
fn test_capture_ignores_foreign_port_and_channel() {
    let rig = Rig::new();
    // Wrong channel.
    rig.engine
        .capture(rig.inbound(0, MidiEvent::note_on(0, 3, 60, 100)));
    // Wrong port.
    rig.engine.capture(InputEvent {
        tick: 0,
        dest: PortId(99),
        event: MidiEvent::note_on(0, 2, 60, 100),
    });
    assert!(rig.clip.lock().is_empty());
}

#[test]
fn test_capture_requires_record_arm() {
    let rig = Rig::new();
    rig.engine.set_track_record(rig.track, false).unwrap();
    rig.engine
        .capture(rig.inbound(0, MidiEvent::note_on(0, 2, 60, 100)));
    assert!(rig.clip.lock().is_empty());

    // The bus input monitor still sees the traffic.
    rig.engine
        .with_bus(rig.bus, |bus, _| {
            assert_eq!(bus.monitor_in().unwrap().count(), 1);
        })
        .unwrap();
}

#[test]
fn test_mmc_trapped_on_control_bus_only() {
    let rig = Rig::new();
    rig.engine.reset_control_bus();
    let listener = Arc::new(RecordingListener::default());
    rig.engine.set_mmc_listener(listener.clone());

    let sysex = mmc::encode(mmc::ALL_DEVICES, MmcCommand::Locate, &mmc::locate_payload(90));
    rig.engine
        .capture(rig.inbound(0, MidiEvent::sysex(0, sysex)));

    // Trapped: posted to the listener, never routed to the clip.
    let events = listener.events.lock();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].command, MmcCommand::Locate);
    assert_eq!(events[0].locate(), Some(90));
    drop(events);
    assert!(rig.clip.lock().is_empty());
}

#[test]
fn test_mmc_to_non_control_port_routes_as_sysex() {
    let rig = Rig::new();
    // A second bus becomes the event's destination; the first remains
    // the control bus.
    let other = rig.engine.create_bus("Other", BusMode::Input).unwrap();
    rig.engine.reset_control_bus();
    let listener = Arc::new(RecordingListener::default());
    rig.engine.set_mmc_listener(listener.clone());

    let port = rig
        .engine
        .with_bus(other, |bus, _| bus.port())
        .unwrap()
        .unwrap();
    let sysex = mmc::encode(mmc::ALL_DEVICES, MmcCommand::Stop, &[]);
    rig.engine.capture(InputEvent {
        tick: 0,
        dest: port,
        event: MidiEvent::sysex(0, sysex),
    });

    assert!(listener.events.lock().is_empty());
    // Routed normally: the other bus's input monitor counted it.
    rig.engine
        .with_bus(other, |bus, _| {
            assert_eq!(bus.monitor_in().unwrap().count(), 1);
        })
        .unwrap();
}

#[test]
fn test_unrecognized_mmc_command_still_ends_routing() {
    let rig = Rig::new();
    rig.engine.reset_control_bus();
    let listener = Arc::new(RecordingListener::default());
    rig.engine.set_mmc_listener(listener.clone());

    // Eject (0x08) carries the MMC signature but is not a command the
    // engine decodes. The trap still swallows it on the control port:
    // nothing reaches the listener, the clip, or the monitors.
    let event = MidiEvent::sysex(0, vec![0xf0, 0x7f, 0x7f, 0x06, 0x08, 0xf7]);
    rig.engine.capture(rig.inbound(0, event));

    assert!(listener.events.lock().is_empty());
    assert!(rig.clip.lock().is_empty());
    rig.engine
        .with_bus(rig.bus, |bus, _| {
            assert_eq!(bus.monitor_in().unwrap().count(), 0);
        })
        .unwrap();
}

#[test]
fn test_plain_sysex_is_not_trapped() {
    let rig = Rig::new();
    rig.engine.reset_control_bus();
    let listener = Arc::new(RecordingListener::default());
    rig.engine.set_mmc_listener(listener.clone());

    // GM reset: well-framed sysex without the MMC signature, arriving on
    // the control port.
    let event = MidiEvent::sysex(0, vec![0xf0, 0x7e, 0x7f, 0x09, 0x01, 0xf7]);
    rig.engine.capture(rig.inbound(0, event));

    assert!(listener.events.lock().is_empty());
    rig.engine
        .with_bus(rig.bus, |bus, _| {
            assert_eq!(bus.monitor_in().unwrap().count(), 1);
        })
        .unwrap();
}

#[test]
fn test_input_thread_drains_backend() {
    let rig = Rig::new();
    rig.engine.activate().unwrap();

    rig.seq.feed_input(rig.inbound(7, MidiEvent::note_on(0, 2, 64, 90)));
    rig.seq.feed_input(rig.inbound(9, MidiEvent::note_off(0, 2, 64, 0)));

    // The poll wakes on the first event and drains both.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while rig.clip.lock().len() < 2 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    let clip = rig.clip.lock();
    assert_eq!(clip.len(), 2);
    assert_eq!(clip.events()[0].tick, 7);
    assert_eq!(clip.events()[1].tick, 9);
    drop(clip);

    rig.engine.deactivate();
    rig.engine.clean();
}
