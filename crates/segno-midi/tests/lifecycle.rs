//! Engine lifecycle, MMC dispatch, hot-plug retry and bus persistence.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{TestClock, TestSession};
use segno_midi::{
    BankSelMethod, BusDocument, BusMode, Connect, Error, EventKind, MemorySequencer, MidiEngine,
    MmcCommand, MmcEvent, MmcSubCommand, PortAddr, QueueId,
};

const QUEUE: QueueId = QueueId(0);

fn engine_over(seq: Arc<MemorySequencer>) -> MidiEngine {
    let session = TestSession::new(48_000, 120.0, 96);
    let clock = TestClock::new();
    MidiEngine::new(seq, session, clock)
}

#[test]
fn test_init_failure_is_fatal() {
    let seq = Arc::new(MemorySequencer::new());
    seq.set_fail_open(true);
    let engine = engine_over(seq);
    assert!(matches!(engine.init("segno"), Err(Error::Backend(_))));
}

#[test]
fn test_activate_requires_init() {
    let engine = engine_over(Arc::new(MemorySequencer::new()));
    assert!(matches!(engine.activate(), Err(Error::NotInitialized)));
}

#[test]
fn test_start_requires_activation() {
    let engine = engine_over(Arc::new(MemorySequencer::new()));
    engine.init("segno").unwrap();
    assert!(matches!(engine.start(), Err(Error::NotActivated)));
}

#[test]
fn test_activate_deactivate_clean() {
    let seq = Arc::new(MemorySequencer::new());
    let engine = engine_over(seq.clone());
    engine.init("segno").unwrap();
    let bus = engine.create_bus("Master", BusMode::Duplex).unwrap();

    engine.activate().unwrap();
    // A second activate is a no-op.
    engine.activate().unwrap();

    engine.deactivate();
    engine.clean();

    // The bus port was deleted on cleanup.
    engine
        .with_bus(bus, |bus, _| assert!(bus.port().is_none()))
        .unwrap();
}

#[test]
fn test_reset_tempo_pushes_queue_tempo() {
    let seq = Arc::new(MemorySequencer::new());
    let engine = engine_over(seq.clone());
    engine.init("segno").unwrap();
    engine.reset_tempo().unwrap();
    assert_eq!(seq.queue_tempo(QUEUE), Some((96, 500_000)));
}

#[test]
fn test_stop_quiets_patched_channels() {
    let seq = Arc::new(MemorySequencer::new());
    let engine = engine_over(seq.clone());
    engine.init("segno").unwrap();
    let bus = engine.create_bus("Out", BusMode::Output).unwrap();
    engine
        .with_bus_mut(bus, |bus, backend| {
            bus.set_patch(backend, 3, "Organ", BankSelMethod::PatchOnly, -1, 16)
        })
        .unwrap()
        .unwrap();
    engine.activate().unwrap();
    engine.start().unwrap();

    seq.clear_delivered();
    engine.stop();

    assert!(!seq.is_queue_running(QUEUE));
    let controllers: Vec<_> = seq
        .delivered_events()
        .into_iter()
        .filter(|event| event.kind == EventKind::Controller)
        .map(|event| (event.channel, event.data1))
        .collect();
    // Patched channel swept, controllers left alone while the bus stays
    // open.
    assert_eq!(controllers, vec![(3, 0x78), (3, 0x7b)]);

    engine.deactivate();
    engine.clean();
}

#[test]
fn test_mmc_locate_roundtrip_through_control_bus() {
    let seq = Arc::new(MemorySequencer::new());
    let engine = engine_over(seq.clone());
    engine.init("segno").unwrap();
    engine.create_bus("Control", BusMode::Duplex).unwrap();
    engine.reset_control_bus();

    let position = 3 * 3600 * 30 + 45 * 60 * 30 + 17 * 30 + 12;
    engine.send_mmc_locate(position).unwrap();

    let delivered = seq.delivered_events();
    assert_eq!(delivered.len(), 1);
    let event = MmcEvent::decode(delivered[0].sysex.as_deref().unwrap()).unwrap();
    assert_eq!(event.command, MmcCommand::Locate);
    assert_eq!(event.locate(), Some(position));
}

#[test]
fn test_mmc_masked_write_through_control_bus() {
    let seq = Arc::new(MemorySequencer::new());
    let engine = engine_over(seq.clone());
    engine.init("segno").unwrap();
    engine.create_bus("Control", BusMode::Duplex).unwrap();
    engine.reset_control_bus();

    engine
        .send_mmc_masked_write(MmcSubCommand::TrackRecord, 5, true)
        .unwrap();

    let delivered = seq.delivered_events();
    let event = MmcEvent::decode(delivered[0].sysex.as_deref().unwrap()).unwrap();
    assert_eq!(
        event.masked_write(),
        Some((MmcSubCommand::TrackRecord, 5, true))
    );
}

#[test]
fn test_mmc_without_control_bus_is_a_noop() {
    let seq = Arc::new(MemorySequencer::new());
    let engine = engine_over(seq.clone());
    engine.init("segno").unwrap();
    engine.send_mmc_locate(100).unwrap();
    assert!(seq.delivered_events().is_empty());
}

#[test]
fn test_announce_retries_pending_connects() {
    let seq = Arc::new(MemorySequencer::new());
    let engine = engine_over(seq.clone());
    engine.init("segno").unwrap();

    let peer = PortAddr {
        client: 130,
        port: 0,
    };
    seq.refuse_subscriptions_to(peer);

    // The saved document names a peer that is not there yet; its
    // connection stays pending after load.
    let bus = engine
        .load_bus_document(BusDocument {
            name: "Out".into(),
            mode: BusMode::Output,
            input_gain: None,
            input_panning: None,
            input_connects: Vec::new(),
            output_gain: Some(1.0),
            output_panning: Some(0.0),
            output_connects: vec![Connect {
                client: "130:Synth".into(),
                port: "0:in".into(),
            }],
            midi_map: Vec::new(),
        })
        .unwrap();
    engine
        .with_bus(bus, |bus, _| {
            assert_eq!(bus.pending_connects(false).len(), 1);
        })
        .unwrap();

    // The peer hot-plugs back in: announce arrives, the retry lands.
    seq.accept_all_subscriptions();
    seq.feed_announce();
    assert!(engine.poll_announce(Duration::from_millis(200)).unwrap());
    engine.announce_ack().unwrap();

    assert_eq!(seq.subscriptions().len(), 1);
    engine
        .with_bus(bus, |bus, _| {
            assert!(bus.pending_connects(false).is_empty());
        })
        .unwrap();
}

#[test]
fn test_bus_document_roundtrip_through_engine() {
    let seq = Arc::new(MemorySequencer::new());
    let engine = engine_over(seq.clone());
    engine.init("segno").unwrap();
    let bus = engine.create_bus("GM Out", BusMode::Output).unwrap();
    engine
        .with_bus_mut(bus, |bus, backend| {
            bus.set_patch(backend, 9, "Standard Kit", BankSelMethod::Normal, 0, 0)
        })
        .unwrap()
        .unwrap();

    let document = engine.save_bus_document(bus).unwrap();
    let json = serde_json::to_string(&document).unwrap();

    let seq2 = Arc::new(MemorySequencer::new());
    let engine2 = engine_over(seq2);
    engine2.init("segno").unwrap();
    let restored = engine2
        .load_bus_document(serde_json::from_str(&json).unwrap())
        .unwrap();

    engine2
        .with_bus(restored, |bus, _| {
            assert_eq!(bus.name(), "GM Out");
            assert_eq!(bus.patches().get(&9).unwrap().instrument, "Standard Kit");
        })
        .unwrap();
}
