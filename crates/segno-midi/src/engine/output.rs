//! The MIDI output thread.
//!
//! A single cooperative worker parked on the engine's condition variable.
//! The audio callback wakes it once per period through
//! [`MidiEngine::sync`](super::MidiEngine::sync); on each wake it runs one
//! read-ahead cycle if the transport is playing, otherwise it goes back to
//! sleep. The wait, [`EngineInner::process`] via `process_sync`, and
//! `track_sync` all serialise on the same mutex.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::debug;

use super::EngineInner;

pub(crate) fn spawn(inner: Arc<EngineInner>) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("segno-midi-output".into())
        .spawn(move || run(inner))
}

fn run(inner: Arc<EngineInner>) {
    debug!("output thread started");
    let mut guard = inner.output.mutex.lock();
    while inner.output.run.load(Ordering::Acquire) {
        inner.output.cond.wait(&mut guard);
        if !inner.output.run.load(Ordering::Acquire) {
            break;
        }
        // Only if playing, the output process cycle.
        if inner.session.transport().is_playing() {
            inner.process();
        }
    }
    drop(guard);
    debug!("output thread stopped");
}
