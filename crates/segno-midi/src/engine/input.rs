//! The MIDI input thread.
//!
//! Blocks on the backend's input poll with a 200 ms timeout so the
//! shutdown flag is noticed promptly; on each wake it drains every
//! pending event through [`EngineInner::capture`], then sleeps again.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use super::EngineInner;

const POLL_TIMEOUT: Duration = Duration::from_millis(200);

pub(crate) fn spawn(inner: Arc<EngineInner>) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("segno-midi-input".into())
        .spawn(move || run(inner))
}

fn run(inner: Arc<EngineInner>) {
    debug!("input thread started");
    while inner.input_run.load(Ordering::Acquire) {
        match inner.backend.poll_input(POLL_TIMEOUT) {
            Ok(true) => loop {
                match inner.backend.event_input() {
                    Ok(Some(event)) => inner.capture(event),
                    Ok(None) => break,
                    Err(error) => {
                        warn!(%error, "input read failed");
                        break;
                    }
                }
            },
            Ok(false) => {}
            Err(error) => {
                warn!(%error, "input poll failed");
                break;
            }
        }
    }
    debug!("input thread stopped");
}
