//! Error types for the MIDI sequencing core.

use thiserror::Error;

use crate::backend::BackendError;
use crate::bus::BusId;
use segno_core::TrackId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("sequencer backend: {0}")]
    Backend(#[from] BackendError),

    #[error("engine not initialized")]
    NotInitialized,

    #[error("engine not activated")]
    NotActivated,

    #[error("worker thread spawn failed: {0}")]
    Thread(#[from] std::io::Error),

    #[error("unknown bus {0:?}")]
    UnknownBus(BusId),

    #[error("unknown track {0:?}")]
    UnknownTrack(TrackId),

    #[error("bus has no open port")]
    PortClosed,
}

pub type Result<T> = std::result::Result<T, Error>;
