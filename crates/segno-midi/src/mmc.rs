//! MIDI Machine Control encoding and decoding.
//!
//! MMC rides in universal real-time sysex:
//! `F0 7F <device> 06 <command> [<payload...>] F7`. The engine emits
//! locate and masked-write commands on its output control bus and traps
//! inbound MMC on the input control bus; anything that does not match the
//! signature is routed as ordinary sysex.

/// Broadcast device id.
pub const ALL_DEVICES: u8 = 0x7f;

const REALTIME_SYSEX: u8 = 0x7f;
const MMC_COMMAND_MODE: u8 = 0x06;

/// The "target" sub-id that opens a locate payload.
const LOCATE_TARGET: u8 = 0x01;

/// SMPTE-30 convention used by locate positions.
const LOCATE_FPS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MmcCommand {
    Stop = 0x01,
    Play = 0x02,
    DeferredPlay = 0x03,
    FastForward = 0x04,
    Rewind = 0x05,
    RecordStrobe = 0x06,
    RecordExit = 0x07,
    Pause = 0x09,
    MaskedWrite = 0x41,
    Locate = 0x44,
}

impl MmcCommand {
    fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x01 => Self::Stop,
            0x02 => Self::Play,
            0x03 => Self::DeferredPlay,
            0x04 => Self::FastForward,
            0x05 => Self::Rewind,
            0x06 => Self::RecordStrobe,
            0x07 => Self::RecordExit,
            0x09 => Self::Pause,
            0x41 => Self::MaskedWrite,
            0x44 => Self::Locate,
            _ => return None,
        })
    }
}

/// Information fields addressable by a masked write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MmcSubCommand {
    TrackRecord = 0x4f,
    TrackMute = 0x62,
}

impl MmcSubCommand {
    fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x4f => Self::TrackRecord,
            0x62 => Self::TrackMute,
            _ => return None,
        })
    }
}

/// A decoded MMC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmcEvent {
    pub device: u8,
    pub command: MmcCommand,
    pub payload: Vec<u8>,
}

/// True when the sysex bytes carry the MMC signature. Only frames that
/// pass this test are trapped off the control bus.
pub fn is_mmc(sysex: &[u8]) -> bool {
    sysex.len() >= 6
        && sysex[0] == crate::event::SYSEX_START
        && sysex[1] == REALTIME_SYSEX
        && sysex[3] == MMC_COMMAND_MODE
        && sysex.ends_with(&[crate::event::SYSEX_END])
}

/// Build the sysex envelope around an MMC command. Payloads are length
/// prefixed, matching what hardware transports expect.
pub fn encode(device: u8, command: MmcCommand, payload: &[u8]) -> Vec<u8> {
    let mut sysex = Vec::with_capacity(7 + payload.len());
    sysex.push(crate::event::SYSEX_START);
    sysex.push(REALTIME_SYSEX);
    sysex.push(device);
    sysex.push(MMC_COMMAND_MODE);
    sysex.push(command as u8);
    if !payload.is_empty() {
        sysex.push(payload.len() as u8);
        sysex.extend_from_slice(payload);
    }
    sysex.push(crate::event::SYSEX_END);
    sysex
}

/// Locate payload: `{01, hours, minutes, seconds, frames, subframes}` in
/// SMPTE-30; `position` counts 30ths of a second.
pub fn locate_payload(mut position: u64) -> [u8; 6] {
    let hours = position / (3600 * LOCATE_FPS);
    position -= hours * 3600 * LOCATE_FPS;
    let minutes = position / (60 * LOCATE_FPS);
    position -= minutes * 60 * LOCATE_FPS;
    let seconds = position / LOCATE_FPS;
    position -= seconds * LOCATE_FPS;
    [
        LOCATE_TARGET,
        hours as u8,
        minutes as u8,
        seconds as u8,
        position as u8,
        0,
    ]
}

/// Masked-write payload addressing track `track`: a byte index, the bit
/// for the track within it, and the bit's new value.
pub fn masked_write_payload(subcmd: MmcSubCommand, track: usize, on: bool) -> [u8; 4] {
    let mask = 1u8 << (if track < 2 { track + 5 } else { (track - 2) % 7 });
    let byte = if track < 2 { 0 } else { 1 + (track - 2) / 7 };
    [subcmd as u8, byte as u8, mask, if on { mask } else { 0 }]
}

impl MmcEvent {
    /// Decode an MMC sysex frame. `None` when the frame is not MMC
    /// (see [`is_mmc`]) or the command byte is unrecognized.
    pub fn decode(sysex: &[u8]) -> Option<Self> {
        if !is_mmc(sysex) {
            return None;
        }
        let command = MmcCommand::from_byte(sysex[4])?;
        let body = &sysex[5..sysex.len() - 1];
        let payload = match body.split_first() {
            Some((&len, rest)) if rest.len() >= len as usize => rest[..len as usize].to_vec(),
            Some(_) => return None,
            None => Vec::new(),
        };
        Some(Self {
            device: sysex[2],
            command,
            payload,
        })
    }

    /// Locate position in 30ths of a second, for `Locate` events.
    pub fn locate(&self) -> Option<u64> {
        if self.command != MmcCommand::Locate {
            return None;
        }
        match self.payload.as_slice() {
            [LOCATE_TARGET, hours, minutes, seconds, frames, _subframes] => Some(
                ((*hours as u64 * 60 + *minutes as u64) * 60 + *seconds as u64) * LOCATE_FPS
                    + *frames as u64,
            ),
            _ => None,
        }
    }

    /// `(subcommand, track, on)` for `MaskedWrite` events.
    pub fn masked_write(&self) -> Option<(MmcSubCommand, usize, bool)> {
        if self.command != MmcCommand::MaskedWrite {
            return None;
        }
        match self.payload.as_slice() {
            [subcmd, byte, mask, value] => {
                let subcmd = MmcSubCommand::from_byte(*subcmd)?;
                let bit = mask.trailing_zeros() as usize;
                let track = if *byte == 0 {
                    bit.checked_sub(5)?
                } else {
                    2 + (*byte as usize - 1) * 7 + bit
                };
                Some((subcmd, track, *value != 0))
            }
            _ => None,
        }
    }
}
