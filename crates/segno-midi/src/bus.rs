//! MIDI buses: named sequencer port pairs with direct dispatch helpers,
//! optional I/O monitors, a per-channel patch map and document
//! persistence.
//!
//! Direct helpers bypass the scheduled queue; they serve UI knobs, patch
//! sends and shutdown, and each one flushes the backend so the bytes hit
//! the wire immediately.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backend::{OutputEvent, PortAddr, PortCaps, PortId, QueueId, Schedule, SequencerBackend};
use crate::error::{Error, Result};
use crate::event::controllers::{
    ALL_CONTROLLERS_OFF, ALL_NOTES_OFF, ALL_SOUND_OFF, BANK_SELECT_LSB, BANK_SELECT_MSB,
    CHANNEL_PANNING, CHANNEL_VOLUME,
};
use crate::event::EventKind;
use crate::monitor::{MidiMonitor, SharedMonitorClock};

/// Stable index of a bus in the engine's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusMode {
    Input,
    Output,
    Duplex,
}

impl BusMode {
    #[inline]
    pub fn is_input(self) -> bool {
        matches!(self, BusMode::Input | BusMode::Duplex)
    }

    #[inline]
    pub fn is_output(self) -> bool {
        matches!(self, BusMode::Output | BusMode::Duplex)
    }
}

/// How a bank number reaches the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum BankSelMethod {
    /// Bank MSB and LSB, then program.
    Normal,
    MsbOnly,
    LsbOnly,
    /// Program change alone.
    PatchOnly,
}

impl From<BankSelMethod> for u8 {
    fn from(method: BankSelMethod) -> u8 {
        match method {
            BankSelMethod::Normal => 0,
            BankSelMethod::MsbOnly => 1,
            BankSelMethod::LsbOnly => 2,
            BankSelMethod::PatchOnly => 3,
        }
    }
}

impl TryFrom<u8> for BankSelMethod {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, String> {
        match value {
            0 => Ok(Self::Normal),
            1 => Ok(Self::MsbOnly),
            2 => Ok(Self::LsbOnly),
            3 => Ok(Self::PatchOnly),
            other => Err(format!("invalid bank-sel-method {}", other)),
        }
    }
}

/// The instrument selection last sent on a channel. Negative bank or
/// program means "not part of the selection" and is omitted from saved
/// documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    #[serde(rename = "midi-instrument")]
    pub instrument: String,
    #[serde(rename = "midi-bank-sel-method", default = "BankSelMethod::default_field")]
    pub bank_sel_method: BankSelMethod,
    #[serde(rename = "midi-bank", default = "minus_one", skip_serializing_if = "is_negative")]
    pub bank: i32,
    #[serde(rename = "midi-program", default = "minus_one", skip_serializing_if = "is_negative")]
    pub program: i32,
}

impl BankSelMethod {
    fn default_field() -> Self {
        Self::Normal
    }
}

fn minus_one() -> i32 {
    -1
}

fn is_negative(value: &i32) -> bool {
    *value < 0
}

/// One persisted connection endpoint, `"<client-no>:<client-name>"` /
/// `"<port-no>:<port-name>"` shaped. Only the leading numbers address the
/// sequencer; the names are for humans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connect {
    pub client: String,
    pub port: String,
}

impl Connect {
    fn addr(&self) -> Option<PortAddr> {
        Some(PortAddr {
            client: leading_number(&self.client)?,
            port: leading_number(&self.port)?,
        })
    }
}

fn leading_number(text: &str) -> Option<u32> {
    text.split(':').next()?.parse().ok()
}

/// Persisted form of one bus: the `<midi-bus>` subtree of the session
/// document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusDocument {
    pub name: String,
    pub mode: BusMode,
    #[serde(rename = "input-gain", default, skip_serializing_if = "Option::is_none")]
    pub input_gain: Option<f32>,
    #[serde(rename = "input-panning", default, skip_serializing_if = "Option::is_none")]
    pub input_panning: Option<f32>,
    #[serde(rename = "input-connects", default, skip_serializing_if = "Vec::is_empty")]
    pub input_connects: Vec<Connect>,
    #[serde(rename = "output-gain", default, skip_serializing_if = "Option::is_none")]
    pub output_gain: Option<f32>,
    #[serde(rename = "output-panning", default, skip_serializing_if = "Option::is_none")]
    pub output_panning: Option<f32>,
    #[serde(rename = "output-connects", default, skip_serializing_if = "Vec::is_empty")]
    pub output_connects: Vec<Connect>,
    #[serde(
        rename = "midi-map",
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "lenient_patches"
    )]
    pub midi_map: Vec<PatchEntry>,
}

/// Best-effort map loading: a malformed `midi-patch` child is skipped and
/// the rest of the document still loads.
fn lenient_patches<'de, D>(deserializer: D) -> std::result::Result<Vec<PatchEntry>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Vec::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<PatchEntry>(value) {
            Ok(entry) => Some(entry),
            Err(error) => {
                warn!(%error, "malformed midi-patch skipped");
                None
            }
        })
        .collect())
}

/// One `<midi-patch>` element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchEntry {
    pub channel: u8,
    #[serde(flatten)]
    pub patch: Patch,
}

pub struct MidiBus {
    name: String,
    mode: BusMode,
    port: Option<PortId>,
    monitor_in: Option<Arc<MidiMonitor>>,
    monitor_out: Option<Arc<MidiMonitor>>,
    patches: BTreeMap<u8, Patch>,
    pending_inputs: Vec<Connect>,
    pending_outputs: Vec<Connect>,
}

impl MidiBus {
    pub fn new(name: impl Into<String>, mode: BusMode, clock: &SharedMonitorClock) -> Self {
        Self {
            name: name.into(),
            mode,
            port: None,
            monitor_in: mode
                .is_input()
                .then(|| Arc::new(MidiMonitor::new(clock.clone()))),
            monitor_out: mode
                .is_output()
                .then(|| Arc::new(MidiMonitor::new(clock.clone()))),
            patches: BTreeMap::new(),
            pending_inputs: Vec::new(),
            pending_outputs: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> BusMode {
        self.mode
    }

    pub fn port(&self) -> Option<PortId> {
        self.port
    }

    pub fn monitor_in(&self) -> Option<&Arc<MidiMonitor>> {
        self.monitor_in.as_ref()
    }

    pub fn monitor_out(&self) -> Option<&Arc<MidiMonitor>> {
        self.monitor_out.as_ref()
    }

    pub fn patches(&self) -> &BTreeMap<u8, Patch> {
        &self.patches
    }

    // ==================== Port Lifecycle ====================

    /// Register the bus port with mode-derived capabilities and tick
    /// timestamping against the engine queue.
    pub fn open(&mut self, backend: &dyn SequencerBackend, queue: QueueId) -> Result<()> {
        let mut caps = PortCaps::default();
        if self.mode.is_input() {
            caps = caps.merge(PortCaps::input());
        }
        if self.mode.is_output() {
            caps = caps.merge(PortCaps::output());
        }
        let port = backend.create_port(&self.name, caps)?;
        backend.set_port_timestamping(port, queue, true)?;
        self.port = Some(port);
        Ok(())
    }

    /// Quiet everything downstream, then unregister the port.
    pub fn close(&mut self, backend: &dyn SequencerBackend) {
        if self.port.is_some() {
            if let Err(error) = self.shut_off(backend, true) {
                warn!(bus = %self.name, %error, "shut-off on close failed");
            }
        }
        if let Some(port) = self.port.take() {
            if let Err(error) = backend.delete_port(port) {
                warn!(bus = %self.name, %error, "port delete failed");
            }
        }
    }

    /// Follow a bus mode change: create the monitors the new mode calls
    /// for, drop the ones it no longer has.
    pub fn update_bus_mode(&mut self, mode: BusMode, clock: &SharedMonitorClock) {
        self.mode = mode;
        if mode.is_input() {
            if self.monitor_in.is_none() {
                self.monitor_in = Some(Arc::new(MidiMonitor::new(clock.clone())));
            }
        } else {
            self.monitor_in = None;
        }
        if mode.is_output() {
            if self.monitor_out.is_none() {
                self.monitor_out = Some(Arc::new(MidiMonitor::new(clock.clone())));
            }
        } else {
            self.monitor_out = None;
        }
    }

    // ==================== Direct Dispatch ====================

    fn send_direct(
        &self,
        backend: &dyn SequencerBackend,
        kind: EventKind,
        channel: u8,
        data1: u8,
        data2: u8,
    ) -> Result<()> {
        let port = self.port.ok_or(Error::PortClosed)?;
        backend.event_output(OutputEvent {
            source: port,
            tag: 0,
            schedule: Schedule::Direct,
            kind,
            channel: channel & 0x0f,
            data1,
            data2,
            duration: 0,
            sysex: None,
        })?;
        backend.drain_output()?;
        Ok(())
    }

    /// Bank/program selection. Records the patch when the instrument name
    /// is meaningful, then emits the bank CCs the method calls for and the
    /// program change.
    pub fn set_patch(
        &mut self,
        backend: &dyn SequencerBackend,
        channel: u8,
        instrument: &str,
        method: BankSelMethod,
        bank: i32,
        program: i32,
    ) -> Result<()> {
        let channel = channel & 0x0f;
        if !instrument.is_empty() {
            self.patches.insert(
                channel,
                Patch {
                    instrument: instrument.to_string(),
                    bank_sel_method: method,
                    bank,
                    program,
                },
            );
        }

        if bank >= 0 && matches!(method, BankSelMethod::Normal | BankSelMethod::MsbOnly) {
            self.send_direct(
                backend,
                EventKind::Controller,
                channel,
                BANK_SELECT_MSB,
                ((bank & 0x3f80) >> 7) as u8,
            )?;
        }
        if bank >= 0 && matches!(method, BankSelMethod::Normal | BankSelMethod::LsbOnly) {
            self.send_direct(
                backend,
                EventKind::Controller,
                channel,
                BANK_SELECT_LSB,
                (bank & 0x007f) as u8,
            )?;
        }
        if program >= 0 {
            self.send_direct(
                backend,
                EventKind::ProgramChange,
                channel,
                0,
                (program & 0x7f) as u8,
            )?;
        }
        Ok(())
    }

    pub fn set_controller(
        &self,
        backend: &dyn SequencerBackend,
        channel: u8,
        controller: u8,
        value: u8,
    ) -> Result<()> {
        self.send_direct(backend, EventKind::Controller, channel, controller, value)
    }

    /// Channel volume, `volume` in `[0, 1]`.
    pub fn set_volume(&self, backend: &dyn SequencerBackend, channel: u8, volume: f32) -> Result<()> {
        let value = ((127.0 * volume).round() as i32 & 0x7f) as u8;
        self.set_controller(backend, channel, CHANNEL_VOLUME, value)
    }

    /// Channel pan, `panning` in `[-1, 1]`, 0 center.
    pub fn set_panning(
        &self,
        backend: &dyn SequencerBackend,
        channel: u8,
        panning: f32,
    ) -> Result<()> {
        let value = (((63.0 * (1.0 + panning)).round() as i32 + 1) & 0x7f) as u8;
        self.set_controller(backend, channel, CHANNEL_PANNING, value)
    }

    /// Universal real-time master volume sysex.
    pub fn set_master_volume(&self, backend: &dyn SequencerBackend, volume: f32) -> Result<()> {
        let value = ((127.0 * volume).round() as i32 & 0x7f) as u8;
        let sysex = [0xf0, 0x7f, 0x7f, 0x04, 0x01, 0x00, value, 0xf7];
        self.send_sysex(backend, &sysex)
    }

    /// Raw sysex passthrough. The caller frames the bytes.
    pub fn send_sysex(&self, backend: &dyn SequencerBackend, sysex: &[u8]) -> Result<()> {
        let port = self.port.ok_or(Error::PortClosed)?;
        backend.event_output(OutputEvent {
            source: port,
            tag: 0,
            schedule: Schedule::Direct,
            kind: EventKind::Sysex,
            channel: 0,
            data1: 0,
            data2: 0,
            duration: 0,
            sysex: Some(sysex),
        })?;
        backend.drain_output()?;
        Ok(())
    }

    /// Silence downstream instruments. While the bus stays open only the
    /// channels that ever received a patch are swept; on close every
    /// channel is, and controllers are reset too.
    pub fn shut_off(&self, backend: &dyn SequencerBackend, close: bool) -> Result<()> {
        let channels: Vec<u8> = if close {
            (0..16).collect()
        } else {
            self.patches.keys().copied().collect()
        };
        for channel in channels {
            self.set_controller(backend, channel, ALL_SOUND_OFF, 0)?;
            self.set_controller(backend, channel, ALL_NOTES_OFF, 0)?;
            if close {
                self.set_controller(backend, channel, ALL_CONTROLLERS_OFF, 0)?;
            }
        }
        Ok(())
    }

    // ==================== Connections ====================

    /// Reconcile one side's pending connect list against the live
    /// subscription graph: items already connected are dropped, the rest
    /// are attempted. Failures stay pending for the next hot-plug
    /// announce. Returns the number of new subscriptions made.
    pub fn update_connects(
        &mut self,
        backend: &dyn SequencerBackend,
        client: u32,
        input_side: bool,
    ) -> usize {
        let Some(port) = self.port else { return 0 };
        let own = PortAddr {
            client,
            port: port.0,
        };
        let name = self.name.clone();

        let current = backend.query_subscribers(port).unwrap_or_default();
        let pending = if input_side {
            &mut self.pending_inputs
        } else {
            &mut self.pending_outputs
        };
        pending.retain(|connect| match connect.addr() {
            Some(addr) => !current.contains(&addr),
            None => {
                warn!(bus = %name, ?connect, "unparseable connect entry dropped");
                false
            }
        });

        let mut updated = 0;
        pending.retain(|connect| {
            let Some(addr) = connect.addr() else {
                return false;
            };
            let (sender, dest) = if input_side { (addr, own) } else { (own, addr) };
            match backend.subscribe(sender, dest) {
                Ok(()) => {
                    updated += 1;
                    false
                }
                Err(error) => {
                    warn!(bus = %name, %error, "subscription pending retry");
                    true
                }
            }
        });
        updated
    }

    /// Connect entries still awaiting a successful subscription.
    pub fn pending_connects(&self, input_side: bool) -> &[Connect] {
        if input_side {
            &self.pending_inputs
        } else {
            &self.pending_outputs
        }
    }

    // ==================== Document ====================

    /// Build a bus from its persisted subtree. Patches with an empty
    /// instrument name are dropped; connects become pending until
    /// `update_connects` lands them.
    pub fn from_document(document: BusDocument, clock: &SharedMonitorClock) -> Self {
        let mut bus = Self::new(document.name, document.mode, clock);
        if let Some(monitor) = &bus.monitor_in {
            if let Some(gain) = document.input_gain {
                monitor.set_gain(gain);
            }
            if let Some(panning) = document.input_panning {
                monitor.set_panning(panning);
            }
        }
        if let Some(monitor) = &bus.monitor_out {
            if let Some(gain) = document.output_gain {
                monitor.set_gain(gain);
            }
            if let Some(panning) = document.output_panning {
                monitor.set_panning(panning);
            }
        }
        for entry in document.midi_map {
            if entry.patch.instrument.is_empty() {
                continue;
            }
            bus.patches.insert(entry.channel & 0x0f, entry.patch);
        }
        bus.pending_inputs = document.input_connects;
        bus.pending_outputs = document.output_connects;
        bus
    }

    /// Snapshot the bus into its persisted subtree. Live connections are
    /// captured from the subscription graph so they can be re-established
    /// on load; unsatisfied pending entries are kept as well.
    pub fn save_document(&self, backend: &dyn SequencerBackend, client: u32) -> BusDocument {
        let mut input_connects = Vec::new();
        let mut output_connects = Vec::new();
        if let Some(port) = self.port {
            let own = PortAddr {
                client,
                port: port.0,
            };
            for addr in backend.query_subscribers(port).unwrap_or_default() {
                if addr == own {
                    continue;
                }
                let connect = Connect {
                    client: addr.client.to_string(),
                    port: addr.port.to_string(),
                };
                if self.mode.is_input() {
                    input_connects.push(connect.clone());
                }
                if self.mode.is_output() {
                    output_connects.push(connect);
                }
            }
        }
        input_connects.extend(self.pending_inputs.iter().cloned());
        output_connects.extend(self.pending_outputs.iter().cloned());

        BusDocument {
            name: self.name.clone(),
            mode: self.mode,
            input_gain: self.monitor_in.as_ref().map(|monitor| monitor.gain()),
            input_panning: self.monitor_in.as_ref().map(|monitor| monitor.panning()),
            input_connects: if self.mode.is_input() {
                input_connects
            } else {
                Vec::new()
            },
            output_gain: self.monitor_out.as_ref().map(|monitor| monitor.gain()),
            output_panning: self.monitor_out.as_ref().map(|monitor| monitor.panning()),
            output_connects: if self.mode.is_output() {
                output_connects
            } else {
                Vec::new()
            },
            midi_map: self
                .patches
                .iter()
                .map(|(&channel, patch)| PatchEntry {
                    channel,
                    patch: patch.clone(),
                })
                .collect(),
        }
    }
}
