//! Backend: the mutex-guarded MIDI connection a connector drives
//! (specification §4.2).
//!
//! Grounded on the teacher's `Device` (`device.rs`): that type owned a raw
//! ALSA sequencer client, subscribed a pair of ports to the Volca, and
//! exposed `send`/`receive` generic over the connector's wire types. This
//! version generalises the same shape to `midir` so it runs on every
//! platform midir supports, and widens the surface to the full operation
//! set the specification lists (program change, note on/off, RPN, drain,
//! the standard identity handshake) instead of being wired to one device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, trace};

use crate::error::CoreError;
use crate::path_util::{hexbuf, DEBUG_TRESHOLD};
use crate::sysex::{self, ByteSource, SysExAssembler, SysExTransfer};

/// Device identity populated by the standard Universal Device Inquiry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub company: Vec<u8>,
    pub family: [u8; 2],
    pub model: [u8; 2],
    pub version: [u8; 4],
}

const UNIVERSAL_INQUIRY: [u8; 6] = [0xF0, 0x7E, 0x7F, 0x06, 0x01, 0xF7];
const MIDI_STOP: [u8; 1] = [0xFC];
/// Devices that chunk a send tend to choke above this; matches the
/// teacher's `seq::Event` 256-byte chunking in `Device::send`.
const MAX_CHUNK: usize = 256;

/// Channel-fed [`ByteSource`]: the midir input callback pushes raw bytes
/// here as they arrive, and `receive` pulls whatever is queued without
/// blocking.
struct ChannelSource {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl ByteSource for ChannelSource {
    fn try_read(&mut self) -> Result<Vec<u8>, CoreError> {
        let mut out = Vec::new();
        while let Ok(chunk) = self.rx.try_recv() {
            out.extend(chunk);
        }
        Ok(out)
    }
}

struct Connection {
    midi_in: Option<midir::MidiInputConnection<()>>,
    midi_out: midir::MidiOutputConnection,
    source: ChannelSource,
    assembler: SysExAssembler,
    port_name: String,
}

/// Open MIDI connection plus the protocol-agnostic operations every
/// connector drives (specification §4.2). Interior state is behind a
/// single mutex so concurrent calls from different threads serialise the
/// way the teacher's single ALSA client does implicitly.
pub struct Backend {
    inner: Mutex<Option<Connection>>,
    cancel: Arc<AtomicBool>,
    pub identity: Mutex<Identity>,
    pub stop_on_connect: bool,
}

impl Backend {
    pub fn new(stop_on_connect: bool) -> Self {
        Self {
            inner: Mutex::new(None),
            cancel: Arc::new(AtomicBool::new(false)),
            identity: Mutex::new(Identity::default()),
            stop_on_connect,
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().expect("backend mutex poisoned").is_some()
    }

    /// Open a MIDI input/output port pair by name (matching the teacher's
    /// `find_volca`, generalised to an arbitrary requested name instead of
    /// the hardcoded "volca sample" client).
    pub fn open(&self, port_name: &str) -> Result<(), CoreError> {
        let midi_in = midir::MidiInput::new("elektroid").map_err(|_| CoreError::Fatal)?;
        let midi_out = midir::MidiOutput::new("elektroid").map_err(|_| CoreError::Fatal)?;

        let in_port = find_port(&midi_in.ports(), &midi_in, port_name)
            .ok_or(CoreError::NotConnected)?;
        let out_port = find_port(&midi_out.ports(), &midi_out, port_name)
            .ok_or(CoreError::NotConnected)?;

        let (tx, rx) = mpsc::channel();
        let midi_in = midi_in
            .connect(
                &in_port,
                "elektroid-in",
                move |_stamp, message, _| {
                    let _ = tx.send(message.to_vec());
                },
                (),
            )
            .map_err(|_| CoreError::NotConnected)?;
        let midi_out = midi_out
            .connect(&out_port, "elektroid-out")
            .map_err(|_| CoreError::NotConnected)?;

        *self.inner.lock().expect("backend mutex poisoned") = Some(Connection {
            midi_in: Some(midi_in),
            midi_out,
            source: ChannelSource { rx },
            assembler: SysExAssembler::new(),
            port_name: port_name.to_string(),
        });
        self.cancel.store(false, Ordering::SeqCst);

        if self.stop_on_connect {
            self.tx(&MIDI_STOP)?;
        }
        self.rx_drain();
        self.midi_handshake()?;
        Ok(())
    }

    pub fn close(&self) {
        let mut guard = self.inner.lock().expect("backend mutex poisoned");
        if let Some(mut conn) = guard.take() {
            self.rx_drain_locked(&mut conn);
            if let Some(midi_in) = conn.midi_in.take() {
                let _ = midi_in.close();
            }
            info!(port = %conn.port_name, "closed backend");
        }
        *self.identity.lock().expect("identity mutex poisoned") = Identity::default();
    }

    /// Used by the task engine to interrupt an in-flight transfer from
    /// another thread.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn tx(&self, raw: &[u8]) -> Result<(), CoreError> {
        let mut guard = self.inner.lock().expect("backend mutex poisoned");
        let conn = guard.as_mut().ok_or(CoreError::NotConnected)?;
        Self::tx_locked(conn, raw)
    }

    fn tx_locked(conn: &mut Connection, raw: &[u8]) -> Result<(), CoreError> {
        if raw.len() > DEBUG_TRESHOLD {
            debug!(len = raw.len(), "send msg");
            trace!(raw = ?hexbuf(raw), len = raw.len(), "send msg");
        } else {
            debug!(raw = ?hexbuf(raw), len = raw.len(), "send msg");
        }
        for chunk in raw.chunks(MAX_CHUNK) {
            conn.midi_out.send(chunk).map_err(|_| CoreError::Wire)?;
        }
        Ok(())
    }

    pub fn tx_sysex(&self, raw: &[u8]) -> Result<(), CoreError> {
        self.tx(raw)
    }

    pub fn rx_sysex(&self, transfer: &mut SysExTransfer) -> Result<Vec<u8>, CoreError> {
        transfer.cancel = self.cancel.clone();
        let mut guard = self.inner.lock().expect("backend mutex poisoned");
        let conn = guard.as_mut().ok_or(CoreError::NotConnected)?;
        sysex::receive(&mut conn.source, &mut conn.assembler, transfer)
    }

    pub fn tx_and_rx_sysex(&self, raw: &[u8], timeout_ms: i64) -> Result<Vec<u8>, CoreError> {
        let mut guard = self.inner.lock().expect("backend mutex poisoned");
        let conn = guard.as_mut().ok_or(CoreError::NotConnected)?;
        Self::tx_locked(conn, raw)?;
        let mut transfer = SysExTransfer::new(Vec::new(), timeout_ms, false);
        transfer.cancel = self.cancel.clone();
        sysex::receive(&mut conn.source, &mut conn.assembler, &mut transfer)
    }

    pub fn program_change(&self, channel: u8, program: u8) -> Result<(), CoreError> {
        self.tx(&[0xC0 | (channel & 0x0F), program & 0x7F])
    }

    pub fn note_on(&self, channel: u8, note: u8, velocity: u8) -> Result<(), CoreError> {
        self.tx(&[0x90 | (channel & 0x0F), note & 0x7F, velocity & 0x7F])
    }

    pub fn note_off(&self, channel: u8, note: u8, velocity: u8) -> Result<(), CoreError> {
        self.tx(&[0x80 | (channel & 0x0F), note & 0x7F, velocity & 0x7F])
    }

    pub fn send_controller(&self, channel: u8, controller: u8, value: u8) -> Result<(), CoreError> {
        self.tx(&[0xB0 | (channel & 0x0F), controller & 0x7F, value & 0x7F])
    }

    /// Four-message registered-parameter-number sequence: `CC#101=msb,
    /// CC#100=lsb, CC#6=vmsb, CC#38=vlsb`.
    pub fn send_rpn(
        &self,
        channel: u8,
        msb: u8,
        lsb: u8,
        vmsb: u8,
        vlsb: u8,
    ) -> Result<(), CoreError> {
        self.send_controller(channel, 101, msb)?;
        self.send_controller(channel, 100, lsb)?;
        self.send_controller(channel, 6, vmsb)?;
        self.send_controller(channel, 38, vlsb)
    }

    /// Discard everything currently buffered, on the wire and in the
    /// transport's assembler.
    pub fn rx_drain(&self) {
        let mut guard = self.inner.lock().expect("backend mutex poisoned");
        if let Some(conn) = guard.as_mut() {
            self.rx_drain_locked(conn);
        }
    }

    fn rx_drain_locked(&self, conn: &mut Connection) {
        while let Ok(chunk) = conn.source.rx.try_recv() {
            trace!(len = chunk.len(), "drained stray bytes");
        }
        conn.assembler = SysExAssembler::new();
    }

    /// Universal Device Inquiry (`F0 7E 7F 06 01 F7`); parses the identity
    /// reply (15 or 17 bytes, depending on 1- vs 3-byte manufacturer id).
    pub fn midi_handshake(&self) -> Result<(), CoreError> {
        let raw = self.tx_and_rx_sysex(&UNIVERSAL_INQUIRY, -1)?;
        let identity = parse_identity_reply(&raw)?;
        debug!(?identity, "identity reply");
        *self.identity.lock().expect("identity mutex poisoned") = identity;
        Ok(())
    }
}

fn find_port<T: midir::MidiIO>(
    ports: &[T::Port],
    io: &T,
    wanted: &str,
) -> Option<T::Port>
where
    T::Port: Clone,
{
    ports
        .iter()
        .find(|p| io.port_name(p).map(|n| n == wanted).unwrap_or(false))
        .cloned()
}

/// Parses `F0 7E <channel> 06 02 <manufacturer 1|3 bytes> <family 2> <model
/// 2> <version 4> F7`.
fn parse_identity_reply(raw: &[u8]) -> Result<Identity, CoreError> {
    if raw.len() != 15 && raw.len() != 17 {
        return Err(CoreError::Protocol);
    }
    if raw[0] != 0xF0 || raw[1] != 0x7E || raw[3] != 0x06 || raw[4] != 0x02 {
        return Err(CoreError::Protocol);
    }
    let (company, rest) = if raw[5] == 0x00 {
        (raw[5..8].to_vec(), &raw[8..])
    } else {
        (raw[5..6].to_vec(), &raw[6..])
    };
    if rest.len() != 9 {
        return Err(CoreError::Protocol);
    }
    let mut family = [0u8; 2];
    family.copy_from_slice(&rest[0..2]);
    let mut model = [0u8; 2];
    model.copy_from_slice(&rest[2..4]);
    let mut version = [0u8; 4];
    version.copy_from_slice(&rest[4..8]);
    Ok(Identity {
        company,
        family,
        model,
        version,
    })
}

pub fn poll_interval() -> Duration {
    sysex::POLL_TIMEOUT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_15_byte_identity() {
        let raw = [
            0xF0, 0x7E, 0x00, 0x06, 0x02, 0x42, 0x01, 0x00, 0x08, 0x00, 0x01, 0x00, 0x00, 0x00,
            0xF7,
        ];
        let identity = parse_identity_reply(&raw).unwrap();
        assert_eq!(identity.company, vec![0x42]);
        assert_eq!(identity.family, [0x01, 0x00]);
        assert_eq!(identity.model, [0x08, 0x00]);
    }

    #[test]
    fn parses_17_byte_identity_with_long_manufacturer() {
        let mut raw = vec![0xF0, 0x7E, 0x00, 0x06, 0x02, 0x00, 0x01, 0x02];
        raw.extend([0x01, 0x00, 0x08, 0x00, 0x01, 0x00, 0x00, 0x00]);
        raw.push(0xF7);
        let identity = parse_identity_reply(&raw).unwrap();
        assert_eq!(identity.company, vec![0x00, 0x01, 0x02]);
    }

    #[test]
    fn rejects_bad_length() {
        let raw = [0xF0, 0x7E, 0x00, 0x06, 0x02, 0xF7];
        assert_eq!(parse_identity_reply(&raw), Err(CoreError::Protocol));
    }
}
