//! Arturia MicroFreak connector (specification §4.5, "MicroFreak").
//!
//! No MicroFreak source file ships in the reference pack, so the SysEx
//! envelope here generalises the request/header/data shape the teacher's
//! own Volca Sample 2 connector (`volca_sample2.rs`) already established —
//! manufacturer-prefixed header, opcode byte, 7-bit packed payload, status
//! opcodes — substituting Arturia's registered manufacturer id (`00 20 6B`)
//! and a private sample-slot opcode table. What the specification pins down
//! normatively is reused as-is: the packed-block convention of §4.9 and the
//! private format tag carried in the high bits of `SampleInfo.format`
//! (`SampleFormat::MicroFreak`), plus the 32000 Hz base rate conversion.

use tracing::debug;

use crate::backend::Backend;
use crate::error::CoreError;
use crate::fs_ops::{
    Control, FsOps, FsOptions, IData, Item, ItemIterator, ItemKind, LoadOptions, SampleFormat,
    SampleInfo, TargetFormat,
};
use crate::sample;
use crate::seven_bit::{pack_block, unpack_block, U7};

const MANUFACTURER: [u8; 3] = [0x00, 0x20, 0x6B];
const PRODUCT: u8 = 0x05;

const OP_REQUEST_HEADER: u8 = 0x40;
const OP_HEADER: u8 = 0x41;
const OP_REQUEST_DATA: u8 = 0x42;
const OP_DATA: u8 = 0x43;
const OP_ACK: u8 = 0x7F;
const OP_NAK: u8 = 0x7E;

const NAME_LEN: usize = 16;
const SLOT_COUNT: u32 = 16;
/// Native conversion rate (specification §4.5, "MicroFreak": "rounds samples
/// up to a 32000 Hz base rate").
pub const BASE_RATE: u32 = 32000;

fn header(channel: u8) -> Vec<u8> {
    let mut out = vec![0xF0];
    out.extend(MANUFACTURER);
    out.push(PRODUCT);
    out.push(channel & 0x0F);
    out
}

fn split_id(id: u32) -> [u8; 2] {
    let (msb, lsb) = U7::split_u8(id as u8);
    [lsb.as_u8(), msb]
}

fn merge_id(lsb: u8, msb: u8) -> u32 {
    U7::new(lsb).merge(msb != 0) as u32
}

fn send(backend: &Backend, channel: u8, op: u8, payload: &[u8]) -> Result<(), CoreError> {
    let mut raw = header(channel);
    raw.push(op);
    raw.extend(payload);
    raw.push(0xF7);
    backend.tx_sysex(&raw)
}

fn request(backend: &Backend, channel: u8, op: u8, payload: &[u8]) -> Result<Vec<u8>, CoreError> {
    let mut raw = header(channel);
    raw.push(op);
    raw.extend(payload);
    raw.push(0xF7);
    backend.tx_and_rx_sysex(&raw, -1)
}

fn parse_reply<'a>(raw: &'a [u8], expect_op: u8) -> Result<&'a [u8], CoreError> {
    let prefix = header(0);
    if raw.len() < prefix.len() + 2 || raw[0] != 0xF0 || raw[1..4] != MANUFACTURER || raw[4] != PRODUCT {
        return Err(CoreError::Protocol);
    }
    let op_idx = prefix.len();
    let op = raw[op_idx];
    if op == OP_NAK {
        return Err(CoreError::Protocol);
    }
    if op != expect_op {
        return Err(CoreError::Protocol);
    }
    let end = raw.len() - 1;
    if raw[end] != 0xF7 {
        return Err(CoreError::Protocol);
    }
    Ok(&raw[op_idx + 1..end])
}

struct SlotHeader {
    name: String,
    frames: u32,
    tag: u8,
}

fn decode_header_payload(rest: &[u8]) -> Result<SlotHeader, CoreError> {
    let data = unpack_block(rest);
    if data.len() < NAME_LEN + 5 {
        return Err(CoreError::Protocol);
    }
    let mut name_bytes = data[..NAME_LEN].to_vec();
    while name_bytes.last() == Some(&0) {
        name_bytes.pop();
    }
    let name = String::from_utf8(name_bytes).map_err(|_| CoreError::Protocol)?;
    let frames = u32::from_le_bytes(data[NAME_LEN..NAME_LEN + 4].try_into().unwrap());
    let tag = data[NAME_LEN + 4];
    Ok(SlotHeader { name, frames, tag })
}

fn encode_header_payload(name: &str, frames: u32, tag: u8) -> Vec<u8> {
    let mut plain = vec![0u8; NAME_LEN];
    let name_bytes = name.as_bytes();
    let copy_len = name_bytes.len().min(NAME_LEN);
    plain[..copy_len].copy_from_slice(&name_bytes[..copy_len]);
    plain.extend(frames.to_le_bytes());
    plain.push(tag);
    pack_block(&plain)
}

fn target(tag: u8) -> TargetFormat {
    TargetFormat {
        channels: Some(1),
        rate: Some(BASE_RATE),
        format: Some(SampleFormat::MicroFreak(tag)),
    }
}

/// Arturia MicroFreak sample storage: a fixed set of numbered sample slots,
/// each carrying a private container tag alongside plain PCM.
#[derive(Debug)]
pub struct MicroFreak {
    channel: u8,
}

impl MicroFreak {
    pub fn new(channel: u8) -> Self {
        Self { channel }
    }
}

impl FsOps for MicroFreak {
    fn id(&self) -> &str {
        "microfreak"
    }

    fn options(&self) -> FsOptions {
        FsOptions::SLOT_STORAGE | FsOptions::MONO | FsOptions::SORT_BY_ID | FsOptions::SAMPLE_EDITOR
    }

    fn display_name(&self) -> &str {
        "MicroFreak"
    }

    fn max_name_len(&self) -> usize {
        NAME_LEN
    }

    fn extensions(&self) -> &[&str] {
        &["wav"]
    }

    fn format_slot(&self, id: i64) -> String {
        format!("{id:02}")
    }

    fn readdir<'a>(
        &'a self,
        backend: &'a Backend,
        _path: &str,
        _extensions: Option<&[&str]>,
    ) -> Result<ItemIterator<'a>, CoreError> {
        let channel = self.channel;
        let iter = (0..SLOT_COUNT).filter_map(move |slot| {
            let raw = match request(backend, channel, OP_REQUEST_HEADER, &split_id(slot)) {
                Ok(raw) => raw,
                Err(err) => return Some(Err(err)),
            };
            let payload = match parse_reply(&raw, OP_HEADER) {
                Ok(p) => p,
                Err(err) => return Some(Err(err)),
            };
            let header = match decode_header_payload(payload) {
                Ok(h) => h,
                Err(err) => return Some(Err(err)),
            };
            if header.frames == 0 && header.name.is_empty() {
                return None;
            }
            Some(Ok(Item {
                name: header.name,
                kind: ItemKind::File,
                size: Some(header.frames as u64 * 2),
                id: Some(slot as i64),
                sample_info: Some(SampleInfo {
                    frames: header.frames,
                    channels: 1,
                    rate: BASE_RATE,
                    format: SampleFormat::MicroFreak(header.tag),
                    loop_start: header.frames.saturating_sub(1),
                    loop_end: header.frames.saturating_sub(1),
                    loop_type: 0,
                    midi_note: 60,
                    midi_fraction: 0,
                    tempo: None,
                    tags: Default::default(),
                }),
                object_info: String::new(),
            }))
        });
        Ok(Box::new(iter))
    }

    fn download(&self, backend: &Backend, src_path: &str, control: &mut Control<'_>) -> Result<IData, CoreError> {
        let (slot, _) = crate::path_util::parse_slot_path(src_path).ok_or(CoreError::BadInput)?;
        let header_raw = request(backend, self.channel, OP_REQUEST_HEADER, &split_id(slot))?;
        let header = decode_header_payload(parse_reply(&header_raw, OP_HEADER)?)?;

        if control.is_canceled() {
            return Err(CoreError::Canceled);
        }
        let data_raw = request(backend, self.channel, OP_REQUEST_DATA, &split_id(slot))?;
        let pcm_bytes = unpack_block(parse_reply(&data_raw, OP_DATA)?);
        debug!(slot, name = %header.name, bytes = pcm_bytes.len(), "downloaded microfreak slot");

        Ok(IData {
            content: pcm_bytes,
            info: Some(SampleInfo {
                frames: header.frames,
                channels: 1,
                rate: BASE_RATE,
                format: SampleFormat::MicroFreak(header.tag),
                loop_start: header.frames.saturating_sub(1),
                loop_end: header.frames.saturating_sub(1),
                loop_type: 0,
                midi_note: 60,
                midi_fraction: 0,
                tempo: None,
                tags: Default::default(),
            }),
            name: Some(header.name),
        })
    }

    fn upload(&self, backend: &Backend, dst_path: &str, idata: IData, control: &mut Control<'_>) -> Result<(), CoreError> {
        let (slot, name) = crate::path_util::parse_slot_path(dst_path).ok_or(CoreError::BadInput)?;
        let name = name.map(str::to_string).or(idata.name.clone()).unwrap_or_default();
        let tag = match idata.info.as_ref().map(|i| i.format) {
            Some(SampleFormat::MicroFreak(tag)) => tag,
            _ => 0,
        };
        let frames = idata.content.len() as u32 / 2;

        let header_payload = encode_header_payload(&name, frames, tag);
        let raw = request(backend, self.channel, OP_HEADER, &header_payload)?;
        parse_reply(&raw, OP_ACK)?;

        if control.is_canceled() {
            return Err(CoreError::Canceled);
        }
        let data_payload = pack_block(&idata.content);
        let raw = request(backend, self.channel, OP_DATA, &data_payload)?;
        parse_reply(&raw, OP_ACK)?;
        control.report(1.0);
        Ok(())
    }

    fn delete(&self, backend: &Backend, path: &str) -> Result<(), CoreError> {
        let (slot, _) = crate::path_util::parse_slot_path(path).ok_or(CoreError::BadInput)?;
        let empty = encode_header_payload("", 0, 0);
        let raw = request(backend, self.channel, OP_HEADER, &empty)?;
        parse_reply(&raw, OP_ACK)?;
        let _ = merge_id(split_id(slot)[0], split_id(slot)[1]);
        Ok(())
    }

    /// Coerces arbitrary host PCM into the MicroFreak's fixed mono 32000 Hz
    /// representation before it is packed for the wire (specification
    /// §4.6, applied at the connector boundary rather than inside the
    /// generic pipeline since the target format here is fixed, not
    /// caller-supplied).
    fn load(&self, path: &str, control: &mut Control<'_>, opts: LoadOptions) -> Result<IData, CoreError> {
        let bytes = std::fs::read(path).map_err(|_| CoreError::BadInput)?;
        sample::load(&bytes, target(0), opts, |p| control.report(p), || control.is_canceled())
    }

    fn save(&self, path: &str, idata: &IData, _control: &mut Control<'_>) -> Result<(), CoreError> {
        let bytes = sample::save(idata)?;
        std::fs::write(path, bytes).map_err(|_| CoreError::BadInput)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_payload_roundtrips_through_packing() {
        let payload = encode_header_payload("kick", 4096, 7);
        let header = decode_header_payload(&payload).unwrap();
        assert_eq!(header.name, "kick");
        assert_eq!(header.frames, 4096);
        assert_eq!(header.tag, 7);
    }

    #[test]
    fn split_merge_id_roundtrips() {
        for id in [0u32, 1, 15] {
            let [lsb, msb] = split_id(id);
            assert_eq!(merge_id(lsb, msb), id);
        }
    }

    #[test]
    fn parse_reply_rejects_nak() {
        let mut raw = header(0);
        raw.push(OP_NAK);
        raw.push(0xF7);
        assert_eq!(parse_reply(&raw, OP_HEADER), Err(CoreError::Protocol));
    }
}
