//! KORG Volca Sample 2 connector (specification §4.5).
//!
//! Ported near-verbatim from the teacher's own device: `device.rs` and
//! `proto/{header,sample,system}.rs`. The teacher's `App`/`Device` pair and
//! its `Message`/`Header` trait machinery are folded here into a single
//! `FsOps` implementation driving the generalised [`Backend`] instead of a
//! bespoke ALSA `Device`; the wire-level shapes (header bytes, opcode
//! table, name/length/level/speed header layout, 7-bit packed PCM) are
//! unchanged from what the teacher already worked out.

use tracing::debug;

use crate::backend::Backend;
use crate::error::CoreError;
use crate::fs_ops::{
    Control, FsOps, FsOptions, IData, Item, ItemIterator, ItemKind, LoadOptions, SampleFormat,
    SampleInfo, TargetFormat,
};
use crate::sample;
use crate::seven_bit::{pack_block, right_justified_decode, unpack_block, U7};

const HEADER_PREFIX: [u8; 6] = [0xF0, 0x42, 0x30, 0x00, 0x01, 0x2D];

const OP_REQUEST_HEADER: u8 = 0x1E;
const OP_HEADER: u8 = 0x4E;
const OP_REQUEST_DATA: u8 = 0x1F;
const OP_DATA: u8 = 0x4F;
const OP_REQUEST_SPACE: u8 = 0x1B;
const OP_SPACE: u8 = 0x4B;
const OP_ACK: u8 = 0x23;
const OP_BUSY: u8 = 0x24;
const OP_NO_SPACE: u8 = 0x25;
const OP_BAD_MESSAGE: u8 = 0x26;

const NAME_LEN: usize = 24;
const SLOT_COUNT: u32 = 200;
const DEFAULT_SPEED: u16 = 16384;
const DEFAULT_LEVEL: u16 = 65535;

/// Storage-stats unit the device reports sector counts in
/// (`VOLCA_SAMPLE_2_BYTES_PER_SECTOR` in the original, `4 * KI`).
const BYTES_PER_SECTOR: u64 = 4096;

/// Sample start point goes up to roughly 91% of the sample length; the
/// slice filesystem inflates on load and truncates back on save so that
/// 91% of the inflated length recovers the original (specification §9,
/// "keep it as a named parameter").
const SAMPLE_START_POINT: f64 = 0.91;

fn header(channel: u8) -> [u8; 6] {
    let mut out = HEADER_PREFIX;
    out[2] = 0x30 | (channel & 0x0F);
    out
}

/// Splits a sample id into the wire's `lo, hi` 7-bit pair.
fn split_id(id: u32) -> [u8; 2] {
    let (msb, lsb) = U7::split_u8(id as u8);
    [lsb.as_u8(), msb]
}

fn merge_id(lsb: u8, msb: u8) -> u32 {
    U7::new(lsb).merge(msb != 0) as u32
}

fn send(backend: &Backend, channel: u8, op: u8, payload: &[u8]) -> Result<(), CoreError> {
    let mut raw = Vec::with_capacity(7 + payload.len());
    raw.extend(header(channel));
    raw.push(op);
    raw.extend(payload);
    raw.push(0xF7);
    backend.tx_sysex(&raw)
}

fn request(backend: &Backend, channel: u8, op: u8, payload: &[u8], timeout_ms: i64) -> Result<Vec<u8>, CoreError> {
    let mut raw = Vec::with_capacity(7 + payload.len());
    raw.extend(header(channel));
    raw.push(op);
    raw.extend(payload);
    raw.push(0xF7);
    backend.tx_and_rx_sysex(&raw, timeout_ms)
}

/// Validates `F0 42 3<ch> 00 01 2D <op> ...` and returns the payload
/// (without the trailing `0xF7`).
fn parse_reply<'a>(raw: &'a [u8], expect_op: u8) -> Result<&'a [u8], CoreError> {
    if raw.len() < 8 || raw[0] != 0xF0 || raw[1] != 0x42 || raw[2] & 0xF0 != 0x30 {
        return Err(CoreError::Protocol);
    }
    if raw[3..6] != HEADER_PREFIX[3..6] {
        return Err(CoreError::Protocol);
    }
    let op = raw[6];
    if op == OP_BUSY {
        return Err(CoreError::Busy);
    }
    if op == OP_NO_SPACE {
        return Err(CoreError::OutOfSpace);
    }
    if op == OP_BAD_MESSAGE {
        return Err(CoreError::Protocol);
    }
    if op != expect_op {
        return Err(CoreError::Protocol);
    }
    let end = raw.len() - 1;
    if raw[end] != 0xF7 {
        return Err(CoreError::Protocol);
    }
    Ok(&raw[7..end])
}

fn parse_status(raw: &[u8]) -> Result<(), CoreError> {
    if raw.len() < 8 {
        return Err(CoreError::Protocol);
    }
    match raw[6] {
        OP_ACK => Ok(()),
        OP_BUSY => Err(CoreError::Busy),
        OP_NO_SPACE => Err(CoreError::OutOfSpace),
        OP_BAD_MESSAGE => Err(CoreError::Protocol),
        _ => Err(CoreError::Protocol),
    }
}

struct HeaderInfo {
    name: String,
    length: u32,
    level: u16,
    speed: u16,
}

fn decode_header_payload(lo: u8, hi: u8, rest: &[u8]) -> Result<(u32, HeaderInfo), CoreError> {
    let id = merge_id(lo, hi);
    let data: Vec<u8> = unpack_block(rest);
    if data.len() < NAME_LEN + 8 {
        return Err(CoreError::Protocol);
    }
    let length = u32::from_le_bytes(data[NAME_LEN..NAME_LEN + 4].try_into().unwrap());
    let level = u16::from_le_bytes(data[NAME_LEN + 4..NAME_LEN + 6].try_into().unwrap());
    let speed = u16::from_le_bytes(data[NAME_LEN + 6..NAME_LEN + 8].try_into().unwrap());
    let mut name_bytes = data[..NAME_LEN].to_vec();
    while name_bytes.last() == Some(&0) {
        name_bytes.pop();
    }
    let name = String::from_utf8(name_bytes).map_err(|_| CoreError::Protocol)?;
    Ok((id, HeaderInfo { name, length, level, speed }))
}

fn encode_header_payload(id: u32, name: &str, length: u32, level: u16, speed: u16) -> Vec<u8> {
    let mut idx = split_id(id).to_vec();
    let mut plain = vec![0u8; NAME_LEN];
    let name_bytes = name.as_bytes();
    let copy_len = name_bytes.len().min(NAME_LEN);
    plain[..copy_len].copy_from_slice(&name_bytes[..copy_len]);
    plain.extend(length.to_le_bytes());
    plain.extend(level.to_le_bytes());
    plain.extend(speed.to_le_bytes());
    idx.extend(pack_block(&plain));
    idx
}

fn target() -> TargetFormat {
    TargetFormat {
        channels: Some(1),
        rate: Some(31250),
        format: Some(SampleFormat::S16),
    }
}

/// KORG Volca Sample 2 filesystem: 200 numbered sample slots.
#[derive(Debug)]
pub struct VolcaSample2 {
    channel: u8,
}

impl VolcaSample2 {
    pub fn new(channel: u8) -> Self {
        Self { channel }
    }
}

impl FsOps for VolcaSample2 {
    fn id(&self) -> &str {
        "volca_sample2"
    }

    fn options(&self) -> FsOptions {
        FsOptions::SLOT_STORAGE
            | FsOptions::MONO
            | FsOptions::SORT_BY_ID
            | FsOptions::SAMPLE_EDITOR
            | FsOptions::SHOW_SAMPLE_COLUMNS
    }

    fn display_name(&self) -> &str {
        "Volca Sample 2"
    }

    fn max_name_len(&self) -> usize {
        NAME_LEN
    }

    fn extensions(&self) -> &[&str] {
        &["wav"]
    }

    fn format_slot(&self, id: i64) -> String {
        format!("{id:03}")
    }

    fn storage_stats(&self, backend: &Backend) -> Result<(u64, u64), CoreError> {
        let raw = request(backend, self.channel, OP_REQUEST_SPACE, &[], -1)?;
        let payload = parse_reply(&raw, OP_SPACE)?;
        if payload.len() < 4 {
            return Err(CoreError::Protocol);
        }
        // The sector fields are a full 14-bit quantity (`lsb | (msb << 7)` in
        // the original's `volca_sample_2_get_size`), not the single merged
        // bit `merge_id` recovers for 0-199/1-16 slot ids.
        let used = right_justified_decode(&payload[0..2]) as u64 * BYTES_PER_SECTOR;
        let all = right_justified_decode(&payload[2..4]) as u64 * BYTES_PER_SECTOR;
        Ok((used, all))
    }

    fn readdir<'a>(
        &'a self,
        backend: &'a Backend,
        _path: &str,
        _extensions: Option<&[&str]>,
    ) -> Result<ItemIterator<'a>, CoreError> {
        let channel = self.channel;
        let iter = (0..SLOT_COUNT).filter_map(move |slot| {
            let raw = request(backend, channel, OP_REQUEST_HEADER, &split_id(slot), -1);
            let raw = match raw {
                Ok(raw) => raw,
                Err(err) => return Some(Err(err)),
            };
            let payload = match parse_reply(&raw, OP_HEADER) {
                Ok(p) => p,
                Err(err) => return Some(Err(err)),
            };
            if payload.len() < 2 {
                return Some(Err(CoreError::Protocol));
            }
            let (id, info) = match decode_header_payload(payload[0], payload[1], &payload[2..]) {
                Ok(v) => v,
                Err(err) => return Some(Err(err)),
            };
            if info.length == 0 && info.name.is_empty() {
                return None;
            }
            Some(Ok(Item {
                name: info.name,
                kind: ItemKind::File,
                size: Some(info.length as u64 * 2),
                id: Some(id as i64),
                sample_info: Some(SampleInfo {
                    frames: info.length,
                    channels: 1,
                    rate: 31250,
                    format: SampleFormat::S16,
                    loop_start: info.length.saturating_sub(1),
                    loop_end: info.length.saturating_sub(1),
                    loop_type: 0,
                    midi_note: 60,
                    midi_fraction: 0,
                    tempo: Some(info.speed as f32 / DEFAULT_SPEED as f32 * 120.0),
                    tags: Default::default(),
                }),
                object_info: format!("level={}", info.level),
            }))
        });
        Ok(Box::new(iter))
    }

    fn download(&self, backend: &Backend, src_path: &str, control: &mut Control<'_>) -> Result<IData, CoreError> {
        let (slot, _) = crate::path_util::parse_slot_path(src_path).ok_or(CoreError::BadInput)?;
        let raw = request(backend, self.channel, OP_REQUEST_HEADER, &split_id(slot), -1)?;
        let payload = parse_reply(&raw, OP_HEADER)?;
        let (_, info) = decode_header_payload(payload[0], payload[1], &payload[2..])?;

        if control.is_canceled() {
            return Err(CoreError::Canceled);
        }
        let raw = request(backend, self.channel, OP_REQUEST_DATA, &split_id(slot), -1)?;
        let payload = parse_reply(&raw, OP_DATA)?;
        let pcm_bytes = unpack_block(&payload[2..]);
        debug!(slot, name = %info.name, bytes = pcm_bytes.len(), "downloaded volca sample 2 slot");

        Ok(IData {
            content: pcm_bytes,
            info: Some(SampleInfo {
                frames: info.length,
                channels: 1,
                rate: 31250,
                format: SampleFormat::S16,
                loop_start: info.length.saturating_sub(1),
                loop_end: info.length.saturating_sub(1),
                loop_type: 0,
                midi_note: 60,
                midi_fraction: 0,
                tempo: None,
                tags: Default::default(),
            }),
            name: Some(info.name),
        })
    }

    fn upload(&self, backend: &Backend, dst_path: &str, idata: IData, control: &mut Control<'_>) -> Result<(), CoreError> {
        let (slot, name) = crate::path_util::parse_slot_path(dst_path).ok_or(CoreError::BadInput)?;
        let name = name
            .map(str::to_string)
            .or(idata.name.clone())
            .unwrap_or_default();
        let samples: Vec<i16> = idata
            .content
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();

        let header_payload = encode_header_payload(slot, &name, samples.len() as u32, DEFAULT_LEVEL, DEFAULT_SPEED);
        let raw = request(backend, self.channel, OP_HEADER, &header_payload, -1)?;
        parse_status(&raw)?;

        if control.is_canceled() {
            return Err(CoreError::Canceled);
        }
        let pcm_bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let mut data_payload = split_id(slot).to_vec();
        data_payload.extend(pack_block(&pcm_bytes));
        let raw = request(backend, self.channel, OP_DATA, &data_payload, -1)?;
        parse_status(&raw)?;
        control.report(1.0);
        Ok(())
    }

    fn delete(&self, backend: &Backend, path: &str) -> Result<(), CoreError> {
        let (slot, _) = crate::path_util::parse_slot_path(path).ok_or(CoreError::BadInput)?;
        let empty = encode_header_payload(slot, "", 0, 0, 0);
        let raw = request(backend, self.channel, OP_HEADER, &empty, -1)?;
        parse_status(&raw)
    }

    fn clear(&self, backend: &Backend, path: &str) -> Result<(), CoreError> {
        self.delete(backend, path)
    }

    fn load(&self, path: &str, control: &mut Control<'_>, opts: LoadOptions) -> Result<IData, CoreError> {
        let bytes = std::fs::read(path).map_err(|_| CoreError::BadInput)?;
        sample::load(&bytes, target(), opts, |p| control.report(p), || control.is_canceled())
    }

    fn save(&self, path: &str, idata: &IData, _control: &mut Control<'_>) -> Result<(), CoreError> {
        let bytes = sample::save(idata)?;
        std::fs::write(path, bytes).map_err(|_| CoreError::BadInput)
    }
}

/// KORG Volca Sample 2 "slice" filesystem: identical wire protocol to
/// [`VolcaSample2`], except the sample length is tweaked so a slice's
/// effective end reaches 100% of the stored length instead of
/// [`SAMPLE_START_POINT`] of it (specification §9; grounded on the
/// original's `volca_sample_2_slice_load`/`_save`, which differ from the
/// plain sample filesystem only in this length adjustment). Delegates
/// every other operation to an inner [`VolcaSample2`].
#[derive(Debug)]
pub struct VolcaSample2Slice {
    inner: VolcaSample2,
}

impl VolcaSample2Slice {
    pub fn new(channel: u8) -> Self {
        Self { inner: VolcaSample2::new(channel) }
    }
}

impl FsOps for VolcaSample2Slice {
    fn id(&self) -> &str {
        "volca_sample2_slice"
    }

    fn options(&self) -> FsOptions {
        self.inner.options()
    }

    fn display_name(&self) -> &str {
        "Slices"
    }

    fn max_name_len(&self) -> usize {
        self.inner.max_name_len()
    }

    fn extensions(&self) -> &[&str] {
        self.inner.extensions()
    }

    fn format_slot(&self, id: i64) -> String {
        self.inner.format_slot(id)
    }

    fn storage_stats(&self, backend: &Backend) -> Result<(u64, u64), CoreError> {
        self.inner.storage_stats(backend)
    }

    fn readdir<'a>(
        &'a self,
        backend: &'a Backend,
        path: &str,
        extensions: Option<&[&str]>,
    ) -> Result<ItemIterator<'a>, CoreError> {
        self.inner.readdir(backend, path, extensions)
    }

    fn download(&self, backend: &Backend, src_path: &str, control: &mut Control<'_>) -> Result<IData, CoreError> {
        self.inner.download(backend, src_path, control)
    }

    fn upload(&self, backend: &Backend, dst_path: &str, idata: IData, control: &mut Control<'_>) -> Result<(), CoreError> {
        self.inner.upload(backend, dst_path, idata, control)
    }

    fn delete(&self, backend: &Backend, path: &str) -> Result<(), CoreError> {
        self.inner.delete(backend, path)
    }

    fn clear(&self, backend: &Backend, path: &str) -> Result<(), CoreError> {
        self.inner.clear(backend, path)
    }

    /// Appends silence so the sample reaches `slice_len = ceil(sample_len /
    /// SAMPLE_START_POINT)` frames: once the device plays back only
    /// `SAMPLE_START_POINT` of that inflated length, it recovers the
    /// original sample length.
    fn load(&self, path: &str, control: &mut Control<'_>, opts: LoadOptions) -> Result<IData, CoreError> {
        let mut idata = self.inner.load(path, control, opts)?;
        let sample_len = idata.content.len() / 2;
        let slice_len = (sample_len as f64 / SAMPLE_START_POINT).ceil() as usize;
        idata.content.resize(slice_len * 2, 0);
        if let Some(info) = idata.info.as_mut() {
            info.frames = slice_len as u32;
        }
        Ok(idata)
    }

    /// Inverse of [`VolcaSample2Slice::load`]: truncates back down to
    /// `sample_len = slice_len * SAMPLE_START_POINT` frames and rewrites the
    /// loop points to the new end.
    fn save(&self, path: &str, idata: &IData, control: &mut Control<'_>) -> Result<(), CoreError> {
        let slice_len = idata.content.len() / 2;
        let sample_len = (slice_len as f64 * SAMPLE_START_POINT) as usize;
        let mut idata = idata.clone();
        idata.content.truncate(sample_len * 2);
        if let Some(info) = idata.info.as_mut() {
            info.frames = sample_len as u32;
            info.loop_start = sample_len.saturating_sub(1) as u32;
            info.loop_end = info.loop_start;
        }
        self.inner.save(path, &idata, control)
    }
}

const OP_REQUEST_PATTERN: u8 = 0x1D;
const OP_PATTERN: u8 = 0x4D;
const PATTERN_COUNT: u32 = 16;

/// KORG Volca Sample 2 pattern storage: 16 numbered pattern slots, 1-based
/// on the wire and in the UI (specification §4.5, "Volca Sample 2":
/// "16 pattern slots; pattern slot storage is 1-based on the wire and
/// 1-based in the UI"). Pattern contents are an opaque byte blob — the
/// specification's data model treats device presets this way (§3,
/// Non-goals) — so unlike [`VolcaSample2`] this filesystem carries no
/// [`SampleInfo`] and applies no resampling.
#[derive(Debug)]
pub struct VolcaSample2Patterns {
    channel: u8,
}

impl VolcaSample2Patterns {
    pub fn new(channel: u8) -> Self {
        Self { channel }
    }
}

impl FsOps for VolcaSample2Patterns {
    fn id(&self) -> &str {
        "volca_sample2_patterns"
    }

    fn options(&self) -> FsOptions {
        FsOptions::SLOT_STORAGE | FsOptions::SORT_BY_ID
    }

    fn display_name(&self) -> &str {
        "Volca Sample 2 Patterns"
    }

    fn extensions(&self) -> &[&str] {
        &["syx"]
    }

    fn format_slot(&self, id: i64) -> String {
        format!("{id:02}")
    }

    fn readdir<'a>(
        &'a self,
        _backend: &'a Backend,
        _path: &str,
        _extensions: Option<&[&str]>,
    ) -> Result<ItemIterator<'a>, CoreError> {
        let iter = (1..=PATTERN_COUNT).map(|slot| {
            Ok(Item {
                name: slot.to_string(),
                kind: ItemKind::File,
                size: None,
                id: Some(slot as i64),
                sample_info: None,
                object_info: String::new(),
            })
        });
        Ok(Box::new(iter))
    }

    fn download(&self, backend: &Backend, src_path: &str, control: &mut Control<'_>) -> Result<IData, CoreError> {
        let (slot, _) = crate::path_util::parse_slot_path(src_path).ok_or(CoreError::BadInput)?;
        if slot < 1 || slot > PATTERN_COUNT {
            return Err(CoreError::BadInput);
        }
        if control.is_canceled() {
            return Err(CoreError::Canceled);
        }
        let raw = request(backend, self.channel, OP_REQUEST_PATTERN, &split_id(slot), -1)?;
        let payload = parse_reply(&raw, OP_PATTERN)?;
        if payload.len() < 2 {
            return Err(CoreError::Protocol);
        }
        let content = unpack_block(&payload[2..]);
        debug!(slot, bytes = content.len(), "downloaded volca sample 2 pattern slot");
        control.report(1.0);
        Ok(IData { content, info: None, name: Some(slot.to_string()) })
    }

    fn upload(&self, backend: &Backend, dst_path: &str, idata: IData, control: &mut Control<'_>) -> Result<(), CoreError> {
        let (slot, _) = crate::path_util::parse_slot_path(dst_path).ok_or(CoreError::BadInput)?;
        if slot < 1 || slot > PATTERN_COUNT {
            return Err(CoreError::BadInput);
        }
        if control.is_canceled() {
            return Err(CoreError::Canceled);
        }
        let mut payload = split_id(slot).to_vec();
        payload.extend(pack_block(&idata.content));
        let raw = request(backend, self.channel, OP_PATTERN, &payload, -1)?;
        parse_status(&raw)?;
        control.report(1.0);
        Ok(())
    }

    fn delete(&self, backend: &Backend, path: &str) -> Result<(), CoreError> {
        let (slot, _) = crate::path_util::parse_slot_path(path).ok_or(CoreError::BadInput)?;
        if slot < 1 || slot > PATTERN_COUNT {
            return Err(CoreError::BadInput);
        }
        let payload = split_id(slot).to_vec();
        let raw = request(backend, self.channel, OP_PATTERN, &payload, -1)?;
        parse_status(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_slot_ids_are_one_based() {
        let fs_ops = VolcaSample2Patterns::new(0);
        let backend = Backend::new(false);
        let items: Vec<_> = fs_ops
            .readdir(&backend, "/", None)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(items.len(), PATTERN_COUNT as usize);
        assert_eq!(items[0].id, Some(1));
        assert_eq!(items.last().unwrap().id, Some(PATTERN_COUNT as i64));
    }

    #[test]
    fn download_rejects_out_of_range_slot() {
        let fs_ops = VolcaSample2Patterns::new(0);
        let backend = Backend::new(false);
        let canceled = std::sync::atomic::AtomicBool::new(false);
        let mut control = Control { parts: 1, part: 0, progress: 0.0, canceled: &canceled, on_progress: None };
        assert_eq!(fs_ops.download(&backend, "/0", &mut control), Err(CoreError::BadInput));
        assert_eq!(fs_ops.download(&backend, "/17", &mut control), Err(CoreError::BadInput));
    }

    #[test]
    fn header_payload_roundtrips_through_packing() {
        let payload = encode_header_payload(17, "kick", 4096, 100, 200);
        let (id, info) = decode_header_payload(payload[0], payload[1], &payload[2..]).unwrap();
        assert_eq!(id, 17);
        assert_eq!(info.name, "kick");
        assert_eq!(info.length, 4096);
        assert_eq!(info.level, 100);
        assert_eq!(info.speed, 200);
    }

    #[test]
    fn split_merge_id_roundtrips() {
        for id in [0u32, 1, 42, 127, 199] {
            let [lsb, msb] = split_id(id);
            assert_eq!(merge_id(lsb, msb), id);
        }
    }

    #[test]
    fn parse_reply_maps_busy_opcode() {
        let mut raw = header(0).to_vec();
        raw.push(OP_BUSY);
        raw.push(0xF7);
        assert_eq!(parse_reply(&raw, OP_HEADER), Err(CoreError::Busy));
    }

    #[test]
    fn storage_stats_decodes_full_sector_range_and_scales_to_bytes() {
        // lsb=0x7f, msb=0x03 -> 0x7f | (3 << 7) = 511 sectors, far past the
        // single-bit range merge_id recovers.
        let used_sectors = right_justified_decode(&[0x7F, 0x03]);
        assert_eq!(used_sectors, 511);
        assert_eq!(used_sectors as u64 * BYTES_PER_SECTOR, 511 * 4096);
    }

    fn make_wav(samples: &[i16]) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 31250,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut buf = Vec::new();
        {
            let mut writer = hound::WavWriter::new(std::io::Cursor::new(&mut buf), spec).unwrap();
            for &s in samples {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        buf
    }

    fn no_cancel_control(canceled: &std::sync::atomic::AtomicBool) -> Control<'_> {
        Control { parts: 1, part: 0, progress: 0.0, canceled, on_progress: None }
    }

    #[test]
    fn slice_load_inflates_length_by_sample_start_point() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.wav");
        let samples = vec![0i16; 1000];
        std::fs::write(&path, make_wav(&samples)).unwrap();

        let fs_ops = VolcaSample2Slice::new(0);
        let canceled = std::sync::atomic::AtomicBool::new(false);
        let mut control = no_cancel_control(&canceled);
        let idata = fs_ops
            .load(path.to_str().unwrap(), &mut control, crate::fs_ops::LoadOptions::default())
            .unwrap();

        let expected_len = (1000f64 / SAMPLE_START_POINT).ceil() as usize;
        assert_eq!(idata.content.len(), expected_len * 2);
        assert_eq!(idata.info.unwrap().frames, expected_len as u32);
    }

    #[test]
    fn slice_save_truncates_and_rewrites_loop_points() {
        let slice_len = 1100usize;
        let idata = IData {
            content: vec![0u8; slice_len * 2],
            info: Some(SampleInfo {
                frames: slice_len as u32,
                channels: 1,
                rate: 31250,
                format: SampleFormat::S16,
                loop_start: slice_len as u32 - 1,
                loop_end: slice_len as u32 - 1,
                loop_type: 0,
                midi_note: 60,
                midi_fraction: 0,
                tempo: None,
                tags: Default::default(),
            }),
            name: None,
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let fs_ops = VolcaSample2Slice::new(0);
        let canceled = std::sync::atomic::AtomicBool::new(false);
        let mut control = no_cancel_control(&canceled);
        fs_ops.save(path.to_str().unwrap(), &idata, &mut control).unwrap();

        let expected_sample_len = (slice_len as f64 * SAMPLE_START_POINT) as usize;
        let written = std::fs::read(&path).unwrap();
        let reader = hound::WavReader::new(std::io::Cursor::new(written)).unwrap();
        assert_eq!(reader.duration() as usize, expected_sample_len);
    }
}
