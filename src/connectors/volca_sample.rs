//! KORG Volca Sample (1) connector (specification §4.5, "Volca Sample 1 /
//! SyRO").
//!
//! Grounded on `connectors/volca_sample.c`: this device never talks MIDI at
//! all (`CONNECTOR_OPTION_NO_MIDI` in the original), so unlike every other
//! connector in this crate it never touches [`Backend`]'s SysEx transport.
//! Samples are instead synthesised into an audio stream and played through
//! the host's speaker output into the Volca Sample's audio-in jack, or, in
//! "dump" mode, written to a WAV file instead of played. The real Korg SyRO
//! encoder is a closed-source binary SDK (`volca_sample_sdk/`, headers only
//! in the retrieval pack, no implementation) - the lossless little-endian
//! framing in [`encode_syro`]/[`decode_syro_header`] below is this crate's
//! own stand-in for it, not a port of Korg's bitstream, and is documented as
//! such in the design ledger. The four-stage upload (`encode`, `reload`,
//! `playback`, `settle`) and the fixed 31250 Hz mono load rate are carried
//! over from `volca_sample_get_syro_op`/`volca_sample_send_syro`/
//! `volca_sample_load` unchanged.

use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use crate::audio_host::AudioHost;
use crate::backend::Backend;
use crate::error::CoreError;
use crate::fs_ops::{
    Control, FsOps, FsOptions, IData, Item, ItemIterator, ItemKind, LoadOptions, SampleFormat,
    SampleInfo, TargetFormat,
};
use crate::sample;

const MAX_SAMPLES: u32 = 100;
const NATIVE_RATE: u32 = 31250;
const SYRO_RATE: u32 = 44100;
const SYRO_CHANNELS: u16 = 2;
const SETTLE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyroKind {
    Sample,
    Erase,
}

/// Encodes `(kind, id, quality)` as four duplicated-channel header frames
/// followed by the payload duplicated to both channels. See the module
/// doc comment: this is this crate's own framing, not Korg's.
fn encode_syro(kind: SyroKind, id: u32, quality: u8, pcm: &[i16]) -> Vec<i16> {
    let kind_code: i16 = match kind {
        SyroKind::Sample => 1,
        SyroKind::Erase => 2,
    };
    let header = [kind_code, (id & 0x7fff) as i16, ((id >> 15) & 0x7fff) as i16, quality as i16];
    let mut out = Vec::with_capacity((header.len() + pcm.len()) * 2);
    for h in header {
        out.push(h);
        out.push(h);
    }
    for &s in pcm {
        out.push(s);
        out.push(s);
    }
    out
}

/// Inverse of [`encode_syro`]'s header; returns `(kind, id, quality,
/// mono_payload)`.
fn decode_syro_header(stereo: &[i16]) -> Option<(SyroKind, u32, u8, Vec<i16>)> {
    if stereo.len() < 8 {
        return None;
    }
    let kind = match stereo[0] {
        1 => SyroKind::Sample,
        2 => SyroKind::Erase,
        _ => return None,
    };
    let id = ((stereo[4] as u32 & 0x7fff) << 15) | (stereo[2] as u32 & 0x7fff);
    let quality = stereo[6] as u8;
    let payload: Vec<i16> = stereo[8..].iter().step_by(2).copied().collect();
    Some((kind, id, quality, payload))
}

fn syro_sample_info(frames: u32) -> SampleInfo {
    SampleInfo {
        frames,
        channels: SYRO_CHANNELS,
        rate: SYRO_RATE,
        format: SampleFormat::S16,
        loop_start: frames.saturating_sub(1),
        loop_end: frames.saturating_sub(1),
        loop_type: 0,
        midi_note: 0,
        midi_fraction: 0,
        tempo: None,
        tags: Default::default(),
    }
}

/// KORG Volca Sample 1 storage. `quality` selects linear (`None`) vs
/// compressed (`Some(8)`/`Some(16)`) encoding; `dump` selects writing the
/// synthesised stream to a WAV file instead of playing it live.
#[derive(Debug)]
pub struct VolcaSample {
    quality: Option<u8>,
    dump: bool,
    audio: Mutex<AudioHost>,
}

impl VolcaSample {
    pub fn live(quality: Option<u8>) -> Self {
        Self { quality, dump: false, audio: Mutex::new(AudioHost::new()) }
    }

    pub fn dump(quality: Option<u8>) -> Self {
        Self { quality, dump: true, audio: Mutex::new(AudioHost::new()) }
    }

    fn slot_id(&self) -> &str {
        match (self.quality, self.dump) {
            (None, false) => "sample",
            (Some(16), false) => "sample-comp-16b",
            (Some(8), false) => "sample-comp-8b",
            (None, true) => "sample-dump",
            (Some(16), true) => "sample-comp-16b-dump",
            (Some(8), true) => "sample-comp-8b-dump",
            _ => "sample",
        }
    }

    /// Plays a synthesised stream out through the default output device,
    /// resampling to its native rate first if needed (`volca_sample_send_syro`).
    fn send_syro(&self, syro: &IData, control: Option<&mut Control<'_>>) -> Result<(), CoreError> {
        let mut audio = self.audio.lock().expect("audio mutex poisoned");
        let reloaded = match audio.native_output_rate() {
            Some(rate) if rate != SYRO_RATE => {
                let wav = sample::save(syro)?;
                sample::load(
                    &wav,
                    TargetFormat { channels: Some(SYRO_CHANNELS), rate: Some(rate), format: Some(SampleFormat::S16) },
                    LoadOptions::default(),
                    |_| {},
                    || false,
                )?
            }
            _ => syro.clone(),
        };
        if let Some(control) = control {
            control.part += 1;
        }
        audio.play_and_wait(&reloaded, || false)?;
        std::thread::sleep(SETTLE);
        Ok(())
    }
}

impl FsOps for VolcaSample {
    fn id(&self) -> &str {
        self.slot_id()
    }

    fn options(&self) -> FsOptions {
        if self.dump {
            FsOptions::SINGLE_OP | FsOptions::SLOT_STORAGE
        } else {
            FsOptions::SAMPLE_EDITOR
                | FsOptions::MONO
                | FsOptions::SINGLE_OP
                | FsOptions::SLOT_STORAGE
                | FsOptions::AUDIO_LINK
        }
    }

    fn display_name(&self) -> &str {
        match (self.quality, self.dump) {
            (None, false) => "Samples",
            (Some(16), false) => "Samples compressed 16 bits",
            (Some(8), false) => "Samples compressed 8 bits",
            (None, true) => "Samples (dump)",
            (Some(16), true) => "Samples compressed 16 bits (dump)",
            (Some(8), true) => "Samples compressed 8 bits (dump)",
            _ => "Samples",
        }
    }

    fn extensions(&self) -> &[&str] {
        &["wav"]
    }

    fn format_slot(&self, id: i64) -> String {
        id.to_string()
    }

    fn readdir<'a>(
        &'a self,
        _backend: &'a Backend,
        path: &str,
        _extensions: Option<&[&str]>,
    ) -> Result<ItemIterator<'a>, CoreError> {
        if path != "/" {
            return Err(CoreError::BadInput);
        }
        let iter = (0..MAX_SAMPLES).map(|slot| {
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

    /// Resamples arbitrary host PCM to the Volca Sample's fixed mono
    /// 31250 Hz 16-bit capture rate before synthesis (`volca_sample_load`:
    /// "Resampling is not needed but doing it here makes results
    /// repeatable").
    fn load(&self, path: &str, control: &mut Control<'_>, opts: LoadOptions) -> Result<IData, CoreError> {
        let bytes = std::fs::read(path).map_err(|_| CoreError::BadInput)?;
        let target = TargetFormat { channels: Some(1), rate: Some(NATIVE_RATE), format: Some(SampleFormat::S16) };
        let idata = sample::load(&bytes, target, opts, |p| control.report(p), || control.is_canceled())?;
        control.part += 1;
        Ok(idata)
    }

    fn upload(&self, _backend: &Backend, dst_path: &str, idata: IData, control: &mut Control<'_>) -> Result<(), CoreError> {
        let (slot, _) = crate::path_util::parse_slot_path(dst_path).ok_or(CoreError::BadInput)?;
        if slot >= MAX_SAMPLES {
            return Err(CoreError::BadInput);
        }
        let pcm: Vec<i16> = idata.content.chunks_exact(2).map(|c| i16::from_le_bytes([c[0], c[1]])).collect();

        let quality = self.quality.unwrap_or(0);
        let stereo = encode_syro(SyroKind::Sample, slot, quality, &pcm);
        let syro_op = IData { content: stereo.iter().flat_map(|s| s.to_le_bytes()).collect(), info: Some(syro_sample_info(stereo.len() as u32 / 2)), name: None };
        debug!(slot, frames = pcm.len(), "synthesised syro stream for upload");
        control.part += 1;

        if self.dump {
            let bytes = sample::save(&syro_op)?;
            std::fs::write(format!("{slot}.wav"), bytes).map_err(|_| CoreError::BadInput)?;
            control.part += 2;
            control.report(1.0);
            Ok(())
        } else {
            self.send_syro(&syro_op, Some(control))?;
            control.part += 1;
            control.report(1.0);
            Ok(())
        }
    }

    fn delete(&self, _backend: &Backend, path: &str) -> Result<(), CoreError> {
        let (slot, _) = crate::path_util::parse_slot_path(path).ok_or(CoreError::BadInput)?;
        if slot >= MAX_SAMPLES {
            return Err(CoreError::BadInput);
        }
        let stereo = encode_syro(SyroKind::Erase, slot, 0, &[]);
        let syro_op = IData { content: stereo.iter().flat_map(|s| s.to_le_bytes()).collect(), info: Some(syro_sample_info(stereo.len() as u32 / 2)), name: None };
        self.send_syro(&syro_op, None)
    }
}

/// All six registered variants (three qualities x live/dump), matching
/// `volca_sample_handshake`'s `gslist_fill`.
pub fn all_variants() -> Vec<VolcaSample> {
    let qualities = [None, Some(16), Some(8)];
    let mut out = Vec::with_capacity(6);
    for quality in qualities {
        out.push(VolcaSample::live(quality));
    }
    for quality in qualities {
        out.push(VolcaSample::dump(quality));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syro_header_roundtrips() {
        let pcm = vec![100i16, -200, 300];
        let stereo = encode_syro(SyroKind::Sample, 42, 16, &pcm);
        let (kind, id, quality, payload) = decode_syro_header(&stereo).unwrap();
        assert_eq!(kind, SyroKind::Sample);
        assert_eq!(id, 42);
        assert_eq!(quality, 16);
        assert_eq!(payload, pcm);
    }

    #[test]
    fn erase_header_carries_no_payload() {
        let stereo = encode_syro(SyroKind::Erase, 7, 0, &[]);
        let (kind, id, _quality, payload) = decode_syro_header(&stereo).unwrap();
        assert_eq!(kind, SyroKind::Erase);
        assert_eq!(id, 7);
        assert!(payload.is_empty());
    }

    #[test]
    fn readdir_rejects_non_root_path() {
        let fs_ops = VolcaSample::live(None);
        let backend = Backend::new(false);
        assert!(fs_ops.readdir(&backend, "/sub", None).is_err());
    }

    #[test]
    fn dump_variant_reports_single_op_and_slot_storage_only() {
        let fs_ops = VolcaSample::dump(None);
        let opts = fs_ops.options();
        assert!(opts.contains(FsOptions::SLOT_STORAGE));
        assert!(!opts.contains(FsOptions::SAMPLE_EDITOR));
    }
}
