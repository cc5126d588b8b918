//! Audio Host Adapter: playback/record over `cpal` (specification §4.7).
//!
//! The teacher has no audio-host layer of its own (it only ever wrote
//! finished buffers to disk with `hound`), so this module is grounded on
//! the `other_examples/` precedent for wiring `cpal` in the idiomatic way a
//! Rust audio host is wired elsewhere in the pack (the `nih-plug`
//! standalone `cpal` backend): build a host, pick the default
//! input/output device, negotiate a stream config, and drive a callback
//! that only ever touches a mutex-guarded shared struct, never blocking
//! inside the callback itself.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat as CpalFormat, Stream};
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::fs_ops::IData;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecordOptions: u8 {
        const LEFT = 1;
        const RIGHT = 2;
        const STEREO = 3;
        const MONITOR_ONLY = 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Stopped = 0,
    PreparingPlayback,
    Playing,
    StoppingPlayback,
    PreparingRecord,
    Recording,
    StoppingRecord,
}

/// State shared between the UI/task-engine thread and the audio callback,
/// guarded by one mutex so the callback never has to reason about partial
/// updates (specification §4.7: "all guarded by the audio mutex").
pub struct SharedState {
    pub sample: Option<Vec<i16>>,
    pub channels: u16,
    pub rate: u32,
    pub pos: usize,
    pub sel_start: usize,
    pub sel_end: usize,
    pub loop_playback: bool,
    pub mono_mix: bool,
    pub record_options: RecordOptions,
    pub record_buffer: Vec<i16>,
    pub record_len: usize,
    pub monitor_peak: [f32; 2],
    pub volume: f32,
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            sample: None,
            channels: 1,
            rate: 44100,
            pos: 0,
            sel_start: 0,
            sel_end: 0,
            loop_playback: false,
            mono_mix: false,
            record_options: RecordOptions::STEREO,
            record_buffer: Vec::new(),
            record_len: 0,
            monitor_peak: [0.0, 0.0],
            volume: 1.0,
        }
    }
}

pub struct AudioHost {
    state: Arc<Mutex<SharedState>>,
    status: Arc<AtomicU8>,
    playback_stream: Option<Stream>,
    capture_stream: Option<Stream>,
}

impl AudioHost {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SharedState::default())),
            status: Arc::new(AtomicU8::new(Status::Stopped as u8)),
            playback_stream: None,
            capture_stream: None,
        }
    }

    /// Sample rate the default output device reports, used by connectors
    /// that must resample a synthesised stream to match it before playing.
    pub fn native_output_rate(&self) -> Option<u32> {
        let host = cpal::default_host();
        let device = host.default_output_device()?;
        device.default_output_config().ok().map(|c| c.sample_rate().0)
    }

    pub fn status(&self) -> Status {
        match self.status.load(Ordering::SeqCst) {
            0 => Status::Stopped,
            1 => Status::PreparingPlayback,
            2 => Status::Playing,
            3 => Status::StoppingPlayback,
            4 => Status::PreparingRecord,
            5 => Status::Recording,
            _ => Status::StoppingRecord,
        }
    }

    fn set_status(&self, status: Status) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    pub fn load_sample(&self, idata: &IData) -> Result<(), CoreError> {
        let info = idata.info.as_ref().ok_or(CoreError::BadInput)?;
        let samples: Vec<i16> = idata
            .content
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        let mut state = self.state.lock().expect("audio mutex poisoned");
        state.channels = info.channels;
        state.rate = info.rate;
        state.pos = 0;
        state.sel_start = 0;
        state.sel_end = 0;
        state.sample = Some(samples);
        Ok(())
    }

    /// Starts playback on the default output device. The callback only
    /// ever locks the mutex for the duration of one buffer's worth of
    /// frame-by-frame copying (specification §4.7 step 4: never block on
    /// host I/O while holding it).
    pub fn play(&mut self) -> Result<(), CoreError> {
        self.set_status(Status::PreparingPlayback);
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(CoreError::NotConnected)?;
        let config = device.default_output_config().map_err(|_| CoreError::Fatal)?;
        let state = self.state.clone();
        let status = self.status.clone();

        let err_fn = |err| warn!(%err, "playback stream error");
        let stream = match config.sample_format() {
            CpalFormat::I16 => device
                .build_output_stream(
                    &config.into(),
                    move |data: &mut [i16], _| write_to_output_i16(data, &state),
                    err_fn,
                    None,
                )
                .map_err(|_| CoreError::Fatal)?,
            CpalFormat::F32 => device
                .build_output_stream(
                    &config.into(),
                    move |data: &mut [f32], _| write_to_output_f32(data, &state),
                    err_fn,
                    None,
                )
                .map_err(|_| CoreError::Fatal)?,
            _ => return Err(CoreError::Unsupported),
        };
        stream.play().map_err(|_| CoreError::Fatal)?;
        self.playback_stream = Some(stream);
        status.store(Status::Playing as u8, Ordering::SeqCst);
        debug!("playback started");
        Ok(())
    }

    pub fn stop_playback(&mut self) {
        self.set_status(Status::StoppingPlayback);
        self.playback_stream = None;
        self.set_status(Status::Stopped);
    }

    /// Loads `idata` and blocks until playback reaches the end of the
    /// buffer, polling the shared position the callback advances. Used by
    /// connectors that hand a device a SyRO-encoded stream over the
    /// speaker output instead of a wire protocol.
    pub fn play_and_wait(&mut self, idata: &IData, mut is_canceled: impl FnMut() -> bool) -> Result<(), CoreError> {
        self.load_sample(idata)?;
        let total_frames = {
            let info = idata.info.as_ref().ok_or(CoreError::BadInput)?;
            info.frames as usize
        };
        self.play()?;
        loop {
            if is_canceled() {
                self.stop_playback();
                return Err(CoreError::Canceled);
            }
            let pos = self.state.lock().expect("audio mutex poisoned").pos;
            if pos >= total_frames {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        self.stop_playback();
        Ok(())
    }

    /// Allocates the record buffer (specification's reset-for-record) and
    /// starts capture on the default input device.
    pub fn start_record(&mut self, max_record_seconds: u32) -> Result<(), CoreError> {
        self.set_status(Status::PreparingRecord);
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(CoreError::NotConnected)?;
        let config = device.default_input_config().map_err(|_| CoreError::Fatal)?;
        let rate = config.sample_rate().0;
        let channels = config.channels();

        {
            let mut state = self.state.lock().expect("audio mutex poisoned");
            let max_len = rate as usize * max_record_seconds as usize * channels as usize;
            state.record_buffer = vec![0; max_len];
            state.record_len = 0;
            state.rate = rate;
            state.channels = channels;
            state.monitor_peak = [0.0, 0.0];
        }

        let state = self.state.clone();
        let err_fn = |err| warn!(%err, "capture stream error");
        let stream = match config.sample_format() {
            CpalFormat::I16 => device
                .build_input_stream(
                    &config.into(),
                    move |data: &[i16], _| read_from_input_i16(data, &state),
                    err_fn,
                    None,
                )
                .map_err(|_| CoreError::Fatal)?,
            CpalFormat::F32 => device
                .build_input_stream(
                    &config.into(),
                    move |data: &[f32], _| read_from_input_f32(data, &state),
                    err_fn,
                    None,
                )
                .map_err(|_| CoreError::Fatal)?,
            _ => return Err(CoreError::Unsupported),
        };
        stream.play().map_err(|_| CoreError::Fatal)?;
        self.capture_stream = Some(stream);
        self.set_status(Status::Recording);
        Ok(())
    }

    /// Truncates to actually-recorded length, normalises, and trims
    /// leading silence snapped to the nearest zero crossing
    /// (specification §4.7, Finish-recording).
    pub fn finish_record(&mut self) -> Result<IData, CoreError> {
        self.set_status(Status::StoppingRecord);
        self.capture_stream = None;
        let mut state = self.state.lock().expect("audio mutex poisoned");
        state.record_buffer.truncate(state.record_len);
        normalize_i16(&mut state.record_buffer);

        let channels = state.channels as usize;
        let silence_frame = find_first_non_silent_frame(&state.record_buffer, channels);
        let crossing = zero_crossing_seek(&state.record_buffer, channels, silence_frame, Direction::Backward, Slope::Any)
            .unwrap_or(silence_frame);
        let trimmed = state.record_buffer[crossing * channels..].to_vec();

        let mut content = Vec::with_capacity(trimmed.len() * 2);
        for sample in &trimmed {
            content.extend_from_slice(&sample.to_le_bytes());
        }

        let info = crate::fs_ops::SampleInfo {
            frames: (trimmed.len() / channels.max(1)) as u32,
            channels: state.channels,
            rate: state.rate,
            format: crate::fs_ops::SampleFormat::S16,
            loop_start: 0,
            loop_end: 0,
            loop_type: 0,
            midi_note: 60,
            midi_fraction: 0,
            tempo: None,
            tags: Default::default(),
        };
        self.set_status(Status::Stopped);
        Ok(IData {
            content,
            info: Some(info),
            name: None,
        })
    }
}

impl Default for AudioHost {
    fn default() -> Self {
        Self::new()
    }
}

fn write_to_output_i16(output: &mut [i16], state: &Mutex<SharedState>) {
    output.fill(0);
    let mut state = state.lock().expect("audio mutex poisoned");
    let channels = state.channels.max(1) as usize;
    let Some(sample) = state.sample.clone() else {
        return;
    };
    let sel_len = state.sel_end.saturating_sub(state.sel_start);
    let (start, end) = if sel_len > 0 {
        (state.sel_start, state.sel_end)
    } else {
        (0, sample.len() / channels)
    };

    for frame in output.chunks_mut(channels) {
        if state.pos > end {
            if state.loop_playback {
                state.pos = start;
            } else {
                break;
            }
        }
        let base = state.pos * channels;
        if base + channels > sample.len() {
            break;
        }
        if state.mono_mix && channels >= 2 {
            let mono = mono_mix_i16(&sample[base..base + channels]);
            for slot in frame.iter_mut() {
                *slot = (mono as f32 * state.volume) as i16;
            }
        } else {
            for (slot, src) in frame.iter_mut().zip(&sample[base..base + channels]) {
                *slot = (*src as f32 * state.volume) as i16;
            }
        }
        state.pos += 1;
    }
}

fn write_to_output_f32(output: &mut [f32], state: &Mutex<SharedState>) {
    output.fill(0.0);
    let mut scratch = vec![0i16; output.len()];
    write_to_output_i16(&mut scratch, state);
    for (dst, src) in output.iter_mut().zip(scratch) {
        *dst = src as f32 / i16::MAX as f32;
    }
}

fn mono_mix_i16(frame: &[i16]) -> i16 {
    let gain = if frame.len() == 2 {
        0.5
    } else {
        1.0 / (frame.len() as f64).sqrt()
    };
    let sum: f64 = frame.iter().map(|&s| s as f64).sum();
    (sum * gain) as i16
}

fn read_from_input_i16(input: &[i16], state: &Mutex<SharedState>) {
    let mut state = state.lock().expect("audio mutex poisoned");
    let channels = state.channels.max(1) as usize;
    let monitor_only = state.record_options.contains(RecordOptions::MONITOR_ONLY);

    for frame in input.chunks(channels) {
        for (ch, &sample) in frame.iter().enumerate().take(2) {
            let peak = (sample as f32 / i16::MAX as f32).abs();
            if peak > state.monitor_peak[ch] {
                state.monitor_peak[ch] = peak;
            }
        }
        if !monitor_only {
            let len = state.record_len;
            if len + frame.len() <= state.record_buffer.len() {
                state.record_buffer[len..len + frame.len()].copy_from_slice(frame);
                state.record_len += frame.len();
            }
        }
    }
}

fn read_from_input_f32(input: &[f32], state: &Mutex<SharedState>) {
    let scratch: Vec<i16> = input.iter().map(|&s| (s * i16::MAX as f32) as i16).collect();
    read_from_input_i16(&scratch, state);
}

/// Scales so the loudest sample reaches full scale: `ratio =
/// min(SHRT_MAX/max, SHRT_MIN/min)` (specification §4.7, Finish-recording).
fn normalize_i16(buffer: &mut [i16]) {
    let max = buffer.iter().copied().max().unwrap_or(0);
    let min = buffer.iter().copied().min().unwrap_or(0);
    if max == 0 && min == 0 {
        return;
    }
    let ratio_pos = if max > 0 {
        i16::MAX as f64 / max as f64
    } else {
        f64::INFINITY
    };
    let ratio_neg = if min < 0 {
        i16::MIN as f64 / min as f64
    } else {
        f64::INFINITY
    };
    let ratio = ratio_pos.min(ratio_neg);
    if !ratio.is_finite() || ratio <= 1.0 {
        return;
    }
    for sample in buffer.iter_mut() {
        *sample = (*sample as f64 * ratio).clamp(i16::MIN as f64, i16::MAX as f64) as i16;
    }
}

/// First frame whose samples exceed 1% of full scale on any channel.
fn find_first_non_silent_frame(buffer: &[i16], channels: usize) -> usize {
    let threshold = (i16::MAX as f64 * 0.01) as i16;
    buffer
        .chunks(channels.max(1))
        .position(|frame| frame.iter().any(|&s| s.abs() > threshold))
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slope {
    Positive,
    Negative,
    Any,
}

/// Scans frame-by-frame for a zero crossing with the requested slope on
/// every channel (specification §4.7, Zero-crossing seek). Returns the
/// input frame unchanged if none is found.
pub fn zero_crossing_seek(
    buffer: &[i16],
    channels: usize,
    from_frame: usize,
    direction: Direction,
    slope: Slope,
) -> Option<usize> {
    let channels = channels.max(1);
    let total_frames = buffer.len() / channels;
    if total_frames < 2 {
        return None;
    }

    let frame_at = |f: usize| -> &[i16] { &buffer[f * channels..(f + 1) * channels] };
    let is_crossing = |prev: &[i16], next: &[i16]| {
        prev.iter().zip(next).all(|(&p, &n)| match slope {
            Slope::Positive => p < 0 && n >= 0,
            Slope::Negative => p > 0 && n <= 0,
            Slope::Any => (p < 0 && n >= 0) || (p > 0 && n <= 0),
        })
    };

    match direction {
        Direction::Forward => {
            for f in from_frame..total_frames.saturating_sub(1) {
                if is_crossing(frame_at(f), frame_at(f + 1)) {
                    return Some(f + 1);
                }
            }
        }
        Direction::Backward => {
            for f in (1..=from_frame.min(total_frames.saturating_sub(1))).rev() {
                if is_crossing(frame_at(f - 1), frame_at(f)) {
                    return Some(f - 1);
                }
            }
        }
    }
    None
}

/// Deletes `[start, start+length)` frames and rewrites loop points
/// (specification §4.7, Delete range).
pub fn delete_range(
    samples: &mut Vec<i16>,
    channels: usize,
    start: usize,
    length: usize,
    loop_start: &mut usize,
    loop_end: &mut usize,
) {
    let channels = channels.max(1);
    let byte_start = start * channels;
    let byte_end = (start + length) * channels;
    if byte_end <= samples.len() {
        samples.drain(byte_start..byte_end);
    }
    let end = start + length;
    for point in [loop_start, loop_end] {
        if *point >= start && *point < end {
            *point = (samples.len() / channels).saturating_sub(1);
        } else if *point >= end {
            *point -= length;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_scales_to_full_scale() {
        let mut buf = vec![1000i16, -2000, 500];
        normalize_i16(&mut buf);
        assert!(buf.iter().any(|&s| s.unsigned_abs() > 2000));
    }

    #[test]
    fn zero_crossing_forward_finds_sign_change() {
        let buf = vec![-100i16, -50, 10, 80];
        let found = zero_crossing_seek(&buf, 1, 0, Direction::Forward, Slope::Positive);
        assert_eq!(found, Some(2));
    }

    #[test]
    fn zero_crossing_returns_none_when_monotone() {
        let buf = vec![10i16, 20, 30, 40];
        let found = zero_crossing_seek(&buf, 1, 0, Direction::Forward, Slope::Negative);
        assert_eq!(found, None);
    }

    #[test]
    fn delete_range_shifts_trailing_loop_point() {
        let mut samples = vec![0i16; 20];
        let mut loop_start = 15usize;
        let mut loop_end = 18usize;
        delete_range(&mut samples, 1, 2, 5, &mut loop_start, &mut loop_end);
        assert_eq!(samples.len(), 15);
        assert_eq!(loop_start, 10);
        assert_eq!(loop_end, 13);
    }

    #[test]
    fn delete_range_snaps_interior_loop_point_to_tail() {
        let mut samples = vec![0i16; 20];
        let mut loop_start = 4usize;
        let mut loop_end = 18usize;
        delete_range(&mut samples, 1, 2, 5, &mut loop_start, &mut loop_end);
        assert_eq!(loop_start, 14);
    }
}
