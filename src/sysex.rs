//! Frame-aligned SysEx transport (specification §4.1).
//!
//! The receive side is implemented as an explicit parser — [`SysExAssembler`]
//! — that consumes whatever raw byte chunks the underlying MIDI port hands
//! it and produces a sequence of complete `F0 ... F7` messages, self
//! resyncing around stray real-time bytes and non-SysEx prefixes. [`Backend`]
//! (in `backend.rs`) layers timeout/cancel/batch semantics on top by calling
//! [`SysExAssembler::feed`] each time bytes arrive and polling
//! [`SysExAssembler::take_message`] in between.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::CoreError;

pub const EST: u8 = 0xF0;
pub const EOX: u8 = 0xF7;

/// Default identity-reply timeout, used whenever a caller passes `-1`.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Poll granularity used while waiting for bytes that haven't arrived yet.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(20);

/// Per-transfer timeout selector, mirroring the specification's `-1`/`0`
/// sentinels without smuggling them into a plain integer.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    Default,
    Infinite,
    Millis(u64),
}

impl Timeout {
    pub fn from_ms(ms: i64) -> Self {
        match ms {
            -1 => Timeout::Default,
            0 => Timeout::Infinite,
            ms => Timeout::Millis(ms as u64),
        }
    }

    fn duration(self) -> Option<Duration> {
        match self {
            Timeout::Default => Some(DEFAULT_TIMEOUT),
            Timeout::Infinite => None,
            Timeout::Millis(ms) => Some(Duration::from_millis(ms)),
        }
    }
}

/// One in-flight SysEx exchange (specification's `SysExTransfer`).
#[derive(Debug, Clone)]
pub struct SysExTransfer {
    pub raw: Vec<u8>,
    pub timeout: Timeout,
    pub batch: bool,
    pub cancel: Arc<AtomicBool>,
    pub elapsed: Duration,
}

impl SysExTransfer {
    pub fn new(raw: Vec<u8>, timeout_ms: i64, batch: bool) -> Self {
        Self {
            raw,
            timeout: Timeout::from_ms(timeout_ms),
            batch,
            cancel: Arc::new(AtomicBool::new(false)),
            elapsed: Duration::ZERO,
        }
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn is_canceled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// Explicit SysEx re-framing state machine (specification §4.1, steps 1-5).
///
/// Owns a growing buffer of not-yet-consumed bytes. Real-time status bytes
/// (`0xF1..=0xF6`, `0xF8..=0xFF`) interleaved inside a message body are
/// stripped when a complete message is extracted; a leading run of bytes
/// that isn't the start of a SysEx message is dropped outright.
#[derive(Debug, Default)]
pub struct SysExAssembler {
    buffer: Vec<u8>,
}

impl SysExAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes, skipping a leading non-SysEx run per
    /// step 3 of the receive algorithm.
    pub fn feed(&mut self, fresh: &[u8]) {
        if self.buffer.is_empty() {
            match fresh.iter().position(|&b| b == EST) {
                Some(0) => self.buffer.extend_from_slice(fresh),
                Some(start) => self.buffer.extend_from_slice(&fresh[start..]),
                None => {}
            }
        } else {
            self.buffer.extend_from_slice(fresh);
        }
    }

    /// Pull one complete message out of the buffer, if any is present.
    /// Strips interleaved real-time bytes and silently discards the
    /// degenerate empty message `F0 F7`.
    pub fn take_message(&mut self) -> Option<Vec<u8>> {
        loop {
            let end = self.buffer.iter().position(|&b| b == EOX)?;
            let raw: Vec<u8> = self.buffer[..=end]
                .iter()
                .copied()
                .filter(|&b| !is_realtime_status(b) || b == EST || b == EOX)
                .collect();
            self.buffer.drain(..=end);

            if raw.len() == 2 && raw[0] == EST && raw[1] == EOX {
                // Degenerate empty message: drop silently and keep scanning.
                continue;
            }
            return Some(raw);
        }
    }
}

fn is_realtime_status(byte: u8) -> bool {
    matches!(byte, 0xF1..=0xF6 | 0xF8..=0xFF)
}

/// Byte source a [`Backend`](crate::backend::Backend) feeds into the
/// transport. Abstracts over the concrete MIDI input so the receive
/// algorithm can be unit tested against a canned byte stream.
pub trait ByteSource {
    /// Non-blocking read of whatever is currently available; returns an
    /// empty vec (not an error) when nothing has arrived yet.
    fn try_read(&mut self) -> Result<Vec<u8>, CoreError>;
}

/// Runs the normative receive algorithm (specification §4.1) against a
/// [`ByteSource`], honouring `transfer.timeout`, `transfer.batch` and
/// cancellation.
pub fn receive(
    source: &mut dyn ByteSource,
    assembler: &mut SysExAssembler,
    transfer: &mut SysExTransfer,
) -> Result<Vec<u8>, CoreError> {
    let deadline = transfer.timeout.duration();
    let start = Instant::now();
    let mut collected = Vec::new();
    let mut seen_one = false;

    loop {
        if transfer.is_canceled() {
            return Err(CoreError::Canceled);
        }

        if let Some(msg) = assembler.take_message() {
            seen_one = true;
            if transfer.batch {
                collected.extend_from_slice(&msg);
                // In batch mode we keep looping until a read times out.
                continue;
            }
            return Ok(msg);
        }

        let fresh = source.try_read()?;
        if fresh.is_empty() {
            if transfer.batch && seen_one {
                // A read timed out after at least one message: batch done.
                return Ok(collected);
            }
            if let Some(deadline) = deadline {
                if start.elapsed() >= deadline {
                    return if seen_one {
                        Ok(collected)
                    } else {
                        Err(CoreError::TimedOut)
                    };
                }
            }
            std::thread::sleep(POLL_TIMEOUT);
            transfer.elapsed = start.elapsed();
            continue;
        }

        assembler.feed(&fresh);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Canned {
        chunks: Vec<Vec<u8>>,
    }

    impl ByteSource for Canned {
        fn try_read(&mut self) -> Result<Vec<u8>, CoreError> {
            Ok(if self.chunks.is_empty() {
                Vec::new()
            } else {
                self.chunks.remove(0)
            })
        }
    }

    #[test]
    fn single_message_strips_realtime_bytes() {
        let mut source = Canned {
            chunks: vec![vec![0xF8, EST, 0x01, 0xF8, 0x02, EOX]],
        };
        let mut assembler = SysExAssembler::new();
        let mut transfer = SysExTransfer::new(Vec::new(), 100, false);
        let msg = receive(&mut source, &mut assembler, &mut transfer).unwrap();
        assert_eq!(msg, vec![EST, 0x01, 0x02, EOX]);
    }

    #[test]
    fn drops_leading_garbage_until_est() {
        let mut source = Canned {
            chunks: vec![vec![0x01, 0x02, EST, 0x05, EOX]],
        };
        let mut assembler = SysExAssembler::new();
        let mut transfer = SysExTransfer::new(Vec::new(), 100, false);
        let msg = receive(&mut source, &mut assembler, &mut transfer).unwrap();
        assert_eq!(msg, vec![EST, 0x05, EOX]);
    }

    #[test]
    fn drops_degenerate_empty_message() {
        let mut source = Canned {
            chunks: vec![vec![EST, EOX, EST, 0x7, EOX]],
        };
        let mut assembler = SysExAssembler::new();
        let mut transfer = SysExTransfer::new(Vec::new(), 100, false);
        let msg = receive(&mut source, &mut assembler, &mut transfer).unwrap();
        assert_eq!(msg, vec![EST, 0x7, EOX]);
    }

    #[test]
    fn times_out_with_nothing_readable() {
        let mut source = Canned { chunks: vec![] };
        let mut assembler = SysExAssembler::new();
        let mut transfer = SysExTransfer::new(Vec::new(), 30, false);
        let err = receive(&mut source, &mut assembler, &mut transfer).unwrap_err();
        assert_eq!(err, CoreError::TimedOut);
    }

    #[test]
    fn cancel_flag_aborts_receive() {
        let mut source = Canned { chunks: vec![] };
        let mut assembler = SysExAssembler::new();
        let mut transfer = SysExTransfer::new(Vec::new(), 0, false);
        transfer.cancel();
        let err = receive(&mut source, &mut assembler, &mut transfer).unwrap_err();
        assert_eq!(err, CoreError::Canceled);
    }

    #[test]
    fn batch_mode_concatenates_until_idle() {
        let mut source = Canned {
            chunks: vec![
                vec![EST, 1, EOX, EST, 2, EOX],
                vec![], // idle -> batch ends
            ],
        };
        let mut assembler = SysExAssembler::new();
        let mut transfer = SysExTransfer::new(Vec::new(), 100, true);
        let msg = receive(&mut source, &mut assembler, &mut transfer).unwrap();
        assert_eq!(msg, vec![EST, 1, EOX, EST, 2, EOX]);
    }
}
