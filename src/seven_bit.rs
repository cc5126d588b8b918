//! 7-bit MIDI-safe encodings shared by every connector.
//!
//! `U7` and the streaming [`Converter`] below are carried over near-verbatim
//! from the Volca Sample 2 connector this crate grew out of; the
//! right-justified, left-justified and packed-block conventions are named in
//! the specification's Path & Utility Layer (§4.9) and are generalised here
//! so the MIDI SDS and MicroFreak connectors can reuse the same primitives.

use bytemuck::{Pod, TransparentWrapper, Zeroable};
use derive_more::{Display, Into};

use crate::path_util::Array;

/// A byte known to have its high bit clear, as required on the MIDI wire.
#[derive(Clone, Copy, Debug, Display, Default, PartialEq, Eq, Into, Pod, Zeroable, TransparentWrapper)]
#[repr(transparent)]
pub struct U7(u8);

impl U7 {
    pub fn new(raw: u8) -> Self {
        debug_assert_eq!(0b1000_0000 & raw, 0);
        Self(raw)
    }

    pub fn new_checked(byte: u8) -> Option<Self> {
        (byte < 0b1000_0000).then_some(Self(byte))
    }

    pub const fn split_u8(num: u8) -> (u8, U7) {
        let msb = (0b1000_0000 & num).rotate_left(1);
        let num = 0b0111_1111 & num;
        (msb, Self(num))
    }

    pub fn merge(self, msb: bool) -> u8 {
        self.0 | (u8::from(msb) << 7)
    }

    pub const fn take_nth_msb(self, n: usize) -> u8 {
        (self.0 & (1 << n)).rotate_left(7 - n as u32)
    }

    pub const fn as_u8(self) -> u8 {
        self.0
    }
}

pub type FromKorgData<I> = Converter<I, U7ToU8>;
pub type IntoKorgData<I> = Converter<I, U8ToU7>;

pub trait Convert {
    type Input: Sized;
    type InputBuffer: Array<ArrayItem = Self::Input>;

    type Output: Sized;
    type OutputBuffer: Array<ArrayItem = Self::Output>;

    /// Len must be less or equal to input length
    fn convert_chunk(input: Self::InputBuffer, len: u8) -> (Self::OutputBuffer, u8);
}

pub struct U8ToU7;
impl U8ToU7 {
    /// `packed_size` from the specification: `8*ceil(len/7) - (7 - len%7)%7`.
    pub fn convert_len(len: usize) -> usize {
        let bits = len * 8;
        bits / 7 + usize::from(bits % 7 != 0)
    }
}
impl Convert for U8ToU7 {
    type Input = u8;
    type InputBuffer = [u8; 7];

    type Output = U7;
    type OutputBuffer = [U7; 8];

    fn convert_chunk(input: Self::InputBuffer, len: u8) -> (Self::OutputBuffer, u8) {
        let mut output = [U7(0); 8];
        let mut amount_to_take = 0;

        assert!(len as usize <= Self::InputBuffer::LEN);
        for (idx, byte) in input.into_iter().enumerate().take(len as usize) {
            let (msb, byte7) = U7::split_u8(byte);
            output[0].0 |= msb << idx;
            output[idx + 1] = byte7;
            amount_to_take += 1;
        }

        if amount_to_take > 0 {
            amount_to_take += 1;
        }

        (output, amount_to_take)
    }
}

pub struct U7ToU8;
impl U7ToU8 {
    pub fn convert_len(len: usize) -> usize {
        let bits = len * 7;
        bits / 8 + usize::from(bits % 8 != 0)
    }
}

impl Convert for U7ToU8 {
    type Input = U7;
    type InputBuffer = [U7; 8];

    type Output = u8;
    type OutputBuffer = [u8; 7];

    fn convert_chunk(input: Self::InputBuffer, len: u8) -> (Self::OutputBuffer, u8) {
        let mut output = [0; 7];
        let mut amount_to_take = 0;

        assert!(len as usize <= Self::InputBuffer::LEN);
        if len > 1 {
            let (msbs, input) = input.split_first().expect("it's an array");
            for (idx, byte) in input.iter().enumerate().take(len as usize - 1) {
                output[idx] = byte.0 | msbs.take_nth_msb(idx);
                amount_to_take += 1;
            }
        }

        (output, amount_to_take)
    }
}

// Helper type to extract IntoIter
type OutputIter<C> = <<C as Convert>::OutputBuffer as IntoIterator>::IntoIter;

pub struct Converter<I, C: Convert> {
    inner: I,
    buffer: OutputIter<C>,
    amount_to_take: u8,
}

impl<Iter, C> Converter<Iter, C>
where
    Iter: Iterator<Item = C::Input>,
    C: Convert,
    C::InputBuffer: Default,
{
    pub fn new(iter: Iter) -> Self
    where
        C::OutputBuffer: Default,
    {
        let mut this = Self {
            inner: iter,
            buffer: C::OutputBuffer::default().into_iter(),
            amount_to_take: 0,
        };
        this.setup_new_buffer();
        this
    }

    fn setup_new_buffer(&mut self) {
        let mut input = C::InputBuffer::default();
        let mut input_len = 0;

        for (idx, byte) in self.inner.by_ref().enumerate().take(C::InputBuffer::LEN) {
            input[idx] = byte;
            input_len += 1;
        }

        if input_len > 0 {
            let (output, amount_to_take) = C::convert_chunk(input, input_len);
            self.amount_to_take = amount_to_take;
            self.buffer = output.into_iter();
        }
    }
}

impl<I, C> Iterator for Converter<I, C>
where
    I: Iterator<Item = C::Input>,
    C: Convert,
    C::InputBuffer: Default,
{
    type Item = C::Output;

    fn next(&mut self) -> Option<Self::Item> {
        if self.amount_to_take == 0 {
            self.setup_new_buffer();
        }

        if self.amount_to_take > 0 {
            self.amount_to_take -= 1;
            self.buffer.next()
        } else {
            None
        }
    }
}

/// Pack an arbitrary byte slice into 7-bit-safe bytes (the "packed SysEx
/// block" convention: runs of 7 input bytes followed by one high-bit byte).
pub fn pack_block(src: &[u8]) -> Vec<u8> {
    IntoKorgData::new(src.iter().copied())
        .map(U7::as_u8)
        .collect()
}

/// Inverse of [`pack_block`].
pub fn unpack_block(src: &[u8]) -> Vec<u8> {
    FromKorgData::new(src.iter().copied().map(U7::new)).collect()
}

/// Right-justified integer decode: `value = sum(data[i] << 7*i)`, used for
/// ids, frame counts, loop points and periods in the MIDI SDS dump header.
pub fn right_justified_decode(data: &[u8]) -> u32 {
    data.iter()
        .enumerate()
        .fold(0u32, |acc, (i, &b)| acc | ((b as u32 & 0x7f) << (7 * i)))
}

/// Inverse of [`right_justified_decode`]; writes `length` 7-bit bytes.
pub fn right_justified_encode(value: u32, length: usize) -> Vec<u8> {
    (0..length)
        .map(|i| ((value >> (7 * i)) & 0x7f) as u8)
        .collect()
}

/// Left-justified signed decode used by the MIDI SDS data packet: a fixed
/// width value occupies the top `bits` of `7*data.len()`, big-endian across
/// the 7-bit words, offset by `0x8000` the way MIDI SDS samples are.
pub fn left_justified_decode_i16(data: &[u8], bits: u32) -> i16 {
    let shifted = data
        .iter()
        .rev()
        .enumerate()
        .fold(0u32, |acc, (i, &b)| acc | ((b as u32 & 0x7f) << (7 * i)));
    let total_bits = 7 * data.len() as u32;
    let value = shifted >> (total_bits - bits);
    (value as i64 - 0x8000) as i16
}

/// Inverse of [`left_justified_decode_i16`]; writes `data.len()` 7-bit bytes.
pub fn left_justified_encode_i16(sample: i16, bits: u32, data: &mut [u8]) {
    let total_bits = 7 * data.len() as u32;
    let value = ((sample as i32 + 0x8000) as u32) << (total_bits - bits);
    for (i, slot) in data.iter_mut().rev().enumerate() {
        *slot = ((value >> (7 * i)) & 0x7f) as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_msb() {
        assert_eq!(U7(0b0000_0001).take_nth_msb(0), 0b1000_0000);
        assert_eq!(U7(0b0000_0001).take_nth_msb(1), 0b0000_0000);

        assert_eq!(U7(0b0000_0010).take_nth_msb(1), 0b1000_0000);
        assert_eq!(U7(0b0000_0001).take_nth_msb(0), 0b1000_0000);

        assert_eq!(U7(0b0000_0100).take_nth_msb(2), 0b1000_0000);
        assert_eq!(U7(0b0000_1000).take_nth_msb(3), 0b1000_0000);
        assert_eq!(U7(0b0001_0000).take_nth_msb(4), 0b1000_0000);
        assert_eq!(U7(0b0010_0000).take_nth_msb(5), 0b1000_0000);
        assert_eq!(U7(0b0100_0001).take_nth_msb(6), 0b1000_0000);
        assert_eq!(U7(0b1000_0001).take_nth_msb(7), 0b1000_0000);

        assert_eq!(U7(0b0000_0100).take_nth_msb(1), 0b0000_0000);
        assert_eq!(U7(0b0000_1000).take_nth_msb(2), 0b0000_0000);
        assert_eq!(U7(0b0001_0000).take_nth_msb(3), 0b0000_0000);
        assert_eq!(U7(0b0010_0000).take_nth_msb(4), 0b0000_0000);
        assert_eq!(U7(0b0100_0001).take_nth_msb(5), 0b0000_0000);
        assert_eq!(U7(0b1000_0001).take_nth_msb(6), 0b0000_0000);
    }

    #[test]
    fn pack_unpack_roundtrip() {
        for len in 0..40 {
            let src: Vec<u8> = (0..len).map(|i| (i * 37 + 11) as u8).collect();
            let packed = pack_block(&src);
            assert_eq!(packed.len(), U8ToU7::convert_len(src.len()));
            let unpacked = unpack_block(&packed);
            assert_eq!(unpacked, src);
        }
    }

    #[test]
    fn right_justified_roundtrip() {
        let value = 0x1A2B3;
        let encoded = right_justified_encode(value, 3);
        assert_eq!(right_justified_decode(&encoded), value & 0x1f_ffff);
    }

    #[test]
    fn left_justified_roundtrip() {
        for sample in [-32768i16, -1, 0, 1, 32767] {
            let mut buf = [0u8; 3];
            left_justified_encode_i16(sample, 16, &mut buf);
            assert_eq!(left_justified_decode_i16(&buf, 16), sample);
        }
    }
}
