//! Path composition, slot-path grammar, 7/8-bit array plumbing and the
//! debug hex dump shared by every connector (specification §4.9).

use std::fmt;
use std::ops;

use bytemuck::{cast_slice, Pod, Zeroable};

/// Below this many bytes, send/receive logging inlines the message at
/// `debug`; above it, only a summary is logged at `debug` and the hex dump
/// moves to `trace`. Matches the teacher's `DEBUG_TRESHOLD`.
pub const DEBUG_TRESHOLD: usize = 16;

/// Helper trait for using arrays in trait bounds and associated types.
pub trait Array:
    AsRef<[Self::ArrayItem]>
    + ops::IndexMut<usize, Output = Self::ArrayItem>
    + IntoIterator<Item = Self::ArrayItem>
    + Sized
{
    type ArrayItem: Clone + Sized;
    const LEN: usize;
}

impl<const N: usize, T: Clone + Sized> Array for [T; N] {
    type ArrayItem = T;
    const LEN: usize = N;
}

macro_rules! array_type_refs {
    ($slice:expr, $($ty:ty),+ $(,)?) => {
        ::arrayref::array_refs![$slice, $( std::mem::size_of::<$ty>() ),+]
    }
}

pub(crate) use array_type_refs;

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(transparent)]
struct Hex(u8);

impl fmt::Debug for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}", self.0)
    }
}

/// Single-line, space-separated hex view of a slice. Cheap enough to be
/// used inline in `tracing` fields.
pub fn hexbuf(slice: &[u8]) -> &[impl fmt::Debug] {
    cast_slice::<u8, Hex>(slice)
}

/// Stable multi-line hex dump with byte offsets, e.g.:
///
/// ```text
/// 0000  f0 42 30 00 01 2d 1e 00  00 f7
/// ```
///
/// Used by connectors at high verbosity only; not on the critical path and
/// not part of any wire contract.
pub fn hexdump(data: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    for (offset, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:04x}  ", offset * 16);
        for (i, byte) in chunk.iter().enumerate() {
            let _ = write!(out, "{byte:02x} ");
            if i == 7 {
                out.push(' ');
            }
        }
        out.push('\n');
    }
    out
}

/// Join two path components with exactly one `/`, treating `/` as the root
/// sentinel (specification's `chain`).
pub fn chain(dir: &str, name: &str) -> String {
    if dir == "/" || dir.is_empty() {
        format!("/{name}")
    } else if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Slot-mode path grammar: `<dir>/<id>[:<name>]`. Accepts either form and
/// yields `(id, name)`.
pub fn parse_slot_path(path: &str) -> Option<(u32, Option<&str>)> {
    let last = path.rsplit('/').next().unwrap_or(path);
    let (id_part, name) = match last.split_once(':') {
        Some((id, name)) => (id, Some(name)),
        None => (last, None),
    };
    let id = id_part.parse().ok()?;
    Some((id, name))
}

/// Replace characters that break the host filesystem (`/`, `\`) with `?`.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c == '/' || c == '\\' { '?' } else { c })
        .collect()
}

/// Restrict a name to a controlled alphabet (used by connectors, like
/// MicroFreak, whose display only has a fixed glyph set); anything outside
/// `alphabet` becomes `default_char`.
pub fn restrict_alphabet(name: &str, alphabet: &str, default_char: char) -> String {
    name.chars()
        .map(|c| if alphabet.contains(c) { c } else { default_char })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_root() {
        assert_eq!(chain("/", "17"), "/17");
        assert_eq!(chain("", "17"), "/17");
    }

    #[test]
    fn chain_nested() {
        assert_eq!(chain("/kit", "bd.wav"), "/kit/bd.wav");
        assert_eq!(chain("/kit/", "bd.wav"), "/kit/bd.wav");
    }

    #[test]
    fn slot_path_grammar() {
        assert_eq!(parse_slot_path("/17"), Some((17, None)));
        assert_eq!(parse_slot_path("/17:kick"), Some((17, Some("kick"))));
        assert_eq!(parse_slot_path("17:kick"), Some((17, Some("kick"))));
        assert_eq!(parse_slot_path("/abc"), None);
    }

    #[test]
    fn sanitize_strips_path_separators() {
        assert_eq!(sanitize_name("a/b\\c"), "a?b?c");
    }

    #[test]
    fn restrict_alphabet_substitutes_default() {
        assert_eq!(restrict_alphabet("ab#1", "ab1", '_'), "ab_1");
    }
}
