//! Virtual filesystem abstraction (specification §4.4, data model in §3).
//!
//! The teacher's domain layer (`domain.rs`, `domain/sample_slots.rs`) models
//! one concrete slot-mode filesystem; here that shape is generalised into a
//! trait so every connector (`connectors/*.rs`) can implement only the
//! operations its device actually supports. Per the REDESIGN FLAGS this
//! replaces the original C function-pointer table (`FsOps`, a struct of
//! nullable fn pointers the UI null-checks) with a capability-queried Rust
//! trait: each method has a default that returns `CoreError::Unsupported`,
//! so a connector overrides exactly what it implements and callers never
//! null-check a pointer.

use std::fmt;

use bitflags::bitflags;

use crate::backend::Backend;
use crate::error::CoreError;

bitflags! {
    /// Option bitset a `FsOps` descriptor carries (specification §3, §4.4).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FsOptions: u32 {
        const SLOT_STORAGE        = 1 << 0;
        const SINGLE_OP           = 1 << 1;
        const MONO                = 1 << 2;
        const STEREO              = 1 << 3;
        const SORT_BY_ID          = 1 << 4;
        const SORT_BY_NAME        = 1 << 5;
        const ALLOW_SEARCH        = 1 << 6;
        const SAMPLE_EDITOR       = 1 << 7;
        const AUDIO_LINK          = 1 << 8;
        const SHOW_ID_COLUMN      = 1 << 9;
        const SHOW_SLOT_COLUMN    = 1 << 10;
        const SHOW_SIZE_COLUMN    = 1 << 11;
        const SHOW_INFO_COLUMN    = 1 << 12;
        const SHOW_SAMPLE_COLUMNS = 1 << 13;
    }
}

/// PCM sample encoding, plus the MicroFreak private tag carried in the
/// high bits of the wire `format` byte (specification §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    S16,
    S24,
    S32,
    U8,
    F32,
    F64,
    MicroFreak(u8),
}

/// Describes an audio payload carried by an [`Item`] or an [`IData`].
#[derive(Debug, Clone, PartialEq)]
pub struct SampleInfo {
    pub frames: u32,
    pub channels: u16,
    pub rate: u32,
    pub format: SampleFormat,
    pub loop_start: u32,
    pub loop_end: u32,
    pub loop_type: u8,
    pub midi_note: u8,
    pub midi_fraction: u8,
    pub tempo: Option<f32>,
    pub tags: std::collections::BTreeMap<[u8; 4], String>,
}

impl SampleInfo {
    /// Applies the loop-point fallback the specification's invariants and
    /// the Sample Pipeline's load step both require: out-of-range or
    /// inverted loop points collapse to `(frames-1, frames-1, 0)`.
    pub fn normalize_loop_points(&mut self) {
        let bad = self.loop_end < self.loop_start
            || self.loop_start >= self.frames
            || self.loop_end >= self.frames;
        if bad {
            let last = self.frames.saturating_sub(1);
            self.loop_start = last;
            self.loop_end = last;
            self.loop_type = 0;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    File,
    Dir,
}

/// One directory entry (specification §3).
#[derive(Debug, Clone)]
pub struct Item {
    pub name: String,
    pub kind: ItemKind,
    /// Byte size; `None` models the C original's `-1` ("unknown").
    pub size: Option<u64>,
    /// Device-native numeric id; `None` models `-1` ("no id").
    pub id: Option<i64>,
    pub sample_info: Option<SampleInfo>,
    pub object_info: String,
}

/// A forward, non-restartable cursor over a directory. Plain
/// `Iterator<Item = Result<Item, CoreError>>` per the REDESIGN FLAGS (§9):
/// `free` falls out of `Drop` for free, so connectors only need to produce
/// an `Iterator`, typically a boxed closure or generator-style struct.
pub type ItemIterator<'a> = Box<dyn Iterator<Item = Result<Item, CoreError>> + 'a>;

/// Owned *(byte content, typed info, optional name)* triple a connector
/// moves between device-side and host-side representations.
#[derive(Debug, Clone)]
pub struct IData {
    pub content: Vec<u8>,
    pub info: Option<SampleInfo>,
    pub name: Option<String>,
}

impl IData {
    pub fn new(content: Vec<u8>) -> Self {
        Self {
            content,
            info: None,
            name: None,
        }
    }
}

/// Cooperative progress/cancellation handle threaded through long-running
/// `FsOps` calls (specification's `TaskControl`).
pub struct Control<'a> {
    pub parts: u32,
    pub part: u32,
    pub progress: f32,
    pub canceled: &'a std::sync::atomic::AtomicBool,
    pub on_progress: Option<Box<dyn FnMut(f32) + 'a>>,
}

impl<'a> Control<'a> {
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn report(&mut self, progress: f32) {
        self.progress = progress;
        if let Some(cb) = self.on_progress.as_mut() {
            cb(progress);
        }
    }
}

/// Fixed target format the Task Engine asks the Sample Pipeline to coerce
/// into before handing bytes to `upload`/`save` (specification §4.6).
#[derive(Debug, Clone, Copy)]
pub struct TargetFormat {
    pub channels: Option<u16>,
    pub rate: Option<u32>,
    pub format: Option<SampleFormat>,
}

/// Options passed down to `load`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    pub tags: bool,
}

/// Capability-queried replacement for the C `FsOps` function-pointer
/// table. Every method defaults to `Unsupported`; a connector overrides
/// only the operations its device actually implements. Callers never
/// null-check: an unimplemented operation simply returns an error the
/// Task Engine already knows how to handle.
pub trait FsOps: fmt::Debug + Send + Sync {
    fn id(&self) -> &str;
    fn options(&self) -> FsOptions;
    fn display_name(&self) -> &str;
    fn max_name_len(&self) -> usize {
        24
    }

    /// Allowed file extensions (without the leading dot), in preference
    /// order; the first is `type_ext`, the suggested save extension.
    fn extensions(&self) -> &[&str];

    fn readdir<'a>(
        &'a self,
        _backend: &'a Backend,
        _path: &str,
        _extensions: Option<&[&str]>,
    ) -> Result<ItemIterator<'a>, CoreError> {
        Err(CoreError::Unsupported)
    }

    fn download(
        &self,
        _backend: &Backend,
        _src_path: &str,
        _control: &mut Control<'_>,
    ) -> Result<IData, CoreError> {
        Err(CoreError::Unsupported)
    }

    fn upload(
        &self,
        _backend: &Backend,
        _dst_path: &str,
        _idata: IData,
        _control: &mut Control<'_>,
    ) -> Result<(), CoreError> {
        Err(CoreError::Unsupported)
    }

    /// Local-file to device-representation coercion; does not touch the
    /// wire (specification §4.4: wraps the Sample Pipeline for audio
    /// filesystems, passes opaque bytes through otherwise).
    fn load(
        &self,
        _path: &str,
        _control: &mut Control<'_>,
        _opts: LoadOptions,
    ) -> Result<IData, CoreError> {
        Err(CoreError::Unsupported)
    }

    fn save(&self, _path: &str, _idata: &IData, _control: &mut Control<'_>) -> Result<(), CoreError> {
        Err(CoreError::Unsupported)
    }

    fn rename(&self, _backend: &Backend, _path: &str, _new_name: &str) -> Result<(), CoreError> {
        Err(CoreError::Unsupported)
    }

    fn delete(&self, _backend: &Backend, _path: &str) -> Result<(), CoreError> {
        Err(CoreError::Unsupported)
    }

    fn move_(&self, _backend: &Backend, _src_path: &str, _dst_path: &str) -> Result<(), CoreError> {
        Err(CoreError::Unsupported)
    }

    fn copy(&self, _backend: &Backend, _src_path: &str, _dst_path: &str) -> Result<(), CoreError> {
        Err(CoreError::Unsupported)
    }

    fn clear(&self, _backend: &Backend, _path: &str) -> Result<(), CoreError> {
        Err(CoreError::Unsupported)
    }

    fn swap(&self, _backend: &Backend, _path_a: &str, _path_b: &str) -> Result<(), CoreError> {
        Err(CoreError::Unsupported)
    }

    fn mkdir(&self, _backend: &Backend, _path: &str) -> Result<(), CoreError> {
        Err(CoreError::Unsupported)
    }

    /// Computes a deterministic upload destination path.
    fn get_upload_path(&self, dst_dir: &str, src_path: &str, content: &IData) -> String {
        default_upload_path(self, dst_dir, src_path, content)
    }

    /// Computes a deterministic download destination path.
    fn get_download_path(&self, dst_dir: &str, src_path: &str, content: &IData) -> String {
        default_upload_path(self, dst_dir, src_path, content)
    }

    /// Formats a numeric id the way this filesystem displays slots, e.g.
    /// zero-padded three digits for a 1000-slot MIDI SDS sampler.
    fn format_slot(&self, id: i64) -> String {
        id.to_string()
    }

    fn storage_stats(&self, _backend: &Backend) -> Result<(u64, u64), CoreError> {
        Err(CoreError::Unsupported)
    }

    /// Reports whether `path` already exists on the device, when the
    /// connector can answer that cheaply (specification §4.8 step 3). The
    /// default `Unsupported` means "not defined": the Task Engine then
    /// proceeds without asking, the same way the original's
    /// `elektroid_check_file_and_wait` does when `fs_ops->file_exists` is
    /// null.
    fn file_exists(&self, _backend: &Backend, _path: &str) -> Result<bool, CoreError> {
        Err(CoreError::Unsupported)
    }
}

/// Shared implementation of `get_upload_path`/`get_download_path`
/// (specification §4.4): slot filesystems return the already-resolved
/// slot path unchanged; hierarchical filesystems build
/// `"<backend-name> <fs-name>[ <nn>][ - <sanitised-sample-name>].<ext>"`.
fn default_upload_path(ops: &(impl FsOps + ?Sized), dst_dir: &str, src_path: &str, content: &IData) -> String {
    if ops.options().contains(FsOptions::SLOT_STORAGE) {
        return src_path.to_string();
    }
    let ext = ops.extensions().first().copied().unwrap_or("bin");
    let base = content
        .name
        .clone()
        .unwrap_or_else(|| src_path.rsplit('/').next().unwrap_or(src_path).to_string());
    let sanitized = crate::path_util::sanitize_name(&base);
    crate::path_util::chain(dst_dir, &format!("{} {sanitized}.{ext}", ops.display_name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Stub;
    impl FsOps for Stub {
        fn id(&self) -> &str {
            "stub"
        }
        fn options(&self) -> FsOptions {
            FsOptions::empty()
        }
        fn display_name(&self) -> &str {
            "Stub FS"
        }
        fn extensions(&self) -> &[&str] {
            &["wav"]
        }
    }

    #[test]
    fn unimplemented_ops_report_unsupported() {
        let stub = Stub;
        let backend = Backend::new(false);
        assert_eq!(stub.delete(&backend, "/x"), Err(CoreError::Unsupported));
        assert_eq!(stub.mkdir(&backend, "/x"), Err(CoreError::Unsupported));
    }

    #[test]
    fn hierarchical_upload_path_uses_display_name_and_extension() {
        let stub = Stub;
        let data = IData {
            content: vec![],
            info: None,
            name: Some("kick/drum".to_string()),
        };
        let path = stub.get_upload_path("/samples", "/tmp/src.wav", &data);
        assert_eq!(path, "/samples/Stub FS kick?drum.wav");
    }

    #[test]
    fn slot_storage_upload_path_is_unchanged() {
        #[derive(Debug)]
        struct Slotted;
        impl FsOps for Slotted {
            fn id(&self) -> &str {
                "slotted"
            }
            fn options(&self) -> FsOptions {
                FsOptions::SLOT_STORAGE
            }
            fn display_name(&self) -> &str {
                "Slots"
            }
            fn extensions(&self) -> &[&str] {
                &["wav"]
            }
        }
        let slotted = Slotted;
        let data = IData::new(vec![]);
        assert_eq!(slotted.get_upload_path("/", "/17", &data), "/17");
    }

    #[test]
    fn loop_points_fall_back_when_inverted_or_out_of_range() {
        let mut info = SampleInfo {
            frames: 100,
            channels: 1,
            rate: 44100,
            format: SampleFormat::S16,
            loop_start: 50,
            loop_end: 10,
            loop_type: 1,
            midi_note: 60,
            midi_fraction: 0,
            tempo: None,
            tags: Default::default(),
        };
        info.normalize_loop_points();
        assert_eq!((info.loop_start, info.loop_end, info.loop_type), (99, 99, 0));
    }
}
