//! Local filesystem connector (specification §4.5, "System").
//!
//! Grounded on the original `connectors/system.c`: a single C implementation
//! parameterised over a `(rate, bit depth, channels)` triple, registered
//! once per supported variant. Here each variant is a distinct [`SystemFs`]
//! value so the connector registry can list them independently, the way
//! the spec's table enumerates nine concrete variants. Ordinary local-FS
//! mutators (`mkdir`, `rename`, `delete`, `move_`) go straight through
//! `std::fs`; `readdir` additionally decodes a WAV header through the
//! Sample Pipeline when the variant is a sample variant, to populate
//! [`SampleInfo`] the way the original's `system_readdir` does.

use std::fs;
use std::path::{Path, PathBuf};

use crate::backend::Backend;
use crate::error::CoreError;
use crate::fs_ops::{
    Control, FsOps, FsOptions, IData, Item, ItemIterator, ItemKind, LoadOptions, SampleFormat,
};
use crate::sample;

/// One `(rate, bit depth, channels)` variant the original system connector
/// registers (specification §4.5 "System").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemVariant {
    pub rate: u32,
    pub bits: u16,
    pub channels: u16,
}

pub const VARIANTS: &[SystemVariant] = &[
    SystemVariant { rate: 48000, bits: 16, channels: 2 },
    SystemVariant { rate: 48000, bits: 16, channels: 1 },
    SystemVariant { rate: 44100, bits: 16, channels: 2 },
    SystemVariant { rate: 44100, bits: 16, channels: 1 },
    SystemVariant { rate: 44100, bits: 24, channels: 2 },
    SystemVariant { rate: 44100, bits: 24, channels: 1 },
    SystemVariant { rate: 44100, bits: 8, channels: 2 },
    SystemVariant { rate: 44100, bits: 8, channels: 1 },
    SystemVariant { rate: 32000, bits: 16, channels: 1 },
];

fn variant_format(bits: u16) -> SampleFormat {
    match bits {
        8 => SampleFormat::U8,
        24 => SampleFormat::S24,
        32 => SampleFormat::S32,
        _ => SampleFormat::S16,
    }
}

/// Local disk filesystem, either the plain "browse any file" variant
/// (`variant = None`) or one of the nine sample-coercing variants.
#[derive(Debug)]
pub struct SystemFs {
    variant: Option<SystemVariant>,
}

impl SystemFs {
    pub fn plain() -> Self {
        Self { variant: None }
    }

    pub fn sample_variant(variant: SystemVariant) -> Self {
        Self { variant: Some(variant) }
    }

    fn target(&self) -> Option<crate::fs_ops::TargetFormat> {
        self.variant.map(|v| crate::fs_ops::TargetFormat {
            channels: Some(v.channels),
            rate: Some(v.rate),
            format: Some(variant_format(v.bits)),
        })
    }
}

impl FsOps for SystemFs {
    fn id(&self) -> &str {
        "system"
    }

    fn options(&self) -> FsOptions {
        let mut opts = FsOptions::SORT_BY_NAME | FsOptions::ALLOW_SEARCH;
        if let Some(v) = self.variant {
            opts |= FsOptions::SHOW_SAMPLE_COLUMNS | FsOptions::SAMPLE_EDITOR;
            opts |= match v.channels {
                1 => FsOptions::MONO,
                2 => FsOptions::STEREO,
                _ => FsOptions::empty(),
            };
        }
        opts
    }

    fn display_name(&self) -> &str {
        "System"
    }

    fn extensions(&self) -> &[&str] {
        if self.variant.is_some() {
            &["wav"]
        } else {
            &["*"]
        }
    }

    fn readdir<'a>(
        &'a self,
        _backend: &'a Backend,
        path: &str,
        extensions: Option<&[&str]>,
    ) -> Result<ItemIterator<'a>, CoreError> {
        let dir = fs::read_dir(path).map_err(map_io_error)?;
        let extensions: Option<Vec<String>> =
            extensions.map(|exts| exts.iter().map(|e| e.to_ascii_lowercase()).collect());
        let want_sample_info = self.variant.is_some();

        let iter = dir.filter_map(move |entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => return Some(Err(map_io_error(err))),
            };
            let file_type = entry.file_type().ok()?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = file_type.is_dir();

            if !is_dir {
                if let Some(exts) = &extensions {
                    let matches = name
                        .rsplit_once('.')
                        .map(|(_, ext)| exts.iter().any(|e| e == &ext.to_ascii_lowercase()))
                        .unwrap_or(false);
                    if !matches {
                        return None;
                    }
                }
            }

            let metadata = entry.metadata().ok();
            let size = metadata.as_ref().map(|m| m.len());
            let sample_info = if want_sample_info && !is_dir {
                fs::read(entry.path())
                    .ok()
                    .and_then(|bytes| sample::load(&bytes, self.target().unwrap(), LoadOptions::default(), |_| {}, || false).ok())
                    .and_then(|idata| idata.info)
            } else {
                None
            };

            Some(Ok(Item {
                name,
                kind: if is_dir { ItemKind::Dir } else { ItemKind::File },
                size,
                id: None,
                sample_info,
                object_info: String::new(),
            }))
        });
        Ok(Box::new(iter))
    }

    fn download(&self, _backend: &Backend, src_path: &str, control: &mut Control<'_>) -> Result<IData, CoreError> {
        self.load(src_path, control, LoadOptions::default())
    }

    fn upload(&self, _backend: &Backend, dst_path: &str, idata: IData, control: &mut Control<'_>) -> Result<(), CoreError> {
        self.save(dst_path, &idata, control)
    }

    fn load(&self, path: &str, control: &mut Control<'_>, opts: LoadOptions) -> Result<IData, CoreError> {
        let bytes = fs::read(path).map_err(map_io_error)?;
        match self.target() {
            Some(target) => sample::load(&bytes, target, opts, |p| control.report(p), || control.is_canceled()),
            None => Ok(IData::new(bytes)),
        }
    }

    fn save(&self, path: &str, idata: &IData, _control: &mut Control<'_>) -> Result<(), CoreError> {
        let bytes = if idata.info.is_some() {
            sample::save(idata)?
        } else {
            idata.content.clone()
        };
        fs::write(path, bytes).map_err(map_io_error)
    }

    fn rename(&self, _backend: &Backend, path: &str, new_name: &str) -> Result<(), CoreError> {
        let src = Path::new(path);
        let dst = src.with_file_name(new_name);
        fs::rename(src, dst).map_err(map_io_error)
    }

    fn delete(&self, _backend: &Backend, path: &str) -> Result<(), CoreError> {
        let p = Path::new(path);
        if p.is_dir() {
            fs::remove_dir_all(p).map_err(map_io_error)
        } else {
            fs::remove_file(p).map_err(map_io_error)
        }
    }

    fn move_(&self, _backend: &Backend, src_path: &str, dst_path: &str) -> Result<(), CoreError> {
        fs::rename(src_path, dst_path).map_err(map_io_error)
    }

    fn copy(&self, _backend: &Backend, src_path: &str, dst_path: &str) -> Result<(), CoreError> {
        fs::copy(src_path, dst_path).map(|_| ()).map_err(map_io_error)
    }

    fn mkdir(&self, _backend: &Backend, path: &str) -> Result<(), CoreError> {
        match fs::create_dir(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Err(CoreError::Exists),
            Err(err) => Err(map_io_error(err)),
        }
    }

    fn storage_stats(&self, _backend: &Backend) -> Result<(u64, u64), CoreError> {
        storage_stats_for(Path::new("/"))
    }

    fn file_exists(&self, _backend: &Backend, path: &str) -> Result<bool, CoreError> {
        Ok(Path::new(path).exists())
    }
}

fn map_io_error(err: std::io::Error) -> CoreError {
    match err.kind() {
        std::io::ErrorKind::NotFound => CoreError::NotFound,
        std::io::ErrorKind::AlreadyExists => CoreError::Exists,
        std::io::ErrorKind::PermissionDenied => CoreError::Wire,
        _ => CoreError::BadInput,
    }
}

/// Matches `path` to its mount by `st_dev` and reports `statvfs` values
/// (specification §4.5, "System": "On Linux ... reports statvfs values").
#[cfg(unix)]
fn storage_stats_for(path: &Path) -> Result<(u64, u64), CoreError> {
    use nix::sys::statvfs::statvfs;
    let stats = statvfs(path).map_err(|_| CoreError::Wire)?;
    let block_size = stats.fragment_size().max(1);
    let total = stats.blocks() * block_size;
    let free = stats.blocks_available() * block_size;
    Ok((total - free, total))
}

#[cfg(not(unix))]
fn storage_stats_for(_path: &Path) -> Result<(u64, u64), CoreError> {
    Err(CoreError::Unsupported)
}

/// Used by the connector registry to register every `(rate, bits,
/// channels)` variant plus the plain byte-passthrough variant.
pub fn all_variants() -> Vec<(String, SystemFs)> {
    let mut out = vec![("system".to_string(), SystemFs::plain())];
    for v in VARIANTS {
        out.push((format!("system-{}-{}-{}", v.rate, v.bits, v.channels), SystemFs::sample_variant(*v)));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn readdir_lists_files_and_dirs() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.wav"), b"data").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let fs_ops = SystemFs::plain();
        let backend = Backend::new(false);
        let items: Vec<_> = fs_ops
            .readdir(&backend, dir.path().to_str().unwrap(), None)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn extension_filter_excludes_non_matching_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.wav"), b"data").unwrap();
        fs::write(dir.path().join("b.txt"), b"data").unwrap();
        let fs_ops = SystemFs::plain();
        let backend = Backend::new(false);
        let items: Vec<_> = fs_ops
            .readdir(&backend, dir.path().to_str().unwrap(), Some(&["wav"]))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "a.wav");
    }

    #[test]
    fn mkdir_reports_exists_on_second_call() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("new").to_str().unwrap().to_string();
        let fs_ops = SystemFs::plain();
        let backend = Backend::new(false);
        fs_ops.mkdir(&backend, &target).unwrap();
        assert_eq!(fs_ops.mkdir(&backend, &target), Err(CoreError::Exists));
    }

    #[allow(dead_code)]
    fn _path_type_check(_p: PathBuf) {}
}
