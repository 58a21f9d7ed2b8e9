// Copyright © 2026 The cowsr Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Image Format Adapters.
//!
//! Every on-disk image format a storage repository can hold is driven through
//! the [`ImageFormat`] capability set. Adapters are selected at runtime from a
//! [`FormatRegistry`] keyed by the [`ImageType`] persisted with each volume.

#[macro_use]
extern crate log;

pub mod cow;
pub mod qcow2;
pub mod raw;
mod util;
pub mod vhd;

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::cow::{CowFile, CowFormat};
pub use crate::qcow2::Qcow2Format;
pub use crate::raw::RawFormat;
pub use crate::vhd::VhdFormat;

pub const MEBIBYTE: u64 = 1 << 20;
/// Largest virtual size an image may have. Image tools and the metadata
/// store both take signed 64-bit sizes.
pub const MAX_VIRTUAL_SIZE: u64 = i64::MAX as u64 / MEBIBYTE * MEBIBYTE;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unknown image type: {0}")]
    UnknownImageType(String),
    #[error("No adapter registered for {0} images")]
    NoAdapter(ImageType),
    #[error("{op} is not supported by {image_type} images")]
    Unsupported {
        op: &'static str,
        image_type: ImageType,
    },
    #[error("Path is not valid UTF-8: {0:?}")]
    NonUtf8Path(PathBuf),
    #[error("Failed to get metadata of {1:?}")]
    Metadata(#[source] io::Error, PathBuf),
    #[error("Failed to query the size of {1:?}")]
    Size(#[source] io::Error, PathBuf),
    #[error("Failed to truncate {1:?}")]
    Truncate(#[source] io::Error, PathBuf),
    #[error("Failed to spawn `{0}`")]
    Spawn(String, #[source] io::Error),
    #[error("`{cmd}` exited with {status}: {stderr}")]
    Command {
        cmd: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("Unexpected output from `{cmd}`: {output}")]
    Output { cmd: String, output: String },
    #[error("Failure in cow image")]
    Cow(#[source] cow::Error),
    #[error("Size {0} is larger than the maximum of {MAX_VIRTUAL_SIZE} bytes")]
    SizeTooLarge(u64),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Image formats a volume can be stored in. The discriminant is what the
/// metadata store persists.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    Raw = 0,
    Vhd = 1,
    Qcow2 = 2,
    Cow = 3,
}

impl Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageType::Raw => write!(f, "raw"),
            ImageType::Vhd => write!(f, "vhd"),
            ImageType::Qcow2 => write!(f, "qcow2"),
            ImageType::Cow => write!(f, "cow"),
        }
    }
}

impl FromStr for ImageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "raw" => Ok(ImageType::Raw),
            "vhd" => Ok(ImageType::Vhd),
            "qcow2" => Ok(ImageType::Qcow2),
            "cow" => Ok(ImageType::Cow),
            _ => Err(Error::UnknownImageType(s.to_string())),
        }
    }
}

impl TryFrom<i64> for ImageType {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        match value {
            0 => Ok(ImageType::Raw),
            1 => Ok(ImageType::Vhd),
            2 => Ok(ImageType::Qcow2),
            3 => Ok(ImageType::Cow),
            other => Err(Error::UnknownImageType(other.to_string())),
        }
    }
}

impl From<ImageType> for i64 {
    fn from(image_type: ImageType) -> Self {
        image_type as i64
    }
}

/// Capability set implemented once per image format.
///
/// Every call carries a `dbg` correlation token which ends up in the logs of
/// the adapter and of any tool it runs. Sizes handed to adapters are whole
/// MiB; see [`size_to_mib`].
pub trait ImageFormat: Send + Sync {
    fn image_type(&self) -> ImageType;

    /// Datapath URI scheme for volumes in this format.
    fn uri_prefix(&self) -> &'static str;

    /// Number of nodes a chain may hold before snapshots are refused.
    fn max_chain_height(&self) -> u64;

    /// Initialise the image at `path`, which already exists as an empty file.
    fn create(&self, dbg: &str, path: &Path, size_mib: u64) -> Result<()>;

    fn resize(&self, dbg: &str, path: &Path, size_mib: u64) -> Result<()>;

    /// Discard all content of the image, keeping its size and parent.
    fn reset(&self, dbg: &str, path: &Path) -> Result<()>;

    /// Create `new_path` as a COW child of `parent_path` while the parent is
    /// attached to a running datapath.
    fn online_snapshot(
        &self,
        dbg: &str,
        new_path: &Path,
        parent_path: &Path,
        force_parent_link: bool,
    ) -> Result<()> {
        let _ = (dbg, new_path, parent_path, force_parent_link);
        Err(self.unsupported("online_snapshot"))
    }

    /// Create `new_path` as a COW child of `parent_path`. Unless
    /// `force_parent_link` is set, a format may link the child to the
    /// parent's own parent when `parent_path` holds no data.
    fn offline_snapshot(
        &self,
        dbg: &str,
        new_path: &Path,
        parent_path: &Path,
        force_parent_link: bool,
    ) -> Result<()> {
        let _ = (dbg, new_path, parent_path, force_parent_link);
        Err(self.unsupported("offline_snapshot"))
    }

    /// Commit the content of `path` into `parent_path`.
    fn coalesce(&self, dbg: &str, path: &Path, parent_path: &Path) -> Result<()> {
        let _ = (dbg, path, parent_path);
        Err(self.unsupported("coalesce"))
    }

    fn get_parent(&self, dbg: &str, path: &Path) -> Result<Option<PathBuf>>;

    fn get_vsize(&self, dbg: &str, path: &Path) -> Result<u64>;

    /// Rewrite the parent pointer of `path` without touching data.
    fn set_parent(&self, dbg: &str, path: &Path, parent_path: &Path) -> Result<()> {
        let _ = (dbg, path, parent_path);
        Err(self.unsupported("set_parent"))
    }

    fn is_parent_pointing_to_path(&self, dbg: &str, path: &Path, parent_path: &Path) -> Result<bool> {
        let parent = self.get_parent(dbg, path)?;
        debug!("{dbg}: parent of {path:?} is {parent:?}, expected {parent_path:?}");
        // Volumes live side by side in one directory, so the file name is
        // what identifies them whatever prefix the tool reports.
        Ok(match parent {
            Some(parent) => parent.file_name() == parent_path.file_name(),
            None => false,
        })
    }

    fn is_empty(&self, dbg: &str, path: &Path) -> Result<bool> {
        let _ = (dbg, path);
        Err(self.unsupported("is_empty"))
    }

    fn unsupported(&self, op: &'static str) -> Error {
        Error::Unsupported {
            op,
            image_type: self.image_type(),
        }
    }
}

/// Adapters keyed by image type, built once at startup.
#[derive(Clone)]
pub struct FormatRegistry {
    formats: HashMap<ImageType, Arc<dyn ImageFormat>>,
}

impl FormatRegistry {
    /// Registry holding every built-in adapter.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry
            .register(Arc::new(RawFormat))
            .register(Arc::new(VhdFormat))
            .register(Arc::new(Qcow2Format))
            .register(Arc::new(CowFormat));
        registry
    }

    pub fn empty() -> Self {
        FormatRegistry {
            formats: HashMap::new(),
        }
    }

    /// Register `format` for its image type, replacing any previous adapter.
    pub fn register(&mut self, format: Arc<dyn ImageFormat>) -> &mut Self {
        self.formats.insert(format.image_type(), format);
        self
    }

    pub fn get(&self, image_type: ImageType) -> Result<&dyn ImageFormat> {
        self.formats
            .get(&image_type)
            .map(|format| format.as_ref())
            .ok_or(Error::NoAdapter(image_type))
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Round `size` up to whole MiB, returning the MiB count and the rounded
/// size in bytes.
pub fn size_to_mib(size: u64) -> Result<(u64, u64)> {
    let size_mib = size.div_ceil(MEBIBYTE);
    match size_mib.checked_mul(MEBIBYTE) {
        Some(rounded) if rounded <= MAX_VIRTUAL_SIZE => Ok((size_mib, rounded)),
        _ => Err(Error::SizeTooLarge(size)),
    }
}

pub fn is_block_device(path: &Path) -> Result<bool> {
    let metadata = path
        .metadata()
        .map_err(|e| Error::Metadata(e, path.to_path_buf()))?;
    Ok(metadata.file_type().is_block_device())
}

fn block_device_size(path: &Path) -> Result<u64> {
    let mut device = File::open(path).map_err(|e| Error::Size(e, path.to_path_buf()))?;
    device
        .seek(SeekFrom::End(0))
        .map_err(|e| Error::Size(e, path.to_path_buf()))
}

/// Apparent size of a file, or the capacity of a block device.
pub fn file_size(path: &Path) -> Result<u64> {
    if is_block_device(path)? {
        return block_device_size(path);
    }
    path.metadata()
        .map(|m| m.len())
        .map_err(|e| Error::Metadata(e, path.to_path_buf()))
}

/// Space actually allocated to a file, or the capacity of a block device.
pub fn physical_size(path: &Path) -> Result<u64> {
    if is_block_device(path)? {
        return block_device_size(path);
    }
    path.metadata()
        .map(|m| m.blocks() * 512)
        .map_err(|e| Error::Metadata(e, path.to_path_buf()))
}

pub(crate) fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::NonUtf8Path(path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    #[test]
    fn test_size_to_mib() {
        assert_eq!(size_to_mib(0).unwrap(), (0, 0));
        assert_eq!(size_to_mib(1).unwrap(), (1, MEBIBYTE));
        assert_eq!(size_to_mib(MEBIBYTE).unwrap(), (1, MEBIBYTE));
        assert_eq!(
            size_to_mib(10 * MEBIBYTE + 1).unwrap(),
            (11, 11 * MEBIBYTE)
        );
        assert_eq!(
            size_to_mib(MAX_VIRTUAL_SIZE).unwrap().1,
            MAX_VIRTUAL_SIZE
        );
        for size in [MAX_VIRTUAL_SIZE + 1, i64::MAX as u64 + 1, u64::MAX - 1, u64::MAX] {
            assert!(matches!(size_to_mib(size), Err(Error::SizeTooLarge(s)) if s == size));
        }
    }

    #[test]
    fn test_image_type_round_trip() {
        for image_type in [
            ImageType::Raw,
            ImageType::Vhd,
            ImageType::Qcow2,
            ImageType::Cow,
        ] {
            assert_eq!(
                ImageType::from_str(&image_type.to_string()).unwrap(),
                image_type
            );
            assert_eq!(ImageType::try_from(i64::from(image_type)).unwrap(), image_type);
        }
        ImageType::from_str("vmdk").unwrap_err();
        ImageType::try_from(42).unwrap_err();
    }

    #[test]
    fn test_registry_lookup_and_override() {
        let registry = FormatRegistry::new();
        assert_eq!(
            registry.get(ImageType::Cow).unwrap().image_type(),
            ImageType::Cow
        );
        assert_eq!(registry.get(ImageType::Vhd).unwrap().max_chain_height(), 30);

        let mut registry = FormatRegistry::empty();
        assert!(matches!(
            registry.get(ImageType::Raw),
            Err(Error::NoAdapter(ImageType::Raw))
        ));
        registry.register(Arc::new(RawFormat));
        assert_eq!(
            registry.get(ImageType::Raw).unwrap().uri_prefix(),
            "tapdisk://"
        );
    }

    #[test]
    fn test_sizes_of_regular_file() {
        let file = TempFile::new().unwrap();
        file.as_file().set_len(3 * MEBIBYTE).unwrap();
        assert!(!is_block_device(file.as_path()).unwrap());
        assert_eq!(file_size(file.as_path()).unwrap(), 3 * MEBIBYTE);
        // Nothing was written, the file is sparse.
        assert!(physical_size(file.as_path()).unwrap() < 3 * MEBIBYTE);
    }
}
