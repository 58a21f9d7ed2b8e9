// Copyright © 2026 The cowsr Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Flat images with no copy-on-write capabilities.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::{file_size, is_block_device, Error, ImageFormat, ImageType, Result, MEBIBYTE};

pub struct RawFormat;

fn truncate(path: &Path, size: u64) -> Result<()> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .and_then(|f| f.set_len(size))
        .map_err(|e| Error::Truncate(e, path.to_path_buf()))
}

impl ImageFormat for RawFormat {
    fn image_type(&self) -> ImageType {
        ImageType::Raw
    }

    fn uri_prefix(&self) -> &'static str {
        "tapdisk://"
    }

    fn max_chain_height(&self) -> u64 {
        1
    }

    fn create(&self, dbg: &str, path: &Path, size_mib: u64) -> Result<()> {
        // Devices come pre-sized by the repository backend.
        if is_block_device(path)? {
            return Ok(());
        }
        debug!("{dbg}: raw create {path:?} {size_mib} MiB");
        truncate(path, size_mib * MEBIBYTE)
    }

    fn resize(&self, dbg: &str, path: &Path, size_mib: u64) -> Result<()> {
        if is_block_device(path)? {
            return Err(self.unsupported("resize of a block device"));
        }
        debug!("{dbg}: raw resize {path:?} {size_mib} MiB");
        truncate(path, size_mib * MEBIBYTE)
    }

    fn reset(&self, dbg: &str, path: &Path) -> Result<()> {
        if is_block_device(path)? {
            return Err(self.unsupported("reset of a block device"));
        }
        let size = file_size(path)?;
        debug!("{dbg}: raw reset {path:?}");
        truncate(path, 0)?;
        truncate(path, size)
    }

    fn get_parent(&self, _dbg: &str, _path: &Path) -> Result<Option<PathBuf>> {
        Ok(None)
    }

    fn get_vsize(&self, _dbg: &str, path: &Path) -> Result<u64> {
        file_size(path)
    }
}
