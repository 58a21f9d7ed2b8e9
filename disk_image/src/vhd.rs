// Copyright © 2026 The cowsr Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Dynamic VHD images driven through `vhd-util`.

use std::path::{Path, PathBuf};

use crate::util::call;
use crate::{path_str, Error, ImageFormat, ImageType, Result, MEBIBYTE};

const VHD_UTIL_BIN: &str = "/usr/bin/vhd-util";
const OPT_LOG_ERR: &str = "--debug";
// Metadata is preallocated for images of up to 2 TiB.
const MSIZE_MIB: u64 = 2 * 1024 * 1024;
const MAX_CHAIN_HEIGHT: u64 = 30;

pub struct VhdFormat;

impl VhdFormat {
    fn snapshot(
        &self,
        dbg: &str,
        new_path: &Path,
        parent_path: &Path,
        force_parent_link: bool,
    ) -> Result<()> {
        let mut args = vec![
            "snapshot",
            "-n",
            path_str(new_path)?,
            "-p",
            path_str(parent_path)?,
        ];
        // vhd-util links to the grandparent when the parent is empty
        // unless told otherwise.
        if force_parent_link {
            args.push("-e");
        }
        call(dbg, VHD_UTIL_BIN, &args).map(drop)
    }
}

fn parse_mib(cmd: &str, output: &str) -> Result<u64> {
    output
        .trim()
        .parse::<u64>()
        .map(|mib| mib * MEBIBYTE)
        .map_err(|_| Error::Output {
            cmd: cmd.to_owned(),
            output: output.to_owned(),
        })
}

/// `vhd-util read -B` dumps the block allocation table, a block is allocated
/// if any bit is set.
fn bitmap_is_empty(bitmap: &[u8]) -> bool {
    bitmap.iter().all(|b| *b == 0)
}

impl ImageFormat for VhdFormat {
    fn image_type(&self) -> ImageType {
        ImageType::Vhd
    }

    fn uri_prefix(&self) -> &'static str {
        "tapdisk://"
    }

    fn max_chain_height(&self) -> u64 {
        MAX_CHAIN_HEIGHT
    }

    fn create(&self, dbg: &str, path: &Path, size_mib: u64) -> Result<()> {
        let size = size_mib.to_string();
        let msize = MSIZE_MIB.to_string();
        call(
            dbg,
            VHD_UTIL_BIN,
            &["create", "-n", path_str(path)?, "-s", &size, "-S", &msize],
        )
        .map(drop)
    }

    fn resize(&self, dbg: &str, path: &Path, size_mib: u64) -> Result<()> {
        let size = size_mib.to_string();
        call(
            dbg,
            VHD_UTIL_BIN,
            &["resize", "-n", path_str(path)?, "-s", &size, "-f"],
        )
        .map(drop)
    }

    fn reset(&self, dbg: &str, path: &Path) -> Result<()> {
        call(
            dbg,
            VHD_UTIL_BIN,
            &["modify", OPT_LOG_ERR, "-z", "-n", path_str(path)?],
        )
        .map(drop)
    }

    fn online_snapshot(
        &self,
        dbg: &str,
        new_path: &Path,
        parent_path: &Path,
        force_parent_link: bool,
    ) -> Result<()> {
        self.snapshot(dbg, new_path, parent_path, force_parent_link)
    }

    fn offline_snapshot(
        &self,
        dbg: &str,
        new_path: &Path,
        parent_path: &Path,
        force_parent_link: bool,
    ) -> Result<()> {
        self.snapshot(dbg, new_path, parent_path, force_parent_link)
    }

    fn coalesce(&self, dbg: &str, path: &Path, _parent_path: &Path) -> Result<()> {
        // vhd-util always commits into the parent recorded in the image.
        call(dbg, VHD_UTIL_BIN, &["coalesce", "-n", path_str(path)?]).map(drop)
    }

    fn get_parent(&self, dbg: &str, path: &Path) -> Result<Option<PathBuf>> {
        let output = call(dbg, VHD_UTIL_BIN, &["query", "-n", path_str(path)?, "-p"])?;
        let parent = output.trim();
        if parent.is_empty() || parent.contains("has no parent") {
            return Ok(None);
        }
        Ok(Some(PathBuf::from(parent)))
    }

    fn get_vsize(&self, dbg: &str, path: &Path) -> Result<u64> {
        let output = call(dbg, VHD_UTIL_BIN, &["query", "-n", path_str(path)?, "-v"])?;
        parse_mib("vhd-util query -v", &output)
    }

    fn set_parent(&self, dbg: &str, path: &Path, parent_path: &Path) -> Result<()> {
        call(
            dbg,
            VHD_UTIL_BIN,
            &["modify", "-n", path_str(path)?, "-p", path_str(parent_path)?],
        )
        .map(drop)
    }

    fn is_empty(&self, dbg: &str, path: &Path) -> Result<bool> {
        let output = call(
            dbg,
            VHD_UTIL_BIN,
            &["read", OPT_LOG_ERR, "-B", "-n", path_str(path)?],
        )?;
        Ok(bitmap_is_empty(output.as_bytes()))
    }
}
