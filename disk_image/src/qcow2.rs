// Copyright © 2026 The cowsr Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! QCOW2 images driven through `qemu-img` and `qemu-io`.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::util::call;
use crate::{path_str, Error, ImageFormat, ImageType, Result};

const QEMU_IMG: &str = "/usr/lib64/qemu-dp/bin/qemu-img";
const QEMU_IO: &str = "/usr/lib64/qemu-dp/bin/qemu-io";
const QCOW2_CLUSTER_SIZE: &str = "2048k";
const MAX_CHAIN_HEIGHT: u64 = 30;

pub struct Qcow2Format;

#[derive(Deserialize)]
struct ImageInfo {
    #[serde(rename = "virtual-size")]
    virtual_size: u64,
    #[serde(rename = "backing-filename")]
    backing_filename: Option<String>,
}

impl Qcow2Format {
    fn info(&self, dbg: &str, path: &Path) -> Result<ImageInfo> {
        let output = call(dbg, QEMU_IMG, &["info", "--output=json", path_str(path)?])?;
        serde_json::from_str(&output).map_err(|_| Error::Output {
            cmd: "qemu-img info".to_owned(),
            output,
        })
    }

    fn create_snapshot(&self, dbg: &str, backing_file: &Path, new_path: &Path) -> Result<()> {
        let options = format!(
            "backing_file={},backing_fmt=qcow2,cluster_size={QCOW2_CLUSTER_SIZE}",
            path_str(backing_file)?
        );
        call(
            dbg,
            QEMU_IMG,
            &["create", "-f", "qcow2", "-o", &options, path_str(new_path)?],
        )
        .map(drop)
    }
}

/// `qemu-io map` prints a single "not allocated" line for images holding no
/// data.
fn map_is_empty(output: &str) -> bool {
    let mut lines = output.lines();
    match (lines.next(), lines.next()) {
        (Some(line), None) => line.contains("not allocated"),
        _ => false,
    }
}

impl ImageFormat for Qcow2Format {
    fn image_type(&self) -> ImageType {
        ImageType::Qcow2
    }

    fn uri_prefix(&self) -> &'static str {
        "qdisk://"
    }

    fn max_chain_height(&self) -> u64 {
        MAX_CHAIN_HEIGHT
    }

    fn create(&self, dbg: &str, path: &Path, size_mib: u64) -> Result<()> {
        let options = format!("size={size_mib}M,cluster_size={QCOW2_CLUSTER_SIZE}");
        call(
            dbg,
            QEMU_IMG,
            &["create", "-f", "qcow2", "-o", &options, path_str(path)?],
        )
        .map(drop)
    }

    fn resize(&self, dbg: &str, path: &Path, size_mib: u64) -> Result<()> {
        let size = format!("{size_mib}M");
        call(dbg, QEMU_IMG, &["resize", path_str(path)?, &size]).map(drop)
    }

    fn reset(&self, dbg: &str, path: &Path) -> Result<()> {
        let info = self.info(dbg, path)?;
        let size = info.virtual_size.to_string();
        let mut options = format!("cluster_size={QCOW2_CLUSTER_SIZE}");
        if let Some(backing) = info.backing_filename {
            options.push_str(&format!(",backing_file={backing},backing_fmt=qcow2"));
        }
        call(
            dbg,
            QEMU_IMG,
            &["create", "-f", "qcow2", "-o", &options, path_str(path)?, &size],
        )
        .map(drop)
    }

    fn online_snapshot(
        &self,
        dbg: &str,
        new_path: &Path,
        parent_path: &Path,
        _force_parent_link: bool,
    ) -> Result<()> {
        self.create_snapshot(dbg, parent_path, new_path)
    }

    fn offline_snapshot(
        &self,
        dbg: &str,
        new_path: &Path,
        parent_path: &Path,
        force_parent_link: bool,
    ) -> Result<()> {
        let mut backing_file = parent_path.to_path_buf();
        if !force_parent_link && self.is_empty(dbg, parent_path)? {
            if let Some(grandparent) = self.get_parent(dbg, parent_path)? {
                debug!("{dbg}: {parent_path:?} is empty, linking to {grandparent:?}");
                backing_file = grandparent;
            }
        }
        self.create_snapshot(dbg, &backing_file, new_path)
    }

    fn coalesce(&self, dbg: &str, path: &Path, parent_path: &Path) -> Result<()> {
        call(
            dbg,
            QEMU_IMG,
            &[
                "commit",
                "-q",
                "-t",
                "none",
                path_str(path)?,
                "-b",
                path_str(parent_path)?,
                "-d",
            ],
        )
        .map(drop)
    }

    fn get_parent(&self, dbg: &str, path: &Path) -> Result<Option<PathBuf>> {
        Ok(self.info(dbg, path)?.backing_filename.map(PathBuf::from))
    }

    fn get_vsize(&self, dbg: &str, path: &Path) -> Result<u64> {
        Ok(self.info(dbg, path)?.virtual_size)
    }

    fn set_parent(&self, dbg: &str, path: &Path, parent_path: &Path) -> Result<()> {
        call(
            dbg,
            QEMU_IMG,
            &[
                "rebase",
                "-t",
                "none",
                "-T",
                "none",
                path_str(path)?,
                "-b",
                path_str(parent_path)?,
                "-F",
                "qcow2",
                "-u",
            ],
        )
        .map(drop)
    }

    fn is_empty(&self, dbg: &str, path: &Path) -> Result<bool> {
        let open = format!("open {}", path_str(path)?);
        let output = call(dbg, QEMU_IO, &["--cmd", &open, "--cmd", "map"])?;
        let empty = map_is_empty(&output);
        debug!("{dbg}: {path:?} empty={empty}");
        Ok(empty)
    }
}
