// Copyright © 2026 The cowsr Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Native sparse copy-on-write images.
//!
//! An image is a [`CowHeader`], an allocation table holding one big-endian
//! `u64` per cluster and the data clusters, appended in allocation order. A
//! table entry is the file offset of the cluster data, zero when the cluster
//! is not allocated. Unallocated clusters read through to the backing file,
//! or as zeroes when there is none.

mod header;

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub use self::header::CowHeader;
use self::header::{HEADER_SIZE, MAX_VIRTUAL_SIZE};
use crate::{ImageFormat, ImageType, MEBIBYTE};

// Chains are capped well below this by the repository.
const MAX_NESTING_DEPTH: u32 = 64;
const MAX_CHAIN_HEIGHT: u64 = 30;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid magic")]
    InvalidMagic,
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("Invalid cluster bits: {0}")]
    InvalidClusterBits(u32),
    #[error("Virtual size too large: {0}")]
    SizeTooLarge(u64),
    #[error("Allocation table too small: {0} entries")]
    TableTooSmall(u64),
    #[error("Invalid allocation table offset: {0}")]
    InvalidTableOffset(u64),
    #[error("Backing file name is too long: {0}")]
    BackingFileTooLong(usize),
    #[error("Backing file name is not valid UTF-8")]
    InvalidBackingFileName(#[source] std::string::FromUtf8Error),
    #[error("Path is not valid UTF-8: {0:?}")]
    NonUtf8Path(PathBuf),
    #[error("Backing chain is deeper than {0}")]
    MaxNestingDepthExceeded(u32),
    #[error("Failed to open {1:?}")]
    Open(#[source] io::Error, PathBuf),
    #[error("Failed to open backing file {1:?}")]
    OpenBacking(#[source] Box<Error>, PathBuf),
    #[error("Failed to read header")]
    ReadingHeader(#[source] io::Error),
    #[error("Failed to write header")]
    WritingHeader(#[source] io::Error),
    #[error("Failed to read allocation table")]
    ReadingTable(#[source] io::Error),
    #[error("Failed to write allocation table")]
    WritingTable(#[source] io::Error),
    #[error("Failed to read data")]
    ReadingData(#[source] io::Error),
    #[error("Failed to write data")]
    WritingData(#[source] io::Error),
    #[error("Failed to sync image")]
    SyncingData(#[source] io::Error),
    #[error("Access beyond the end of the image at offset {0}")]
    InvalidOffset(u64),
}

pub type Result<T> = std::result::Result<T, Error>;

/// An open image and, lazily, its chain of backing files.
pub struct CowFile {
    path: PathBuf,
    file: File,
    header: CowHeader,
    table: Vec<u64>,
    backing: Option<Box<CowFile>>,
}

impl CowFile {
    /// Create a fresh, fully unallocated image at `path`, truncating any
    /// existing file.
    pub fn create(path: &Path, virtual_size: u64, backing_file: Option<&Path>) -> Result<CowFile> {
        let backing_name = backing_file
            .map(|p| {
                p.to_str()
                    .map(str::to_owned)
                    .ok_or_else(|| Error::NonUtf8Path(p.to_path_buf()))
            })
            .transpose()?;
        let header = CowHeader::new(virtual_size, backing_name)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::Open(e, path.to_path_buf()))?;
        header.write_to(&mut file)?;
        // The table starts out as zeroes, leave it sparse.
        file.set_len(header.table_offset + header.table_entries * 8)
            .map_err(Error::WritingTable)?;
        file.sync_all().map_err(Error::SyncingData)?;
        drop(file);

        Self::open(path)
    }

    /// Open an existing image for reading and writing together with its
    /// backing chain.
    pub fn open(path: &Path) -> Result<CowFile> {
        Self::open_with(path, true, Some(0))
    }

    /// Open only the image itself, without following the backing chain.
    pub fn open_detached(path: &Path, writable: bool) -> Result<CowFile> {
        Self::open_with(path, writable, None)
    }

    fn open_with(path: &Path, writable: bool, depth: Option<u32>) -> Result<CowFile> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(|e| Error::Open(e, path.to_path_buf()))?;
        let header = CowHeader::read_from(&mut file)?;

        let mut raw_table = vec![0u8; (header.table_entries * 8) as usize];
        file.read_exact_at(&mut raw_table, header.table_offset)
            .map_err(Error::ReadingTable)?;
        let table = raw_table
            .chunks_exact(8)
            .map(|c| u64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();

        let mut image = CowFile {
            path: path.to_path_buf(),
            file,
            header,
            table,
            backing: None,
        };

        if let Some(depth) = depth {
            if let Some(backing_path) = image.backing_path() {
                if depth >= MAX_NESTING_DEPTH {
                    return Err(Error::MaxNestingDepthExceeded(MAX_NESTING_DEPTH));
                }
                // Backing files are never written through a child.
                let backing = Self::open_with(&backing_path, false, Some(depth + 1))
                    .map_err(|e| Error::OpenBacking(Box::new(e), backing_path.clone()))?;
                image.backing = Some(Box::new(backing));
            }
        }

        Ok(image)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &CowHeader {
        &self.header
    }

    pub fn virtual_size(&self) -> u64 {
        self.header.virtual_size
    }

    /// Backing file path, resolved relative to the image's directory.
    pub fn backing_path(&self) -> Option<PathBuf> {
        let backing = Path::new(self.header.backing_file.as_deref()?);
        if backing.is_absolute() {
            return Some(backing.to_path_buf());
        }
        Some(match self.path.parent() {
            Some(dir) => dir.join(backing),
            None => backing.to_path_buf(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.table.iter().all(|entry| *entry == 0)
    }

    /// Number of clusters holding data in this image alone.
    pub fn allocated_clusters(&self) -> usize {
        self.table.iter().filter(|entry| **entry != 0).count()
    }

    fn cluster_size(&self) -> u64 {
        self.header.cluster_size()
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.header.virtual_size => Ok(()),
            _ => Err(Error::InvalidOffset(offset)),
        }
    }

    /// Split `[offset, offset + len)` into per-cluster pieces of
    /// `(cluster index, offset in cluster, offset in buffer, length)`.
    fn cluster_pieces(&self, offset: u64, len: usize) -> Vec<(usize, u64, usize, usize)> {
        let cluster_size = self.cluster_size();
        let mut pieces = Vec::new();
        let mut done = 0usize;
        while done < len {
            let pos = offset + done as u64;
            let cluster = (pos / cluster_size) as usize;
            let in_cluster = pos % cluster_size;
            let count = std::cmp::min((cluster_size - in_cluster) as usize, len - done);
            pieces.push((cluster, in_cluster, done, count));
            done += count;
        }
        pieces
    }

    /// Read guest data at `offset`, falling through to the backing chain for
    /// unallocated clusters.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        for (cluster, in_cluster, start, count) in self.cluster_pieces(offset, buf.len()) {
            let chunk = &mut buf[start..start + count];
            match self.table[cluster] {
                0 => self.read_backing(offset + start as u64, chunk)?,
                data_offset => self
                    .file
                    .read_exact_at(chunk, data_offset + in_cluster)
                    .map_err(Error::ReadingData)?,
            }
        }
        Ok(())
    }

    /// Read from the backing chain, treating anything past its end as zeroes.
    fn read_backing(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        buf.fill(0);
        let Some(backing) = &self.backing else {
            return Ok(());
        };
        let backing_size = backing.virtual_size();
        if offset >= backing_size {
            return Ok(());
        }
        let len = std::cmp::min(buf.len() as u64, backing_size - offset) as usize;
        backing.read_at(offset, &mut buf[..len])
    }

    fn write_table_entry(&mut self, cluster: usize, value: u64) -> Result<()> {
        self.file
            .write_all_at(
                &value.to_be_bytes(),
                self.header.table_offset + cluster as u64 * 8,
            )
            .map_err(Error::WritingTable)?;
        self.table[cluster] = value;
        Ok(())
    }

    fn end_of_file(&self) -> Result<u64> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(Error::ReadingData)
    }

    /// Allocate `cluster` at the end of the file, seeded with the content it
    /// currently reads as unless it is about to be overwritten entirely.
    fn allocate_cluster(&mut self, cluster: usize, overwrite: bool) -> Result<u64> {
        let cluster_size = self.cluster_size();
        let mut data = vec![0u8; cluster_size as usize];
        if !overwrite {
            let start = cluster as u64 * cluster_size;
            let len = std::cmp::min(cluster_size, self.header.virtual_size - start) as usize;
            self.read_backing(start, &mut data[..len])?;
        }
        let data_offset = self.end_of_file()?.next_multiple_of(cluster_size);
        self.file
            .write_all_at(&data, data_offset)
            .map_err(Error::WritingData)?;
        self.write_table_entry(cluster, data_offset)?;
        Ok(data_offset)
    }

    /// Write guest data at `offset`, allocating clusters as needed.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        let cluster_size = self.cluster_size();
        for (cluster, in_cluster, start, count) in self.cluster_pieces(offset, data.len()) {
            let data_offset = match self.table[cluster] {
                0 => self.allocate_cluster(cluster, count as u64 == cluster_size)?,
                data_offset => data_offset,
            };
            self.file
                .write_all_at(&data[start..start + count], data_offset + in_cluster)
                .map_err(Error::WritingData)?;
        }
        Ok(())
    }

    /// Change the virtual size. Growing relocates the allocation table to the
    /// end of the file when it has no room left; shrinking drops the clusters
    /// past the new end.
    pub fn resize(&mut self, new_size: u64) -> Result<()> {
        if new_size > MAX_VIRTUAL_SIZE {
            return Err(Error::SizeTooLarge(new_size));
        }
        let cluster_size = self.cluster_size();
        let needed = self.header.clusters_for(new_size);

        if new_size < self.header.virtual_size {
            for cluster in needed as usize..self.table.len() {
                if self.table[cluster] != 0 {
                    self.write_table_entry(cluster, 0)?;
                }
            }
            // Content past the new end must not resurface on a later grow.
            let tail = new_size % cluster_size;
            if tail != 0 {
                let data_offset = self.table[(needed - 1) as usize];
                if data_offset != 0 {
                    let zeroes = vec![0u8; (cluster_size - tail) as usize];
                    self.file
                        .write_all_at(&zeroes, data_offset + tail)
                        .map_err(Error::WritingData)?;
                }
            }
        } else if needed > self.header.table_entries {
            let table_offset = self.end_of_file()?.next_multiple_of(cluster_size);
            let mut table = self.table.clone();
            table.resize(needed as usize, 0);
            let raw: Vec<u8> = table.iter().flat_map(|e| e.to_be_bytes()).collect();
            self.file
                .write_all_at(&raw, table_offset)
                .map_err(Error::WritingTable)?;
            self.header.table_offset = table_offset;
            self.header.table_entries = needed;
            self.table = table;
        }

        self.header.virtual_size = new_size;
        self.header.write_to(&mut self.file)?;
        self.sync()
    }

    /// Point the image at a different backing file. Data is left untouched.
    pub fn set_backing_file(&mut self, backing_file: Option<&Path>) -> Result<()> {
        self.header.backing_file = backing_file
            .map(|p| {
                p.to_str()
                    .map(str::to_owned)
                    .ok_or_else(|| Error::NonUtf8Path(p.to_path_buf()))
            })
            .transpose()?;
        self.header.write_to(&mut self.file)?;
        self.backing = None;
        self.sync()
    }

    /// Copy every cluster allocated in this image into `parent`, growing the
    /// parent first if this image is larger.
    pub fn commit_into(&self, parent: &mut CowFile) -> Result<()> {
        if parent.virtual_size() < self.virtual_size() {
            parent.resize(self.virtual_size())?;
        }
        let cluster_size = self.cluster_size();
        let mut data = vec![0u8; cluster_size as usize];
        for (cluster, data_offset) in self.table.iter().enumerate() {
            if *data_offset == 0 {
                continue;
            }
            let start = cluster as u64 * cluster_size;
            let len = std::cmp::min(cluster_size, self.virtual_size() - start) as usize;
            self.file
                .read_exact_at(&mut data[..len], *data_offset)
                .map_err(Error::ReadingData)?;
            parent.write_at(start, &data[..len])?;
        }
        parent.sync()
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().map_err(Error::SyncingData)
    }
}

/// [`ImageFormat`] adapter for native images.
pub struct CowFormat;

impl ImageFormat for CowFormat {
    fn image_type(&self) -> ImageType {
        ImageType::Cow
    }

    fn uri_prefix(&self) -> &'static str {
        "cow://"
    }

    fn max_chain_height(&self) -> u64 {
        MAX_CHAIN_HEIGHT
    }

    fn create(&self, dbg: &str, path: &Path, size_mib: u64) -> crate::Result<()> {
        debug!("{dbg}: cow create {path:?} {size_mib} MiB");
        CowFile::create(path, size_mib * MEBIBYTE, None)?;
        Ok(())
    }

    fn resize(&self, dbg: &str, path: &Path, size_mib: u64) -> crate::Result<()> {
        debug!("{dbg}: cow resize {path:?} {size_mib} MiB");
        CowFile::open_detached(path, true)?.resize(size_mib * MEBIBYTE)?;
        Ok(())
    }

    fn reset(&self, dbg: &str, path: &Path) -> crate::Result<()> {
        debug!("{dbg}: cow reset {path:?}");
        let image = CowFile::open_detached(path, false)?;
        let backing = image.header().backing_file.clone().map(PathBuf::from);
        let size = image.virtual_size();
        drop(image);
        CowFile::create(path, size, backing.as_deref())?;
        Ok(())
    }

    fn online_snapshot(
        &self,
        dbg: &str,
        new_path: &Path,
        parent_path: &Path,
        _force_parent_link: bool,
    ) -> crate::Result<()> {
        debug!("{dbg}: cow snapshot {parent_path:?} -> {new_path:?}");
        let size = CowFile::open_detached(parent_path, false)?.virtual_size();
        CowFile::create(new_path, size, Some(parent_path))?;
        Ok(())
    }

    fn offline_snapshot(
        &self,
        dbg: &str,
        new_path: &Path,
        parent_path: &Path,
        force_parent_link: bool,
    ) -> crate::Result<()> {
        let parent = CowFile::open_detached(parent_path, false)?;
        let mut backing = parent_path.to_path_buf();
        if !force_parent_link && parent.is_empty() {
            if let Some(grandparent) = parent.backing_path() {
                debug!("{dbg}: {parent_path:?} is empty, linking to {grandparent:?}");
                backing = grandparent;
            }
        }
        debug!("{dbg}: cow snapshot {backing:?} -> {new_path:?}");
        CowFile::create(new_path, parent.virtual_size(), Some(&backing))?;
        Ok(())
    }

    fn coalesce(&self, dbg: &str, path: &Path, parent_path: &Path) -> crate::Result<()> {
        debug!("{dbg}: cow commit {path:?} into {parent_path:?}");
        let image = CowFile::open_detached(path, false)?;
        let mut parent = CowFile::open(parent_path)?;
        image.commit_into(&mut parent)?;
        Ok(())
    }

    fn get_parent(&self, _dbg: &str, path: &Path) -> crate::Result<Option<PathBuf>> {
        Ok(CowFile::open_detached(path, false)?.backing_path())
    }

    fn get_vsize(&self, _dbg: &str, path: &Path) -> crate::Result<u64> {
        Ok(CowFile::open_detached(path, false)?.virtual_size())
    }

    fn set_parent(&self, dbg: &str, path: &Path, parent_path: &Path) -> crate::Result<()> {
        debug!("{dbg}: cow set parent of {path:?} to {parent_path:?}");
        CowFile::open_detached(path, true)?.set_backing_file(Some(parent_path))?;
        Ok(())
    }

    fn is_empty(&self, _dbg: &str, path: &Path) -> crate::Result<bool> {
        Ok(CowFile::open_detached(path, false)?.is_empty())
    }
}

impl From<Error> for crate::Error {
    fn from(e: Error) -> Self {
        crate::Error::Cow(e)
    }
}
