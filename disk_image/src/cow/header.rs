// Copyright © 2026 The cowsr Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Header parsing, validation and serialisation.
//!
//! The header occupies the first [`HEADER_SIZE`] bytes of an image. All
//! integers are big-endian.
//!
//! | Offset | Size | Field |
//! |-------:|-----:|-------|
//! | 0      | 4    | magic |
//! | 4      | 4    | version |
//! | 8      | 4    | cluster_bits |
//! | 12     | 4    | backing_file_size |
//! | 16     | 8    | virtual_size |
//! | 24     | 8    | table_offset |
//! | 32     | 8    | table_entries |
//! | 40     | n    | backing file path, `backing_file_size` bytes |

use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::{Error, Result};

pub(super) const COW_MAGIC: u32 = 0x434f_5701;
pub(super) const COW_VERSION: u32 = 1;
pub(super) const HEADER_SIZE: u64 = 4096;
// 64 KiB clusters.
pub(super) const DEFAULT_CLUSTER_BITS: u32 = 16;
pub(super) const MIN_CLUSTER_BITS: u32 = 9;
pub(super) const MAX_CLUSTER_BITS: u32 = 21;
// 16 TB, same limit as qcow.
pub(super) const MAX_VIRTUAL_SIZE: u64 = 0x01 << 44;
const BACKING_FILE_OFFSET: u64 = 40;
pub(super) const MAX_BACKING_FILE_SIZE: usize = (HEADER_SIZE - BACKING_FILE_OFFSET) as usize;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CowHeader {
    pub cluster_bits: u32,
    pub virtual_size: u64,
    pub table_offset: u64,
    pub table_entries: u64,
    pub backing_file: Option<String>,
}

impl CowHeader {
    pub fn new(virtual_size: u64, backing_file: Option<String>) -> Result<Self> {
        let header = CowHeader {
            cluster_bits: DEFAULT_CLUSTER_BITS,
            virtual_size,
            table_offset: HEADER_SIZE,
            table_entries: 0,
            backing_file,
        };
        let header = CowHeader {
            table_entries: header.clusters_for(virtual_size),
            ..header
        };
        header.validate()?;
        Ok(header)
    }

    pub fn cluster_size(&self) -> u64 {
        1 << self.cluster_bits
    }

    /// Number of clusters needed to map `size` bytes.
    pub fn clusters_for(&self, size: u64) -> u64 {
        size.div_ceil(self.cluster_size())
    }

    fn validate(&self) -> Result<()> {
        if !(MIN_CLUSTER_BITS..=MAX_CLUSTER_BITS).contains(&self.cluster_bits) {
            return Err(Error::InvalidClusterBits(self.cluster_bits));
        }
        if self.virtual_size > MAX_VIRTUAL_SIZE {
            return Err(Error::SizeTooLarge(self.virtual_size));
        }
        if self.table_entries < self.clusters_for(self.virtual_size) {
            return Err(Error::TableTooSmall(self.table_entries));
        }
        if self.table_offset < HEADER_SIZE {
            return Err(Error::InvalidTableOffset(self.table_offset));
        }
        if let Some(backing_file) = &self.backing_file {
            if backing_file.len() > MAX_BACKING_FILE_SIZE {
                return Err(Error::BackingFileTooLong(backing_file.len()));
            }
        }
        Ok(())
    }

    pub fn read_from<F: Read + Seek>(f: &mut F) -> Result<Self> {
        f.seek(SeekFrom::Start(0)).map_err(Error::ReadingHeader)?;
        let mut buf = vec![0u8; HEADER_SIZE as usize];
        f.read_exact(&mut buf).map_err(Error::ReadingHeader)?;
        let mut cursor = Cursor::new(buf);

        let magic = cursor
            .read_u32::<BigEndian>()
            .map_err(Error::ReadingHeader)?;
        if magic != COW_MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = cursor
            .read_u32::<BigEndian>()
            .map_err(Error::ReadingHeader)?;
        if version != COW_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let cluster_bits = cursor
            .read_u32::<BigEndian>()
            .map_err(Error::ReadingHeader)?;
        let backing_file_size = cursor
            .read_u32::<BigEndian>()
            .map_err(Error::ReadingHeader)? as usize;
        let virtual_size = cursor
            .read_u64::<BigEndian>()
            .map_err(Error::ReadingHeader)?;
        let table_offset = cursor
            .read_u64::<BigEndian>()
            .map_err(Error::ReadingHeader)?;
        let table_entries = cursor
            .read_u64::<BigEndian>()
            .map_err(Error::ReadingHeader)?;

        if backing_file_size > MAX_BACKING_FILE_SIZE {
            return Err(Error::BackingFileTooLong(backing_file_size));
        }
        let backing_file = if backing_file_size > 0 {
            let mut name = vec![0u8; backing_file_size];
            cursor.read_exact(&mut name).map_err(Error::ReadingHeader)?;
            Some(String::from_utf8(name).map_err(Error::InvalidBackingFileName)?)
        } else {
            None
        };

        let header = CowHeader {
            cluster_bits,
            virtual_size,
            table_offset,
            table_entries,
            backing_file,
        };
        header.validate()?;
        Ok(header)
    }

    pub fn write_to<F: Write + Seek>(&self, f: &mut F) -> Result<()> {
        self.validate()?;
        let mut buf = Vec::with_capacity(HEADER_SIZE as usize);
        let backing = self.backing_file.as_deref().unwrap_or_default();
        // Writes into a Vec cannot fail.
        let _ = buf.write_u32::<BigEndian>(COW_MAGIC);
        let _ = buf.write_u32::<BigEndian>(COW_VERSION);
        let _ = buf.write_u32::<BigEndian>(self.cluster_bits);
        let _ = buf.write_u32::<BigEndian>(backing.len() as u32);
        let _ = buf.write_u64::<BigEndian>(self.virtual_size);
        let _ = buf.write_u64::<BigEndian>(self.table_offset);
        let _ = buf.write_u64::<BigEndian>(self.table_entries);
        buf.extend_from_slice(backing.as_bytes());
        buf.resize(HEADER_SIZE as usize, 0);

        f.seek(SeekFrom::Start(0)).map_err(Error::WritingHeader)?;
        f.write_all(&buf).map_err(Error::WritingHeader)
    }
}
