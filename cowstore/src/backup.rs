// Copyright © 2026 The cowsr Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Rolling copies of the metadata database.
//!
//! The schedule lives in the database itself (`backup_interval`,
//! `last_backup_time`, `max_backups`) so every host attached to the
//! repository agrees on it. Copies land in the backups directory as
//! `db-backup-<unix seconds>.db`, oldest pruned first.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::callbacks::{db_context, Callbacks};
use crate::lock::DB_BACKUP_LOCK;
use crate::{Error, Result};

const BACKUP_PREFIX: &str = "db-backup-";
const BACKUP_SUFFIX: &str = ".db";

fn backup_file_name(secs: u64) -> String {
    // Zero padded so that names sort chronologically.
    format!("{BACKUP_PREFIX}{secs:020}{BACKUP_SUFFIX}")
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Backups found in `dir`, oldest first.
pub fn list_backups(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::Io(e, dir.to_path_buf())),
    };
    let mut backups = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| Error::Io(e, dir.to_path_buf()))?.path();
        let is_backup = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(BACKUP_PREFIX) && name.ends_with(BACKUP_SUFFIX));
        if is_backup {
            backups.push(path);
        }
    }
    backups.sort();
    Ok(backups)
}

/// Take a backup if one is due. Returns the path of the new copy.
pub fn rolling_backup(cb: &dyn Callbacks, opq: &Path) -> Result<Option<PathBuf>> {
    rolling_backup_at(cb, opq, unix_now())
}

fn rolling_backup_at(cb: &dyn Callbacks, opq: &Path, now: u64) -> Result<Option<PathBuf>> {
    let _lock = cb.volume_lock(opq, DB_BACKUP_LOCK)?;
    let dir = cb.backups_dir(opq);

    let taken = db_context(cb, opq, |db| {
        let due = db.last_backup_time()?.saturating_add(db.backup_interval()?);
        if now < due {
            return Ok(None);
        }
        fs::create_dir_all(&dir).map_err(|e| Error::Io(e, dir.clone()))?;
        let path = dir.join(backup_file_name(now));
        db.backup_to(&path)?;
        db.set_last_backup_time(now)?;
        Ok(Some((path, db.max_backups()?)))
    })?;
    let Some((path, max_backups)) = taken else {
        return Ok(None);
    };
    info!("Metadata database backed up to {path:?}");

    let backups = list_backups(&dir)?;
    let excess = backups.len().saturating_sub(max_backups as usize);
    for old in &backups[..excess] {
        debug!("Pruning metadata backup {old:?}");
        fs::remove_file(old).map_err(|e| Error::Io(e, old.clone()))?;
    }
    Ok(Some(path))
}
