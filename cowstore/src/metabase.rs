// Copyright © 2026 The cowsr Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Volume Metadata Store.
//!
//! One SQLite database per repository records the tree of volumes, the VDIs
//! addressing them and two crash-recovery logs:
//!
//! - `journal` rows announce that a child is being moved from a coalesced
//!   node to that node's parent,
//! - `refresh` rows announce that an active leaf's chain changed underneath
//!   its datapath.
//!
//! The database is shared by every process and host attached to the
//! repository, so a [`Metabase`] is opened per operation and cross-row
//! invariants are protected by the repository locks rather than by
//! transaction isolation alone.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use disk_image::ImageType;
use rusqlite::types::Type;
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, Params, Row};
use thiserror::Error;

// Long enough for any other holder of the database to finish.
const BUSY_TIMEOUT: Duration = Duration::from_secs(3600);
const SCHEMA_MODULE: &str = "volume";
const SCHEMA_VERSION: i64 = 1;

#[derive(Error, Debug)]
pub enum MetabaseError {
    #[error("Metadata database failure")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Volume {0} does not exist")]
    VolumeNotFound(i64),
    #[error("Missing configuration property {0}")]
    MissingConfiguration(&'static str),
    #[error("Value {0} does not fit in the metadata database")]
    OutOfRange(u64),
}

pub type Result<T> = std::result::Result<T, MetabaseError>;

/// A node of the copy-on-write tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Volume {
    pub id: i64,
    pub parent_id: Option<i64>,
    /// Snapshot volumes are read-only.
    pub snap: bool,
    /// `None` while a resize is in flight.
    pub vsize: Option<u64>,
    pub psize: Option<u64>,
    pub image_type: ImageType,
}

/// An externally addressed disk and the volume it currently points at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vdi {
    pub uuid: String,
    pub name: String,
    pub description: String,
    pub active_on: Option<String>,
    pub nonpersistent: bool,
    pub sharable: bool,
    pub volume: Volume,
}

impl Vdi {
    pub fn image_type(&self) -> ImageType {
        self.volume.image_type
    }
}

/// Children of `id`'s old parent `parent_id` are being moved to
/// `new_parent_id`; `id` is the child being moved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalEntry {
    pub id: i64,
    pub parent_id: i64,
    pub new_parent_id: i64,
}

/// The chain of active leaf `leaf_id` changed: `child_id` moved from
/// `old_parent_id` to `new_parent_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshEntry {
    pub child_id: i64,
    pub old_parent_id: i64,
    pub new_parent_id: i64,
    pub leaf_id: String,
    pub active_on: String,
}

fn to_u64(value: Option<i64>) -> Option<u64> {
    value.map(|v| v as u64)
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| MetabaseError::OutOfRange(value))
}

fn volume_from_row(row: &Row<'_>) -> rusqlite::Result<Volume> {
    let image_type: i64 = row.get("image_type")?;
    let image_type = ImageType::try_from(image_type).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Integer, Box::new(e))
    })?;
    Ok(Volume {
        id: row.get("id")?,
        parent_id: row.get("parent_id")?,
        snap: row.get("snap")?,
        vsize: to_u64(row.get("vsize")?),
        psize: to_u64(row.get("psize")?),
        image_type,
    })
}

fn vdi_from_row(row: &Row<'_>) -> rusqlite::Result<Vdi> {
    Ok(Vdi {
        uuid: row.get("uuid")?,
        name: row.get::<_, Option<String>>("name")?.unwrap_or_default(),
        description: row
            .get::<_, Option<String>>("description")?
            .unwrap_or_default(),
        active_on: row.get("active_on")?,
        nonpersistent: row.get::<_, Option<bool>>("nonpersistent")?.unwrap_or(false),
        sharable: row.get::<_, Option<bool>>("sharable")?.unwrap_or(false),
        volume: volume_from_row(row)?,
    })
}

fn journal_from_row(row: &Row<'_>) -> rusqlite::Result<JournalEntry> {
    Ok(JournalEntry {
        id: row.get("id")?,
        parent_id: row.get("parent_id")?,
        new_parent_id: row.get("new_parent_id")?,
    })
}

fn refresh_from_row(row: &Row<'_>) -> rusqlite::Result<RefreshEntry> {
    Ok(RefreshEntry {
        child_id: row.get("child_id")?,
        old_parent_id: row.get("old_parent_id")?,
        new_parent_id: row.get("new_parent_id")?,
        leaf_id: row.get("leaf_id")?,
        active_on: row.get("active_on")?,
    })
}

const VDI_SELECT: &str = "SELECT * FROM vdi INNER JOIN volume ON vdi.volume_id = volume.id";

const CREATE_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS volume(
        id          INTEGER PRIMARY KEY NOT NULL,
        snap        BOOLEAN NOT NULL CHECK (snap IN (0, 1)),
        parent_id   INTEGER,
        vsize       INTEGER,
        psize       INTEGER,
        image_type  INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS volume_parent ON volume(parent_id);
    CREATE TABLE IF NOT EXISTS vdi(
        uuid          TEXT PRIMARY KEY NOT NULL,
        name          TEXT,
        description   TEXT,
        active_on     TEXT,
        nonpersistent INTEGER,
        volume_id     INTEGER NOT NULL UNIQUE,
        sharable      INTEGER,
        FOREIGN KEY(volume_id) REFERENCES volume(id)
    );
    CREATE UNIQUE INDEX IF NOT EXISTS vdi_volume_id ON vdi(volume_id);
    CREATE TABLE IF NOT EXISTS journal(
        id            INTEGER NOT NULL,
        parent_id     INTEGER NOT NULL,
        new_parent_id INTEGER NOT NULL,
        FOREIGN KEY(id) REFERENCES volume(id),
        FOREIGN KEY(parent_id) REFERENCES volume(id),
        FOREIGN KEY(new_parent_id) REFERENCES volume(id)
    );
    CREATE TABLE IF NOT EXISTS refresh(
        child_id      INTEGER NOT NULL,
        new_parent_id INTEGER NOT NULL,
        old_parent_id INTEGER NOT NULL,
        leaf_id       TEXT NOT NULL,
        active_on     TEXT NOT NULL,
        FOREIGN KEY(child_id) REFERENCES volume(id),
        FOREIGN KEY(new_parent_id) REFERENCES volume(id),
        FOREIGN KEY(old_parent_id) REFERENCES volume(id),
        FOREIGN KEY(leaf_id) REFERENCES vdi(uuid)
    );
    CREATE TABLE IF NOT EXISTS vdi_custom_keys(
        vdi_uuid  TEXT NOT NULL,
        key       TEXT NOT NULL,
        value     TEXT,
        FOREIGN KEY(vdi_uuid) REFERENCES vdi(uuid),
        UNIQUE (vdi_uuid, key) ON CONFLICT REPLACE
    );
";

const CREATE_CONFIGURATION: &str = "
    CREATE TABLE IF NOT EXISTS configuration(
        key    TEXT PRIMARY KEY NOT NULL,
        value  NOT NULL
    );
    INSERT OR IGNORE INTO configuration(key, value)
    VALUES ('backup_interval', 3600),
           ('last_backup_time', 0),
           ('max_backups', 8);
";

/// A connection to a repository's metadata database.
pub struct Metabase {
    conn: Connection,
}

impl Metabase {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(Metabase { conn })
    }

    /// Run `f` in a transaction, committed if `f` succeeds and rolled back
    /// otherwise.
    pub fn transaction<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Self) -> std::result::Result<T, E>,
        E: From<MetabaseError>,
    {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(MetabaseError::from)?;
        let value = f(self)?;
        tx.commit().map_err(MetabaseError::from)?;
        Ok(value)
    }

    fn table_exists(&self, name: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count == 1)
    }

    pub fn schema_version(&self) -> Result<i64> {
        if !self.table_exists("db_version")? {
            return Ok(0);
        }
        let version = self
            .conn
            .query_row(
                "SELECT version FROM db_version WHERE module_name = ?1",
                params![SCHEMA_MODULE],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.unwrap_or(0))
    }

    fn set_schema_version(&self, version: i64) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS db_version(
                 module_name TEXT PRIMARY KEY NOT NULL,
                 version     INTEGER UNSIGNED NOT NULL
             )",
        )?;
        self.conn.execute(
            "INSERT OR REPLACE INTO db_version(module_name, version) VALUES (?1, ?2)",
            params![SCHEMA_MODULE, version],
        )?;
        Ok(())
    }

    /// Create or upgrade the schema. Running it on an up to date database
    /// changes nothing.
    pub fn create(&self) -> Result<()> {
        self.transaction(|db| {
            let version = db.schema_version()?;
            if version == 0 {
                db.conn.execute_batch(CREATE_TABLES)?;
            }
            if version < SCHEMA_VERSION {
                db.conn.execute_batch(CREATE_CONFIGURATION)?;
                db.set_schema_version(SCHEMA_VERSION)?;
            }
            Ok(())
        })
    }

    fn get_configuration(&self, key: &'static str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT value FROM configuration WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(MetabaseError::MissingConfiguration(key))
    }

    fn set_configuration(&self, key: &str, value: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE configuration SET value = ?1 WHERE key = ?2",
            params![value, key],
        )?;
        Ok(())
    }

    /// Seconds between two rolling backups.
    pub fn backup_interval(&self) -> Result<u64> {
        Ok(self.get_configuration("backup_interval")? as u64)
    }

    pub fn set_backup_interval(&self, seconds: u64) -> Result<()> {
        self.set_configuration("backup_interval", to_i64(seconds)?)
    }

    /// Unix time of the last rolling backup.
    pub fn last_backup_time(&self) -> Result<u64> {
        Ok(self.get_configuration("last_backup_time")? as u64)
    }

    pub fn set_last_backup_time(&self, seconds: u64) -> Result<()> {
        self.set_configuration("last_backup_time", to_i64(seconds)?)
    }

    pub fn max_backups(&self) -> Result<u64> {
        Ok(self.get_configuration("max_backups")? as u64)
    }

    pub fn set_max_backups(&self, count: u64) -> Result<()> {
        self.set_configuration("max_backups", to_i64(count)?)
    }

    /// Write a consistent copy of the database to `path`.
    pub fn backup_to(&self, path: &Path) -> Result<()> {
        self.conn.backup(DatabaseName::Main, path, None)?;
        Ok(())
    }

    pub fn insert_vdi(
        &self,
        name: &str,
        description: &str,
        uuid: &str,
        volume_id: i64,
        sharable: bool,
    ) -> Result<()> {
        debug!("insert_vdi(uuid={uuid}, volid={volume_id})");
        self.conn.execute(
            "INSERT INTO vdi(uuid, name, description, volume_id, sharable)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![uuid, name, description, volume_id, sharable],
        )?;
        Ok(())
    }

    /// Delete a VDI together with its custom keys and pending refreshes.
    pub fn delete_vdi(&self, uuid: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM vdi_custom_keys WHERE vdi_uuid = ?1",
            params![uuid],
        )?;
        self.remove_refresh_entry(uuid)?;
        self.conn
            .execute("DELETE FROM vdi WHERE uuid = ?1", params![uuid])?;
        Ok(())
    }

    pub fn update_vdi_volume_id(&self, uuid: &str, volume_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE vdi SET volume_id = ?1 WHERE uuid = ?2",
            params![volume_id, uuid],
        )?;
        Ok(())
    }

    pub fn update_vdi_name(&self, uuid: &str, name: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE vdi SET name = ?1 WHERE uuid = ?2",
            params![name, uuid],
        )?;
        Ok(())
    }

    pub fn update_vdi_description(&self, uuid: &str, description: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE vdi SET description = ?1 WHERE uuid = ?2",
            params![description, uuid],
        )?;
        Ok(())
    }

    /// Record where the VDI is attached. Detaching drops its pending
    /// refreshes, the next attach loads the current chain anyway.
    pub fn update_vdi_active_on(&self, uuid: &str, active_on: Option<&str>) -> Result<()> {
        if active_on.is_none() {
            self.remove_refresh_entry(uuid)?;
        }
        self.conn.execute(
            "UPDATE vdi SET active_on = ?1 WHERE uuid = ?2",
            params![active_on, uuid],
        )?;
        Ok(())
    }

    pub fn update_vdi_nonpersistent(&self, uuid: &str, nonpersistent: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE vdi SET nonpersistent = ?1 WHERE uuid = ?2",
            params![nonpersistent, uuid],
        )?;
        Ok(())
    }

    fn insert_volume(
        &self,
        parent_id: Option<i64>,
        snap: bool,
        vsize: Option<u64>,
        image_type: ImageType,
    ) -> Result<Volume> {
        let sql_vsize = vsize.map(to_i64).transpose()?;
        self.conn.execute(
            "INSERT INTO volume(parent_id, snap, vsize, psize, image_type)
             VALUES (?1, ?2, ?3, NULL, ?4)",
            params![
                parent_id,
                snap,
                sql_vsize,
                i64::from(image_type)
            ],
        )?;
        Ok(Volume {
            id: self.conn.last_insert_rowid(),
            parent_id,
            snap,
            vsize,
            psize: None,
            image_type,
        })
    }

    pub fn insert_new_volume(&self, vsize: u64, image_type: ImageType) -> Result<Volume> {
        self.insert_volume(None, false, Some(vsize), image_type)
    }

    /// Insert a child of `parent_id` sharing its image type.
    pub fn insert_child_volume(
        &self,
        parent_id: i64,
        vsize: Option<u64>,
        is_snapshot: bool,
    ) -> Result<Volume> {
        let parent = self
            .get_volume_by_id(parent_id)?
            .ok_or(MetabaseError::VolumeNotFound(parent_id))?;
        self.insert_volume(Some(parent_id), is_snapshot, vsize, parent.image_type)
    }

    pub fn delete_volume(&self, volume_id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM volume WHERE id = ?1", params![volume_id])?;
        Ok(())
    }

    pub fn update_volume_parent(&self, volume_id: i64, parent_id: Option<i64>) -> Result<()> {
        self.conn.execute(
            "UPDATE volume SET parent_id = ?1 WHERE id = ?2",
            params![parent_id, volume_id],
        )?;
        Ok(())
    }

    pub fn update_volume_vsize(&self, volume_id: i64, vsize: Option<u64>) -> Result<()> {
        self.conn.execute(
            "UPDATE volume SET vsize = ?1 WHERE id = ?2",
            params![vsize.map(to_i64).transpose()?, volume_id],
        )?;
        Ok(())
    }

    /// Cache the physical size of a frozen node, or forget it with `None`
    /// once the node becomes a leaf again.
    pub fn update_volume_psize(&self, volume_id: i64, psize: Option<u64>) -> Result<()> {
        self.conn.execute(
            "UPDATE volume SET psize = ?1 WHERE id = ?2",
            params![psize.map(to_i64).transpose()?, volume_id],
        )?;
        Ok(())
    }

    pub fn set_volume_as_snapshot(&self, volume_id: i64) -> Result<()> {
        self.conn
            .execute("UPDATE volume SET snap = 1 WHERE id = ?1", params![volume_id])?;
        Ok(())
    }

    fn query_volumes<P: Params>(&self, sql: &str, params: P) -> Result<Vec<Volume>> {
        let mut stmt = self.conn.prepare(sql)?;
        let volumes = stmt
            .query_map(params, volume_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(volumes)
    }

    fn query_vdis<P: Params>(&self, sql: &str, params: P) -> Result<Vec<Vdi>> {
        let mut stmt = self.conn.prepare(sql)?;
        let vdis = stmt
            .query_map(params, vdi_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(vdis)
    }

    pub fn get_vdi_by_id(&self, uuid: &str) -> Result<Option<Vdi>> {
        Ok(self
            .query_vdis(&format!("{VDI_SELECT} WHERE vdi.uuid = ?1"), params![uuid])?
            .pop())
    }

    pub fn get_vdi_for_volume(&self, volume_id: i64) -> Result<Option<Vdi>> {
        Ok(self
            .query_vdis(
                &format!("{VDI_SELECT} WHERE vdi.volume_id = ?1"),
                params![volume_id],
            )?
            .pop())
    }

    pub fn get_all_vdis(&self) -> Result<Vec<Vdi>> {
        self.query_vdis(&format!("{VDI_SELECT} ORDER BY vdi.rowid"), [])
    }

    pub fn get_all_volumes(&self) -> Result<Vec<Volume>> {
        self.query_volumes("SELECT * FROM volume ORDER BY id", [])
    }

    pub fn get_children(&self, volume_id: i64) -> Result<Vec<Volume>> {
        self.query_volumes(
            "SELECT * FROM volume WHERE parent_id = ?1 ORDER BY id",
            params![volume_id],
        )
    }

    pub fn get_volume_by_id(&self, volume_id: i64) -> Result<Option<Volume>> {
        Ok(self
            .query_volumes("SELECT * FROM volume WHERE id = ?1", params![volume_id])?
            .pop())
    }

    /// Sum of the cached physical sizes. Only frozen inner nodes carry one;
    /// it is cleared when a leaf is merged back into the node.
    pub fn get_non_leaf_total_psize(&self) -> Result<u64> {
        let total: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(psize), 0) FROM volume WHERE psize IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(total as u64)
    }

    /// Sum of the virtual sizes of the writable leaves.
    pub fn get_leaf_total_vsize(&self) -> Result<u64> {
        let total: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(vsize), 0) FROM volume
              WHERE id NOT IN
                    (SELECT parent_id FROM volume WHERE parent_id IS NOT NULL)
                AND snap = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(total as u64)
    }

    /// Inner nodes that are the only child of their parent and have exactly
    /// one child themselves. Nodes addressed by a VDI, or whose parent is,
    /// are left alone.
    pub fn find_non_leaf_coalesceable(&self) -> Result<Vec<Volume>> {
        self.query_volumes(
            "SELECT * FROM volume AS node
              WHERE node.parent_id IS NOT NULL
                AND (SELECT COUNT(*) FROM volume AS sibling
                      WHERE sibling.parent_id = node.parent_id) = 1
                AND (SELECT COUNT(*) FROM volume AS child
                      WHERE child.parent_id = node.id) = 1
                AND node.id NOT IN (SELECT volume_id FROM vdi)
                AND node.parent_id NOT IN (SELECT volume_id FROM vdi)
              ORDER BY node.id",
            [],
        )
    }

    /// VDI leaves that are the only child of their parent and are either
    /// inactive or active on `host`.
    pub fn find_leaf_coalesceable(&self, host: &str) -> Result<Vec<Volume>> {
        self.query_volumes(
            "SELECT volume.* FROM volume
               INNER JOIN vdi ON vdi.volume_id = volume.id
              WHERE volume.parent_id IS NOT NULL
                AND (SELECT COUNT(*) FROM volume AS sibling
                      WHERE sibling.parent_id = volume.parent_id) = 1
                AND NOT EXISTS (SELECT 1 FROM volume AS child
                                 WHERE child.parent_id = volume.id)
                AND volume.parent_id NOT IN (SELECT volume_id FROM vdi)
                AND (vdi.active_on IS NULL OR vdi.active_on = ?1)
              ORDER BY volume.id",
            params![host],
        )
    }

    /// Leaves that no VDI addresses and no pending recovery entry refers to.
    pub fn get_garbage_volumes(&self) -> Result<Vec<Volume>> {
        self.query_volumes(
            "SELECT * FROM volume
              WHERE id NOT IN
                    (SELECT parent_id FROM volume WHERE parent_id IS NOT NULL)
                AND id NOT IN (SELECT volume_id FROM vdi)
                AND id NOT IN (SELECT old_parent_id FROM refresh)
                AND id NOT IN (SELECT new_parent_id FROM refresh)
                AND id NOT IN (SELECT child_id FROM refresh)
                AND id NOT IN (SELECT id FROM journal)
                AND id NOT IN (SELECT parent_id FROM journal)
                AND id NOT IN (SELECT new_parent_id FROM journal)
              ORDER BY id",
            [],
        )
    }

    /// Journal the move of every volume in `children` from `parent_id` to
    /// `new_parent_id`.
    pub fn add_journal_entries(
        &self,
        parent_id: i64,
        new_parent_id: i64,
        children: &[Volume],
    ) -> Result<Vec<JournalEntry>> {
        let mut entries = Vec::with_capacity(children.len());
        for child in children {
            self.conn.execute(
                "INSERT INTO journal(id, parent_id, new_parent_id) VALUES (?1, ?2, ?3)",
                params![child.id, parent_id, new_parent_id],
            )?;
            entries.push(JournalEntry {
                id: child.id,
                parent_id,
                new_parent_id,
            });
        }
        Ok(entries)
    }

    pub fn get_journal_entries(&self) -> Result<Vec<JournalEntry>> {
        let mut stmt = self.conn.prepare("SELECT * FROM journal ORDER BY rowid")?;
        let entries = stmt
            .query_map([], journal_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    pub fn remove_journal_entry(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM journal WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Ask the datapaths of every active VDI in `leaves` to reload their
    /// chain after `child_id` moved.
    pub fn add_refresh_entries(
        &self,
        child_id: i64,
        old_parent_id: i64,
        new_parent_id: i64,
        leaves: &[Vdi],
    ) -> Result<Vec<RefreshEntry>> {
        let mut entries = Vec::with_capacity(leaves.len());
        for leaf in leaves {
            let Some(active_on) = &leaf.active_on else {
                continue;
            };
            self.conn.execute(
                "INSERT INTO refresh(child_id, old_parent_id, new_parent_id, leaf_id, active_on)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![child_id, old_parent_id, new_parent_id, leaf.uuid, active_on],
            )?;
            entries.push(RefreshEntry {
                child_id,
                old_parent_id,
                new_parent_id,
                leaf_id: leaf.uuid.clone(),
                active_on: active_on.clone(),
            });
        }
        Ok(entries)
    }

    pub fn get_refresh_entries(&self, host: &str) -> Result<Vec<RefreshEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM refresh WHERE active_on = ?1 ORDER BY rowid")?;
        let entries = stmt
            .query_map(params![host], refresh_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    pub fn remove_refresh_entry(&self, leaf_id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM refresh WHERE leaf_id = ?1", params![leaf_id])?;
        Ok(())
    }

    pub fn get_vdi_custom_keys(&self, uuid: &str) -> Result<BTreeMap<String, String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM vdi_custom_keys WHERE vdi_uuid = ?1")?;
        let keys = stmt
            .query_map(params![uuid], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                ))
            })?
            .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
        Ok(keys)
    }

    /// Custom keys of every VDI, keyed by VDI uuid.
    pub fn get_all_vdi_custom_keys(&self) -> Result<HashMap<String, BTreeMap<String, String>>> {
        let mut stmt = self
            .conn
            .prepare("SELECT vdi_uuid, key, value FROM vdi_custom_keys")?;
        let mut rows = stmt.query([])?;
        let mut all: HashMap<String, BTreeMap<String, String>> = HashMap::new();
        while let Some(row) = rows.next()? {
            all.entry(row.get(0)?).or_default().insert(
                row.get(1)?,
                row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            );
        }
        Ok(all)
    }

    pub fn set_vdi_custom_key(&self, uuid: &str, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO vdi_custom_keys(vdi_uuid, key, value) VALUES (?1, ?2, ?3)",
            params![uuid, key, value],
        )?;
        Ok(())
    }

    pub fn delete_vdi_custom_key(&self, uuid: &str, key: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM vdi_custom_keys WHERE vdi_uuid = ?1 AND key = ?2",
            params![uuid, key],
        )?;
        Ok(())
    }

    /// Number of volumes from the VDI's head up to the root, both included.
    pub fn get_vdi_chain_height(&self, uuid: &str) -> Result<u64> {
        let height: i64 = self.conn.query_row(
            "WITH RECURSIVE chain(id, parent_id) AS (
                 SELECT volume.id, volume.parent_id
                   FROM vdi INNER JOIN volume ON vdi.volume_id = volume.id
                  WHERE vdi.uuid = ?1
                 UNION ALL
                 SELECT volume.id, volume.parent_id
                   FROM volume INNER JOIN chain ON volume.id = chain.parent_id
             )
             SELECT COUNT(*) FROM chain",
            params![uuid],
            |row| row.get(0),
        )?;
        Ok(height as u64)
    }

    /// Forget everything a dead host had attached.
    pub fn clear_host_references(&self, host: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE vdi SET active_on = NULL WHERE active_on = ?1",
            params![host],
        )?;
        self.conn
            .execute("DELETE FROM refresh WHERE active_on = ?1", params![host])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use vmm_sys_util::tempdir::TempDir;

    use super::*;

    const MIB: u64 = 1 << 20;

    fn test_db() -> (TempDir, Metabase) {
        let dir = TempDir::new_with_prefix("/tmp/metabase").unwrap();
        let db = Metabase::open(&dir.as_path().join("sqlite3-metadata.db")).unwrap();
        db.create().unwrap();
        (dir, db)
    }

    fn ids(volumes: &[Volume]) -> Vec<i64> {
        volumes.iter().map(|v| v.id).collect()
    }

    // root -> mid -> leaf, leaf addressed by "vdi-leaf".
    fn chain(db: &Metabase) -> (Volume, Volume, Volume) {
        let root = db.insert_new_volume(10 * MIB, ImageType::Cow).unwrap();
        let mid = db.insert_child_volume(root.id, Some(10 * MIB), false).unwrap();
        let leaf = db.insert_child_volume(mid.id, Some(10 * MIB), false).unwrap();
        db.insert_vdi("leaf", "", "vdi-leaf", leaf.id, false).unwrap();
        (root, mid, leaf)
    }

    #[test]
    fn test_create_is_idempotent() {
        let (_dir, db) = test_db();
        assert_eq!(db.schema_version().unwrap(), 1);
        db.set_max_backups(3).unwrap();
        db.create().unwrap();
        db.create().unwrap();
        assert_eq!(db.schema_version().unwrap(), 1);
        assert_eq!(db.max_backups().unwrap(), 3);
        assert_eq!(db.backup_interval().unwrap(), 3600);
        assert_eq!(db.last_backup_time().unwrap(), 0);
    }

    #[test]
    fn test_volume_and_vdi_round_trip() {
        let (_dir, db) = test_db();
        let root = db.insert_new_volume(MIB, ImageType::Cow).unwrap();
        let child = db.insert_child_volume(root.id, None, true).unwrap();
        assert_eq!(child.image_type, ImageType::Cow);
        assert_eq!(child.parent_id, Some(root.id));
        assert_eq!(db.get_volume_by_id(child.id).unwrap().unwrap(), child);
        assert!(matches!(
            db.insert_child_volume(999, None, false),
            Err(MetabaseError::VolumeNotFound(999))
        ));

        db.insert_vdi("disk", "a disk", "u1", child.id, true).unwrap();
        let vdi = db.get_vdi_by_id("u1").unwrap().unwrap();
        assert_eq!(vdi.name, "disk");
        assert_eq!(vdi.description, "a disk");
        assert!(vdi.sharable);
        assert!(vdi.active_on.is_none());
        assert_eq!(vdi.volume, child);
        assert_eq!(db.get_vdi_for_volume(child.id).unwrap().unwrap().uuid, "u1");
        assert!(db.get_vdi_by_id("nope").unwrap().is_none());

        // One VDI per volume.
        db.insert_vdi("other", "", "u2", child.id, false).unwrap_err();

        db.update_vdi_name("u1", "renamed").unwrap();
        db.update_vdi_description("u1", "").unwrap();
        db.update_vdi_nonpersistent("u1", true).unwrap();
        db.update_volume_vsize(child.id, Some(2 * MIB)).unwrap();
        let vdi = db.get_vdi_by_id("u1").unwrap().unwrap();
        assert_eq!(vdi.name, "renamed");
        assert!(vdi.nonpersistent);
        assert_eq!(vdi.volume.vsize, Some(2 * MIB));
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let (_dir, db) = test_db();
        let res: Result<()> = db.transaction(|db| {
            db.insert_new_volume(MIB, ImageType::Raw)?;
            Err(MetabaseError::VolumeNotFound(1))
        });
        res.unwrap_err();
        assert!(db.get_all_volumes().unwrap().is_empty());

        db.transaction(|db| db.insert_new_volume(MIB, ImageType::Raw))
            .unwrap();
        assert_eq!(db.get_all_volumes().unwrap().len(), 1);
    }

    #[test]
    fn test_coalesce_candidates() {
        let (_dir, db) = test_db();
        let (root, mid, leaf) = chain(&db);

        assert_eq!(ids(&db.find_non_leaf_coalesceable().unwrap()), vec![mid.id]);
        assert_eq!(
            ids(&db.find_leaf_coalesceable("host1").unwrap()),
            vec![leaf.id]
        );

        // Collapse mid: leaf becomes root's only child.
        db.update_volume_parent(leaf.id, Some(root.id)).unwrap();
        db.delete_volume(mid.id).unwrap();
        assert!(db.find_non_leaf_coalesceable().unwrap().is_empty());
        assert_eq!(
            ids(&db.find_leaf_coalesceable("host1").unwrap()),
            vec![leaf.id]
        );

        db.update_vdi_active_on("vdi-leaf", Some("host2")).unwrap();
        assert!(db.find_leaf_coalesceable("host1").unwrap().is_empty());
        assert_eq!(
            ids(&db.find_leaf_coalesceable("host2").unwrap()),
            vec![leaf.id]
        );

        // A sibling disqualifies both.
        let sibling = db.insert_child_volume(root.id, Some(MIB), false).unwrap();
        assert!(db.find_leaf_coalesceable("host2").unwrap().is_empty());
        db.delete_volume(sibling.id).unwrap();
    }

    #[test]
    fn test_non_leaf_needs_exactly_one_child() {
        let (_dir, db) = test_db();
        let (_root, mid, _leaf) = chain(&db);
        let second = db.insert_child_volume(mid.id, Some(MIB), false).unwrap();
        assert!(db.find_non_leaf_coalesceable().unwrap().is_empty());
        db.delete_volume(second.id).unwrap();
        assert_eq!(ids(&db.find_non_leaf_coalesceable().unwrap()), vec![mid.id]);
    }

    #[test]
    fn test_garbage_volumes() {
        let (_dir, db) = test_db();
        let (root, mid, leaf) = chain(&db);
        assert!(db.get_garbage_volumes().unwrap().is_empty());

        let orphan = db.insert_child_volume(root.id, Some(MIB), false).unwrap();
        assert_eq!(ids(&db.get_garbage_volumes().unwrap()), vec![orphan.id]);

        // Held back by a pending refresh.
        db.update_vdi_active_on("vdi-leaf", Some("host1")).unwrap();
        let vdi = db.get_vdi_by_id("vdi-leaf").unwrap().unwrap();
        db.add_refresh_entries(leaf.id, orphan.id, root.id, &[vdi])
            .unwrap();
        assert!(db.get_garbage_volumes().unwrap().is_empty());
        db.remove_refresh_entry("vdi-leaf").unwrap();

        // Held back by a pending journal entry.
        db.add_journal_entries(orphan.id, root.id, &[mid.clone()])
            .unwrap();
        assert!(db.get_garbage_volumes().unwrap().is_empty());
        db.remove_journal_entry(mid.id).unwrap();
        assert_eq!(ids(&db.get_garbage_volumes().unwrap()), vec![orphan.id]);
    }

    #[test]
    fn test_journal_and_refresh_logs() {
        let (_dir, db) = test_db();
        let (root, mid, leaf) = chain(&db);

        let entries = db
            .add_journal_entries(mid.id, root.id, &[leaf.clone()])
            .unwrap();
        assert_eq!(
            entries,
            vec![JournalEntry {
                id: leaf.id,
                parent_id: mid.id,
                new_parent_id: root.id
            }]
        );
        assert_eq!(db.get_journal_entries().unwrap(), entries);
        db.remove_journal_entry(leaf.id).unwrap();
        assert!(db.get_journal_entries().unwrap().is_empty());

        // Inactive leaves are not recorded.
        let inactive = db.get_vdi_by_id("vdi-leaf").unwrap().unwrap();
        assert!(db
            .add_refresh_entries(leaf.id, mid.id, root.id, &[inactive])
            .unwrap()
            .is_empty());

        db.update_vdi_active_on("vdi-leaf", Some("host1")).unwrap();
        let active = db.get_vdi_by_id("vdi-leaf").unwrap().unwrap();
        db.add_refresh_entries(leaf.id, mid.id, root.id, &[active])
            .unwrap();
        let pending = db.get_refresh_entries("host1").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].old_parent_id, mid.id);
        assert_eq!(pending[0].new_parent_id, root.id);
        assert_eq!(pending[0].leaf_id, "vdi-leaf");
        assert!(db.get_refresh_entries("host2").unwrap().is_empty());

        // Detaching drops pending refreshes.
        db.update_vdi_active_on("vdi-leaf", None).unwrap();
        assert!(db.get_refresh_entries("host1").unwrap().is_empty());
    }

    #[test]
    fn test_clear_host_references() {
        let (_dir, db) = test_db();
        let (root, mid, leaf) = chain(&db);
        db.update_vdi_active_on("vdi-leaf", Some("dead")).unwrap();
        let vdi = db.get_vdi_by_id("vdi-leaf").unwrap().unwrap();
        db.add_refresh_entries(leaf.id, mid.id, root.id, &[vdi])
            .unwrap();

        db.clear_host_references("dead").unwrap();
        assert!(db.get_refresh_entries("dead").unwrap().is_empty());
        assert!(db
            .get_vdi_by_id("vdi-leaf")
            .unwrap()
            .unwrap()
            .active_on
            .is_none());
    }

    #[test]
    fn test_custom_keys() {
        let (_dir, db) = test_db();
        let (_root, _mid, _leaf) = chain(&db);
        db.set_vdi_custom_key("vdi-leaf", "k", "v1").unwrap();
        db.set_vdi_custom_key("vdi-leaf", "k", "v2").unwrap();
        db.set_vdi_custom_key("vdi-leaf", "other", "x").unwrap();
        let keys = db.get_vdi_custom_keys("vdi-leaf").unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys["k"], "v2");

        db.delete_vdi_custom_key("vdi-leaf", "other").unwrap();
        let all = db.get_all_vdi_custom_keys().unwrap();
        assert_eq!(all["vdi-leaf"].len(), 1);

        db.delete_vdi("vdi-leaf").unwrap();
        assert!(db.get_all_vdi_custom_keys().unwrap().is_empty());
        assert!(db.get_vdi_by_id("vdi-leaf").unwrap().is_none());
    }

    #[test]
    fn test_chain_height_and_sizes() {
        let (_dir, db) = test_db();
        let (root, mid, _leaf) = chain(&db);
        assert_eq!(db.get_vdi_chain_height("vdi-leaf").unwrap(), 3);
        assert_eq!(db.get_vdi_chain_height("missing").unwrap(), 0);

        assert_eq!(db.get_non_leaf_total_psize().unwrap(), 0);
        db.update_volume_psize(root.id, Some(3 * MIB)).unwrap();
        db.update_volume_psize(mid.id, Some(MIB)).unwrap();
        assert_eq!(db.get_non_leaf_total_psize().unwrap(), 4 * MIB);

        assert_eq!(db.get_leaf_total_vsize().unwrap(), 10 * MIB);
        let snap = db.insert_child_volume(root.id, Some(7 * MIB), true).unwrap();
        assert_eq!(db.get_leaf_total_vsize().unwrap(), 10 * MIB);
        db.delete_volume(snap.id).unwrap();
        let writable = db.insert_child_volume(root.id, Some(7 * MIB), false).unwrap();
        db.set_volume_as_snapshot(writable.id).unwrap();
        assert_eq!(db.get_leaf_total_vsize().unwrap(), 10 * MIB);
    }

    #[test]
    fn test_sizes_must_fit_the_database() {
        let (_dir, db) = test_db();
        let (root, _mid, _leaf) = chain(&db);
        let too_big = i64::MAX as u64 + 1;
        assert!(matches!(
            db.insert_new_volume(too_big, ImageType::Cow),
            Err(MetabaseError::OutOfRange(v)) if v == too_big
        ));
        assert!(matches!(
            db.update_volume_vsize(root.id, Some(u64::MAX)),
            Err(MetabaseError::OutOfRange(_))
        ));
        assert!(matches!(
            db.update_volume_psize(root.id, Some(too_big)),
            Err(MetabaseError::OutOfRange(_))
        ));
        assert!(matches!(
            db.set_backup_interval(u64::MAX),
            Err(MetabaseError::OutOfRange(_))
        ));
        assert_eq!(db.get_volume_by_id(root.id).unwrap().unwrap(), root);

        db.update_volume_psize(root.id, Some(i64::MAX as u64)).unwrap();
        db.update_volume_psize(root.id, None).unwrap();
        assert_eq!(db.get_volume_by_id(root.id).unwrap().unwrap().psize, None);
    }

    #[test]
    fn test_backup_to() {
        let (dir, db) = test_db();
        chain(&db);
        let copy = dir.as_path().join("copy.db");
        db.backup_to(&copy).unwrap();

        let restored = Metabase::open(&copy).unwrap();
        assert_eq!(restored.get_all_volumes().unwrap().len(), 3);
        assert!(restored.get_vdi_by_id("vdi-leaf").unwrap().is_some());
    }
}
