// Copyright © 2026 The cowsr Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Coalescing garbage collector.
//!
//! One collector runs per repository per host. Each iteration deletes
//! garbage volumes, finishes reparenting and datapath refreshes a crashed
//! collector left behind, then merges at most one pair of volumes: an inner
//! node into its parent, or failing that a VDI leaf into its parent.
//!
//! Reparenting is journalled: the move of every child is recorded before
//! its image is touched and the record removed in the same transaction as
//! the database update, so replaying the journal finishes the job exactly
//! once.

use std::fs;
use std::io;
use std::path::Path;
use std::thread;

use disk_image::file_size;

use crate::backup::rolling_backup;
use crate::callbacks::{db_context, Callbacks, VolumeContext};
use crate::lock::{VolumeLock, GLOBAL_LOCK};
use crate::metabase::{JournalEntry, Metabase, RefreshEntry, Vdi, Volume};
use crate::{Error, Result};

// Correlation token of every image and datapath request of the collector.
const GC: &str = "GC";

/// A volume and the lock keeping other collectors away from it.
struct LockedVolume {
    volume: Volume,
    _lock: VolumeLock,
}

/// A volume to merge and its parent, both locked.
struct LockedPair {
    node: LockedVolume,
    parent: LockedVolume,
}

/// Lock `node` then its parent without waiting. `None` when either is held
/// by someone else.
fn lock_node_pair(
    cb: &dyn Callbacks,
    opq: &Path,
    db: &Metabase,
    node: &Volume,
) -> Result<Option<LockedPair>> {
    let Some(parent_id) = node.parent_id else {
        return Ok(None);
    };
    let Some(node_lock) = cb.volume_try_lock(opq, &node.id.to_string())? else {
        debug!("{GC}: volume {} is busy", node.id);
        return Ok(None);
    };
    let Some(parent_lock) = cb.volume_try_lock(opq, &parent_id.to_string())? else {
        debug!("{GC}: parent {parent_id} of volume {} is busy", node.id);
        return Ok(None);
    };
    let parent = db
        .get_volume_by_id(parent_id)?
        .ok_or(Error::VolumeNotFound(parent_id))?;

    Ok(Some(LockedPair {
        node: LockedVolume {
            volume: node.clone(),
            _lock: node_lock,
        },
        parent: LockedVolume {
            volume: parent,
            _lock: parent_lock,
        },
    }))
}

/// Active VDIs addressing a leaf somewhere under `volume`.
fn find_active_leaves(db: &Metabase, volume: &Volume, leaves: &mut Vec<Vdi>) -> Result<()> {
    let children = db.get_children(volume.id)?;
    if children.is_empty() {
        if let Some(vdi) = db.get_vdi_for_volume(volume.id)? {
            if vdi.active_on.is_some() {
                leaves.push(vdi);
            }
        }
        return Ok(());
    }
    for child in &children {
        find_active_leaves(db, child, leaves)?;
    }
    Ok(())
}

pub fn gc_is_enabled(cb: &dyn Callbacks, opq: &Path) -> bool {
    !cb.gc_disabled_path(opq).exists()
}

/// Create or remove the marker stopping the collector of repository `uri`.
pub fn set_gc_enabled(cb: &dyn Callbacks, uri: &str, enabled: bool) -> Result<()> {
    let ctx = VolumeContext::new(cb, uri)?;
    let marker = cb.gc_disabled_path(ctx.path());
    if enabled {
        match fs::remove_file(&marker) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(Error::Io(e, marker)),
            _ => (),
        }
    } else {
        fs::write(&marker, b"").map_err(|e| Error::Io(e, marker.clone()))?;
    }
    info!(
        "GC of {:?} {}",
        ctx.path(),
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

/// The collector of one repository.
pub struct CowCoalesce<'a> {
    cb: &'a dyn Callbacks,
    uri: String,
}

impl<'a> CowCoalesce<'a> {
    pub fn new(cb: &'a dyn Callbacks, uri: &str) -> Self {
        CowCoalesce {
            cb,
            uri: uri.to_owned(),
        }
    }

    fn global_lock(&self, opq: &Path) -> Result<VolumeLock> {
        self.cb
            .volume_poll_lock(opq, GLOBAL_LOCK, self.cb.config().gc_poll_period)
    }

    /// Delete every garbage volume and empty the trash. Returns how many
    /// volumes went.
    pub fn remove_garbage_volumes(&self) -> Result<usize> {
        let cb = self.cb;
        let ctx = VolumeContext::new(cb, &self.uri)?;
        let opq = ctx.path();

        let count = {
            let _gl = self.global_lock(opq)?;
            let garbage = db_context(cb, opq, |db| Ok(db.get_garbage_volumes()?))?;
            for volume in &garbage {
                info!("{GC}: removing garbage volume {}", volume.id);
                db_context(cb, opq, |db| {
                    db.delete_volume(volume.id)?;
                    cb.volume_destroy(opq, &volume.id.to_string())
                })?;
            }
            garbage.len()
        };
        cb.empty_trash(opq)?;
        Ok(count)
    }

    fn reparent_children(&self, opq: &Path, entries: &[JournalEntry]) -> Result<()> {
        let cb = self.cb;
        for entry in entries {
            let (child, leaves) = db_context(cb, opq, |db| {
                let child = db
                    .get_volume_by_id(entry.id)?
                    .ok_or(Error::VolumeNotFound(entry.id))?;
                let mut leaves = Vec::new();
                find_active_leaves(db, &child, &mut leaves)?;
                Ok((child, leaves))
            })?;
            let format = cb.formats().get(child.image_type)?;
            let child_path = cb.volume_get_path(opq, &child.id.to_string());
            let new_parent_path = cb.volume_get_path(opq, &entry.new_parent_id.to_string());

            info!(
                "{GC}: reparenting volume {} from {} to {}",
                child.id, entry.parent_id, entry.new_parent_id
            );
            db_context(cb, opq, |db| {
                db.update_volume_parent(child.id, Some(entry.new_parent_id))?;
                format.set_parent(GC, &child_path, &new_parent_path)?;
                db.remove_journal_entry(child.id)?;
                if !leaves.is_empty() {
                    let refreshed = db.add_refresh_entries(
                        child.id,
                        entry.parent_id,
                        entry.new_parent_id,
                        &leaves,
                    )?;
                    debug!(
                        "{GC}: leaves {:?} of volume {} will be refreshed",
                        refreshed.iter().map(|r| &r.leaf_id).collect::<Vec<_>>(),
                        child.id
                    );
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    fn refresh_leaf_vdis(&self, opq: &Path, entries: &[RefreshEntry]) -> Result<()> {
        let cb = self.cb;
        for entry in entries {
            let vdi = db_context(cb, opq, |db| Ok(db.get_vdi_by_id(&entry.leaf_id)?))?;
            if let Some(vdi) = vdi.filter(|vdi| vdi.active_on.is_some()) {
                info!("{GC}: refreshing datapath of VDI {}", vdi.uuid);
                cb.datapath().refresh_datapath_coalesce(
                    GC,
                    &cb.data_metadata_path(opq, &vdi.uuid),
                    &cb.volume_get_path(opq, &entry.old_parent_id.to_string()),
                    &cb.volume_get_path(opq, &entry.new_parent_id.to_string()),
                )?;
            }
            db_context(cb, opq, |db| Ok(db.remove_refresh_entry(&entry.leaf_id)?))?;
        }
        Ok(())
    }

    /// Finish the reparenting and datapath refreshes left over by a
    /// collector that died. Does nothing when there are none.
    pub fn recover_journal(&self) -> Result<()> {
        let cb = self.cb;
        let ctx = VolumeContext::new(cb, &self.uri)?;
        let opq = ctx.path();
        let _gl = self.global_lock(opq)?;

        let journal = db_context(cb, opq, |db| Ok(db.get_journal_entries()?))?;
        if !journal.is_empty() {
            info!("{GC}: replaying {} journal entries", journal.len());
        }
        self.reparent_children(opq, &journal)?;

        let refresh = db_context(cb, opq, |db| {
            Ok(db.get_refresh_entries(cb.current_host())?)
        })?;
        self.refresh_leaf_vdis(opq, &refresh)
    }

    fn find_best_non_leaf_coalesceable(&self, opq: &Path) -> Result<Option<LockedPair>> {
        let cb = self.cb;
        let _gl = self.global_lock(opq)?;
        db_context(cb, opq, |db| {
            let nodes = db.find_non_leaf_coalesceable()?;
            if !nodes.is_empty() {
                debug!("{GC}: found {} non-leaf coalesceable nodes", nodes.len());
            }
            for node in &nodes {
                if let Some(pair) = lock_node_pair(cb, opq, db, node)? {
                    return Ok(Some(pair));
                }
            }
            Ok(None)
        })
    }

    /// Merge an inner node into its parent and hand its only child over to
    /// the parent. The merge itself runs without the global lock.
    fn non_leaf_coalesce(&self, opq: &Path, pair: LockedPair) -> Result<()> {
        let cb = self.cb;
        let node = &pair.node.volume;
        let parent = &pair.parent.volume;
        info!("{GC}: non-leaf coalesce of volume {} into {}", node.id, parent.id);

        let node_path = cb.volume_get_path(opq, &node.id.to_string());
        let parent_path = cb.volume_get_path(opq, &parent.id.to_string());
        let format = cb.formats().get(node.image_type)?;
        format.coalesce(GC, &node_path, &parent_path)?;
        let parent_psize = cb.volume_get_phys_size(opq, &parent.id.to_string())?;

        let _gl = self.global_lock(opq)?;
        let journal = db_context(cb, opq, |db| {
            db.update_volume_psize(parent.id, Some(parent_psize))?;
            let children = db.get_children(node.id)?;
            Ok(db.add_journal_entries(node.id, parent.id, &children)?)
        })?;
        self.reparent_children(opq, &journal)?;
        drop(pair);
        Ok(())
    }

    fn find_best_leaf_coalesceable(&self, opq: &Path) -> Result<bool> {
        let cb = self.cb;
        let _gl = self.global_lock(opq)?;
        let nodes = db_context(cb, opq, |db| {
            Ok(db.find_leaf_coalesceable(cb.current_host())?)
        })?;
        if !nodes.is_empty() {
            debug!("{GC}: found {} leaf coalesceable nodes", nodes.len());
        }
        for node in &nodes {
            if let Some(pair) = db_context(cb, opq, |db| lock_node_pair(cb, opq, db, node))? {
                self.leaf_coalesce(opq, pair)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Merge a VDI leaf into its parent, or freeze it under a new leaf when
    /// it is too large to merge while its datapath waits. Runs under the
    /// global lock.
    fn leaf_coalesce(&self, opq: &Path, pair: LockedPair) -> Result<()> {
        let cb = self.cb;
        let leaf = &pair.node.volume;
        let parent = &pair.parent.volume;
        info!("{GC}: leaf coalesce of volume {} into {}", leaf.id, parent.id);

        let leaf_name = leaf.id.to_string();
        let leaf_path = cb.volume_get_path(opq, &leaf_name);
        let parent_path = cb.volume_get_path(opq, &parent.id.to_string());
        let leaf_psize = file_size(&leaf_path)?;

        let vdi = db_context(cb, opq, |db| Ok(db.get_vdi_for_volume(leaf.id)?))?
            .ok_or(Error::VolumeNotFound(leaf.id))?;
        let format = cb.formats().get(vdi.image_type())?;
        let meta_path = cb.data_metadata_path(opq, &vdi.uuid);
        let active = vdi.active_on.is_some();

        if leaf_psize < cb.config().leaf_coalesce_max_size {
            debug!("{GC}: merging leaf {} in place", leaf.id);
            if active {
                cb.datapath().pause_datapath(GC, &meta_path)?;
            }
            format.coalesce(GC, &leaf_path, &parent_path)?;
            db_context(cb, opq, |db| {
                db.update_vdi_volume_id(&vdi.uuid, parent.id)?;
                // The parent is a leaf again and counts by its virtual size.
                db.update_volume_psize(parent.id, None)?;
                if leaf.vsize.is_some() && leaf.vsize != parent.vsize {
                    db.update_volume_vsize(parent.id, leaf.vsize)?;
                }
                if leaf.snap {
                    db.set_volume_as_snapshot(parent.id)?;
                }
                Ok(())
            })?;
            if active {
                cb.datapath()
                    .unpause_datapath(GC, &meta_path, &parent_path)?;
            }
            db_context(cb, opq, |db| {
                db.delete_volume(leaf.id)?;
                cb.volume_destroy(opq, &leaf_name)
            })?;
        } else {
            debug!(
                "{GC}: leaf {} is {leaf_psize} bytes, freezing it for a later non-leaf coalesce",
                leaf.id
            );
            let vsize = match leaf.vsize {
                Some(vsize) => vsize,
                None => format.get_vsize(GC, &leaf_path)?,
            };
            let new_leaf_path = db_context(cb, opq, |db| {
                let new_leaf = db.insert_child_volume(leaf.id, Some(vsize), leaf.snap)?;
                let new_leaf_path = cb.volume_create(opq, &new_leaf.id.to_string(), vsize)?;
                format.online_snapshot(GC, &new_leaf_path, &leaf_path, false)?;
                db.update_vdi_volume_id(&vdi.uuid, new_leaf.id)?;
                db.update_volume_psize(
                    leaf.id,
                    Some(cb.volume_get_phys_size(opq, &leaf_name)?),
                )?;
                Ok(new_leaf_path)
            })?;
            if active {
                cb.datapath()
                    .refresh_datapath_clone(GC, &meta_path, &new_leaf_path)?;
            }
        }
        drop(pair);
        Ok(())
    }

    fn backup(&self) -> Result<()> {
        let ctx = VolumeContext::new(self.cb, &self.uri)?;
        rolling_backup(self.cb, ctx.path())?;
        Ok(())
    }

    /// One pass of the collector. Returns whether a pair was merged.
    pub fn run_iteration(&self) -> Result<bool> {
        self.remove_garbage_volumes()?;
        self.recover_journal()?;
        if let Err(e) = self.backup() {
            warn!("{GC}: metadata backup failed: {e}");
        }

        let ctx = VolumeContext::new(self.cb, &self.uri)?;
        let opq = ctx.path();
        if let Some(pair) = self.find_best_non_leaf_coalesceable(opq)? {
            self.non_leaf_coalesce(opq, pair)?;
            return Ok(true);
        }
        self.find_best_leaf_coalesceable(opq)
    }

    /// Iterate until the repository's disable marker shows up. The first
    /// failure ends the loop.
    pub fn run(&self) -> Result<()> {
        let cb = self.cb;
        let ctx = VolumeContext::new(cb, &self.uri)?;
        let opq = ctx.path();
        cb.create_trash_dir(opq)?;
        info!("{GC}: starting on {opq:?} as host {}", cb.current_host());

        while gc_is_enabled(cb, opq) {
            let busy = self.run_iteration().inspect_err(|e| {
                error!("{GC}: aborting after unexpected failure: {e:?}");
            })?;
            thread::sleep(if busy {
                cb.config().gc_busy_interval
            } else {
                cb.config().gc_idle_interval
            });
        }
        info!("{GC}: stopping, the collector of {opq:?} is disabled");
        Ok(())
    }
}

/// Run the collector of repository `uri` in the calling thread.
pub fn run_coalesce(cb: &dyn Callbacks, uri: &str) -> Result<()> {
    CowCoalesce::new(cb, uri).run()
}
