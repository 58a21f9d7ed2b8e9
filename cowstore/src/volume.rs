// Copyright © 2026 The cowsr Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Volume Operations API.
//!
//! Every operation resolves the repository through a [`VolumeContext`] and
//! changes the shape of the volume tree only while holding the global lock.

use std::collections::BTreeMap;
use std::path::Path;

use disk_image::{is_block_device, size_to_mib, ImageFormat};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::callbacks::{db_context, Callbacks, VolumeContext};
use crate::lock::GLOBAL_LOCK;
use crate::metabase::{Metabase, Vdi};
use crate::{Error, Result};

/// What callers get to see of a VDI.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub uuid: String,
    pub key: String,
    pub name: String,
    pub description: String,
    pub read_write: bool,
    pub virtual_size: u64,
    pub physical_utilisation: u64,
    pub uri: Vec<String>,
    pub sharable: bool,
    pub keys: BTreeMap<String, String>,
}

pub(crate) fn get_vdi(db: &Metabase, key: &str) -> Result<Vdi> {
    db.get_vdi_by_id(key)?
        .ok_or_else(|| Error::VdiNotFound(key.to_owned()))
}

/// A crash in the middle of a resize leaves the virtual size unset. Ask the
/// image for it and record it again.
fn vdi_sanitize(vdi: &mut Vdi, opq: &Path, db: &Metabase, cb: &dyn Callbacks) -> Result<u64> {
    if let Some(vsize) = vdi.volume.vsize {
        return Ok(vsize);
    }
    let format = cb.formats().get(vdi.image_type())?;
    let path = cb.volume_get_path(opq, &vdi.volume.id.to_string());
    let vsize = format.get_vsize("", &path)?;
    info!(
        "Restoring virtual size {vsize} of volume {} after an interrupted resize",
        vdi.volume.id
    );
    db.update_volume_vsize(vdi.volume.id, Some(vsize))?;
    vdi.volume.vsize = Some(vsize);
    Ok(vsize)
}

fn vdi_uri(cb: &dyn Callbacks, opq: &Path, format: &dyn ImageFormat, uuid: &str) -> Vec<String> {
    vec![format!(
        "{}{}{uuid}",
        format.uri_prefix(),
        cb.volume_uri_prefix(opq)
    )]
}

fn snapshot(
    format: &dyn ImageFormat,
    dbg: &str,
    active: bool,
    new_path: &Path,
    parent_path: &Path,
) -> disk_image::Result<()> {
    if active {
        format.online_snapshot(dbg, new_path, parent_path, false)
    } else {
        format.offline_snapshot(dbg, new_path, parent_path, false)
    }
}

pub struct CowVolume;

impl CowVolume {
    pub fn create(
        dbg: &str,
        cb: &dyn Callbacks,
        sr: &str,
        name: &str,
        description: &str,
        size: u64,
        sharable: bool,
    ) -> Result<VolumeInfo> {
        let (size_mib, vsize) = size_to_mib(size)?;
        let ctx = VolumeContext::new(cb, sr)?;
        let opq = ctx.path();
        let image_type = cb.config().image_type;
        let format = cb.formats().get(image_type)?;
        let vdi_uuid = Uuid::new_v4().to_string();

        let volume = {
            let _gl = cb.volume_poll_lock(opq, GLOBAL_LOCK, cb.config().gl_poll_period)?;
            db_context(cb, opq, |db| {
                let volume = db.insert_new_volume(vsize, image_type)?;
                db.insert_vdi(name, description, &vdi_uuid, volume.id, sharable)?;
                let path = cb.volume_create(opq, &volume.id.to_string(), vsize)?;
                format.create(dbg, &path, size_mib)?;
                Ok(volume)
            })?
        };
        debug!("{dbg}: created VDI {vdi_uuid} on volume {}", volume.id);

        Ok(VolumeInfo {
            uuid: vdi_uuid.clone(),
            key: vdi_uuid.clone(),
            name: name.to_owned(),
            description: description.to_owned(),
            read_write: true,
            virtual_size: vsize,
            physical_utilisation: cb.volume_get_phys_size(opq, &volume.id.to_string())?,
            uri: vdi_uri(cb, opq, format, &vdi_uuid),
            sharable,
            keys: BTreeMap::new(),
        })
    }

    /// Forget the VDI and remove its head volume. Ancestors left without
    /// children are collected by the GC.
    pub fn destroy(dbg: &str, cb: &dyn Callbacks, sr: &str, key: &str) -> Result<()> {
        let ctx = VolumeContext::new(cb, sr)?;
        let opq = ctx.path();
        let _gl = cb.volume_lock(opq, GLOBAL_LOCK)?;

        let vdi = db_context(cb, opq, |db| {
            let vdi = get_vdi(db, key)?;
            db.delete_vdi(key)?;
            Ok(vdi)
        })?;
        db_context(cb, opq, |db| {
            if !db.get_children(vdi.volume.id)?.is_empty() {
                warn!(
                    "{dbg}: volume {} still has children, leaving it in the tree",
                    vdi.volume.id
                );
                return Ok(());
            }
            cb.volume_destroy(opq, &vdi.volume.id.to_string())?;
            db.delete_volume(vdi.volume.id)?;
            Ok(())
        })?;
        debug!("{dbg}: destroyed VDI {key}");
        Ok(())
    }

    /// Grow a VDI. The virtual size is cleared while the image is being
    /// resized so that an interrupted resize is repaired on next access.
    pub fn resize(dbg: &str, cb: &dyn Callbacks, sr: &str, key: &str, new_size: u64) -> Result<()> {
        let (size_mib, vsize) = size_to_mib(new_size)?;
        let ctx = VolumeContext::new(cb, sr)?;
        let opq = ctx.path();

        let vdi = db_context(cb, opq, |db| {
            let mut vdi = get_vdi(db, key)?;
            if vdi.sharable {
                return Err(Error::SharableCannotResize(vdi.uuid));
            }
            let current = vdi_sanitize(&mut vdi, opq, db, cb)?;
            if new_size < current {
                error!("{dbg}: volume cannot be shrunk from {current} to {new_size}");
                return Err(Error::ShrinkNotAllowed {
                    current,
                    requested: new_size,
                });
            }
            db.update_volume_vsize(vdi.volume.id, None)?;
            Ok(vdi)
        })?;

        let format = cb.formats().get(vdi.image_type())?;
        let name = vdi.volume.id.to_string();
        db_context(cb, opq, |db| {
            cb.volume_resize(opq, &name, vsize)?;
            let path = cb.volume_get_path(opq, &name);
            if is_block_device(&path)? {
                return Err(Error::CannotResizeBlockDevice(path));
            }
            format.resize(dbg, &path, size_mib)?;
            let real_vsize = format.get_vsize(dbg, &path)?;
            db.update_volume_vsize(vdi.volume.id, Some(real_vsize))?;
            Ok(())
        })
    }

    fn check_clone(
        vdi: &Vdi,
        db: &Metabase,
        cb: &dyn Callbacks,
        format: &dyn ImageFormat,
        is_snapshot: bool,
    ) -> Result<()> {
        if vdi.sharable {
            return Err(Error::SharableCannotClone(vdi.uuid.clone()));
        }

        let max = cb
            .config()
            .max_chain_height
            .unwrap_or_else(|| format.max_chain_height());
        let height = db.get_vdi_chain_height(&vdi.uuid)?;
        if height >= max {
            return Err(Error::ChainTooLong { height, max });
        }

        if let Some(active_on) = &vdi.active_on {
            if !is_snapshot {
                return Err(Error::VdiInUse(vdi.uuid.clone()));
            }
            let current_host = cb.current_host();
            if active_on != current_host {
                debug!("{current_host} can not snapshot a VDI already active on {active_on}");
                return Err(Error::ActivatedOnAnotherHost(active_on.clone()));
            }
        }
        Ok(())
    }

    fn clone_vdi(
        dbg: &str,
        cb: &dyn Callbacks,
        sr: &str,
        key: &str,
        is_snapshot: bool,
    ) -> Result<VolumeInfo> {
        let snap_uuid = Uuid::new_v4().to_string();
        let ctx = VolumeContext::new(cb, sr)?;
        let opq = ctx.path();
        let _gl = cb.volume_poll_lock(opq, GLOBAL_LOCK, cb.config().gl_poll_period)?;

        let (vdi, vsize, snap_volume_id, snap_path, vol_path, need_extra_snap) =
            db_context(cb, opq, |db| {
                let mut vdi = get_vdi(db, key)?;
                let format = cb.formats().get(vdi.image_type())?;
                Self::check_clone(&vdi, db, cb, format, is_snapshot)?;
                let vsize = vdi_sanitize(&mut vdi, opq, db, cb)?;

                // Snapshots are immutable, branch off their parent instead.
                let vol_id = if vdi.volume.snap {
                    vdi.volume.parent_id.unwrap_or(vdi.volume.id)
                } else {
                    vdi.volume.id
                };
                let vol_path = cb.volume_get_path(opq, &vol_id.to_string());
                if is_block_device(&vol_path)? {
                    return Err(Error::CannotCloneBlockDevice(vol_path));
                }

                let snap_volume = db.insert_child_volume(vol_id, Some(vsize), false)?;
                let snap_path = cb.volume_create(opq, &snap_volume.id.to_string(), vsize)?;
                snapshot(format, dbg, vdi.active_on.is_some(), &snap_path, &vol_path)?;

                // An offline snapshot of an empty image may have been linked
                // to the image's own parent. If it was not, the source keeps
                // its data in vol_path: freeze it, move the VDI to the new
                // child and take a second child for the copy.
                let need_extra_snap = !vdi.volume.snap
                    && (vdi.active_on.is_some()
                        || format.is_parent_pointing_to_path(dbg, &snap_path, &vol_path)?);
                if need_extra_snap {
                    db.update_vdi_volume_id(&vdi.uuid, snap_volume.id)?;
                } else {
                    if !vdi.volume.snap {
                        db.update_volume_parent(snap_volume.id, vdi.volume.parent_id)?;
                    }
                    if is_snapshot {
                        db.set_volume_as_snapshot(snap_volume.id)?;
                    }
                    db.insert_vdi(
                        &vdi.name,
                        &vdi.description,
                        &snap_uuid,
                        snap_volume.id,
                        vdi.sharable,
                    )?;
                }
                Ok((vdi, vsize, snap_volume.id, snap_path, vol_path, need_extra_snap))
            })?;

        let format = cb.formats().get(vdi.image_type())?;
        let result_volume_id = if need_extra_snap {
            debug!("{dbg}: need extra snapshot of volume {}", vdi.volume.id);
            if vdi.active_on.is_some() {
                cb.datapath().refresh_datapath_clone(
                    "Volume.snapshot",
                    &cb.data_metadata_path(opq, &vdi.uuid),
                    &snap_path,
                )?;
            }
            let psize = cb.volume_get_phys_size(opq, &vdi.volume.id.to_string())?;
            db_context(cb, opq, |db| {
                db.update_volume_psize(vdi.volume.id, Some(psize))?;
                let snap_2 = db.insert_child_volume(vdi.volume.id, Some(vsize), is_snapshot)?;
                let snap_2_path = cb.volume_create(opq, &snap_2.id.to_string(), vsize)?;
                snapshot(format, dbg, vdi.active_on.is_some(), &snap_2_path, &vol_path)?;
                db.insert_vdi(
                    &vdi.name,
                    &vdi.description,
                    &snap_uuid,
                    snap_2.id,
                    vdi.sharable,
                )?;
                Ok(snap_2.id)
            })?
        } else {
            snap_volume_id
        };
        debug!(
            "{dbg}: VDI {snap_uuid} created on volume {result_volume_id} from {}",
            vdi.uuid
        );

        Ok(VolumeInfo {
            uuid: snap_uuid.clone(),
            key: snap_uuid.clone(),
            name: vdi.name.clone(),
            description: vdi.description.clone(),
            read_write: !is_snapshot,
            virtual_size: vsize,
            physical_utilisation: cb.volume_get_phys_size(opq, &result_volume_id.to_string())?,
            uri: vdi_uri(cb, opq, format, &snap_uuid),
            sharable: false,
            keys: BTreeMap::new(),
        })
    }

    /// Writable copy of a VDI.
    pub fn clone(dbg: &str, cb: &dyn Callbacks, sr: &str, key: &str) -> Result<VolumeInfo> {
        Self::clone_vdi(dbg, cb, sr, key, false)
    }

    /// Read-only copy of a VDI.
    pub fn snapshot(dbg: &str, cb: &dyn Callbacks, sr: &str, key: &str) -> Result<VolumeInfo> {
        Self::clone_vdi(dbg, cb, sr, key, true)
    }

    fn info(
        cb: &dyn Callbacks,
        opq: &Path,
        vdi: &Vdi,
        vsize: u64,
        keys: BTreeMap<String, String>,
    ) -> Result<VolumeInfo> {
        let format = cb.formats().get(vdi.image_type())?;
        Ok(VolumeInfo {
            uuid: vdi.uuid.clone(),
            key: vdi.uuid.clone(),
            name: vdi.name.clone(),
            description: vdi.description.clone(),
            read_write: !vdi.volume.snap,
            virtual_size: vsize,
            physical_utilisation: cb.volume_get_phys_size(opq, &vdi.volume.id.to_string())?,
            uri: vdi_uri(cb, opq, format, &vdi.uuid),
            sharable: vdi.sharable,
            keys,
        })
    }

    pub fn stat(_dbg: &str, cb: &dyn Callbacks, sr: &str, key: &str) -> Result<VolumeInfo> {
        let ctx = VolumeContext::new(cb, sr)?;
        let opq = ctx.path();
        let (vdi, vsize, keys) = db_context(cb, opq, |db| {
            let mut vdi = get_vdi(db, key)?;
            let vsize = vdi_sanitize(&mut vdi, opq, db, cb)?;
            let keys = db.get_vdi_custom_keys(&vdi.uuid)?;
            Ok((vdi, vsize, keys))
        })?;
        Self::info(cb, opq, &vdi, vsize, keys)
    }

    pub fn ls(_dbg: &str, cb: &dyn Callbacks, sr: &str) -> Result<Vec<VolumeInfo>> {
        let ctx = VolumeContext::new(cb, sr)?;
        let opq = ctx.path();
        let (vdis, mut all_keys) = db_context(cb, opq, |db| {
            let mut vdis = Vec::new();
            for mut vdi in db.get_all_vdis()? {
                let vsize = vdi_sanitize(&mut vdi, opq, db, cb)?;
                vdis.push((vdi, vsize));
            }
            Ok((vdis, db.get_all_vdi_custom_keys()?))
        })?;

        vdis.into_iter()
            .map(|(vdi, vsize)| {
                let keys = all_keys.remove(&vdi.uuid).unwrap_or_default();
                Self::info(cb, opq, &vdi, vsize, keys)
            })
            .collect()
    }

    pub fn set(
        _dbg: &str,
        cb: &dyn Callbacks,
        sr: &str,
        key: &str,
        custom_key: &str,
        value: &str,
    ) -> Result<()> {
        let ctx = VolumeContext::new(cb, sr)?;
        db_context(cb, ctx.path(), |db| {
            get_vdi(db, key)?;
            Ok(db.set_vdi_custom_key(key, custom_key, value)?)
        })
    }

    pub fn unset(_dbg: &str, cb: &dyn Callbacks, sr: &str, key: &str, custom_key: &str) -> Result<()> {
        let ctx = VolumeContext::new(cb, sr)?;
        db_context(cb, ctx.path(), |db| {
            get_vdi(db, key)?;
            Ok(db.delete_vdi_custom_key(key, custom_key)?)
        })
    }

    pub fn set_name(_dbg: &str, cb: &dyn Callbacks, sr: &str, key: &str, new_name: &str) -> Result<()> {
        let ctx = VolumeContext::new(cb, sr)?;
        db_context(cb, ctx.path(), |db| {
            let vdi = get_vdi(db, key)?;
            Ok(db.update_vdi_name(&vdi.uuid, new_name)?)
        })
    }

    pub fn set_description(
        _dbg: &str,
        cb: &dyn Callbacks,
        sr: &str,
        key: &str,
        new_description: &str,
    ) -> Result<()> {
        let ctx = VolumeContext::new(cb, sr)?;
        db_context(cb, ctx.path(), |db| {
            let vdi = get_vdi(db, key)?;
            Ok(db.update_vdi_description(&vdi.uuid, new_description)?)
        })
    }

    /// Upper bound of the space the repository may end up using: the frozen
    /// inner nodes as they are plus every writable leaf fully allocated.
    pub fn get_sr_provisioned_size(cb: &dyn Callbacks, sr: &str) -> Result<u64> {
        let ctx = VolumeContext::new(cb, sr)?;
        let opq = ctx.path();
        db_context(cb, opq, |db| {
            for mut vdi in db.get_all_vdis()? {
                vdi_sanitize(&mut vdi, opq, db, cb)?;
            }
            Ok(db.get_non_leaf_total_psize()? + db.get_leaf_total_vsize()?)
        })
    }
}
