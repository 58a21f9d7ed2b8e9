// Copyright © 2026 The cowsr Authors
//
// SPDX-License-Identifier: Apache-2.0
//

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use cowstore::datapath::{self, Datapath};
use cowstore::metabase::Metabase;
use cowstore::{db_context, init_sr, Callbacks, FileCallbacks, SrConfig};
use disk_image::CowFile;
use vmm_sys_util::tempdir::TempDir;

pub const MIB: u64 = 1 << 20;
pub const HOST: &str = "host1";

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Remembers every request, naming paths by their file name.
#[derive(Clone, Default)]
pub struct RecordingDatapath {
    calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingDatapath {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Datapath for RecordingDatapath {
    fn refresh_datapath_clone(
        &self,
        _dbg: &str,
        meta_path: &Path,
        new_path: &Path,
    ) -> datapath::Result<()> {
        self.record(format!(
            "refresh-clone {} {}",
            file_name(meta_path),
            file_name(new_path)
        ));
        Ok(())
    }

    fn refresh_datapath_coalesce(
        &self,
        _dbg: &str,
        meta_path: &Path,
        coalesced_node: &Path,
        parent_node: &Path,
    ) -> datapath::Result<()> {
        self.record(format!(
            "refresh-coalesce {} {} {}",
            file_name(meta_path),
            file_name(coalesced_node),
            file_name(parent_node)
        ));
        Ok(())
    }

    fn pause_datapath(&self, _dbg: &str, meta_path: &Path) -> datapath::Result<()> {
        self.record(format!("pause {}", file_name(meta_path)));
        Ok(())
    }

    fn unpause_datapath(
        &self,
        _dbg: &str,
        meta_path: &Path,
        new_path: &Path,
    ) -> datapath::Result<()> {
        self.record(format!(
            "unpause {} {}",
            file_name(meta_path),
            file_name(new_path)
        ));
        Ok(())
    }
}

/// A scratch repository with fast polling and no GC pauses.
pub struct TestSr {
    pub dir: TempDir,
    pub cb: FileCallbacks,
    pub uri: String,
    pub datapath: RecordingDatapath,
}

impl TestSr {
    pub fn new() -> Self {
        Self::with_options("")
    }

    pub fn with_options(options: &str) -> Self {
        let mut config = SrConfig::parse(options).unwrap();
        config.gl_poll_period = std::time::Duration::from_millis(10);
        config.gc_poll_period = std::time::Duration::from_millis(10);
        config.gc_busy_interval = std::time::Duration::ZERO;
        config.gc_idle_interval = std::time::Duration::from_millis(10);

        let dir = TempDir::new_with_prefix("/tmp/cowstore").unwrap();
        let datapath = RecordingDatapath::default();
        let cb = FileCallbacks::new(config)
            .with_host(HOST)
            .with_datapath(Box::new(datapath.clone()));
        let uri = format!("file://{}", dir.as_path().display());
        init_sr(&cb, &uri).unwrap();
        TestSr {
            dir,
            cb,
            uri,
            datapath,
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.as_path()
    }

    pub fn db<T>(&self, f: impl FnOnce(&Metabase) -> cowstore::Result<T>) -> T {
        db_context(&self.cb, self.path(), f).unwrap()
    }

    pub fn volume_id(&self, uuid: &str) -> i64 {
        self.db(|db| Ok(db.get_vdi_by_id(uuid)?.unwrap().volume.id))
    }

    pub fn volume_path(&self, id: i64) -> PathBuf {
        self.cb.volume_get_path(self.path(), &id.to_string())
    }

    pub fn volume_ids(&self) -> Vec<i64> {
        self.db(|db| Ok(db.get_all_volumes()?))
            .into_iter()
            .map(|v| v.id)
            .collect()
    }

    pub fn set_active_on(&self, uuid: &str, host: Option<&str>) {
        self.db(|db| Ok(db.update_vdi_active_on(uuid, host)?));
    }

    /// Write guest data through the head image of a VDI.
    pub fn write_vdi(&self, uuid: &str, offset: u64, data: &[u8]) {
        let mut image = CowFile::open(&self.volume_path(self.volume_id(uuid))).unwrap();
        image.write_at(offset, data).unwrap();
        image.sync().unwrap();
    }

    pub fn read_vdi(&self, uuid: &str, offset: u64, len: usize) -> Vec<u8> {
        let image = CowFile::open(&self.volume_path(self.volume_id(uuid))).unwrap();
        let mut buf = vec![0u8; len];
        image.read_at(offset, &mut buf).unwrap();
        buf
    }

    /// Every parent exists, no cycles, and no two VDIs share a volume.
    pub fn check_tree(&self) {
        let (volumes, vdis) = self.db(|db| Ok((db.get_all_volumes()?, db.get_all_vdis()?)));
        let ids: HashSet<i64> = volumes.iter().map(|v| v.id).collect();
        for volume in &volumes {
            let mut seen = HashSet::new();
            let mut current = Some(volume.clone());
            while let Some(v) = current {
                assert!(seen.insert(v.id), "cycle through volume {}", v.id);
                current = v.parent_id.map(|parent_id| {
                    assert!(ids.contains(&parent_id), "dangling parent {parent_id}");
                    volumes.iter().find(|p| p.id == parent_id).unwrap().clone()
                });
            }
        }
        let mut used = HashSet::new();
        for vdi in &vdis {
            assert!(used.insert(vdi.volume.id), "volume {} shared", vdi.volume.id);
        }
    }
}
