// Copyright © 2026 The cowsr Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Repository backend callbacks.
//!
//! The engine never touches the repository layout directly. It asks a
//! [`Callbacks`] implementation to resolve the repository URI to a local
//! path (the "opaque" handle threaded through every call), to materialise
//! and remove backing objects, and to locate the metadata database, lock
//! files and trash directory. The default methods implement the plain
//! directory layout; backends override what they provision differently.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use disk_image::FormatRegistry;

use crate::config::SrConfig;
use crate::datapath::{Datapath, NullDatapath};
use crate::lock::{self, VolumeLock, DB_LOCK};
use crate::metabase::Metabase;
use crate::{Error, Result};

const METADATA_FILE: &str = "sqlite3-metadata.db";
const TRASH_DIR: &str = ".trash";
const GC_DISABLED_FILE: &str = "gc_disabled";
const BACKUPS_DIR: &str = "db_backups";
const INVENTORY_PATH: &str = "/etc/xensource-inventory";
const HOST_ENV: &str = "COWSR_HOST";

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> Error + '_ {
    move |e| Error::Io(e, path.to_path_buf())
}

pub trait Callbacks: Send + Sync {
    fn config(&self) -> &SrConfig;

    fn formats(&self) -> &FormatRegistry;

    fn datapath(&self) -> &dyn Datapath;

    /// Identifier of this host, as recorded in `active_on`.
    fn current_host(&self) -> &str;

    /// Resolve a repository URI to the local path of the repository.
    fn start_operations(&self, uri: &str) -> Result<PathBuf> {
        let path = Path::new(uri.strip_prefix("file://").unwrap_or(uri));
        if !path.is_absolute() {
            return Err(Error::InvalidUri(uri.to_owned()));
        }
        if !path.is_dir() {
            return Err(Error::Io(
                io::Error::from(io::ErrorKind::NotFound),
                path.to_path_buf(),
            ));
        }
        Ok(path.to_path_buf())
    }

    fn stop_operations(&self, _opq: &Path) {}

    fn volume_get_path(&self, opq: &Path, name: &str) -> PathBuf {
        opq.join(name)
    }

    /// Materialise an empty backing object for volume `name`.
    fn volume_create(&self, opq: &Path, name: &str, size: u64) -> Result<PathBuf> {
        debug!("volume_create opq={opq:?} name={name} size={size}");
        let path = self.volume_get_path(opq, name);
        OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(io_error(&path))?;
        Ok(path)
    }

    /// Move the backing object of `name` to the trash and drop its lock file.
    fn volume_destroy(&self, opq: &Path, name: &str) -> Result<()> {
        debug!("volume_destroy opq={opq:?} name={name}");
        self.create_trash_dir(opq)?;
        let path = self.volume_get_path(opq, name);
        match fs::rename(&path, self.trash_dir(opq).join(name)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(Error::Io(e, path)),
            _ => (),
        }
        // Best effort, the lock file is recreated on demand.
        let _ = fs::remove_file(self.lock_path(opq, name));
        Ok(())
    }

    /// Grow the space reserved for `name` ahead of an image resize.
    fn volume_resize(&self, _opq: &Path, _name: &str, _new_size: u64) -> Result<()> {
        Ok(())
    }

    fn volume_get_phys_size(&self, opq: &Path, name: &str) -> Result<u64> {
        Ok(disk_image::physical_size(&self.volume_get_path(opq, name))?)
    }

    fn metadata_path(&self, opq: &Path) -> PathBuf {
        opq.join(METADATA_FILE)
    }

    fn trash_dir(&self, opq: &Path) -> PathBuf {
        opq.join(TRASH_DIR)
    }

    fn create_trash_dir(&self, opq: &Path) -> Result<()> {
        let dir = self.trash_dir(opq);
        fs::create_dir_all(&dir).map_err(io_error(&dir))
    }

    fn empty_trash(&self, opq: &Path) -> Result<()> {
        let dir = self.trash_dir(opq);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::Io(e, dir)),
        };
        for entry in entries {
            let path = entry.map_err(io_error(&dir))?.path();
            fs::remove_file(&path).map_err(io_error(&path))?;
        }
        Ok(())
    }

    /// Where the datapath keeps the attachment state of a VDI.
    fn data_metadata_path(&self, opq: &Path, vdi_uuid: &str) -> PathBuf {
        opq.join(vdi_uuid)
    }

    fn volume_uri_prefix(&self, opq: &Path) -> String {
        format!("{}/", opq.display())
    }

    /// The GC of this repository stops while this file exists.
    fn gc_disabled_path(&self, opq: &Path) -> PathBuf {
        opq.join(GC_DISABLED_FILE)
    }

    fn backups_dir(&self, opq: &Path) -> PathBuf {
        opq.join(BACKUPS_DIR)
    }

    fn lock_path(&self, opq: &Path, name: &str) -> PathBuf {
        lock::lock_path(opq, name)
    }

    fn volume_lock(&self, opq: &Path, name: &str) -> Result<VolumeLock> {
        Ok(VolumeLock::lock(name, &self.lock_path(opq, name))?)
    }

    fn volume_try_lock(&self, opq: &Path, name: &str) -> Result<Option<VolumeLock>> {
        Ok(VolumeLock::try_lock(name, &self.lock_path(opq, name))?)
    }

    fn volume_poll_lock(&self, opq: &Path, name: &str, period: Duration) -> Result<VolumeLock> {
        Ok(VolumeLock::poll_lock(
            name,
            &self.lock_path(opq, name),
            period,
        )?)
    }

    fn get_database(&self, opq: &Path) -> Result<Metabase> {
        Ok(Metabase::open(&self.metadata_path(opq))?)
    }

    fn create_database(&self, opq: &Path) -> Result<()> {
        let _lock = self.volume_lock(opq, DB_LOCK)?;
        self.get_database(opq)?.create()?;
        Ok(())
    }
}

/// Resolves a repository URI for as long as it lives.
pub struct VolumeContext<'a> {
    cb: &'a dyn Callbacks,
    opq: PathBuf,
}

impl<'a> VolumeContext<'a> {
    pub fn new(cb: &'a dyn Callbacks, uri: &str) -> Result<Self> {
        let opq = cb.start_operations(uri)?;
        Ok(VolumeContext { cb, opq })
    }

    pub fn path(&self) -> &Path {
        &self.opq
    }
}

impl Drop for VolumeContext<'_> {
    fn drop(&mut self) {
        self.cb.stop_operations(&self.opq);
    }
}

/// Run `f` in a metadata transaction while holding the database lock.
pub fn db_context<T, F>(cb: &dyn Callbacks, opq: &Path, f: F) -> Result<T>
where
    F: FnOnce(&Metabase) -> Result<T>,
{
    let _lock = cb.volume_lock(opq, DB_LOCK)?;
    let db = cb.get_database(opq)?;
    db.transaction(f)
}

/// Prepare a fresh repository directory.
pub fn init_sr(cb: &dyn Callbacks, uri: &str) -> Result<()> {
    let ctx = VolumeContext::new(cb, uri)?;
    cb.create_database(ctx.path())?;
    cb.create_trash_dir(ctx.path())?;
    info!("Initialised repository {:?}", ctx.path());
    Ok(())
}

fn inventory_host(inventory: &str) -> Option<String> {
    inventory.lines().find_map(|line| {
        let value = line.trim().strip_prefix("INSTALLATION_UUID=")?;
        let value = value.trim_matches(|c| c == '\'' || c == '"');
        (!value.is_empty()).then(|| value.to_owned())
    })
}

fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for writes of its full length.
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return None;
    }
    let len = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..len].to_vec()).ok()
}

/// This host's identifier: `$COWSR_HOST`, the installation UUID from the
/// inventory, or the hostname, whichever is found first.
pub fn current_host() -> String {
    if let Ok(host) = std::env::var(HOST_ENV) {
        if !host.is_empty() {
            return host;
        }
    }
    fs::read_to_string(INVENTORY_PATH)
        .ok()
        .and_then(|inventory| inventory_host(&inventory))
        .or_else(hostname)
        .unwrap_or_else(|| "localhost".to_owned())
}

/// Callbacks for repositories that are plain local directories.
pub struct FileCallbacks {
    config: SrConfig,
    formats: FormatRegistry,
    datapath: Box<dyn Datapath>,
    host: String,
}

impl FileCallbacks {
    pub fn new(config: SrConfig) -> Self {
        FileCallbacks {
            config,
            formats: FormatRegistry::new(),
            datapath: Box::new(NullDatapath),
            host: current_host(),
        }
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = host.to_owned();
        self
    }

    pub fn with_datapath(mut self, datapath: Box<dyn Datapath>) -> Self {
        self.datapath = datapath;
        self
    }

    pub fn with_formats(mut self, formats: FormatRegistry) -> Self {
        self.formats = formats;
        self
    }
}

impl Callbacks for FileCallbacks {
    fn config(&self) -> &SrConfig {
        &self.config
    }

    fn formats(&self) -> &FormatRegistry {
        &self.formats
    }

    fn datapath(&self) -> &dyn Datapath {
        self.datapath.as_ref()
    }

    fn current_host(&self) -> &str {
        &self.host
    }
}

#[cfg(test)]
mod tests {
    use vmm_sys_util::tempdir::TempDir;

    use super::*;

    fn callbacks() -> FileCallbacks {
        FileCallbacks::new(SrConfig::default()).with_host("host1")
    }

    #[test]
    fn test_start_operations() {
        let dir = TempDir::new_with_prefix("/tmp/callbacks").unwrap();
        let cb = callbacks();
        let uri = format!("file://{}", dir.as_path().display());
        assert_eq!(cb.start_operations(&uri).unwrap(), dir.as_path());
        assert_eq!(
            cb.start_operations(dir.as_path().to_str().unwrap()).unwrap(),
            dir.as_path()
        );
        assert!(matches!(
            cb.start_operations("relative/sr"),
            Err(Error::InvalidUri(_))
        ));
        assert!(matches!(
            cb.start_operations("file:///nonexistent/sr"),
            Err(Error::Io(..))
        ));
    }

    #[test]
    fn test_volume_lifecycle_and_trash() {
        let dir = TempDir::new_with_prefix("/tmp/callbacks").unwrap();
        let cb = callbacks();
        let opq = dir.as_path();

        let path = cb.volume_create(opq, "1", 1 << 20).unwrap();
        assert_eq!(path, opq.join("1"));
        assert!(path.exists());
        let lock = cb.volume_try_lock(opq, "1").unwrap().unwrap();
        drop(lock);
        assert!(opq.join("lock_1").exists());

        cb.volume_destroy(opq, "1").unwrap();
        assert!(!path.exists());
        assert!(!opq.join("lock_1").exists());
        assert!(cb.trash_dir(opq).join("1").exists());
        // Destroying twice is harmless.
        cb.volume_destroy(opq, "1").unwrap();

        cb.empty_trash(opq).unwrap();
        assert_eq!(fs::read_dir(cb.trash_dir(opq)).unwrap().count(), 0);
    }

    #[test]
    fn test_db_context_commits_and_rolls_back() {
        let dir = TempDir::new_with_prefix("/tmp/callbacks").unwrap();
        let cb = callbacks();
        init_sr(&cb, dir.as_path().to_str().unwrap()).unwrap();
        assert!(cb.trash_dir(dir.as_path()).is_dir());
        let opq = dir.as_path();

        let failed: Result<()> = db_context(&cb, opq, |db| {
            db.insert_new_volume(1 << 20, disk_image::ImageType::Cow)?;
            Err(Error::VolumeNotFound(1))
        });
        failed.unwrap_err();
        let volumes = db_context(&cb, opq, |db| Ok(db.get_all_volumes()?)).unwrap();
        assert!(volumes.is_empty());

        db_context(&cb, opq, |db| {
            Ok(db.insert_new_volume(1 << 20, disk_image::ImageType::Cow)?)
        })
        .unwrap();
        let volumes = db_context(&cb, opq, |db| Ok(db.get_all_volumes()?)).unwrap();
        assert_eq!(volumes.len(), 1);
    }

    #[test]
    fn test_inventory_host() {
        let inventory = "PRIMARY_DISK='/dev/sda'\nINSTALLATION_UUID='0fd9ed8c-7d43'\n";
        assert_eq!(inventory_host(inventory).unwrap(), "0fd9ed8c-7d43");
        assert!(inventory_host("BUILD_NUMBER='1'\n").is_none());
        assert!(!current_host().is_empty());
    }
}
