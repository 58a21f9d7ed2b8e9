// Copyright © 2026 The cowsr Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Copy-on-write volume engine of a storage repository.
//!
//! A repository is a directory shared by every host it is attached to. It
//! holds the metadata database, the backing image of every volume, named
//! lock files and a trash directory. Foreground [`volume`] operations and
//! the background [`coalesce`] collector coordinate only through those
//! files.

#[macro_use]
extern crate log;

pub mod backup;
pub mod callbacks;
pub mod coalesce;
pub mod config;
pub mod datapath;
mod fcntl;
pub mod lock;
pub mod metabase;
pub mod volume;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use crate::callbacks::{db_context, init_sr, Callbacks, FileCallbacks, VolumeContext};
pub use crate::coalesce::{run_coalesce, set_gc_enabled, CowCoalesce};
pub use crate::config::SrConfig;
pub use crate::datapath::{Datapath, HookDatapath, NullDatapath};
pub use crate::volume::{CowVolume, VolumeInfo};

#[derive(Error, Debug)]
pub enum Error {
    #[error("VDI {0} does not exist")]
    VdiNotFound(String),
    #[error("Volume {0} does not exist")]
    VolumeNotFound(i64),
    #[error("The VDI {0} is currently in use")]
    VdiInUse(String),
    #[error("VDI Invalid size, shrinking from {current} to {requested} not allowed")]
    ShrinkNotAllowed { current: u64, requested: u64 },
    #[error("Cannot clone or snapshot block device {0:?}")]
    CannotCloneBlockDevice(PathBuf),
    #[error("Cannot resize block device {0:?}")]
    CannotResizeBlockDevice(PathBuf),
    #[error("The snapshot chain is too long: {height} >= {max}")]
    ChainTooLong { height: u64, max: u64 },
    #[error("VDI is activated on another host: {0}")]
    ActivatedOnAnotherHost(String),
    #[error("Sharable VDI {0} cannot be resized")]
    SharableCannotResize(String),
    #[error("Sharable VDI {0} cannot be cloned")]
    SharableCannotClone(String),
    #[error("Invalid repository URI: {0}")]
    InvalidUri(String),
    #[error("I/O failure on {1:?}")]
    Io(#[source] io::Error, PathBuf),
    #[error("Metadata failure")]
    Metabase(#[from] metabase::MetabaseError),
    #[error("Locking failure")]
    Lock(#[from] lock::LockError),
    #[error("Image failure")]
    Image(#[from] disk_image::Error),
    #[error("Datapath failure")]
    Datapath(#[from] datapath::DatapathError),
    #[error("Invalid configuration")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// Stable code reported for precondition violations, `None` for backend
    /// failures.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Error::VdiInUse(_) => Some("SR_BACKEND_FAILURE_24"),
            Error::ShrinkNotAllowed { .. } => Some("SR_BACKEND_FAILURE_79"),
            Error::CannotCloneBlockDevice(_) => Some("SR_BACKEND_FAILURE_82"),
            Error::ChainTooLong { .. } => Some("SR_BACKEND_FAILURE_109"),
            Error::CannotResizeBlockDevice(_) => Some("SR_BACKEND_FAILURE_110"),
            Error::ActivatedOnAnotherHost(_) => Some("Activated_on_another_host"),
            Error::SharableCannotResize(_) | Error::SharableCannotClone(_) => {
                Some("UnimplementedInBackend")
            }
            Error::VdiNotFound(_) => Some("VDI_DOES_NOT_EXIST"),
            _ => None,
        }
    }

    /// Whether the caller asked for something the repository refuses, as
    /// opposed to the backend failing.
    pub fn is_precondition(&self) -> bool {
        self.code().is_some()
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            Error::VdiInUse("u".to_owned()).code(),
            Some("SR_BACKEND_FAILURE_24")
        );
        assert_eq!(
            Error::ShrinkNotAllowed {
                current: 2,
                requested: 1
            }
            .code(),
            Some("SR_BACKEND_FAILURE_79")
        );
        assert_eq!(
            Error::ChainTooLong { height: 30, max: 30 }.code(),
            Some("SR_BACKEND_FAILURE_109")
        );
        assert!(Error::SharableCannotClone("u".to_owned()).is_precondition());
        assert!(!Error::VolumeNotFound(3).is_precondition());
        assert!(!Error::Io(io::Error::other("boom"), PathBuf::from("/sr")).is_precondition());
    }
}
