// Copyright © 2026 The cowsr Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Hooks into the datapath serving an active VDI.
//!
//! When the chain under an attached VDI changes, its datapath must reopen
//! the images it has open. The attach/activate machinery itself lives
//! outside this crate; a [`Datapath`] only relays the reload requests.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatapathError {
    #[error("Failed to run datapath hook {0:?}")]
    Spawn(PathBuf, #[source] io::Error),
    #[error("Datapath hook {program:?} {op} failed: {stderr}")]
    Hook {
        program: PathBuf,
        op: &'static str,
        stderr: String,
    },
    #[error("Path is not valid UTF-8: {0:?}")]
    NonUtf8Path(PathBuf),
}

pub type Result<T> = std::result::Result<T, DatapathError>;

/// Live-chain primitives, keyed by the datapath metadata path of the VDI.
pub trait Datapath: Send + Sync {
    /// The VDI now points at `new_path`, whose parent is the image the
    /// datapath had open.
    fn refresh_datapath_clone(&self, dbg: &str, meta_path: &Path, new_path: &Path) -> Result<()>;

    /// `coalesced_node` was merged into `parent_node` somewhere up the chain.
    fn refresh_datapath_coalesce(
        &self,
        dbg: &str,
        meta_path: &Path,
        coalesced_node: &Path,
        parent_node: &Path,
    ) -> Result<()>;

    /// Quiesce I/O ahead of a change of the image being written to.
    fn pause_datapath(&self, dbg: &str, meta_path: &Path) -> Result<()>;

    /// Resume I/O, now against `new_path`.
    fn unpause_datapath(&self, dbg: &str, meta_path: &Path, new_path: &Path) -> Result<()>;
}

/// For hosts with no live datapath. Every request is logged and dropped.
pub struct NullDatapath;

impl Datapath for NullDatapath {
    fn refresh_datapath_clone(&self, dbg: &str, meta_path: &Path, new_path: &Path) -> Result<()> {
        debug!("{dbg}: no datapath to refresh for {meta_path:?} -> {new_path:?}");
        Ok(())
    }

    fn refresh_datapath_coalesce(
        &self,
        dbg: &str,
        meta_path: &Path,
        coalesced_node: &Path,
        parent_node: &Path,
    ) -> Result<()> {
        debug!(
            "{dbg}: no datapath to refresh for {meta_path:?}, {coalesced_node:?} merged into {parent_node:?}"
        );
        Ok(())
    }

    fn pause_datapath(&self, dbg: &str, meta_path: &Path) -> Result<()> {
        debug!("{dbg}: no datapath to pause for {meta_path:?}");
        Ok(())
    }

    fn unpause_datapath(&self, dbg: &str, meta_path: &Path, new_path: &Path) -> Result<()> {
        debug!("{dbg}: no datapath to unpause for {meta_path:?} -> {new_path:?}");
        Ok(())
    }
}

/// Relays every request to an external program invoked as
/// `<program> <operation> <meta_path> [<path>...]`.
pub struct HookDatapath {
    program: PathBuf,
}

impl HookDatapath {
    pub fn new(program: PathBuf) -> Self {
        HookDatapath { program }
    }

    fn run(&self, dbg: &str, op: &'static str, paths: &[&Path]) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.arg(op);
        for path in paths {
            cmd.arg(
                path.to_str()
                    .ok_or_else(|| DatapathError::NonUtf8Path(path.to_path_buf()))?,
            );
        }
        debug!("{dbg}: running {cmd:?}");
        let output = cmd
            .output()
            .map_err(|e| DatapathError::Spawn(self.program.clone(), e))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            error!("{dbg}: {cmd:?} failed with {}: {stderr}", output.status);
            return Err(DatapathError::Hook {
                program: self.program.clone(),
                op,
                stderr,
            });
        }
        Ok(())
    }
}

impl Datapath for HookDatapath {
    fn refresh_datapath_clone(&self, dbg: &str, meta_path: &Path, new_path: &Path) -> Result<()> {
        self.run(dbg, "refresh-clone", &[meta_path, new_path])
    }

    fn refresh_datapath_coalesce(
        &self,
        dbg: &str,
        meta_path: &Path,
        coalesced_node: &Path,
        parent_node: &Path,
    ) -> Result<()> {
        self.run(
            dbg,
            "refresh-coalesce",
            &[meta_path, coalesced_node, parent_node],
        )
    }

    fn pause_datapath(&self, dbg: &str, meta_path: &Path) -> Result<()> {
        self.run(dbg, "pause", &[meta_path])
    }

    fn unpause_datapath(&self, dbg: &str, meta_path: &Path, new_path: &Path) -> Result<()> {
        self.run(dbg, "unpause", &[meta_path, new_path])
    }
}
