// Copyright © 2026 The cowsr Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::process::Command;

use crate::{Error, Result};

/// Run an image tool to completion and return its standard output.
pub(crate) fn call(dbg: &str, program: &str, args: &[&str]) -> Result<String> {
    let cmdline = std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ");
    debug!("{dbg}: running `{cmdline}`");

    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| Error::Spawn(cmdline.clone(), e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        error!("{dbg}: `{cmdline}` failed with {}: {stderr}", output.status);
        return Err(Error::Command {
            cmd: cmdline,
            status: output.status,
            stderr,
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
