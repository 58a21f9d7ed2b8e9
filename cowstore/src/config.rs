// Copyright © 2026 The cowsr Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Per-repository tunables, parsed from a `key=value,...` option string.

use std::time::Duration;

use disk_image::{ImageType, MEBIBYTE};
use option_parser::{ByteSized, OptionParser, OptionParserError, Seconds};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Error parsing repository options")]
    Parse(#[source] OptionParserError),
}

type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SrConfig {
    /// Retry period of foreground operations waiting for the global lock.
    pub gl_poll_period: Duration,
    /// Retry period of the GC waiting for the global lock.
    pub gc_poll_period: Duration,
    /// Leaves at least this large are frozen instead of merged in place.
    pub leaf_coalesce_max_size: u64,
    /// Overrides the chain height limit of every image format.
    pub max_chain_height: Option<u64>,
    /// GC pause after an iteration that did some work.
    pub gc_busy_interval: Duration,
    /// GC pause after an idle iteration.
    pub gc_idle_interval: Duration,
    /// Format of the volumes created in the repository.
    pub image_type: ImageType,
}

impl Default for SrConfig {
    fn default() -> Self {
        SrConfig {
            gl_poll_period: Duration::from_millis(500),
            gc_poll_period: Duration::from_secs(1),
            leaf_coalesce_max_size: 20 * MEBIBYTE,
            max_chain_height: None,
            gc_busy_interval: Duration::from_secs(10),
            gc_idle_interval: Duration::from_secs(30),
            image_type: ImageType::Cow,
        }
    }
}

impl SrConfig {
    pub const SYNTAX: &'static str = "Repository tunables \
        \"gl_poll_period=<seconds>,gc_poll_period=<seconds>,\
        leaf_coalesce_max_size=<size>,max_chain_height=<count>,\
        gc_busy_interval=<seconds>,gc_idle_interval=<seconds>,\
        image_type=raw|vhd|qcow2|cow\"";

    /// Parse an option string, starting from the defaults.
    pub fn parse(input: &str) -> ConfigResult<Self> {
        let mut parser = OptionParser::new();
        parser
            .add("gl_poll_period")
            .add("gc_poll_period")
            .add("leaf_coalesce_max_size")
            .add("max_chain_height")
            .add("gc_busy_interval")
            .add("gc_idle_interval")
            .add("image_type");
        parser.parse(input).map_err(ConfigError::Parse)?;

        let seconds = |option: &str, default: Duration| -> ConfigResult<Duration> {
            Ok(parser
                .convert::<Seconds>(option)
                .map_err(ConfigError::Parse)?
                .map_or(default, |s| s.0))
        };
        let default = SrConfig::default();

        Ok(SrConfig {
            gl_poll_period: seconds("gl_poll_period", default.gl_poll_period)?,
            gc_poll_period: seconds("gc_poll_period", default.gc_poll_period)?,
            leaf_coalesce_max_size: parser
                .convert::<ByteSized>("leaf_coalesce_max_size")
                .map_err(ConfigError::Parse)?
                .map_or(default.leaf_coalesce_max_size, |s| s.0),
            max_chain_height: parser
                .convert("max_chain_height")
                .map_err(ConfigError::Parse)?,
            gc_busy_interval: seconds("gc_busy_interval", default.gc_busy_interval)?,
            gc_idle_interval: seconds("gc_idle_interval", default.gc_idle_interval)?,
            image_type: parser
                .convert("image_type")
                .map_err(ConfigError::Parse)?
                .unwrap_or(default.image_type),
        })
    }
}
