// Copyright © 2026 The cowsr Authors
//
// SPDX-License-Identifier: Apache-2.0
//

#[macro_use]
extern crate log;

use std::path::PathBuf;
use std::process;

use anyhow::{bail, Context};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use cowstore::{
    init_sr, run_coalesce, set_gc_enabled, CowVolume, FileCallbacks, HookDatapath, SrConfig,
};

// Correlation token of every request issued from the command line.
const DBG: &str = "cowsr";

fn uuid_arg() -> Arg {
    Arg::new("uuid").help("VDI uuid").required(true)
}

fn create_app() -> Command {
    Command::new("cowsr")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Manage the virtual disks of a copy-on-write storage repository.")
        .subcommand_required(true)
        .arg(
            Arg::new("sr")
                .long("sr")
                .help("Repository URI, file:///<path> or an absolute path")
                .num_args(1)
                .required(true),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .help(SrConfig::SYNTAX)
                .num_args(1),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .help("Identifier of this host, overriding the detected one")
                .num_args(1),
        )
        .arg(
            Arg::new("datapath-hook")
                .long("datapath-hook")
                .help("Program relaying datapath refresh, pause and unpause requests")
                .num_args(1)
                .value_parser(value_parser!(PathBuf)),
        )
        .subcommand(Command::new("init").about("Initialise an empty repository"))
        .subcommand(
            Command::new("create")
                .about("Create a VDI")
                .arg(
                    Arg::new("size")
                        .long("size")
                        .help("Virtual size in bytes, rounded up to a whole MiB")
                        .required(true)
                        .value_parser(value_parser!(u64)),
                )
                .arg(Arg::new("name").long("name").default_value(""))
                .arg(Arg::new("description").long("description").default_value(""))
                .arg(
                    Arg::new("sharable")
                        .long("sharable")
                        .help("Allow the VDI to be attached to several hosts at once")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(Command::new("destroy").about("Destroy a VDI").arg(uuid_arg()))
        .subcommand(
            Command::new("resize")
                .about("Grow a VDI")
                .arg(uuid_arg())
                .arg(
                    Arg::new("size")
                        .help("New virtual size in bytes")
                        .required(true)
                        .value_parser(value_parser!(u64)),
                ),
        )
        .subcommand(Command::new("clone").about("Writable copy of a VDI").arg(uuid_arg()))
        .subcommand(Command::new("snapshot").about("Read-only copy of a VDI").arg(uuid_arg()))
        .subcommand(Command::new("stat").about("Describe a VDI").arg(uuid_arg()))
        .subcommand(Command::new("ls").about("Describe every VDI"))
        .subcommand(
            Command::new("set")
                .about("Set a custom key of a VDI")
                .arg(uuid_arg())
                .arg(Arg::new("key").required(true))
                .arg(Arg::new("value").required(true)),
        )
        .subcommand(
            Command::new("unset")
                .about("Remove a custom key of a VDI")
                .arg(uuid_arg())
                .arg(Arg::new("key").required(true)),
        )
        .subcommand(
            Command::new("set-name")
                .about("Rename a VDI")
                .arg(uuid_arg())
                .arg(Arg::new("name").required(true)),
        )
        .subcommand(
            Command::new("set-description")
                .about("Describe a VDI")
                .arg(uuid_arg())
                .arg(Arg::new("description").required(true)),
        )
        .subcommand(
            Command::new("provisioned-size")
                .about("Space the repository may end up using, in bytes"),
        )
        .subcommand(Command::new("gc").about("Run the garbage collector until it is disabled"))
        .subcommand(Command::new("gc-enable").about("Allow the garbage collector to run"))
        .subcommand(Command::new("gc-disable").about("Stop the garbage collector"))
}

fn arg<'a>(matches: &'a ArgMatches, id: &str) -> anyhow::Result<&'a str> {
    matches
        .get_one::<String>(id)
        .map(String::as_str)
        .with_context(|| format!("Missing argument: {id}"))
}

fn size_arg(matches: &ArgMatches) -> anyhow::Result<u64> {
    matches
        .get_one::<u64>("size")
        .copied()
        .context("Missing argument: size")
}

fn print(value: serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn callbacks(matches: &ArgMatches) -> anyhow::Result<FileCallbacks> {
    let config = match matches.get_one::<String>("config") {
        Some(options) => SrConfig::parse(options).context("Failed parsing --config")?,
        None => SrConfig::default(),
    };
    let mut cb = FileCallbacks::new(config);
    if let Some(host) = matches.get_one::<String>("host") {
        cb = cb.with_host(host);
    }
    if let Some(hook) = matches.get_one::<PathBuf>("datapath-hook") {
        cb = cb.with_datapath(Box::new(HookDatapath::new(hook.clone())));
    }
    Ok(cb)
}

fn run(matches: &ArgMatches) -> anyhow::Result<()> {
    let sr = arg(matches, "sr")?;
    let cb = callbacks(matches)?;

    let Some((command, sub)) = matches.subcommand() else {
        bail!("No command given");
    };
    debug!("{DBG}: {command} on {sr}");

    match command {
        "init" => init_sr(&cb, sr)?,
        "create" => print(serde_json::to_value(CowVolume::create(
            DBG,
            &cb,
            sr,
            arg(sub, "name")?,
            arg(sub, "description")?,
            size_arg(sub)?,
            sub.get_flag("sharable"),
        )?)?)?,
        "destroy" => CowVolume::destroy(DBG, &cb, sr, arg(sub, "uuid")?)?,
        "resize" => CowVolume::resize(DBG, &cb, sr, arg(sub, "uuid")?, size_arg(sub)?)?,
        "clone" => print(serde_json::to_value(CowVolume::clone(
            DBG,
            &cb,
            sr,
            arg(sub, "uuid")?,
        )?)?)?,
        "snapshot" => print(serde_json::to_value(CowVolume::snapshot(
            DBG,
            &cb,
            sr,
            arg(sub, "uuid")?,
        )?)?)?,
        "stat" => print(serde_json::to_value(CowVolume::stat(
            DBG,
            &cb,
            sr,
            arg(sub, "uuid")?,
        )?)?)?,
        "ls" => print(serde_json::to_value(CowVolume::ls(DBG, &cb, sr)?)?)?,
        "set" => CowVolume::set(
            DBG,
            &cb,
            sr,
            arg(sub, "uuid")?,
            arg(sub, "key")?,
            arg(sub, "value")?,
        )?,
        "unset" => CowVolume::unset(DBG, &cb, sr, arg(sub, "uuid")?, arg(sub, "key")?)?,
        "set-name" => CowVolume::set_name(DBG, &cb, sr, arg(sub, "uuid")?, arg(sub, "name")?)?,
        "set-description" => CowVolume::set_description(
            DBG,
            &cb,
            sr,
            arg(sub, "uuid")?,
            arg(sub, "description")?,
        )?,
        "provisioned-size" => print(serde_json::Value::from(
            CowVolume::get_sr_provisioned_size(&cb, sr)?,
        ))?,
        "gc" => run_coalesce(&cb, sr)?,
        "gc-enable" => set_gc_enabled(&cb, sr, true)?,
        "gc-disable" => set_gc_enabled(&cb, sr, false)?,
        other => bail!("Unknown command: {other}"),
    }
    Ok(())
}

fn main() {
    env_logger::init();

    let matches = create_app().get_matches();
    if let Err(e) = run(&matches) {
        match e.downcast_ref::<cowstore::Error>().and_then(|e| e.code()) {
            Some(code) => eprintln!("{code}: {e}"),
            None => eprintln!("Error: {e:?}"),
        }
        process::exit(1);
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn test_app_definition() {
        create_app().debug_assert();
    }

    #[test]
    fn test_parse_create() {
        let matches = create_app()
            .try_get_matches_from([
                "cowsr", "--sr", "/sr", "--host", "h1", "create", "--size", "1048576",
                "--name", "disk", "--sharable",
            ])
            .unwrap();
        assert_eq!(arg(&matches, "sr").unwrap(), "/sr");
        let (command, sub) = matches.subcommand().unwrap();
        assert_eq!(command, "create");
        assert_eq!(size_arg(sub).unwrap(), 1 << 20);
        assert_eq!(arg(sub, "name").unwrap(), "disk");
        assert_eq!(arg(sub, "description").unwrap(), "");
        assert!(sub.get_flag("sharable"));
    }

    #[test]
    fn test_sr_is_required() {
        assert!(create_app()
            .try_get_matches_from(["cowsr", "ls"])
            .is_err());
        assert!(create_app()
            .try_get_matches_from(["cowsr", "--sr", "/sr"])
            .is_err());
    }
}
