//! Renders loopcap's man pages from the clap definitions in `src/cli.rs`.
//!
//! Pages are built for release profiles, or for any profile when
//! `LOOPCAP_GEN_MANPAGES` is set. They land in `$OUT_DIR/man` unless
//! `LOOPCAP_MAN_DIR` names another directory.

use clap::{Command, CommandFactory};
use clap_mangen::Man;
use std::env;
use std::fs::{self, File};
use std::io::Error;
use std::path::{Path, PathBuf};

include!("src/cli.rs");

fn render(cmd: Command, page: &Path) -> Result<(), Error> {
    let mut file = File::create(page)?;
    Man::new(cmd).render(&mut file)
}

fn main() -> Result<(), Error> {
    println!("cargo:rerun-if-changed=src/cli.rs");
    println!("cargo:rerun-if-env-changed=LOOPCAP_GEN_MANPAGES");
    println!("cargo:rerun-if-env-changed=LOOPCAP_MAN_DIR");

    let release = env::var("PROFILE").is_ok_and(|p| p == "release");
    if !release && env::var_os("LOOPCAP_GEN_MANPAGES").is_none() {
        return Ok(());
    }

    let man_dir = match env::var_os("LOOPCAP_MAN_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => PathBuf::from(env::var_os("OUT_DIR").unwrap_or_else(|| "target".into())).join("man"),
    };
    fs::create_dir_all(&man_dir)?;

    let cli = Cli::command();
    render(cli.clone(), &man_dir.join("loopcap.1"))?;

    // One page per command: loopcap-devices.1, loopcap-record.1, ...
    for command in cli.get_subcommands().filter(|c| !c.is_hide_set()) {
        let page = format!("loopcap-{}", command.get_name());
        render(
            command.clone().display_name(page.clone()),
            &man_dir.join(format!("{}.1", page)),
        )?;
    }

    Ok(())
}
