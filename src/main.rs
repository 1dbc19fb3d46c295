use std::env::set_var;
use std::path::PathBuf;

use anyhow::Result;
use clap::{arg, command, ArgAction};
use log::*;
use rpkg::{Event, PkgBuilder, PkgProject};

fn main() -> Result<()> {
    let matches = command!() // requires `cargo` feature
        .arg(arg!(<project> "Project description file (key=value lines)"))
        .arg(arg!(<output> "Output .pkg path"))
        .arg(
            arg!(-v --verbose "Print more debug information, or set `RUST_LOG=debug`")
                .action(ArgAction::SetTrue),
        )
        .arg(arg!(-q --quiet "Suppress progress output").action(ArgAction::SetTrue))
        .get_matches();

    if matches.get_flag("verbose") {
        set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    let project_path = PathBuf::from(matches.get_one::<String>("project").unwrap());
    let output = PathBuf::from(matches.get_one::<String>("output").unwrap());
    let quiet = matches.get_flag("quiet");

    let project = PkgProject::from_file(&project_path)?;
    info!(
        "building {} ({:?}) -> {}",
        project.content_id,
        project.volume_type,
        output.display()
    );

    let mut report = |event: Event| {
        if quiet {
            return;
        }
        match event {
            Event::Message(text) => println!("{}", text),
            Event::Progress(pct) => println!("[{:3}%]", pct),
        }
    };
    let pkg = PkgBuilder::new(project)?.write(&output, Some(&mut report))?;

    if !quiet {
        println!(
            "done: {} entries, {:#x} bytes",
            pkg.entries.len(),
            pkg.header.package_size
        );
    }
    Ok(())
}
