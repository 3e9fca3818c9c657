//! Renders markstation man pages from the clap definitions in src/cli.rs.
//! Pages are only built for release builds or with MARKSTATION_GEN_MANPAGES set.

use clap::CommandFactory;
use std::path::Path;

include!("src/cli.rs");

/// Write `<prefix>.1` for `cmd` and recurse into its subcommands (`card voter`
/// becomes `markstation-card-voter.1`)
fn render(cmd: &clap::Command, prefix: &str, dir: &Path) -> std::io::Result<()> {
    let mut page = Vec::new();
    clap_mangen::Man::new(cmd.clone()).render(&mut page)?;
    std::fs::write(dir.join(format!("{prefix}.1")), page)?;

    for sub in cmd.get_subcommands().filter(|s| s.get_name() != "help") {
        render(sub, &format!("{prefix}-{}", sub.get_name()), dir)?;
    }
    Ok(())
}

fn main() -> std::io::Result<()> {
    println!("cargo:rerun-if-changed=src/cli.rs");
    println!("cargo:rerun-if-env-changed=MARKSTATION_GEN_MANPAGES");

    let release = std::env::var("PROFILE").is_ok_and(|p| p == "release");
    if !release && std::env::var_os("MARKSTATION_GEN_MANPAGES").is_none() {
        return Ok(());
    }

    let Some(out_dir) = std::env::var_os("OUT_DIR") else {
        return Ok(());
    };
    let man_dir = Path::new(&out_dir).join("man");
    std::fs::create_dir_all(&man_dir)?;
    render(&Cli::command(), "markstation", &man_dir)
}
