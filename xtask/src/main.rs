//! Development tasks for markstation
//!
//! Usage:
//!   cargo xtask install     Install release binary to /usr/local/bin (requires sudo)
//!   cargo xtask uninstall   Remove binary from /usr/local/bin (requires sudo)
//!   cargo xtask dist        Build release binary for distribution
//!   cargo xtask manpages    Generate man pages into target/

use std::env;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};

const BINARY: &str = "markstation";
const INSTALL_PATH: &str = "/usr/local/bin/markstation";

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();

    let Some(command) = args.first() else {
        print_help();
        return ExitCode::SUCCESS;
    };

    let result = match command.as_str() {
        "install" => install(),
        "uninstall" => uninstall(),
        "dist" => dist(),
        "manpages" => manpages(),
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        cmd => {
            eprintln!("Unknown command: {}", cmd);
            print_help();
            Err(anyhow::anyhow!("Unknown command"))
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn print_help() {
    eprintln!(
        r#"
markstation development tasks

Usage: cargo xtask <COMMAND>

Commands:
  install    Build release binary and install to /usr/local/bin (requires sudo)
  uninstall  Remove markstation from /usr/local/bin (requires sudo)
  dist       Build optimized release binary for distribution
  manpages   Generate man pages (written under target/)
"#
    );
}

/// Get the project root directory
fn project_root() -> anyhow::Result<PathBuf> {
    let dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => env::current_dir()?,
    };

    // xtask is in a subdirectory, go up one level
    Ok(dir.parent().unwrap_or(&dir).to_path_buf())
}

fn cargo_build(root: &Path, envs: &[(&str, &str)]) -> anyhow::Result<PathBuf> {
    let status = Command::new("cargo")
        .args(["build", "--release"])
        .envs(envs.iter().copied())
        .current_dir(root)
        .status()?;

    if !status.success() {
        anyhow::bail!("Build failed");
    }

    let binary = root.join("target/release").join(BINARY);
    if !binary.exists() {
        anyhow::bail!("Binary not found at {:?}", binary);
    }
    Ok(binary)
}

/// Build release binary and install to /usr/local/bin
fn install() -> anyhow::Result<()> {
    let root = project_root()?;

    println!("==> Building release binary...");
    let binary = cargo_build(&root, &[])?;

    println!("==> Installing to {}...", INSTALL_PATH);
    let status = Command::new("sudo")
        .arg("install")
        .arg("-Dm755")
        .arg(&binary)
        .arg(INSTALL_PATH)
        .status()?;

    if !status.success() {
        anyhow::bail!("Install failed (sudo required)");
    }

    println!("==> Installed successfully!");
    let _ = Command::new(INSTALL_PATH).arg("--version").status();

    Ok(())
}

/// Remove markstation from /usr/local/bin
fn uninstall() -> anyhow::Result<()> {
    println!("==> Removing {}...", INSTALL_PATH);

    let status = Command::new("sudo")
        .args(["rm", "-f", INSTALL_PATH])
        .status()?;

    if !status.success() {
        anyhow::bail!("Uninstall failed (sudo required)");
    }

    println!("==> Uninstalled successfully!");
    Ok(())
}

/// Build optimized release binary for distribution
fn dist() -> anyhow::Result<()> {
    let root = project_root()?;

    println!("==> Building distribution binary...");
    let binary = cargo_build(&root, &[])?;
    println!("==> Built: {:?}", binary);

    let _ = Command::new("ls").arg("-lh").arg(&binary).status();
    let _ = Command::new(&binary).arg("--version").status();

    Ok(())
}

/// Force the build script to render man pages
fn manpages() -> anyhow::Result<()> {
    let root = project_root()?;

    println!("==> Generating man pages...");
    cargo_build(&root, &[("MARKSTATION_GEN_MANPAGES", "1")])?;
    println!("==> Look for the man/ directory under target/release/build/markstation-*/out");

    Ok(())
}
