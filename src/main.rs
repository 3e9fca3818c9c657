//! Markstation - smartcard session engine for precinct voting stations
//!
//! Run with `markstation` or `markstation daemon` to start the daemon.
//! Use `markstation card ...` to program the development card slot.
//! Use `markstation encode-ballot` / `decode-ballot` to inspect card ballots.

use anyhow::Context;
use clap::Parser;
use markstation::ballot::{decode_ballot, encode_ballot, CompletedBallot};
use markstation::card::file::FileCard;
use markstation::card::{create_card, CardData, ElectionManagerCardData, PollWorkerCardData};
use markstation::card::{SystemAdministratorCardData, VoterCardData};
use markstation::cli::{CardAction, Cli, Commands};
use markstation::clock::SystemClock;
use markstation::config::{self, CardBackend, Config};
use markstation::election::{sha256_hex, ElectionDefinition};
use markstation::machine::{load_machine_info, FileMachineConfigProvider, MachineConfigProvider};
use markstation::station::{Station, StationCommand};
use markstation::storage::JsonFileStorage;
use markstation::tally::PollWorkerCardTally;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("markstation={},warn", log_level))),
        )
        .with_target(false)
        .init();

    // Load configuration
    let mut config = config::load_config(cli.config.as_deref())?;

    // Apply CLI overrides
    if let Some(slot) = cli.slot {
        config.card.slot_path = slot.to_string_lossy().into_owned();
    }
    if cli.memory_card {
        config.card.backend = CardBackend::Memory;
    }
    if let Some(delay) = cli.write_delay {
        config.card.write_delay_ms = delay;
    }

    // Run the appropriate command
    match cli.command.unwrap_or(Commands::Daemon) {
        Commands::Daemon => {
            run_daemon(config).await?;
        }

        Commands::Config { init } => {
            if init {
                init_config(cli.config.as_deref())?;
            }
            show_config(&config, cli.config.as_deref());
        }

        Commands::Status { follow, format } => {
            run_status(&config, follow, &format)?;
        }

        Commands::EncodeBallot {
            election,
            ballot,
            output,
        } => {
            let definition = read_election(&election)?;
            let contents = std::fs::read_to_string(&ballot)
                .with_context(|| format!("Failed to read {:?}", ballot))?;
            let ballot: CompletedBallot =
                serde_json::from_str(&contents).context("Invalid completed ballot")?;
            let bytes = encode_ballot(&definition, &ballot)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &bytes)?;
                    eprintln!("Wrote {} bytes to {:?}", bytes.len(), path);
                }
                None => println!("{}", hex::encode(&bytes)),
            }
        }

        Commands::DecodeBallot {
            election,
            file,
            hex,
        } => {
            let definition = read_election(&election)?;
            let raw = std::fs::read(&file).with_context(|| format!("Failed to read {:?}", file))?;
            let bytes = if hex {
                hex::decode(String::from_utf8_lossy(&raw).trim()).context("Invalid hex")?
            } else {
                raw
            };
            let ballot = decode_ballot(&definition, &bytes)?;
            println!("{}", serde_json::to_string_pretty(&ballot)?);
        }

        Commands::ReadTally {
            election,
            file,
            party,
        } => {
            let definition = read_election(&election)?;
            let contents = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {:?}", file))?;
            let payload = PollWorkerCardTally::from_json(&contents)?;
            let tally = payload.combined_tally(&definition.election, party.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&tally)?);
        }

        Commands::HashPasscode { passcode } => {
            println!("{}", hash_passcode(&passcode, &config)?);
        }

        Commands::Card { action } => {
            run_card(&config, action).await?;
        }
    }

    Ok(())
}

fn read_election(path: &Path) -> anyhow::Result<ElectionDefinition> {
    let data =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    Ok(ElectionDefinition::from_json(&data)?)
}

fn hash_passcode(passcode: &str, config: &Config) -> anyhow::Result<String> {
    if passcode.len() != config.auth.passcode_length
        || !passcode.chars().all(|c| c.is_ascii_digit())
    {
        anyhow::bail!(
            "Passcode must be exactly {} digits",
            config.auth.passcode_length
        );
    }
    Ok(sha256_hex(passcode.as_bytes()))
}

/// Run the station daemon, reading commands from stdin
async fn run_daemon(config: Config) -> anyhow::Result<()> {
    let card = create_card(&config.card);

    let storage_dir = config.storage.resolve_path();
    tracing::debug!("Device storage: {:?}", storage_dir);
    let storage = Arc::new(JsonFileStorage::open(storage_dir)?);

    let provider = config
        .machine
        .config_path
        .clone()
        .map(FileMachineConfigProvider::new);
    let machine = load_machine_info(
        provider
            .as_ref()
            .map(|p| p as &dyn MachineConfigProvider),
    )
    .await;

    let mut station = Station::new(config, card, Arc::new(SystemClock), storage)?;
    station.initialize(machine);

    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(read_commands(tx));

    station.run(rx).await?;
    Ok(())
}

/// Forward stdin lines to the station until input closes
async fn read_commands(tx: mpsc::Sender<StationCommand>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Failed to read command input: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match StationCommand::parse_line(&line) {
            Ok(command) => {
                if tx.send(command).await.is_err() {
                    break;
                }
            }
            Err(e) => eprintln!("{}", e),
        }
    }
}

/// Program or eject the development card slot
async fn run_card(config: &Config, action: CardAction) -> anyhow::Result<()> {
    let path = config.card.resolve_slot_path();
    let card = FileCard::new(path.clone());

    let (data, long_value) = match action {
        CardAction::Remove => {
            card.remove().await?;
            println!("Card removed from {:?}", path);
            return Ok(());
        }
        CardAction::Voter {
            precinct,
            ballot_style,
            election_hash,
        } => (
            CardData::Voter(VoterCardData {
                created_at: chrono::Utc::now().timestamp(),
                ballot_style_id: ballot_style,
                precinct_id: precinct,
                election_hash,
                voided_at: None,
                ballot_printed_at: None,
                updated_at: None,
                mark_machine_id: None,
            }),
            None,
        ),
        CardAction::PollWorker { election_hash } => (
            CardData::PollWorker(PollWorkerCardData { election_hash }),
            None,
        ),
        CardAction::ElectionManager {
            election_hash,
            passcode,
            election,
        } => {
            let long_value = match election {
                Some(file) => Some(
                    std::fs::read(&file).with_context(|| format!("Failed to read {:?}", file))?,
                ),
                None => None,
            };
            (
                CardData::ElectionManager(ElectionManagerCardData {
                    election_hash,
                    passcode_hash: hash_passcode(&passcode, config)?,
                }),
                long_value,
            )
        }
        CardAction::SystemAdministrator { passcode } => (
            CardData::SystemAdministrator(SystemAdministratorCardData {
                passcode_hash: hash_passcode(&passcode, config)?,
            }),
            None,
        ),
    };

    card.insert(&data.to_short_value()?, long_value.as_deref())
        .await?;
    println!("Card inserted in {:?}", path);
    Ok(())
}

/// Run the status command - show the station's current screen
fn run_status(config: &Config, follow: bool, format: &str) -> anyhow::Result<()> {
    let Some(state_path) = config.resolve_state_file() else {
        eprintln!("Error: state_file is not configured.");
        eprintln!();
        eprintln!("To enable status monitoring, add to your config.toml:");
        eprintln!();
        eprintln!("  state_file = \"auto\"");
        std::process::exit(1);
    };

    let read_screen = |path: &PathBuf| {
        std::fs::read_to_string(path)
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "stopped".to_string())
    };
    let emit = |screen: &str| {
        if format == "json" {
            println!("{}", serde_json::json!({ "screen": screen }));
        } else {
            println!("{}", screen);
        }
    };

    let mut last_screen = read_screen(&state_path);
    emit(&last_screen);
    if !follow {
        return Ok(());
    }

    // Follow mode: watch for changes
    use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
    use std::sync::mpsc::{channel, RecvTimeoutError};
    use std::time::Duration;

    let (tx, rx) = channel();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = tx.send(res);
        },
        NotifyConfig::default().with_poll_interval(Duration::from_millis(100)),
    )?;

    // Watch the parent directory since the file comes and goes with the daemon
    if let Some(parent) = state_path.parent() {
        std::fs::create_dir_all(parent)?;
        watcher.watch(parent, RecursiveMode::NonRecursive)?;
    }

    loop {
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(Ok(_event)) => {}
            Ok(Err(e)) => {
                tracing::warn!("Watch error: {:?}", e);
                continue;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let screen = read_screen(&state_path);
        if screen != last_screen {
            emit(&screen);
            last_screen = screen;
        }
    }

    Ok(())
}

/// Create the config file with commented defaults
fn init_config(path: Option<&Path>) -> anyhow::Result<()> {
    let Some(config_path) = path.map(PathBuf::from).or_else(Config::default_path) else {
        anyhow::bail!("Could not determine config directory");
    };
    if config_path.exists() {
        println!("Config file exists: {:?}\n", config_path);
        return Ok(());
    }
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&config_path, config::DEFAULT_CONFIG)?;
    println!("Created: {:?}\n", config_path);
    Ok(())
}

/// Show current configuration
fn show_config(config: &Config, path: Option<&Path>) {
    println!("Current Configuration\n");
    println!("=====================\n");

    println!("[card]");
    println!("  backend = {:?}", config.card.backend);
    println!("  slot_path = {:?}", config.card.slot_path);
    if config.card.backend == CardBackend::File {
        println!("  (resolves to: {:?})", config.card.resolve_slot_path());
    }
    println!("  poll_interval_ms = {}", config.card.poll_interval_ms);
    println!("  write_delay_ms = {}", config.card.write_delay_ms);

    println!("\n[auth]");
    println!(
        "  voter_card_expiration_secs = {}",
        config.auth.voter_card_expiration_secs
    );
    println!("  passcode_length = {}", config.auth.passcode_length);
    println!("  max_passcode_attempts = {}", config.auth.max_passcode_attempts);
    println!(
        "  allow_election_managers_other_election = {}",
        config.auth.allow_election_managers_other_election
    );
    println!(
        "  allow_unconfigured_login = {}",
        config.auth.allow_unconfigured_login
    );

    println!("\n[storage]");
    println!("  path = {:?}", config.storage.path);
    println!("  (resolves to: {:?})", config.storage.resolve_path());

    if let Some(ref machine) = config.machine.config_path {
        println!("\n[machine]");
        println!("  config_path = {:?}", machine);
    }

    if let Some(ref state_file) = config.state_file {
        println!("\n[integration]");
        println!("  state_file = {:?}", state_file);
        if let Some(resolved) = config.resolve_state_file() {
            println!("  (resolves to: {:?})", resolved);
        }
    }

    println!("\n---");
    println!(
        "Config file: {:?}",
        path.map(PathBuf::from)
            .or_else(Config::default_path)
            .unwrap_or_else(|| PathBuf::from("(not found)"))
    );
}
