// Command-line interface definitions for markstation
//
// This module is separate so it can be used by both the binary (main.rs)
// and build.rs for generating man pages.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "markstation")]
#[command(author, version, about = "Smartcard session engine for precinct voting stations")]
#[command(long_about = "
Markstation runs the card-driven side of a ballot marking station.
It watches the card reader, decides who is logged in, keeps the voter's
in-progress ballot saved on their card, and tracks polls and counters in
local device storage.

SETUP:
  1. Point [card] slot_path at the slot file your reader bridge maintains
     (or use the memory backend for development)
  2. Run: markstation (to start the daemon)
  3. Insert an election manager card and type `load-election`

USAGE:
  The daemon reads commands from stdin, one per line:
    passcode 123456          enter passcode digits
    vote <contest> a,b       set a contest (no choices clears it)
    print | void | save      finish, abandon or save the ballot now
    polls | live | status    operator controls
")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<std::path::PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    pub quiet: bool,

    /// Override card slot file
    #[arg(long, value_name = "FILE")]
    pub slot: Option<std::path::PathBuf>,

    /// Use the in-memory card backend
    #[arg(long)]
    pub memory_card: bool,

    /// Override voter card write delay in milliseconds
    #[arg(long, value_name = "MS")]
    pub write_delay: Option<u64>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run as daemon (default if no command specified)
    Daemon,

    /// Show current configuration
    Config {
        /// Write a commented default config file if none exists
        #[arg(long)]
        init: bool,
    },

    /// Show the station's current screen
    Status {
        /// Continuously output screen changes
        #[arg(long)]
        follow: bool,

        /// Output format: "text" (default) or "json"
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Encode a completed ballot (JSON) into card bytes
    EncodeBallot {
        /// Election definition JSON
        #[arg(long, value_name = "FILE")]
        election: std::path::PathBuf,

        /// Completed ballot JSON
        ballot: std::path::PathBuf,

        /// Write raw bytes to this file instead of printing hex
        #[arg(short, long, value_name = "FILE")]
        output: Option<std::path::PathBuf>,
    },

    /// Decode card bytes back into a completed ballot (JSON)
    DecodeBallot {
        /// Election definition JSON
        #[arg(long, value_name = "FILE")]
        election: std::path::PathBuf,

        /// Encoded ballot file
        file: std::path::PathBuf,

        /// The file holds hex text rather than raw bytes
        #[arg(long)]
        hex: bool,
    },

    /// Expand a poll worker card tally payload into per-contest counts
    ReadTally {
        /// Election definition JSON
        #[arg(long, value_name = "FILE")]
        election: std::path::PathBuf,

        /// Tally payload JSON as stored on the card
        file: std::path::PathBuf,

        /// Only include contests for this party (plus nonpartisan contests)
        #[arg(long, value_name = "PARTY")]
        party: Option<String>,
    },

    /// Print the digest stored on an administrator card for a passcode
    HashPasscode {
        passcode: String,
    },

    /// Program or eject the card in the slot file (development)
    Card {
        #[command(subcommand)]
        action: CardAction,
    },
}

#[derive(Subcommand)]
pub enum CardAction {
    /// Insert a voter card
    Voter {
        #[arg(long)]
        precinct: String,

        #[arg(long)]
        ballot_style: String,

        /// Election hash to bind the card to
        #[arg(long)]
        election_hash: Option<String>,
    },

    /// Insert a poll worker card
    PollWorker {
        #[arg(long)]
        election_hash: String,
    },

    /// Insert an election manager card
    ElectionManager {
        #[arg(long)]
        election_hash: String,

        #[arg(long)]
        passcode: String,

        /// Election definition JSON to store on the card
        #[arg(long, value_name = "FILE")]
        election: Option<std::path::PathBuf>,
    },

    /// Insert a system administrator card
    SystemAdministrator {
        #[arg(long)]
        passcode: String,
    },

    /// Remove the card
    Remove,
}
