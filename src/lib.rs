//! Markstation: smartcard session engine for precinct voting stations
//!
//! This library provides the core functionality for:
//! - Classifying whatever is in the card reader (voter, poll worker,
//!   election manager, system administrator, blank, unreadable)
//! - Deciding who is logged in, including passcode challenges and
//!   voter card validity (election, precinct, expiry, printed, voided)
//! - Holding the voting session (votes, polls, live mode, counters) as a
//!   reducer over actions
//! - Saving the in-progress ballot to the voter's card with debouncing
//!   and at most one write in flight
//! - Encoding ballots in the compact bit-packed card format and expanding
//!   compressed tallies carried on poll worker cards
//!
//! # Architecture
//!
//! ```text
//!          ┌──────────────┐                         ┌──────────────┐
//!          │ Card reader  │                         │   Commands   │
//!          │ (file/memory)│                         │   (stdin)    │
//!          └──────────────┘                         └──────────────┘
//!                 │ poll                                    │
//!                 ▼                                         ▼
//!          ┌──────────────┐  CardContents   ┌──────────────────────────────┐
//!          │   classify   │ ──────────────▶ │           Station            │
//!          └──────────────┘                 │   (tokio::select! loop)      │
//!                                           └──────────────────────────────┘
//!                                              │            │           │
//!                                              ▼            ▼           ▼
//!                                     ┌────────────┐ ┌────────────┐ ┌────────────┐
//!                                     │  AuthGate  │ │SessionStore│ │ CardSync   │
//!                                     │            │ │  (reduce)  │ │  Engine    │
//!                                     └────────────┘ └────────────┘ └────────────┘
//!                                                        │    │           │
//!                                  StoragePersistence ◀──┘    └──▶ SyncWake
//!                                         │                               │
//!                                         ▼                               ▼
//!                                  ┌────────────┐                 ┌──────────────┐
//!                                  │  Device    │                 │ Ballot codec │
//!                                  │  storage   │                 │ ──▶ card     │
//!                                  └────────────┘                 └──────────────┘
//!
//!          AuthState + SessionState ──▶ select_screen ──▶ state file
//! ```

pub mod auth;
pub mod ballot;
pub mod card;
pub mod cli;
pub mod clock;
pub mod config;
pub mod election;
pub mod error;
pub mod machine;
pub mod screen;
pub mod session;
pub mod station;
pub mod storage;
pub mod sync;
pub mod tally;
pub mod votes;

pub use auth::{AuthGate, AuthState, LoggedOutReason, Role};
pub use cli::{CardAction, Cli, Commands};
pub use config::Config;
pub use error::{Result, StationError};
pub use station::{Station, StationCommand};
