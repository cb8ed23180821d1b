//! Stream Relay Gateway
//!
//! Resolves a user identifier to a local port serving a live, audio-only
//! transcode of that user's remote stream. Relays are external
//! `puller | transcoder` processes; the session cache starts them on demand,
//! reuses them while they are alive, refreshes them when they die or go idle,
//! and hands every relay its own port.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                     remotemedia-stream-relay                      │
//! ├───────────────────────────────────────────────────────────────────┤
//! │                                                                   │
//! │  ┌──────────────────┐                                             │
//! │  │  HTTP API        │ ← GET /view/*identifier → {"port": N}       │
//! │  │  (axum)          │                                             │
//! │  └────────┬─────────┘                                             │
//! │           │ resolve                                               │
//! │           ▼                                                       │
//! │  ┌──────────────────┐   ┌──────────────────┐   ┌──────────────┐   │
//! │  │  Session Cache   │──▶│ Metadata Provider│   │ Port         │   │
//! │  │  (per-id slots)  │   │ (reqwest)        │   │ Allocator    │   │
//! │  └────────┬─────────┘   └──────────────────┘   └──────────────┘   │
//! │           │ launches                                              │
//! │           ▼                                                       │
//! │  ┌─────────────────────────────────────────────────────────────┐  │
//! │  │  Relay processes: rtmpdump | vlc  (one per identifier)      │  │
//! │  └─────────────────────────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod launcher;
pub mod metadata;
pub mod ports;
pub mod process;
pub mod session;

pub use error::{RelayError, RelayErrorKind, Result};
pub use session::{Lookup, SessionCache};
