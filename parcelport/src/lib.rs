//! parcelport - Parcel transport over a device-neutral verbs layer.
//!
//! # Architecture
//!
//! ```text
//!  sender locality                      receiver locality
//! ┌──────────────────┐                 ┌──────────────────────┐
//! │ Sender           │ ── connect ───▶ │ Parcelport           │
//! │   header (pinned)│ ◀─ connect_ack ─│   builds Receiver    │
//! │   payload        │ ── read ──────▶ │ Receiver             │
//! │                  │ ◀═ GET header ══│   header (pinned)    │
//! │                  │ ◀═ GET payload ═│   payload            │
//! │   done()         │ ◀─ read_ack ────│   decode, ack        │
//! └──────────────────┘                 └──────────────────────┘
//! ```
//!
//! The receiver pulls both the header and, unless it was piggy-backed, the
//! payload straight out of the sender's registered memory with one-sided
//! GETs; the handshakes ride on five short active messages. A single
//! progress worker per locality drives completions, and every blocking-like
//! wait is a cooperative spin-and-yield loop around it.

pub mod buffer;
pub mod config;
pub mod context;
pub mod error;
pub mod header;
pub mod locality;
pub mod parcelport;
pub mod receiver;
pub mod sender;
pub mod util;

pub use buffer::{ParcelBuffer, TransmissionChunk};
pub use config::Config;
pub use context::Context;
pub use error::{Error, Result};
pub use header::{Header, HEADER_MAX_SIZE};
pub use locality::{Addr, Locality};
pub use parcelport::{ParcelHandler, Parcelport};
pub use receiver::Receiver;
pub use sender::{PostprocessHandler, Sender, WriteHandler};

/// Active message ids of the transport protocol.
pub const CONNECT_MESSAGE: u8 = 0;
pub const CONNECT_ACK_MESSAGE: u8 = 1;
pub const READ_MESSAGE: u8 = 2;
pub const READ_ACK_MESSAGE: u8 = 3;
pub const CLOSE_MESSAGE: u8 = 4;
