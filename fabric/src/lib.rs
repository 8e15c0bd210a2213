//! fabric - Device-neutral verbs layer.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Md (protection domain)                                      │
//! │    registered regions ── lkey/rkey ──▶ translation table     │
//! │                                                              │
//! │  Worker ──progress()──▶ queued GETs, then AM inboxes         │
//! │    │                                                         │
//! │    ├── Iface (caps: AM_SHORT | GET_ZCOPY | CONNECT_TO_*)     │
//! │    │     am handlers, inbox, counters, fault injection       │
//! │    │                                                         │
//! │    └── Ep ── am_short / get_zcopy ──▶ remote iface or ep     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! - **Md**: scopes memory registrations; packs remote keys
//! - **Iface**: one transport on a domain, addressable by peers
//! - **Ep**: binds an iface to one peer, posts AMs and one-sided GETs
//! - **Worker**: single progress loop executing GETs and delivering AMs
//!
//! The data path is in-process: address blobs resolve through process-wide
//! routing tables and one-sided GETs move bytes between registered regions
//! directly, which is exactly the contract a hardware driver would satisfy
//! with NIC translation tables. Registration, remote-key and capability
//! semantics are identical either way.

pub mod ep;
pub mod iface;
pub mod md;
mod registry;
pub mod rkey;
pub mod status;
pub mod worker;

pub use ep::{Ep, Sge};
pub use iface::{AmCbFlags, CapFlags, Iface, IfaceAttr, IfaceParams, TransportSpec};
pub use md::{Md, MdAttr, MdResource, MemFlags, MemoryRegion, TransportDesc};
pub use rkey::RkeyBundle;
pub use status::Status;
pub use worker::{AsyncContext, AsyncMode, Completion, ThreadMode, Worker};
