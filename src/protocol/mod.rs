//! # Channel Protocol
//!
//! Channel multiplexing over one framed connection.
//!
//! ## Components
//! - **Control**: `OpenChannel`, `OpenChannelResponse` and `CloseChannel` on channel 0
//! - **Channel table**: per-peer slot states (`Empty`, `HalfOpen`, `Open`)
//! - **Handler / Registry**: service endpoints bound to channels
//! - **Tracker**: exactly-once correlation of requests with replies
//! - **Peer**: the per-connection task tying all of the above together
//!
//! ## Flow
//! ```text
//! opener                          receiver
//!   OpenChannel{id} ───────────────▶ resolve handler, bind (maybe renumbered)
//!   ◀─────────── OpenChannelResponse{Ok, id, actual}
//!   relocate to actual, Open            Open
//!   data on `actual` ◀──────────────▶ data on `actual`
//! ```

pub mod channel;
pub mod control;
pub mod handler;
pub mod peer;
pub mod registry;
pub mod tracker;
