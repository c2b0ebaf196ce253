//! Watch-party client.
//!
//! Keeps a local player in step with everyone else in a relay room: the
//! [`engine`] turns local actions into room commands and applies the room's
//! commands locally, [`sync`] talks to the relay, and [`session`] ties both to
//! a player for the length of one connection.

pub mod constants;
pub mod engine;
pub mod invite;
pub mod player;
pub mod protocol;
pub mod session;
pub mod sync;
pub mod utils;
