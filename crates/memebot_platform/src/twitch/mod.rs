#![forbid(unsafe_code)]

mod adapter;
pub mod eventsub;
mod helix;

pub use adapter::{TwitchAdapter, TwitchConfig};
