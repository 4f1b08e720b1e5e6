#![forbid(unsafe_code)]

mod adapter;
mod client;
pub mod events;

pub use adapter::{KickAdapter, KickConfig};
pub use client::KickClient;
