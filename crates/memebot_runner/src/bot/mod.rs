#![forbid(unsafe_code)]

pub mod channel_state;
pub mod commands;
pub mod credits;
pub mod ingest;
pub mod ledger;
pub mod notify;
pub mod outbox;
pub mod registry;
pub mod rewards;
pub mod runner;
pub mod sessions;

#[cfg(test)]
pub(crate) mod test_support;
