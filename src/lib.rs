//! ZLink: cross-chain deposits reconciled into Zcash payouts
//!
//! Watchers observe deposit addresses on EVM chains, Solana and Bitcoin.
//! Each confirmed transfer from a registered wallet earns its sender a
//! single-use claim token; redeeming the token queues a ZEC payout that an
//! operator approves (with the payout transaction id) or rejects.

pub mod address;
pub mod admin;
pub mod app_state;
pub mod backoff;
pub mod claims;
pub mod commands;
pub mod config;
pub mod conversion;
pub mod error;
pub mod http;
pub mod identity;
pub mod ledger;
pub mod notify;
pub mod oracle;
pub mod orchestrator;
pub mod payouts;
pub mod rpc;
pub mod store;
pub mod telegram;
pub mod types;
pub mod watcher;

#[cfg(test)]
pub mod test_utils;
