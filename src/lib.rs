//! Off-chain coordination for the MECA compute marketplace: candidate
//! matching, the tower's relay broker and the signed, encrypted envelopes
//! that submitters and hosts exchange through it.

pub mod broker;
pub mod config;
pub mod ecies;
pub mod envelope;
pub mod keys;
pub mod ledger;
pub mod matcher;
pub mod session;
pub mod types;
