//! Product catalog backend over an EVM smart contract.
//!
//! The catalog lives in a deployed contract. This crate keeps a single
//! websocket connection to the ledger node alive ([`connection`]), exposes
//! the contract's operations as catalog calls ([`catalog`]) and serves them
//! over HTTP with signature-token authentication ([`handlers`], [`auth`]).
//! Clients that change the catalog notify each other through a websocket
//! relay ([`socket`]).

pub mod auth;
pub mod catalog;
pub mod chain;
pub mod config;
pub mod connection;
pub mod encoder;
pub mod errors;
pub mod from_env;
pub mod handlers;
pub mod images;
pub mod network;
pub mod sig_down;
pub mod socket;
pub mod telemetry;
