#![doc = "mber-sync-core: client engine for provisioning and syncing resources against Mber."]

//! This crate holds everything that talks to the remote service: response
//! classification, retry, idempotent create-or-find, verified file transfer,
//! and the build steps composed from them. The `mber-sync` binary is thin glue
//! over [`pipeline::BuildSteps`].
//!
//! # Usage
//! Build a [`client::MberClient`] over a [`contract::Transport`] (usually
//! [`http::HttpTransport`]), then either call single-attempt operations
//! directly or drive them through [`pipeline::BuildSteps`] with a [`retry::Retry`].

pub mod client;
pub mod contract;
pub mod envelope;
pub mod error;
pub mod http;
pub mod identifier;
pub mod ledger;
pub mod pipeline;
pub mod query;
pub mod resolver;
pub mod retry;
pub mod session;
pub mod transfer;
