//! Ubergang gateway server library.
//!
//! Subsystems are wired together by [`server::Server`]; the binary in
//! `main.rs` only parses flags and hands off.

pub mod auth;
pub mod backends;
pub mod metrics;
pub mod mqtt;
pub mod proxy;
pub mod rest;
pub mod scripting;
pub mod server;
pub mod session;
pub mod ssh;
pub mod tasks;
pub mod tls;
pub mod webauthn;
