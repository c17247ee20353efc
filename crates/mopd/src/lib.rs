//! MOP Daemon - frame dispatch and TCP session broker
//!
//! This crate provides the daemon's two engines:
//! - `classifier` - decides what to do with a captured MOP frame and routes it
//! - `capture` - per-interface raw frame capture feeding the classifier
//! - `server` - TCP session broker with capacity limit and broadcast relay
//! - `config` - layered daemon configuration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         mopd daemon                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │  CaptureEngine  │────▶│     FrameDispatcher         │   │
//! │  │ (thread per if) │     │ classify → ProtocolHandler  │   │
//! │  └─────────────────┘     └─────────────────────────────┘   │
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │  SessionBroker  │────▶│       SessionSet            │   │
//! │  │  (TcpListener)  │     │  (capacity-bounded map)     │   │
//! │  └────────┬────────┘     └─────────────────────────────┘   │
//! │           │ sessions                                        │
//! │           ▼                                                 │
//! │  ┌─────────────────┐                                        │
//! │  │ConnectionHandler│  reader + writer task per session      │
//! │  └─────────────────┘                                        │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod capture;
pub mod classifier;
pub mod config;
pub mod server;
