//! # mm-semantic-sync
//!
//! Checkpointed, incremental sync of chat posts into a vector store, with
//! live progress fan-out to any number of subscribers.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ Mattermost │──▶│ FetchPipeline │──▶│ Vector sink │
//! │  REST API  │   │  (one pass)   │   │  (Chroma)   │
//! └────────────┘   └──────┬───────┘   └─────────────┘
//!                         │ ProgressEvent        ▲
//!        ┌────────────────┤                      │ checkpoint
//!        ▼                ▼                      │
//! ┌──────────────┐  ┌──────────┐        ┌───────┴──────┐
//! │SyncController│  │  Broker  │──▶ SSE │ SQLite KV     │
//! │ (timer loop) │  │ (fan-out)│  / CLI │ checkpoint_kv │
//! └──────────────┘  └──────────┘        └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! mmsync init                 # create the checkpoint table
//! mmsync sync once            # one pass with progress on stderr
//! mmsync sync run             # periodic loop until Ctrl-C
//! mmsync serve                # HTTP/SSE control surface
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`error`] | Error kinds |
//! | [`db`] / [`migrate`] | SQLite pool and checkpoint schema |
//! | [`models`] | Channels, posts, pages, sink documents |
//! | [`traits`] | Collaborator seams |
//! | [`checkpoint`] | Checkpoint store backends |
//! | [`sync_state`] | Typed sync state, flags and status feed |
//! | [`upstream`] | Mattermost REST client |
//! | [`embedding`] | Local feature-hashing embedder |
//! | [`sink`] | Chroma and in-memory vector sinks |
//! | [`progress`] | Progress events and notification transports |
//! | [`pipeline`] | Fetch pipeline |
//! | [`controller`] | Sync controller |
//! | [`broker`] | Event broker |
//! | [`service`] | Subscribe protocol |
//! | [`server`] | HTTP/SSE server |
//! | [`commands`] | CLI command implementations |

pub mod broker;
pub mod checkpoint;
pub mod commands;
pub mod config;
pub mod controller;
pub mod db;
pub mod embedding;
pub mod error;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod server;
pub mod service;
pub mod sink;
pub mod sync_state;
pub mod traits;
pub mod upstream;
