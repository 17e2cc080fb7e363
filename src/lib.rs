//! # Webshell - Remote Shell Relay Library
//!
//! Webshell lets a terminal UI (a *viewer*) drive a shell running on another
//! machine (a *host*) without the two ever connecting directly. Both sides dial
//! a rendezvous router, which pairs them by identifier and relays events
//! between them.
//!
//! ## Quick Start
//!
//! ```bash
//! # Start the router
//! webshell router --host 0.0.0.0 --port 4000 &
//!
//! # Serve shells from this machine
//! webshell instance --url ws://localhost:4000/route --id my-box &
//!
//! # Open a shell on it
//! webshell attach my-box --url ws://localhost:4000/route
//! ```
//!
//! ## Library Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use webshell::router::{registry::Registry, relay::Relay, serve};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
//! let relay = Arc::new(Relay::new(Arc::new(Registry::new())));
//! tokio::spawn(serve(listener, relay, "/route"));
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **[Event Codec](event)**: the `shell/create` and `shell/data` wire events
//! - **[Connections](connection)**: socket lifecycle state and outbound queues
//! - **[Router](router)**: classifies connections, keeps the registries, forwards events
//! - **[Attach](attach)**: viewer-side adapter between a terminal and the wire protocol
//! - **[Instance](instance)**: host agent running one PTY shell per viewer
//!
//! ## Delivery
//!
//! The router is stateless and store-less. An event whose counterpart is not
//! connected is dropped, so a viewer attached to an absent host simply sees
//! no output and no error.

pub mod attach;
pub mod connection;
pub mod event;
pub mod instance;
pub mod router;
