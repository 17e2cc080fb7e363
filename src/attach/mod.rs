//! # Webshell Attach Module
//!
//! Terminal viewer for a remote shell. It connects to the router as a viewer,
//! asks the host for a shell, and then mirrors the local terminal through the
//! [`AttachAdapter`].
//!
//! ## Data Flow
//!
//! ```text
//! ┌─────────────┐    stdin     ┌─────────────┐   shell/data    ┌─────────────┐
//! │   User      │─────────────►│   Attach    │────────────────►│   Router    │
//! │   Terminal  │              │   Adapter   │                 │             │
//! │             │◄─────────────│             │◄────────────────│             │
//! └─────────────┘    stdout    └─────────────┘   shell/data    └─────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```bash
//! # Attach to a host, announcing the viewer with the x-client-id header
//! webshell attach 3f2b9c1e-7d44-4a8e-9d0a-2b6f1e5c8a10
//!
//! # Announce the viewer through the sub-protocol, as a browser would
//! webshell attach 3f2b9c1e-7d44-4a8e-9d0a-2b6f1e5c8a10 --subprotocol
//! ```
//!
//! Press `Ctrl-]` to detach.

pub mod adapter;

pub use adapter::{AttachAdapter, AttachError, AttachOptions, TerminalInput};

use anyhow::Result;
use clap::Parser;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use std::io::{Read, Write};
use std::sync::Arc;
use tokio::select;
use tokio::sync::mpsc;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::connection::client::{build_request, check_relay_url, connect};
use crate::event::utf8::Utf8Decoder;
use crate::router::classify::CLIENT_ID_HEADER;

/// Ctrl-]
const DETACH_BYTE: u8 = 0x1D;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Webshell attach - open a shell on a remote host through the router"
)]
pub struct Args {
    /// Identifier of the host to attach to
    pub instance_id: String,

    /// Router WebSocket URL
    #[arg(long, default_value = "ws://127.0.0.1:4000/route")]
    pub url: Url,

    /// Viewer identifier; a random one is generated when omitted
    #[arg(long)]
    pub client_id: Option<String>,

    /// Send the viewer identifier as the WebSocket sub-protocol instead of a header
    #[arg(long, default_value_t = false)]
    pub subprotocol: bool,

    /// Only display output, never send input
    #[arg(long, default_value_t = false)]
    pub read_only: bool,
}

/// Attaches the local terminal to a shell on the named host.
///
/// The terminal is put in raw mode for the duration of the session and the
/// process exits once the session ends, since the blocking stdin reader
/// cannot be cancelled.
pub async fn run_attach(args: Args) -> Result<()> {
    check_relay_url(&args.url)?;

    let client_id = args
        .client_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let header = if args.subprotocol {
        "sec-websocket-protocol"
    } else {
        CLIENT_ID_HEADER
    };
    let request = build_request(&args.url, &[(header.to_string(), client_id.clone())])?;

    info!("Attaching to {} as {}", args.instance_id, client_id);
    let socket = connect(request).await?;

    let adapter = Arc::new(AttachAdapter::new(
        socket.handle.clone(),
        AttachOptions {
            client_id: client_id.clone(),
            instance_id: args.instance_id.clone(),
            bidirectional: !args.read_only,
        },
    ));
    adapter.request_shell()?;

    eprintln!("Attached to {} as {}", args.instance_id, client_id);
    eprintln!("Press Ctrl-] to detach.");

    enable_raw_mode().unwrap_or_else(|e| {
        eprintln!("Failed to enable raw mode: {e}");
    });

    ctrlc::set_handler(move || {
        let _ = disable_raw_mode();
        std::process::exit(0);
    })
    .unwrap_or_else(|e| {
        eprintln!("Failed to set signal handler: {e}");
    });

    let (input_tx, input_rx) = mpsc::channel::<TerminalInput>(1024);
    let (detach_tx, mut detach_rx) = mpsc::channel::<()>(1);

    // Task to read raw bytes from stdin
    let stdin_reader_task = tokio::task::spawn_blocking(move || {
        let mut stdin = std::io::stdin();
        let mut buffer = [0u8; 1024];
        let mut decoder = Utf8Decoder::default();

        loop {
            let n = match stdin.read(&mut buffer) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let (input, detach) = read_input(&mut decoder, &buffer[..n]);

            if let Some(input) = input {
                if input_tx.blocking_send(input).is_err() {
                    break;
                }
            }

            if detach {
                let _ = detach_tx.blocking_send(());
                break;
            }
        }
    });

    adapter.activate(socket.inbound, input_rx, std::io::stdout());

    select! {
        _ = adapter.disposed() => {
            info!("Session with {} ended", args.instance_id);
        }
        _ = detach_rx.recv() => {
            info!("Detached from {}", args.instance_id);
        }
    }

    adapter.dispose();
    socket.handle.close();
    if tokio::time::timeout(std::time::Duration::from_secs(1), socket.driver)
        .await
        .is_err()
    {
        warn!("Relay socket did not close in time");
    }
    stdin_reader_task.abort();

    let _ = disable_raw_mode();
    print!("\r\n");
    let _ = std::io::stdout().flush();

    // Force exit since the stdin reader may still be blocking
    std::process::exit(0);
}

/// Turns one stdin read into input for the host.
///
/// Everything before the detach key is decoded as text. A character split
/// across reads is held in `decoder` until its last byte arrives. The flag
/// reports whether the user pressed the detach key.
fn read_input(decoder: &mut Utf8Decoder, chunk: &[u8]) -> (Option<TerminalInput>, bool) {
    let detach_at = chunk.iter().position(|&b| b == DETACH_BYTE);
    let keys = &chunk[..detach_at.unwrap_or(chunk.len())];

    let mut text = decoder.push(keys);
    if detach_at.is_some() {
        if let Some(tail) = decoder.finish() {
            text.get_or_insert_with(String::new).push_str(&tail);
        }
    }

    (text.map(TerminalInput::Data), detach_at.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionHandle, Frame};
    use crate::event::Event;

    #[test]
    fn split_character_is_sent_once_complete() {
        let (socket, mut rx) = ConnectionHandle::open(8);
        let adapter = AttachAdapter::new(
            socket,
            AttachOptions {
                client_id: "cli-1".into(),
                instance_id: "inst-1".into(),
                bidirectional: true,
            },
        );
        let mut decoder = Utf8Decoder::default();

        for chunk in [&b"ab\xe2\x9c"[..], &b"\x93"[..]] {
            let (input, detach) = read_input(&mut decoder, chunk);
            assert!(!detach);
            match input {
                Some(TerminalInput::Data(data)) => adapter.send_data(&data).unwrap(),
                other => panic!("expected text input, got {other:?}"),
            }
        }

        let mut sent = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            match frame {
                Frame::Text(text) => sent.push(Event::decode(text.as_bytes()).unwrap()),
                other => panic!("expected only text frames, got {other:?}"),
            }
        }
        assert_eq!(
            sent,
            vec![
                Event::shell_data("inst-1", "cli-1", "ab"),
                Event::shell_data("inst-1", "cli-1", "✓"),
            ]
        );
    }

    #[test]
    fn partial_character_alone_sends_nothing() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(read_input(&mut decoder, b"\xf0\x9f"), (None, false));
        assert_eq!(
            read_input(&mut decoder, b"\x98\x80"),
            (Some(TerminalInput::Data("😀".into())), false)
        );
    }

    #[test]
    fn detach_key_stops_input() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(
            read_input(&mut decoder, b"ls\x1dignored"),
            (Some(TerminalInput::Data("ls".into())), true)
        );
        assert_eq!(read_input(&mut decoder, b"\x1d"), (None, true));
    }

    #[test]
    fn detach_flushes_a_truncated_character() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(read_input(&mut decoder, b"\xe2"), (None, false));
        assert_eq!(
            read_input(&mut decoder, b"\x1d"),
            (Some(TerminalInput::Data("\u{fffd}".into())), true)
        );
    }
}
