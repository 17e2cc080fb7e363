//! Binds a local terminal to a viewer connection.
//!
//! Inbound `shell/data` events are written to the terminal output. Local
//! keystrokes become `shell/data` events, and raw terminal bytes bypass the
//! envelope as binary frames.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::connection::{ConnectionHandle, Frame, ReadyState};
use crate::event::Event;

/// Misuse of the adapter's socket, surfaced to the caller
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AttachError {
    #[error("attach adapter was used before its socket was open")]
    NotOpen,

    #[error("attach adapter socket is closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct AttachOptions {
    pub client_id: String,
    pub instance_id: String,
    /// Forward local input to the host. A read-only viewer only renders output.
    pub bidirectional: bool,
}

/// Input produced by the local terminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalInput {
    /// Text typed by the user, wrapped in a `shell/data` event
    Data(String),
    /// Raw bytes, sent as a binary frame
    Binary(Vec<u8>),
}

pub struct AttachAdapter {
    socket: ConnectionHandle,
    options: AttachOptions,
    subscriptions: Mutex<Vec<JoinHandle<()>>>,
    disposed: AtomicBool,
    disposed_tx: watch::Sender<bool>,
}

impl AttachAdapter {
    pub fn new(socket: ConnectionHandle, options: AttachOptions) -> Self {
        let (disposed_tx, _) = watch::channel(false);
        Self {
            socket,
            options,
            subscriptions: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
            disposed_tx,
        }
    }

    /// Starts pumping socket frames to `output` and, when bidirectional,
    /// terminal input to the socket.
    ///
    /// The adapter disposes itself when the socket closes. An input send that
    /// violates the socket state contract also disposes it.
    pub fn activate<W>(
        self: &Arc<Self>,
        mut inbound: mpsc::Receiver<Frame>,
        mut input: mpsc::Receiver<TerminalInput>,
        mut output: W,
    ) where
        W: Write + Send + 'static,
    {
        let adapter = self.clone();
        let inbound_task = tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                if frame == Frame::Close {
                    break;
                }
                if let Err(e) = write_frame(&frame, &mut output) {
                    error!("Failed to write to terminal: {}", e);
                    break;
                }
            }
            adapter.dispose();
        });

        let mut tasks = vec![inbound_task];

        if self.options.bidirectional {
            let adapter = self.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(chunk) = input.recv().await {
                    let result = match chunk {
                        TerminalInput::Data(data) => adapter.send_data(&data),
                        TerminalInput::Binary(data) => adapter.send_binary(&data),
                    };
                    if let Err(e) = result {
                        error!("Dropping terminal input: {}", e);
                        adapter.dispose();
                        break;
                    }
                }
            }));
        }

        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);

        // Disposed while activating: release what was just registered.
        if self.is_disposed() {
            self.release_subscriptions();
        }
    }

    /// Sends terminal text as a `shell/data` event.
    pub fn send_data(&self, data: &str) -> Result<(), AttachError> {
        if !self.check_open_socket()? {
            return Ok(());
        }
        let event = Event::shell_data(
            self.options.instance_id.as_str(),
            self.options.client_id.as_str(),
            data,
        );
        self.socket.send(Frame::Text(event.encode()));
        Ok(())
    }

    /// Sends raw terminal bytes as a binary frame, outside the event envelope.
    pub fn send_binary(&self, data: &[u8]) -> Result<(), AttachError> {
        if !self.check_open_socket()? {
            return Ok(());
        }
        self.socket.send(Frame::Binary(data.to_vec()));
        Ok(())
    }

    /// Asks the host for a shell bound to this viewer.
    pub fn request_shell(&self) -> Result<(), AttachError> {
        if !self.check_open_socket()? {
            return Ok(());
        }
        let event = Event::shell_create(
            self.options.instance_id.as_str(),
            Some(self.options.client_id.clone()),
        );
        self.socket.send(Frame::Text(event.encode()));
        Ok(())
    }

    /// `Ok(false)` means skip the send quietly.
    fn check_open_socket(&self) -> Result<bool, AttachError> {
        match self.socket.state() {
            ReadyState::Open => Ok(true),
            ReadyState::Connecting => Err(AttachError::NotOpen),
            ReadyState::Closing => {
                warn!("Attach adapter socket is closing");
                Ok(false)
            }
            ReadyState::Closed => Err(AttachError::Closed),
        }
    }

    /// Releases every subscription. Only the first call has an effect.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.release_subscriptions();
        self.disposed_tx.send_replace(true);
        debug!("Attach adapter disposed");
    }

    fn release_subscriptions(&self) {
        let tasks = std::mem::take(
            &mut *self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Resolves once the adapter has been disposed.
    pub async fn disposed(&self) {
        let mut rx = self.disposed_tx.subscribe();
        let _ = rx.wait_for(|disposed| *disposed).await;
    }
}

/// Writes one inbound frame to the terminal.
///
/// `shell/data` payloads are written as text and binary frames as raw bytes.
/// Anything else is ignored.
pub fn write_frame<W: Write>(frame: &Frame, output: &mut W) -> std::io::Result<()> {
    match frame {
        Frame::Text(text) => match Event::decode(text.as_bytes()) {
            Ok(Event::ShellData { data, .. }) => {
                output.write_all(data.as_bytes())?;
                output.flush()
            }
            Ok(event) => {
                debug!("Ignoring inbound {}", event.kind());
                Ok(())
            }
            Err(e) => {
                debug!("Ignoring undecodable frame: {}", e);
                Ok(())
            }
        },
        Frame::Binary(data) => {
            output.write_all(data)?;
            output.flush()
        }
        Frame::Close => Ok(()),
    }
}
