//! One PTY-backed shell per attached viewer.

use anyhow::{Context, Result};
use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connection::{ConnectionHandle, Frame};
use crate::event::Event;
use crate::event::utf8::Utf8Decoder;

static NEXT_SHELL: AtomicU64 = AtomicU64::new(1);

/// Notification that a shell's output reached EOF: `(client_id, serial)`
pub type ShellExit = (String, u64);

/// A running shell whose output is streamed to one viewer
pub struct Shell {
    serial: u64,
    input_tx: mpsc::Sender<Vec<u8>>,
    child: Box<dyn Child + Send + Sync>,
    _master: Box<dyn MasterPty + Send>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl Shell {
    /// Spawns `program` in a PTY.
    ///
    /// Output is sent on `socket` as `shell/data` events addressed to
    /// `client_id`, waiting for queue room rather than dropping output. When
    /// the output ends, `exited` is notified.
    pub fn spawn(
        program: &str,
        instance_id: &str,
        client_id: &str,
        socket: ConnectionHandle,
        exited: mpsc::UnboundedSender<ShellExit>,
    ) -> Result<Self> {
        let serial = NEXT_SHELL.fetch_add(1, Ordering::Relaxed);

        let pty_system = portable_pty::native_pty_system();
        let pty_pair = pty_system
            .openpty(PtySize {
                rows: 30,
                cols: 120,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(program);
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        let child = pty_pair
            .slave
            .spawn_command(cmd)
            .context("Failed to spawn shell")?;
        // Only the child keeps the slave open, so its exit ends our reads.
        drop(pty_pair.slave);

        let master = pty_pair.master;
        let mut reader = master.try_clone_reader().context("Failed to clone PTY reader")?;
        let mut writer = master.take_writer().context("Failed to take PTY writer")?;

        // Task to read PTY output and forward it to the viewer
        let instance_id = instance_id.to_owned();
        let client_id = client_id.to_owned();
        let reader_task = tokio::task::spawn_blocking(move || {
            let mut buffer = [0u8; 1024];
            let mut decoder = Utf8Decoder::default();
            loop {
                match reader.read(&mut buffer) {
                    Ok(n) if n > 0 => {
                        if let Some(text) = decoder.push(&buffer[..n]) {
                            let event = Event::shell_data(&*instance_id, &*client_id, text);
                            if !socket.send_blocking(Frame::Text(event.encode())) {
                                debug!("Socket for {} is gone, discarding output", client_id);
                            }
                        }
                    }
                    Ok(_) => break, // EOF
                    Err(e) => {
                        debug!("PTY read for {} ended: {}", client_id, e);
                        break;
                    }
                }
            }
            if let Some(text) = decoder.finish() {
                socket.send_blocking(Frame::Text(
                    Event::shell_data(&*instance_id, &*client_id, text).encode(),
                ));
            }
            let _ = exited.send((client_id, serial));
        });

        // Task to write viewer input to the PTY
        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(1024);
        let writer_task = tokio::task::spawn_blocking(move || {
            while let Some(data) = input_rx.blocking_recv() {
                if writer.write_all(&data).is_err() || writer.flush().is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            serial,
            input_tx,
            child,
            _master: master,
            reader_task,
            writer_task,
        })
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.input_tx
            .send(data.to_vec())
            .await
            .context("Shell input is closed")
    }

    /// Kills the shell process and releases the PTY.
    pub fn close(mut self) {
        if let Err(e) = self.child.kill() {
            debug!("Failed to kill shell {}: {}", self.serial, e);
        }
        if let Err(e) = self.child.try_wait() {
            warn!("Failed to reap shell {}: {}", self.serial, e);
        }
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

/// Determines the user's preferred shell, falling back to `/bin/bash`.
pub fn get_user_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
}

