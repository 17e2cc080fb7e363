//! # Webshell Instance Module
//!
//! The host agent. It keeps a connection to the router open under its
//! instance identifier and runs one PTY shell for every viewer that asks for
//! one.
//!
//! ## Event handling
//!
//! - `shell/create` from viewer `clientId` spawns a shell for that viewer,
//!   unless it already has one.
//! - `shell/data` from viewer `clientId` is written to that viewer's shell.
//! - Shell output goes back as `shell/data` naming both this instance and the
//!   viewer.
//!
//! Events addressed to another instance identifier are ignored.
//!
//! ## Example Usage
//!
//! ```bash
//! webshell instance --url ws://relay.example.com:4000/route
//!
//! # Fixed identifier and an extra handshake header
//! webshell instance --id build-box --header "X-Team: infra"
//! ```

pub mod identity;
pub mod shell;

use anyhow::Result;
use clap::Parser;
use std::collections::HashMap;
use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::connection::client::{build_request, check_relay_url, connect};
use crate::connection::{ConnectionHandle, Frame};
use crate::event::Event;
use crate::router::classify::INSTANCE_ID_HEADER;
use shell::{Shell, ShellExit};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Webshell instance - serve shells on this machine through the router"
)]
pub struct Args {
    /// Router WebSocket URL
    #[arg(long, default_value = "ws://127.0.0.1:4000/route")]
    pub url: Url,

    /// Instance identifier; a persisted one is used when omitted
    #[arg(long)]
    pub id: Option<String>,

    /// Extra handshake header in `key:value` form (repeatable)
    #[arg(long = "header", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Delay before reconnecting to the router
    #[arg(long, default_value_t = 1000)]
    pub retry_delay_ms: u64,
}

fn parse_header(value: &str) -> Result<(String, String), String> {
    let (key, val) = value
        .split_once(':')
        .ok_or_else(|| format!("invalid header format, expected key:value, got {value}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("invalid header format, empty key in {value}"));
    }
    Ok((key.to_string(), val.trim().to_string()))
}

/// Serves shells until Ctrl-C, reconnecting whenever the router goes away.
pub async fn run_instance(args: Args) -> Result<()> {
    check_relay_url(&args.url)?;

    let instance_id = identity::resolve_instance_id(args.id.as_deref())?;
    let headers = handshake_headers(&instance_id, &args.headers);
    let retry_delay = Duration::from_millis(args.retry_delay_ms);

    info!("Instance {} serving shells via {}", instance_id, args.url);

    loop {
        select! {
            result = serve_connection(&args.url, &headers, &instance_id) => {
                if let Err(e) = result {
                    warn!("{:#}. Retrying in {}ms...", e, args.retry_delay_ms);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }

        select! {
            _ = tokio::time::sleep(retry_delay) => {}
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Instance {} stopped", instance_id);
    Ok(())
}

/// Routing header first, then informational headers, then user extras.
fn handshake_headers(instance_id: &str, extra: &[(String, String)]) -> Vec<(String, String)> {
    let mut headers = vec![
        (INSTANCE_ID_HEADER.to_string(), instance_id.to_string()),
        ("x-hostname".to_string(), hostname()),
        ("x-runtime".to_string(), std::env::consts::OS.to_string()),
        ("x-arch".to_string(), std::env::consts::ARCH.to_string()),
    ];
    headers.extend(
        extra
            .iter()
            .filter(|(key, _)| !key.eq_ignore_ascii_case(INSTANCE_ID_HEADER))
            .cloned(),
    );
    headers
}

fn hostname() -> String {
    let name = gethostname::gethostname().to_string_lossy().trim().to_string();
    if name.is_empty() {
        "unknown".to_string()
    } else {
        name
    }
}

async fn serve_connection(url: &Url, headers: &[(String, String)], instance_id: &str) -> Result<()> {
    let request = build_request(url, headers)?;
    let mut socket = connect(request).await?;
    info!("Connected to {}, using ID {}", url, instance_id);

    let (exited_tx, mut exited_rx) = mpsc::unbounded_channel();
    let mut host = ShellHost::new(instance_id, socket.handle.clone(), exited_tx);

    loop {
        select! {
            frame = socket.inbound.recv() => match frame {
                Some(Frame::Text(text)) => host.handle_frame(&text).await,
                Some(Frame::Binary(data)) => {
                    debug!("Ignoring {} byte binary frame", data.len());
                }
                Some(Frame::Close) | None => break,
            },
            Some((client_id, serial)) = exited_rx.recv() => host.reap(&client_id, serial),
        }
    }

    host.close_all();
    socket.driver.abort();
    info!("Connection to {} closed", url);
    Ok(())
}

/// The shells this instance runs, keyed by viewer identifier
pub struct ShellHost {
    instance_id: String,
    program: String,
    socket: ConnectionHandle,
    exited_tx: mpsc::UnboundedSender<ShellExit>,
    shells: HashMap<String, Shell>,
}

impl ShellHost {
    pub fn new(
        instance_id: &str,
        socket: ConnectionHandle,
        exited_tx: mpsc::UnboundedSender<ShellExit>,
    ) -> Self {
        Self {
            instance_id: instance_id.to_owned(),
            program: shell::get_user_shell(),
            socket,
            exited_tx,
            shells: HashMap::new(),
        }
    }

    /// Runs `program` instead of the user's login shell.
    pub fn with_shell(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub async fn handle_frame(&mut self, raw: &str) {
        let event = match Event::decode(raw.as_bytes()) {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping frame from router: {}", e);
                return;
            }
        };

        if event.instance_id() != self.instance_id {
            warn!(
                "Instance ID mismatch: {} != {}",
                event.instance_id(),
                self.instance_id
            );
            return;
        }

        match event {
            Event::ShellCreate {
                client_id: Some(client_id),
                ..
            } => self.open_shell(client_id),
            Event::ShellCreate { client_id: None, .. } => {
                warn!("Ignoring shell/create without a clientId");
            }
            Event::ShellData {
                client_id, data, ..
            } => self.write(&client_id, data.as_bytes()).await,
        }
    }

    fn open_shell(&mut self, client_id: String) {
        if self.shells.contains_key(&client_id) {
            debug!("Shell for {} already running", client_id);
            return;
        }

        match Shell::spawn(
            &self.program,
            &self.instance_id,
            &client_id,
            self.socket.clone(),
            self.exited_tx.clone(),
        ) {
            Ok(shell) => {
                info!("New shell created for {}", client_id);
                self.shells.insert(client_id, shell);
            }
            Err(e) => error!("Failed to create shell for {}: {:#}", client_id, e),
        }
    }

    async fn write(&self, client_id: &str, data: &[u8]) {
        let Some(shell) = self.shells.get(client_id) else {
            warn!("No shell found for client {}", client_id);
            return;
        };
        if let Err(e) = shell.write(data).await {
            warn!("Failed to write to shell for {}: {:#}", client_id, e);
        }
    }

    /// Removes a shell whose output ended, unless it was already replaced.
    pub fn reap(&mut self, client_id: &str, serial: u64) {
        if self
            .shells
            .get(client_id)
            .is_some_and(|shell| shell.serial() == serial)
        {
            if let Some(shell) = self.shells.remove(client_id) {
                shell.close();
                info!("Shell for {} exited", client_id);
            }
        }
    }

    pub fn close_all(&mut self) {
        for (client_id, shell) in self.shells.drain() {
            debug!("Closing shell for {}", client_id);
            shell.close();
        }
    }

    pub fn shell_count(&self) -> usize {
        self.shells.len()
    }
}
