use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use webshell::{attach, instance, router};

#[derive(Parser, Debug)]
#[command(author, version, about = "Remote shells relayed through a rendezvous router.")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the router that pairs hosts with viewers.
    Router(router::Args),
    /// Serve shells from this machine through a router.
    Instance(instance::Args),
    /// Attach this terminal to a shell on a remote host.
    Attach(attach::Args),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Create ~/.webshell directory if it doesn't exist
    let home_dir = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let webshell_dir = format!("{home_dir}/.webshell");
    std::fs::create_dir_all(&webshell_dir)?;

    // Determine log file based on subcommand
    let (log_path, console_output) = match &args.command {
        Commands::Router(_) => (format!("{webshell_dir}/webshell-router.log"), true),
        Commands::Instance(_) => (format!("{webshell_dir}/webshell-instance.log"), true),
        Commands::Attach(_) => (format!("{webshell_dir}/webshell-attach.log"), false), // Terminal is in raw mode
    };

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path)?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if console_output {
        use tracing_subscriber::fmt::writer::MakeWriterExt;
        let writer = std::io::stdout.and(log_file);

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(writer)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(log_file)
            .with_ansi(false)
            .init();
    }

    match &args.command {
        Commands::Router(_) => info!("Starting webshell router"),
        Commands::Instance(_) => info!("Starting webshell instance"),
        Commands::Attach(_) => info!("Starting webshell attach"),
    }

    match args.command {
        Commands::Router(router_args) => router::run_router_server(router_args).await,
        Commands::Instance(instance_args) => instance::run_instance(instance_args).await,
        Commands::Attach(attach_args) => attach::run_attach(attach_args).await,
    }
}
