//! CoreRPC - Minimal multiplexed RPC runtime
//!
//! Command-line entry point: run a server, issue calls, or run the demo.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use corerpc::config::{self, Config};
use corerpc::protocol::{self, CodecType};
use corerpc::{Client, Router, Server};

/// CoreRPC - Multiplexed RPC over a single connection
#[derive(Parser)]
#[command(name = "corerpc")]
#[command(author = "CoreRPC Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Serve and call remote procedures over TCP", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a server exposing the sample service
    Serve {
        /// Port to listen on (overrides the configuration file)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Call a method on a running server
    Call {
        /// Server address, host:port
        #[arg(short, long)]
        server: String,

        /// Method to invoke, e.g. Foo.Sum
        #[arg(short, long, default_value = "Foo.Sum")]
        method: String,

        /// String argument sent to the method
        #[arg(short, long)]
        args: String,

        /// Codec to negotiate (bincode or json)
        #[arg(long)]
        codec: Option<CodecType>,
    },

    /// Start a server on an ephemeral port and issue concurrent calls against it
    Demo {
        /// Number of concurrent calls
        #[arg(short = 'n', long, default_value_t = 5)]
        calls: usize,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = match &config.general.log_filter {
        Some(directive) if !cli.verbose => EnvFilter::new(directive),
        _ if cli.verbose || config.general.verbose => EnvFilter::new("debug"),
        _ => EnvFilter::new("info"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Serve { port } => {
            run_server(config, port).await?;
        }
        Commands::Call {
            server,
            method,
            args,
            codec,
        } => {
            run_call(config, server, method, args, codec).await?;
        }
        Commands::Demo { calls } => {
            run_demo(config, calls).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Sample service: answers `Foo.Sum` by echoing the request with a canned prefix
fn sample_router() -> Router {
    let mut router = Router::new();
    router.register("Foo.Sum", |args: String| async move {
        tracing::info!("Foo.Sum called with {:?}", args);
        Ok::<_, String>(format!("corerpc resp {}", args))
    });
    router
}

/// Run the server until Ctrl+C
async fn run_server(config: Config, port: Option<u16>) -> anyhow::Result<()> {
    let mut settings = config.server.clone();
    if let Some(port) = port {
        settings.port = port;
    }

    let listener = TcpListener::bind(settings.bind_addr()).await?;
    tracing::info!("Start rpc server on {}", listener.local_addr()?);

    let server = Server::with_config(sample_router(), settings.server_config());

    tokio::select! {
        result = server.accept(listener) => result?,
        _ = tokio::signal::ctrl_c() => {
            println!("\nShutting down...");
        }
    }

    tracing::info!("Server stopped");
    Ok(())
}

/// Issue a single call and print the reply
async fn run_call(
    config: Config,
    server: String,
    method: String,
    args: String,
    codec: Option<CodecType>,
) -> anyhow::Result<()> {
    let mut options = config.client.options();
    if let Some(codec) = codec {
        options.codec_type = codec;
    }

    let client = Client::dial(server.as_str(), Some(options)).await?;

    let reply: String = match config.client.call_timeout() {
        Some(deadline) => client.call_timeout(&method, &args, deadline).await?,
        None => client.call(&method, &args).await?,
    };
    println!("{}", reply);

    client.close().await?;
    Ok(())
}

/// Serve on an ephemeral port and issue `calls` concurrent calls
async fn run_demo(config: Config, calls: usize) -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tracing::info!("Start rpc server on {}", addr);

    let server = Server::with_config(sample_router(), config.server.server_config());
    tokio::spawn(async move { server.accept(listener).await });

    let client = Client::dial(addr, Some(config.client.options())).await?;

    let mut tasks = Vec::with_capacity(calls);
    for i in 0..calls {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let args = format!("corerpc req {}", i);
            client.call::<_, String>("Foo.Sum", &args).await
        }));
    }

    for task in tasks {
        let reply = task.await??;
        println!("reply: {}", reply);
    }

    client.close().await?;
    println!("\nProtocol magic: {:#x}", protocol::MAGIC_NUMBER);
    Ok(())
}
