//! SOCKS-capable HTTP reverse proxy.
//!
//! ```text
//!     Client ──▶ listener ──▶ request reader ──▶ resolver ──▶ upstream connect
//!                                                              │
//!                                              (SOCKS5 handshake, optional)
//!                                                              │
//!     Client ◀── response writer ◀── buffer chain ◀── context ◀┘
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use socks_reverse_proxy::config::load_config;
use socks_reverse_proxy::lifecycle::{self, StartupOptions};

#[derive(Parser)]
#[command(name = "socks-reverse-proxy")]
#[command(about = "HTTP reverse proxy with optional SOCKS5 tunneling", long_about = None)]
struct Cli {
    /// TOML configuration file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,

    /// Do not reload the configuration file when it changes
    #[arg(long)]
    no_watch: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.check {
        let Some(path) = cli.config else {
            eprintln!("--check needs --config");
            return ExitCode::FAILURE;
        };
        return match load_config(&path) {
            Ok(_) => {
                println!("{}: configuration ok", path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}: {}", path.display(), e);
                ExitCode::FAILURE
            }
        };
    }

    let options = StartupOptions {
        config_path: cli.config,
        watch: !cli.no_watch,
    };
    match lifecycle::run(options).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}
