use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use rtfmri::config::{Config, DEFAULT_CONFIG_PATH};

/// rtf - real-time fMRI synchronization and control
#[derive(Parser, Debug)]
#[command(name = "rtf")]
#[command(version)]
#[command(about = "Real-time fMRI synchronization and control")]
#[command(long_about = "rtf connects an MRI scanner that writes image files with a model server
that consumes them while an experiment runs.

Quick start:
  1. Run 'rtf init' to write a default rtfmri.toml
  2. Run 'rtf serve' on the compute host
  3. Run 'rtf run <schedule.json>' to drive a session against it
     (or 'rtf run --local <schedule.json>' to do both in one process)
  4. On the scanner host, run 'rtf relay --allow-dir <dir>' to serve files remotely")]
pub struct Cli {
    /// Path to config file (defaults to rtfmri.toml)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the model server until a client sends shutdown
    Serve {
        /// Address to listen on (overrides server.addr)
        #[arg(long)]
        addr: Option<String>,
    },
    /// Drive an experiment session against a model server
    Run {
        /// Session schedule, JSON or TOML (overrides session.schedule)
        schedule: Option<PathBuf>,
        /// Start the model server in this process and shut it down afterwards
        #[arg(long)]
        local: bool,
        /// Model to load on the server (overrides client.model)
        #[arg(long)]
        model: Option<String>,
        /// Server address (overrides client.server_addr)
        #[arg(long)]
        addr: Option<String>,
        /// Scanner output directory; trials are replayed from the schedule when unset
        #[arg(long)]
        image_dir: Option<PathBuf>,
        /// Directory for per-run output (overrides session.output_dir)
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Serve scanner files to a remote peer, reconnecting forever
    Relay {
        /// Peer address to connect to (overrides relay.peer_addr)
        #[arg(long)]
        peer: Option<String>,
        /// Directory files may be served from (repeatable)
        #[arg(long = "allow-dir")]
        allow_dirs: Vec<PathBuf>,
        /// File extension that may be served, e.g. .dcm (repeatable)
        #[arg(long = "allow-type")]
        allow_types: Vec<String>,
        /// Seconds between reconnect attempts (overrides relay.retry_secs)
        #[arg(long)]
        retry_secs: Option<u64>,
    },
    /// Block until a file exists in a watched directory
    Wait {
        /// File to wait for
        path: PathBuf,
        /// Give up after this many seconds (0 waits forever)
        #[arg(long, default_value = "0")]
        timeout_secs: u64,
        /// Minimum size the file must reach (overrides watch.min_file_size)
        #[arg(long)]
        min_size: Option<u64>,
    },
    /// Write a default rtfmri.toml
    Init,
}

/// Fold command line flags into the loaded config. Flags win.
pub fn apply_overrides(command: &Commands, config: &mut Config) {
    match command {
        Commands::Serve { addr } => {
            if let Some(addr) = addr {
                config.server.addr = addr.clone();
            }
        }
        Commands::Run {
            schedule,
            model,
            addr,
            image_dir,
            output_dir,
            local: _,
        } => {
            if let Some(schedule) = schedule {
                config.session.schedule = Some(schedule.clone());
            }
            if let Some(model) = model {
                config.client.model = model.clone();
            }
            if let Some(addr) = addr {
                config.client.server_addr = addr.clone();
            }
            if let Some(dir) = image_dir {
                config.session.image_dir = Some(dir.clone());
            }
            if let Some(dir) = output_dir {
                config.session.output_dir = dir.clone();
            }
        }
        Commands::Relay {
            peer,
            allow_dirs,
            allow_types,
            retry_secs,
        } => {
            if let Some(peer) = peer {
                config.relay.peer_addr = peer.clone();
            }
            if !allow_dirs.is_empty() {
                config.relay.allowed_dirs = allow_dirs.clone();
            }
            if !allow_types.is_empty() {
                config.relay.allowed_types = allow_types.clone();
            }
            if let Some(secs) = retry_secs {
                config.relay.retry_secs = *secs;
            }
        }
        Commands::Wait { min_size, .. } => {
            if let Some(size) = min_size {
                config.watch.min_file_size = *size;
            }
        }
        Commands::Init => {}
    }
}

/// Write a default config file unless one already exists
pub fn init_config(config_path: &str) -> anyhow::Result<()> {
    if Path::new(config_path).exists() {
        println!("Config file {} already exists, leaving it unchanged", config_path);
        return Ok(());
    }

    Config::default()
        .save(config_path)
        .with_context(|| format!("Failed to write config file '{}'", config_path))?;

    println!("Created {}", config_path);
    println!("Edit [session] and [relay] to point at your scanner directories.");
    Ok(())
}

#[cfg(test)]
#[path = "cli_tests.rs"]
mod tests;
