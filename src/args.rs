use clap::Parser;
use std::path::PathBuf;

/// CLI overrides, composed with file config: flags here win over
/// `Config::load`'s result when set.
#[derive(Parser, Debug)]
#[command(name = "turn-taking-server")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Real-time media routing and turn-taking server", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/turn-taking-server.toml")]
    pub config: PathBuf,

    /// HTTP port override
    #[arg(long)]
    pub port: Option<u16>,

    /// Verbose logging (bumps the default filter up one level)
    #[arg(short, long, action)]
    pub verbose: bool,

    /// Run in foreground (don't daemonize)
    #[arg(long, action)]
    pub foreground: bool,

    /// PID file path
    #[arg(long, default_value = "/var/run/turn-taking-server.pid")]
    pub pidfile: PathBuf,
}

impl Args {
    /// Load file config, then apply CLI overrides, in that order.
    pub fn load_config(&self) -> Result<crate::config::Config, Box<dyn std::error::Error>> {
        let mut config = crate::config::Config::load(&self.config)?;
        if let Some(port) = self.port {
            config.server.port = port;
        }
        Ok(config)
    }
}
