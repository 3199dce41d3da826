//! Command-line flags of the `railsync` binary.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Command line of the `railsync` node.
#[derive(Parser, Debug, Default)]
#[command(name = "railsync", about = "Multiplayer train synchronisation node")]
pub struct CliArgs {
    /// Host the session as dispatcher instead of joining one.
    #[arg(long)]
    pub dispatcher: bool,

    /// Dispatcher address to connect to.
    #[arg(long)]
    pub server: Option<String>,

    /// Dispatcher port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Player name.
    #[arg(long)]
    pub user: Option<String>,

    /// Session code.
    #[arg(long)]
    pub code: Option<String>,

    /// Route identity.
    #[arg(long)]
    pub route: Option<String>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

fn override_with<T: Clone>(slot: &mut T, value: &Option<T>) {
    if let Some(value) = value {
        *slot = value.clone();
    }
}

impl Config {
    /// Flags given on the command line replace what `config.ron` says.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        override_with(&mut self.network.server_address, &args.server);
        override_with(&mut self.network.server_port, &args.port);
        override_with(&mut self.multiplayer.username, &args.user);
        override_with(&mut self.multiplayer.session_code, &args.code);
        override_with(&mut self.multiplayer.route, &args.route);
        override_with(&mut self.debug.log_level, &args.log_level);
    }
}
