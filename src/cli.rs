use clap::{Parser, Subcommand};

/// The command line interface for uart-monitor.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Commands available in the command line interface.
#[derive(Subcommand)]
pub enum Commands {
    /// Scan and identify USB serial ports.
    Identify {
        /// Show full details, including labels.
        #[arg(short, long)]
        verbose: bool,

        /// Save board identifications to ~/.boards.
        #[arg(long)]
        save: bool,
    },

    /// Start the monitoring daemon.
    Monitor {
        /// Run in the foreground.
        #[arg(short, long)]
        foreground: bool,

        /// systemd notify mode (implies --foreground).
        #[arg(long)]
        systemd: bool,

        /// Baud rate for all monitored ports.
        #[arg(short, long, default_value_t = 115_200)]
        baud: u32,

        /// Only monitor these devices (comma-separated paths or tty names).
        #[arg(long)]
        only: Option<String>,

        /// Hold ports exclusively and expose a PTY per port.
        #[arg(long)]
        proxy: bool,
    },

    /// Query the running daemon's status.
    Status,

    /// Release a port so another tool (e.g. a flasher) can open it.
    Yield {
        /// The device to release, e.g. /dev/ttyUSB0.
        device: String,
    },

    /// Re-acquire a previously yielded port.
    Reclaim {
        /// The device to re-acquire, e.g. /dev/ttyUSB0.
        device: String,
    },

    /// Tail the latest log for a port.
    Tail {
        /// Device name or label, e.g. ttyUSB0 or VMK180_UART1.
        name: String,
    },
}
