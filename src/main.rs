use clap::Parser;
use color_eyre::eyre::eyre;
use color_eyre::Result;

use uart_monitor::cli::{Cli, Commands};
use uart_monitor::monitor::{self, MonitorOptions};
use uart_monitor::{control, identify, logging};

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    logging::init();

    match cli.command {
        Commands::Identify { verbose, save } => {
            identify::run_identify(verbose, save);
        }

        Commands::Monitor {
            foreground,
            systemd,
            baud,
            only,
            proxy,
        } => {
            monitor::run(MonitorOptions {
                baud,
                only,
                foreground,
                systemd,
                proxy,
                ..MonitorOptions::default()
            })?;
        }

        Commands::Status => {
            let response = control::send_to_daemon("STATUS\n")?;
            print!("{response}");
            if response.is_empty() {
                return Err(eyre!("empty response from daemon"));
            }
        }

        Commands::Yield { device } => {
            let response = control::send_to_daemon(&format!("YIELD {device}\n"))?;
            print!("{response}");
            if !response.starts_with("OK") {
                return Err(eyre!("yield refused"));
            }
        }

        Commands::Reclaim { device } => {
            let response = control::send_to_daemon(&format!("RECLAIM {device}\n"))?;
            print!("{response}");
            if !response.starts_with("OK") {
                return Err(eyre!("reclaim refused"));
            }
        }

        Commands::Tail { name } => {
            control::tail_log(std::path::Path::new(uart_monitor::session::BASE_DIR), &name)?;
        }
    }

    Ok(())
}
