use std::time::Duration;

use clap::Parser;
use snafu::Report;
use tracing::{error, info, Level};

use opal_services::echo::EchoScu;

/// DICOM C-ECHO SCU
#[derive(Debug, Parser)]
#[command(version)]
struct App {
    /// socket address to the SCP,
    /// optionally with AE title
    /// (example: "MAIN-SCP@127.0.0.1:104")
    addr: String,
    /// verbose mode
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
    /// the calling Application Entity title
    #[arg(long = "calling-ae-title", default_value = "ECHO-SCU")]
    calling_ae_title: String,
    /// the called Application Entity title,
    /// overrides AE title in address if present [default: ANY-SCP]
    #[arg(long = "called-ae-title")]
    called_ae_title: Option<String>,
    /// the response timeout in seconds
    #[arg(long = "timeout", default_value = "30")]
    timeout: u64,
}

fn main() {
    let App {
        addr,
        verbose,
        calling_ae_title,
        called_ae_title,
        timeout,
    } = App::parse();

    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(if verbose { Level::DEBUG } else { Level::INFO })
            .finish(),
    )
    .unwrap_or_else(|e| {
        eprintln!("[ERROR] {}", Report::from_error(e));
    });

    if verbose {
        info!("Establishing association with '{}'...", &addr);
    }

    let result = EchoScu::open(
        &calling_ae_title,
        called_ae_title.as_deref().unwrap_or("ANY-SCP"),
        &addr,
    )
    .map(|scu| scu.response_timeout(Duration::from_secs(timeout)))
    .and_then(|mut scu| {
        let state = scu.echo()?;
        scu.close()?;
        Ok(state)
    });

    match result {
        Ok(state) if state.status() == 0 => {
            info!("C-ECHO completed successfully");
        }
        Ok(state) => {
            error!("C-ECHO failed with status {:04X}H", state.status());
            std::process::exit(-2);
        }
        Err(e) => {
            error!("{}", Report::from_error(e));
            std::process::exit(-2);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::App;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        App::command().debug_assert();
    }
}
