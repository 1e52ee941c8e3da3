use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use snafu::{Report, ResultExt, Whatever};
use tracing::{error, Level};

use opal_services::path::FilePathPattern;
use opal_services::store::scp::{StorageScp, StorageScpOptions};

/// DICOM C-STORE SCP
#[derive(Debug, Parser)]
#[command(version)]
struct App {
    /// verbose mode
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
    /// the AE title of this provider
    #[arg(long = "ae-title", default_value = "STORE-SCP")]
    ae_title: String,
    /// which port to listen on
    #[arg(short, default_value = "11112")]
    port: u16,
    /// output directory for incoming objects
    #[arg(short = 'o', default_value = ".")]
    out_dir: PathBuf,
    /// file path pattern over DICOM tags,
    /// e.g. "{00080020,date,yyyy/MM/dd}/{00080018}.dcm"
    #[arg(long = "file-pattern")]
    file_pattern: Option<String>,
    /// calling AE titles authorized to store (repeatable);
    /// all callers are accepted when none is given
    #[arg(long = "authorize")]
    authorize: Vec<String>,
    /// only accept native/uncompressed transfer syntaxes
    #[arg(long)]
    uncompressed_only: bool,
    /// accept unknown SOP classes
    #[arg(long)]
    promiscuous: bool,
    /// max pdu length
    #[arg(
        short = 'm',
        long = "max-pdu-length",
        default_value = "16384",
        value_parser(clap::value_parser!(u32).range(4096..=131_072))
    )]
    max_pdu_length: u32,
    /// artificial delay in milliseconds before each object, for testing
    #[arg(long = "receive-delay")]
    receive_delay: Option<u64>,
    /// artificial delay in milliseconds before each response, for testing
    #[arg(long = "response-delay")]
    response_delay: Option<u64>,
}

fn main() {
    let app = App::parse();

    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(if app.verbose {
                Level::DEBUG
            } else {
                Level::INFO
            })
            .finish(),
    )
    .unwrap_or_else(|e| {
        eprintln!("[ERROR] {}", Report::from_error(e));
    });

    run(app).unwrap_or_else(|e| {
        error!("{}", Report::from_error(e));
        std::process::exit(-2);
    });
}

fn run(app: App) -> Result<(), Whatever> {
    std::fs::create_dir_all(&app.out_dir)
        .whatever_context("could not create output directory")?;

    let file_path_pattern = app
        .file_pattern
        .as_deref()
        .map(|pattern| pattern.parse::<FilePathPattern>())
        .transpose()
        .whatever_context("invalid file path pattern")?;

    let options = StorageScpOptions {
        ae_title: app.ae_title.clone(),
        storage_dir: app.out_dir.clone(),
        authorized_callers: app.authorize.clone(),
        file_path_pattern,
        uncompressed_only: app.uncompressed_only,
        promiscuous: app.promiscuous,
        max_pdu_length: app.max_pdu_length,
        receive_delay: app.receive_delay.map(Duration::from_millis),
        response_delay: app.response_delay.map(Duration::from_millis),
    };

    let listener = TcpListener::bind(("0.0.0.0", app.port))
        .whatever_context("could not bind listening socket")?;
    let scp = Arc::new(StorageScp::new(options));
    scp.listen(listener).whatever_context("listener failed")?;
    Ok(())
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
