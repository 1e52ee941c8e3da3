use std::path::PathBuf;

use clap::Parser;
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::{open_file, InMemDicomObject};
use snafu::{Report, ResultExt, Whatever};
use tracing::{error, info, Level};

use opal_dimse::progress::DicomProgress;
use opal_services::query::InformationModel;
use opal_services::retrieve::{MoveScu, RetrieveOptions};

mod query;
use query::parse_queries;

/// DICOM C-MOVE SCU
#[derive(Debug, Parser)]
#[command(version)]
struct App {
    /// socket address to MOVE SCP (example: "127.0.0.1:1045")
    addr: String,
    /// a DICOM file representing the query object
    file: Option<PathBuf>,
    /// a sequence of queries
    #[arg(short('q'))]
    query: Vec<String>,

    /// verbose mode
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
    /// the calling AE title
    #[arg(long = "calling-ae-title", default_value = "MOVE-SCU")]
    calling_ae_title: String,
    /// the called AE title
    #[arg(long = "called-ae-title")]
    called_ae_title: Option<String>,
    /// the C-MOVE destination AE title
    #[arg(long = "move-destination", default_value = "STORE-SCP")]
    move_destination: String,

    /// use patient root information model
    #[arg(short = 'P', long, conflicts_with = "study")]
    patient: bool,
    /// use study root information model (default)
    #[arg(short = 'S', long, conflicts_with = "patient")]
    study: bool,

    /// issue a cancel request after this many pending responses
    #[arg(long = "cancel-after", default_value = "0")]
    cancel_after: u32,
    /// release the association right after a cancel is issued
    #[arg(long = "release-eager")]
    release_eager: bool,
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
    let model = if app.patient {
        InformationModel::PatientRoot
    } else {
        InformationModel::StudyRoot
    };

    let base = if let Some(file) = &app.file {
        open_file(file)
            .whatever_context("could not open query file")?
            .into_inner()
    } else {
        InMemDicomObject::new_empty()
    };
    if app.query.is_empty() && app.file.is_none() {
        snafu::whatever!("query not specified");
    }
    let mut keys = parse_queries(base, &app.query)?;
    if keys.get(tags::QUERY_RETRIEVE_LEVEL).is_none() {
        let level = if app.patient { "PATIENT" } else { "STUDY" };
        keys.put(DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            PrimitiveValue::from(level),
        ));
    }

    info!("sending C-MOVE request to {}", app.addr);

    let mut scu = MoveScu::open(
        &app.calling_ae_title,
        app.called_ae_title.as_deref().unwrap_or("ANY-SCP"),
        &app.addr,
        model,
    )
    .whatever_context("could not set up the move SCU")?;

    let options = RetrieveOptions {
        cancel_after: app.cancel_after,
        release_eager: app.release_eager,
        ..RetrieveOptions::default()
    };
    let progress = DicomProgress::new();
    let state = scu
        .retrieve(&keys, &app.move_destination, &options, &progress)
        .whatever_context("move failed")?;
    scu.close().whatever_context("could not release")?;

    info!(
        "move ended with status {:04X}H: {} completed, {} failed, {} warning",
        state.status(),
        progress.completed(),
        progress.failed(),
        progress.warning()
    );
    if state.status() != 0x0000 {
        std::process::exit(-2);
    }
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
