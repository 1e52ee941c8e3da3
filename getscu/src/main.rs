use std::path::PathBuf;

use clap::Parser;
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::{open_file, InMemDicomObject};
use snafu::{Report, ResultExt, Whatever};
use tracing::{error, info, Level};

use opal_dimse::progress::DicomProgress;
use opal_services::capability::TransferCapabilities;
use opal_services::query::InformationModel;
use opal_services::retrieve::{GetScu, RetrieveOptions};

mod query;
use query::parse_queries;

/// DICOM C-GET SCU
#[derive(Debug, Parser)]
#[command(version)]
struct App {
    /// socket address to GET SCP (example: "127.0.0.1:1045")
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
    #[arg(long = "calling-ae-title", default_value = "GET-SCU")]
    calling_ae_title: String,
    /// the called AE title
    #[arg(long = "called-ae-title")]
    called_ae_title: Option<String>,

    /// use patient root information model
    #[arg(short = 'P', long, conflicts_with = "study")]
    patient: bool,
    /// use study root information model (default)
    #[arg(short = 'S', long, conflicts_with = "patient")]
    study: bool,

    /// output directory for retrieved objects
    #[arg(short = 'o', default_value = ".")]
    out_dir: PathBuf,
    /// a transfer capability file naming the storage SOP classes
    /// to accept; the common storage classes are used by default
    #[arg(long = "transfer-capability")]
    transfer_capability: Option<PathBuf>,
    /// issue a cancel request after this many pending responses
    #[arg(long = "cancel-after", default_value = "0")]
    cancel_after: u32,
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

    let capabilities = match &app.transfer_capability {
        Some(path) => {
            TransferCapabilities::load(path).whatever_context("could not load capability file")?
        }
        None => TransferCapabilities::common_storage(),
    };

    std::fs::create_dir_all(&app.out_dir)
        .whatever_context("could not create output directory")?;

    let mut scu = GetScu::open(
        &app.calling_ae_title,
        app.called_ae_title.as_deref().unwrap_or("ANY-SCP"),
        &app.addr,
        model,
        &capabilities,
        app.out_dir.clone(),
    )
    .whatever_context("could not set up the get SCU")?;

    let options = RetrieveOptions {
        cancel_after: app.cancel_after,
        ..RetrieveOptions::default()
    };
    let progress = DicomProgress::new();
    let state = scu
        .retrieve(&keys, &options, &progress)
        .whatever_context("get failed")?;
    scu.close().whatever_context("could not release")?;

    info!(
        "get ended with status {:04X}H: {} completed, {} failed, {} warning",
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
