use std::path::PathBuf;

use clap::Parser;
use dicom_core::{DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_object::{open_file, InMemDicomObject};
use snafu::{Report, ResultExt, Whatever};
use tracing::{error, info, Level};

use opal_dimse::progress::DicomProgress;
use opal_services::find::{FindOptions, FindScu, OutputFormat};
use opal_services::query::InformationModel;

mod query;
use query::parse_queries;

/// DICOM C-FIND SCU
#[derive(Debug, Parser)]
#[command(version)]
struct App {
    /// socket address to FIND SCP (example: "QUERY-SCP@127.0.0.1:1045")
    addr: String,
    /// a DICOM file representing the query object
    file: Option<PathBuf>,
    /// a sequence of queries (example: "-q PatientName=Doe*")
    #[arg(short('q'))]
    query: Vec<String>,

    /// verbose mode
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
    /// the calling AE title
    #[arg(long = "calling-ae-title", default_value = "FIND-SCU")]
    calling_ae_title: String,
    /// the called AE title
    #[arg(long = "called-ae-title")]
    called_ae_title: Option<String>,

    /// use patient root information model
    #[arg(short = 'P', long, conflicts_with_all = ["study", "mwl", "ups"])]
    patient: bool,
    /// use study root information model (default)
    #[arg(short = 'S', long, conflicts_with_all = ["patient", "mwl", "ups"])]
    study: bool,
    /// use modality worklist information model
    #[arg(short = 'W', long, conflicts_with_all = ["patient", "study", "ups"])]
    mwl: bool,
    /// use unified procedure step information model
    #[arg(short = 'U', long, conflicts_with_all = ["patient", "study", "mwl"])]
    ups: bool,

    /// issue a cancel request after this many matches
    #[arg(long = "cancel-after", default_value = "0")]
    cancel_after: u32,
    /// directory to write matches into
    #[arg(short = 'o', long = "out-dir")]
    out_dir: Option<PathBuf>,
    /// counter file name pattern for match output
    #[arg(long = "out-pattern", default_value = "match-####.dcm")]
    out_pattern: String,
    /// write matches as DICOM JSON instead of bare data sets
    #[arg(long = "json")]
    json: bool,
    /// write all matches into one file
    #[arg(long = "concatenate")]
    concatenate: bool,
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
    let model = match (app.patient, app.mwl, app.ups) {
        (true, _, _) => InformationModel::PatientRoot,
        (_, true, _) => InformationModel::ModalityWorklist,
        (_, _, true) => InformationModel::UnifiedProcedureStep,
        _ => InformationModel::StudyRoot,
    };

    // base query from file, terms on top
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

    // infer the query retrieve level unless using a worklist model
    if !model.is_worklist_style() && keys.get(tags::QUERY_RETRIEVE_LEVEL).is_none() {
        let level = match model {
            InformationModel::PatientRoot => "PATIENT",
            _ => "STUDY",
        };
        keys.put(DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            PrimitiveValue::from(level),
        ));
    }

    let mut scu = FindScu::open(
        &app.calling_ae_title,
        app.called_ae_title.as_deref().unwrap_or("ANY-SCP"),
        &app.addr,
        model,
    )
    .whatever_context("could not set up the find SCU")?;

    let options = FindOptions {
        cancel_after: app.cancel_after,
        output_dir: app.out_dir.clone(),
        output_pattern: app.out_pattern.clone(),
        output_format: if app.json {
            OutputFormat::Json
        } else {
            OutputFormat::Dicom
        },
        concatenate: app.concatenate,
        ..FindOptions::default()
    };

    let progress = DicomProgress::new();
    let state = scu
        .find(&keys, &options, &progress, |number, identifier| {
            println!(
                "------------------------ Match #{} ------------------------",
                number
            );
            if let Some(name) = identifier
                .get(tags::PATIENT_NAME)
                .and_then(|e| e.to_str().ok())
            {
                println!("PatientName: {}", name);
            }
        })
        .whatever_context("query failed")?;
    scu.close().whatever_context("could not release")?;

    info!(
        "done: {} match(es), status {:04X}H",
        progress.completed(),
        state.status()
    );
    if state.status() != 0x0000 && state.status() != 0xFE00 {
        std::process::exit(-2);
    }
    Ok(())
}
