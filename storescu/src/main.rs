use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use snafu::{Report, ResultExt, Whatever};
use tracing::{error, info, Level};

use opal_dimse::progress::DicomProgress;
use opal_services::store::scan::Scanner;
use opal_services::store::scu::{StoreScu, StoreScuOptions};
use opal_transcode::NativeCodec;

/// DICOM C-STORE SCU
#[derive(Debug, Parser)]
#[command(version)]
struct App {
    /// socket address to Store SCP,
    /// optionally with AE title
    /// (example: "STORE-SCP@127.0.0.1:104")
    addr: String,
    /// the DICOM file(s) to store
    #[arg(required = true)]
    files: Vec<PathBuf>,
    /// verbose mode
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
    /// the calling Application Entity title
    #[arg(long = "calling-ae-title", default_value = "STORE-SCU")]
    calling_ae_title: String,
    /// the called Application Entity title,
    /// overrides AE title in address if present [default: ANY-SCP]
    #[arg(long = "called-ae-title")]
    called_ae_title: Option<String>,
    /// the maximum PDU length accepted by the SCU
    #[arg(
        long = "max-pdu-length",
        default_value = "16384",
        value_parser(clap::value_parser!(u32).range(4096..=131_072))
    )]
    max_pdu_length: u32,
    /// fail file transfer if it cannot be done without transcoding
    #[arg(long = "never-transcode")]
    never_transcode: bool,
    /// quality for lossy JPEG re-encoding
    #[arg(long = "jpeg-quality")]
    jpeg_quality: Option<u8>,
    /// propose common extended negotiation for each storage SOP class
    #[arg(long = "extended-negotiation")]
    extended_negotiation: bool,
    /// print one mark per scanned file instead of a progress bar
    #[arg(long = "printout")]
    printout: bool,
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
    // pre-association scan of all the given roots
    let scanner = Scanner::new()
        .with_printout(app.printout)
        .with_extended_negotiation(app.extended_negotiation);
    let outcome = scanner
        .scan(&app.files)
        .whatever_context("could not scan input files")?;

    if outcome.entries.is_empty() {
        eprintln!("No supported files to transfer");
        std::process::exit(-1);
    }
    if app.verbose {
        info!(
            "{} file(s) to send, {} skipped, {} presentation context(s)",
            outcome.entries.len(),
            outcome.skipped,
            outcome.presentation_contexts.len()
        );
        info!("Establishing association with '{}'...", &app.addr);
    }

    let options = StoreScuOptions {
        never_transcode: app.never_transcode,
        jpeg_quality: app.jpeg_quality,
        common_extended_negotiations: outcome.common_extended_negotiations.clone(),
        max_pdu_length: Some(app.max_pdu_length),
        ..StoreScuOptions::default()
    };
    let mut scu = StoreScu::open(
        &app.calling_ae_title,
        app.called_ae_title.as_deref().unwrap_or("ANY-SCP"),
        &app.addr,
        &outcome.presentation_contexts,
        options,
    )
    .whatever_context("could not establish association")?;

    if app.verbose {
        info!("Association established");
    }

    let progress = DicomProgress::new();
    let progress_bar = if !app.verbose && !app.printout {
        let bar = ProgressBar::new(outcome.entries.len() as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} {wide_msg}")
                .expect("Invalid progress bar template"),
        );
        bar.enable_steady_tick(Duration::new(0, 480_000_000));
        let bar_handle = bar.clone();
        progress.add_listener(Box::new(move |p| {
            bar_handle.set_position((p.completed() + p.failed() + p.warning()) as u64);
            if let Some(path) = p.processed_file() {
                bar_handle.set_message(path.display().to_string());
            }
        }));
        Some(bar)
    } else {
        None
    };

    let mut outcome = outcome;
    let state = scu
        .send_all(&outcome.entries, &progress, &NativeCodec)
        .whatever_context("store failed")?;
    scu.close().whatever_context("could not release")?;
    outcome.cleanup();

    if let Some(bar) = progress_bar {
        bar.finish_with_message("done");
    }

    info!(
        "sent {} object(s) ({} kB), {} failed, {} warning",
        progress.completed(),
        progress.total_size() / 1_000,
        progress.failed(),
        progress.warning()
    );
    if progress.failed() > 0 || (state.status() != 0x0000 && !matches!(state.status(), 0xB000 | 0xB006 | 0xB007)) {
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
