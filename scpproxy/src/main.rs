use std::net::TcpListener;
use std::sync::Arc;

use clap::Parser;
use snafu::{Report, ResultExt, Whatever};
use tracing::{error, info, warn, Level};

use opal_services::proxy::ForwardingProxy;
use opal_transcode::NativeCodec;
use opal_ul::DicomNode;

/// DICOM forwarding proxy:
/// accepts stored objects and forwards them to a destination node
#[derive(Debug, Parser)]
#[command(version)]
struct App {
    /// the destination node (example: "ARCHIVE@pacs.example.org:104")
    destination: String,
    /// the AE title this proxy presents on both sides
    #[arg(long = "ae-title", default_value = "FWD-PROXY")]
    ae_title: String,
    /// the port that we will listen for SCU connections on
    #[arg(short = 'l', long = "listen-port", default_value = "3333")]
    listen_port: u16,
    /// verbose mode
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
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
    let destination_addr: opal_ul::AeAddr = app
        .destination
        .parse()
        .whatever_context("invalid destination address")?;
    let destination =
        DicomNode::from_ae_addr(&destination_addr).whatever_context("invalid destination node")?;
    let source = DicomNode::new(app.ae_title.clone(), "0.0.0.0", app.listen_port)
        .whatever_context("invalid AE title")?;

    let proxy = Arc::new(ForwardingProxy::new(
        source,
        destination,
        Box::new(NativeCodec),
    ));

    let listener = TcpListener::bind(("0.0.0.0", app.listen_port))
        .whatever_context("could not bind listening socket")?;
    info!("listening on 0.0.0.0:{}", app.listen_port);
    info!("forwarding to {}", app.destination);

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let proxy = Arc::clone(&proxy);
                std::thread::spawn(move || {
                    if let Err(e) = proxy.handle_association(stream) {
                        warn!("association ended with error: {}", Report::from_error(e));
                    }
                });
            }
            Err(e) => {
                warn!("could not accept connection: {}", e);
            }
        }
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
