//! The C-STORE service class user.
//!
//! Driven by a scan manifest (see [`scan`](crate::store::scan)),
//! the SCU opens one association proposing the accumulated
//! presentation contexts and sends every scanned object through it.
//!
//! When the peer accepts the transfer syntax an object is stored in,
//! the encoded data set is spliced from the file byte for byte;
//! otherwise the object is read, run through the transcode pipeline,
//! and re-encoded in the accepted syntax.

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use dicom_transfer_syntax_registry::entries;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::{ResultExt, Snafu};
use tracing::{debug, info, warn};

use opal_dimse::commands::{self, Priority};
use opal_dimse::mux::Multiplexer;
use opal_dimse::progress::{DicomProgress, DicomState};
use opal_dimse::status::{self, codes, StatusType};
use opal_transcode::{transcode_object, AdaptTransferSyntax, PixelCodec};
use opal_ul::association::ClientAssociationOptions;
use opal_ul::pdu::CommonExtendedNegotiation;

use crate::store::scan::ScanEntry;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// could not establish the association
    Establish {
        source: opal_ul::association::client::Error,
    },

    /// could not set up the request multiplexer
    Multiplex { source: opal_dimse::mux::Error },

    /// the store operation failed
    Store { source: opal_dimse::mux::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Options for the store pipeline.
#[derive(Debug, Clone, Default)]
pub struct StoreScuOptions {
    /// the request priority
    pub priority: Priority,
    /// never re-encode; objects without a matching context fail
    pub never_transcode: bool,
    /// quality for lossy JPEG re-encoding
    pub jpeg_quality: Option<u8>,
    /// common extended negotiation items from the scan
    pub common_extended_negotiations: Vec<CommonExtendedNegotiation>,
    /// the maximum PDU length to advertise
    pub max_pdu_length: Option<u32>,
}

/// A C-STORE service class user over one association.
pub struct StoreScu {
    mux: Option<Multiplexer>,
    options: StoreScuOptions,
}

impl StoreScu {
    /// Establish an association proposing the given presentation contexts,
    /// usually the ones accumulated by a scan.
    pub fn open(
        calling_ae_title: &str,
        called_ae_title: &str,
        address: &str,
        presentation_contexts: &[(String, Vec<String>)],
        options: StoreScuOptions,
    ) -> Result<StoreScu> {
        let mut builder = ClientAssociationOptions::new()
            .calling_ae_title(calling_ae_title.to_string())
            .called_ae_title(called_ae_title.to_string());
        for (sop_class_uid, transfer_syntaxes) in presentation_contexts {
            builder = builder
                .with_presentation_context(sop_class_uid.clone(), transfer_syntaxes.clone());
        }
        for negotiation in &options.common_extended_negotiations {
            builder = builder.with_common_extended_negotiation(negotiation.clone());
        }
        if let Some(max_pdu_length) = options.max_pdu_length {
            builder = builder.max_pdu_length(max_pdu_length);
        }

        let association = builder.establish_with(address).context(EstablishSnafu)?;
        let mux = Multiplexer::new(association).context(MultiplexSnafu)?;
        Ok(StoreScu {
            mux: Some(mux),
            options,
        })
    }

    /// Send every scanned object, updating `progress` per response.
    ///
    /// An empty manifest yields status `C000H` without any exchange.
    /// A cancelled progress handle aborts the association
    /// at the next response boundary and drains.
    pub fn send_all(
        &mut self,
        entries: &[ScanEntry],
        progress: &Arc<DicomProgress>,
        codec: &dyn PixelCodec,
    ) -> Result<DicomState> {
        let mut state = DicomState::new(Arc::clone(progress));
        if entries.is_empty() {
            state.set_status(codes::CANNOT_UNDERSTAND);
            state.set_message("no DICOM files found");
            return Ok(state);
        }

        progress.set_remaining(entries.len());

        for entry in entries {
            if progress.is_cancelled() {
                info!("store cancelled, aborting association");
                if let Some(mux) = self.mux.take() {
                    let _ = mux.abort();
                }
                state.set_status(codes::CANCEL);
                return Ok(state);
            }

            match self.send_one(entry, progress, codec) {
                Ok(status) => {
                    state.set_status(status);
                }
                Err(e) => {
                    progress.add_failed();
                    progress.notify();
                    warn!("failed to store {}: {}", entry.path.display(), e);
                    state.set_status(codes::PROCESSING_FAILURE);
                }
            }
        }

        if let Some(mux) = self.mux.as_ref() {
            let _ = mux.wait_outstanding();
        }
        Ok(state)
    }

    /// Send one object, classify its response status,
    /// and update the counters.
    fn send_one(
        &mut self,
        entry: &ScanEntry,
        progress: &Arc<DicomProgress>,
        codec: &dyn PixelCodec,
    ) -> std::result::Result<u16, Box<dyn std::error::Error>> {
        let mux = self.mux.as_ref().expect("association is open");

        let context = mux
            .contexts()
            .select_transfer_syntax(&entry.sop_class_uid, &entry.transfer_syntax_uid)?;
        let mut pc_id = context.id;
        let target_ts = context.transfer_syntax.clone();

        let data = if target_ts == entry.transfer_syntax_uid {
            // splice path: the peer accepts the stored encoding,
            // send the file's data set bytes unchanged
            let mut file = std::fs::File::open(&entry.path)?;
            file.seek(SeekFrom::Start(entry.file_meta_end))?;
            let mut data = Vec::with_capacity(
                entry.file_size.saturating_sub(entry.file_meta_end) as usize,
            );
            file.read_to_end(&mut data)?;
            data
        } else if self.options.never_transcode {
            return Err(format!(
                "no presentation context accepts {} and transcoding is disabled",
                entry.transfer_syntax_uid
            )
            .into());
        } else {
            // adaptation path: re-encode the object
            // in the negotiated transfer syntax
            debug!(
                "{}: adapting {} -> {}",
                entry.path.display(),
                entry.transfer_syntax_uid,
                target_ts
            );
            let mut object = dicom_object::open_file(&entry.path)?;
            let mut syntax =
                AdaptTransferSyntax::new(entry.transfer_syntax_uid.clone(), target_ts.clone());
            if let Some(quality) = self.options.jpeg_quality {
                syntax = syntax.with_jpeg_quality(quality);
            }
            transcode_object(&mut object, &mut syntax, codec, &[])?;

            // the pipeline may have downgraded the suitable syntax;
            // the advertised context must match it
            let context = mux
                .contexts()
                .select_transfer_syntax(&entry.sop_class_uid, &syntax.suitable)?;
            if context.transfer_syntax != syntax.suitable {
                return Err(format!(
                    "no presentation context accepts the adapted transfer syntax {}",
                    syntax.suitable
                )
                .into());
            }
            pc_id = context.id;

            let fallback = entries::EXPLICIT_VR_LITTLE_ENDIAN.erased();
            let ts = TransferSyntaxRegistry
                .get(&syntax.suitable)
                .unwrap_or(&fallback);
            let mut data = Vec::with_capacity(entry.file_size as usize);
            object.write_dataset_with_ts(&mut data, ts)?;
            data
        };

        let priority = self.options.priority;
        let sop_class_uid = entry.sop_class_uid.clone();
        let sop_instance_uid = entry.sop_instance_uid.clone();
        let mut handle = mux.send_request(pc_id, Some(data), |message_id| {
            commands::store_rq(message_id, &sop_class_uid, &sop_instance_uid, priority)
        })?;

        let response = handle.recv()?;
        match status::classify_store(response.status) {
            StatusType::Success => {
                progress.add_completed();
                progress.add_total_size(entry.file_size);
            }
            StatusType::Warning => {
                warn!(
                    "stored {} with warning (status {:04X}H)",
                    entry.sop_instance_uid, response.status
                );
                progress.add_warning();
                progress.add_total_size(entry.file_size);
            }
            _ => {
                warn!(
                    "failed to store {} (status {:04X}H)",
                    entry.sop_instance_uid, response.status
                );
                progress.add_failed();
            }
        }
        progress.set_processed_file(&entry.path);
        progress.notify();
        Ok(response.status)
    }

    /// Release the association.
    pub fn close(mut self) -> Result<()> {
        if let Some(mux) = self.mux.take() {
            mux.release().context(StoreSnafu)?;
        }
        Ok(())
    }
}
