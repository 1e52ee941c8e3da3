//! The retrieve services (C-MOVE and C-GET) as service class users.
//!
//! A C-MOVE asks the peer to send the matching objects
//! to a third-party destination application entity;
//! the responses only carry sub-operation counters.
//! A C-GET retrieves the objects through the *same* association:
//! the SCU also acts as a storage SCP,
//! negotiating the SCP role for every storage SOP class
//! it is willing to receive.

use std::path::PathBuf;
use std::sync::Arc;

use dicom_object::{InMemDicomObject, StandardDataDictionary};
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::{debug, info, warn};

use opal_dimse::commands::{self, CommandField, Priority};
use opal_dimse::message;
use opal_dimse::mux::Multiplexer;
use opal_dimse::progress::{DicomProgress, DicomState};
use opal_dimse::status::{codes, StatusType};
use opal_ul::association::{ClientAssociation, ClientAssociationOptions};

use crate::capability::TransferCapabilities;
use crate::query::InformationModel;
use crate::store::scp::store_object_bytes;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// could not establish the association
    Establish {
        source: opal_ul::association::client::Error,
    },

    /// could not set up the request multiplexer
    Multiplex { source: opal_dimse::mux::Error },

    #[snafu(display("no presentation context accepted for `{}`", sop_class_uid))]
    NoContext { sop_class_uid: String },

    #[snafu(display("information model {:?} does not support this retrieve service", model))]
    UnsupportedModel { model: InformationModel },

    /// could not encode the retrieve identifier
    EncodeIdentifier { source: dicom_object::WriteError },

    /// the retrieve operation failed
    Retrieve { source: opal_dimse::mux::Error },

    /// failed to exchange messages on the retrieve association
    Exchange {
        source: opal_dimse::message::ReadError,
    },

    #[snafu(display("bad command set on retrieve association: {}", message))]
    BadCommand { message: String },

    /// failed to send a message on the retrieve association
    Send {
        source: opal_dimse::message::WriteError,
    },

    /// failed to release the association
    Release { source: opal_ul::association::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Options for one retrieve operation.
#[derive(Debug, Clone, Default)]
pub struct RetrieveOptions {
    /// the request priority
    pub priority: Priority,
    /// issue a C-CANCEL-RQ after this many pending responses; zero disables
    pub cancel_after: u32,
    /// release the association as soon as a cancel is issued,
    /// without waiting for outstanding responses
    pub release_eager: bool,
}

/// A C-MOVE service class user bound to one information model.
pub struct MoveScu {
    mux: Option<Multiplexer>,
    pc_id: u8,
    sop_class_uid: &'static str,
}

impl MoveScu {
    /// Establish an association proposing the C-MOVE SOP class
    /// of the given information model.
    pub fn open(
        calling_ae_title: &str,
        called_ae_title: &str,
        address: &str,
        model: InformationModel,
    ) -> Result<MoveScu> {
        let sop_class_uid = model.move_uid().context(UnsupportedModelSnafu { model })?;
        let association = ClientAssociationOptions::new()
            .calling_ae_title(calling_ae_title.to_string())
            .called_ae_title(called_ae_title.to_string())
            .with_presentation_context(sop_class_uid, Vec::<String>::new())
            .establish_with(address)
            .context(EstablishSnafu)?;

        let pc_id = association
            .contexts()
            .accepted()
            .find(|pc| pc.abstract_syntax == sop_class_uid)
            .map(|pc| pc.id)
            .context(NoContextSnafu { sop_class_uid })?;

        let mux = Multiplexer::new(association).context(MultiplexSnafu)?;
        Ok(MoveScu {
            mux: Some(mux),
            pc_id,
            sop_class_uid,
        })
    }

    /// Ask the peer to move the matching objects to `destination_aet`.
    ///
    /// The sub-operation counters of each response are lifted
    /// into the progress handle, whose listeners are notified
    /// at every response boundary.
    pub fn retrieve(
        &mut self,
        keys: &InMemDicomObject<StandardDataDictionary>,
        destination_aet: &str,
        options: &RetrieveOptions,
        progress: &Arc<DicomProgress>,
    ) -> Result<DicomState> {
        let mux = self.mux.as_ref().expect("association is open");
        let sop_class_uid = self.sop_class_uid;
        let context = mux
            .contexts()
            .get(self.pc_id)
            .expect("negotiated context is present");

        let mut identifier = Vec::with_capacity(256);
        encode_with_ts(keys, &context.transfer_syntax, &mut identifier)
            .context(EncodeIdentifierSnafu)?;

        let priority = options.priority;
        let destination = destination_aet.to_string();
        let mut handle = mux
            .send_request(self.pc_id, Some(identifier), |message_id| {
                commands::move_rq(message_id, sop_class_uid, &destination, priority)
            })
            .context(RetrieveSnafu)?;

        let mut state = DicomState::new(Arc::clone(progress));
        let mut responses: u32 = 0;
        loop {
            let response = handle.recv().context(RetrieveSnafu)?;
            progress.update_from_command(&response.command);

            match response.kind {
                StatusType::Pending => {
                    responses += 1;
                    let cancel_now = (options.cancel_after != 0
                        && responses >= options.cancel_after)
                        || progress.is_cancelled();
                    if cancel_now && !handle.is_cancelled() {
                        debug!("issuing C-CANCEL-RQ after {} responses", responses);
                        handle.cancel().context(RetrieveSnafu)?;
                        if options.release_eager {
                            // do not wait for the outstanding responses
                            state.set_status(codes::CANCEL);
                            drop(handle);
                            return Ok(state);
                        }
                    }
                }
                _ => {
                    state.set_status(response.status);
                    if response.kind == StatusType::Failure {
                        warn!(
                            "move ended with status {:04X}H",
                            response.status
                        );
                    } else {
                        info!(
                            "move complete: {} completed, {} failed, {} warning",
                            progress.completed(),
                            progress.failed(),
                            progress.warning()
                        );
                    }
                    break;
                }
            }
        }

        Ok(state)
    }

    /// Release the association.
    pub fn close(mut self) -> Result<()> {
        if let Some(mux) = self.mux.take() {
            mux.release().context(RetrieveSnafu)?;
        }
        Ok(())
    }
}

/// A C-GET service class user bound to one information model.
///
/// The retrieve identifier and the retrieved objects travel
/// over the same association, so this SCU also registers
/// the storage role for the SOP classes it accepts.
pub struct GetScu {
    association: Option<ClientAssociation>,
    pc_id: u8,
    sop_class_uid: &'static str,
    storage_dir: PathBuf,
}

impl GetScu {
    /// Establish an association proposing the C-GET SOP class
    /// plus one storage context per SOP class in `capabilities`,
    /// each with the role selection `scu = false, scp = true`.
    ///
    /// Retrieved objects are written below `storage_dir`.
    pub fn open(
        calling_ae_title: &str,
        called_ae_title: &str,
        address: &str,
        model: InformationModel,
        capabilities: &TransferCapabilities,
        storage_dir: impl Into<PathBuf>,
    ) -> Result<GetScu> {
        let sop_class_uid = model.get_uid().context(UnsupportedModelSnafu { model })?;
        let mut options = ClientAssociationOptions::new()
            .calling_ae_title(calling_ae_title.to_string())
            .called_ae_title(called_ae_title.to_string())
            .with_presentation_context(sop_class_uid, Vec::<String>::new());

        for capability in capabilities.iter() {
            options = options
                .with_presentation_context(
                    capability.sop_class_uid.clone(),
                    capability.transfer_syntax_uids.clone(),
                )
                .with_role_selection(capability.sop_class_uid.clone(), false, true);
        }

        let association = options.establish_with(address).context(EstablishSnafu)?;
        let pc_id = association
            .contexts()
            .accepted()
            .find(|pc| pc.abstract_syntax == sop_class_uid)
            .map(|pc| pc.id)
            .context(NoContextSnafu { sop_class_uid })?;

        Ok(GetScu {
            association: Some(association),
            pc_id,
            sop_class_uid,
            storage_dir: storage_dir.into(),
        })
    }

    /// Retrieve the matching objects through this association.
    ///
    /// Inbound C-STORE requests are stored below the storage directory
    /// and acknowledged on the same association.
    /// Cancellation is honored conservatively:
    /// an object currently being received is always
    /// written out and acknowledged before the cancel flag is consulted.
    pub fn retrieve(
        &mut self,
        keys: &InMemDicomObject<StandardDataDictionary>,
        options: &RetrieveOptions,
        progress: &Arc<DicomProgress>,
    ) -> Result<DicomState> {
        let contexts = self
            .association
            .as_ref()
            .expect("association is open")
            .contexts()
            .clone();
        let get_ts = contexts
            .get(self.pc_id)
            .expect("negotiated context is present")
            .transfer_syntax
            .clone();

        let mut identifier = Vec::with_capacity(256);
        encode_with_ts(keys, &get_ts, &mut identifier).context(EncodeIdentifierSnafu)?;

        // the retrieve request itself is message ID 1;
        // no other request goes out on this association
        let message_id = 1;
        let command = commands::get_rq(message_id, self.sop_class_uid, options.priority);
        message::write_message(
            self.association.as_mut().expect("association is open"),
            self.pc_id,
            &command,
            Some(&identifier),
        )
        .context(SendSnafu)?;

        let mut state = DicomState::new(Arc::clone(progress));
        let mut responses: u32 = 0;
        let mut cancelled = false;

        loop {
            let incoming = {
                let association = self.association.as_mut().expect("association is open");
                message::read_message(association).context(ExchangeSnafu)?
            };
            let field = commands::command_field(&incoming.command).map_err(|e| {
                Error::BadCommand {
                    message: e.to_string(),
                }
            })?;

            match field {
                CommandField::CGetRsp => {
                    let status = commands::status(&incoming.command).unwrap_or(codes::CANNOT_UNDERSTAND);
                    progress.update_from_command(&incoming.command);
                    match opal_dimse::status::classify(status) {
                        StatusType::Pending => {
                            responses += 1;
                            let cancel_now = (options.cancel_after != 0
                                && responses >= options.cancel_after)
                                || progress.is_cancelled();
                            if cancel_now && !cancelled {
                                debug!("issuing C-CANCEL-RQ after {} responses", responses);
                                let cancel = commands::cancel_rq(message_id);
                                message::write_message(
                                    self.association.as_mut().expect("association is open"),
                                    self.pc_id,
                                    &cancel,
                                    None,
                                )
                                .context(SendSnafu)?;
                                cancelled = true;
                            }
                        }
                        _ => {
                            state.set_status(status);
                            break;
                        }
                    }
                }
                CommandField::CStoreRq => {
                    // an object coming back through this association;
                    // finish writing it before looking at the cancel flag
                    self.handle_inbound_store(incoming, &contexts, progress)?;
                }
                field => {
                    warn!("ignoring unexpected {:?} on retrieve association", field);
                }
            }
        }

        info!(
            "get complete: {} completed, {} failed, {} warning",
            progress.completed(),
            progress.failed(),
            progress.warning()
        );
        Ok(state)
    }

    fn handle_inbound_store(
        &mut self,
        incoming: opal_dimse::message::DicomMessage,
        contexts: &opal_ul::context::NegotiatedContexts,
        progress: &Arc<DicomProgress>,
    ) -> Result<()> {
        let association = self.association.as_mut().expect("association is open");
        let message_id = commands::message_id(&incoming.command).unwrap_or(1);
        let cuid = commands::affected_sop_class_uid(&incoming.command).unwrap_or_default();
        let iuid = commands::affected_sop_instance_uid(&incoming.command).unwrap_or_default();
        let pcid = incoming.presentation_context_id;

        let transfer_syntax = contexts
            .get(pcid)
            .map(|pc| pc.transfer_syntax.clone())
            .unwrap_or_default();

        let status = match incoming.data {
            Some(data) => {
                match store_object_bytes(&self.storage_dir, None, &cuid, &iuid, &transfer_syntax, &data)
                {
                    Ok(path) => {
                        debug!("stored {}", path.display());
                        progress.set_processed_file(path);
                        progress.notify();
                        codes::SUCCESS
                    }
                    Err(e) => {
                        warn!("failed to store retrieved object: {}", e);
                        codes::CANNOT_UNDERSTAND
                    }
                }
            }
            None => codes::CANNOT_UNDERSTAND,
        };

        let response = commands::store_rsp(message_id, &cuid, &iuid, status);
        message::write_message(association, pcid, &response, None).context(SendSnafu)?;
        Ok(())
    }

    /// Release the association.
    pub fn close(mut self) -> Result<()> {
        if let Some(mut association) = self.association.take() {
            association.release().context(ReleaseSnafu)?;
        }
        Ok(())
    }
}

fn encode_with_ts(
    keys: &InMemDicomObject<StandardDataDictionary>,
    transfer_syntax_uid: &str,
    out: &mut Vec<u8>,
) -> std::result::Result<(), dicom_object::WriteError> {
    use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
    use dicom_transfer_syntax_registry::{entries, TransferSyntaxRegistry};
    match TransferSyntaxRegistry.get(transfer_syntax_uid) {
        Some(ts) => keys.write_dataset_with_ts(out, ts),
        None => keys.write_dataset_with_ts(out, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased()),
    }
}
