//! The retrieve-to-store forwarding proxy.
//!
//! The proxy accepts objects on one side (as a storage SCP)
//! and emits them on the other (as a C-STORE SCU),
//! optionally rewriting attributes and pixel data on the way.
//!
//! Objects whose stored transfer syntax is accepted by the destination
//! and which need no editing are spliced through byte for byte.
//! Everything else is parsed, run through the attribute editor chain,
//! adapted by the transcode pipeline when the pixel encoding changes,
//! and re-encoded for the destination association.

use std::net::TcpStream;
use std::sync::{Arc, Mutex};

use dicom_dictionary_std::uids;
use dicom_object::{InMemDicomObject, StandardDataDictionary};
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_transfer_syntax_registry::{entries, TransferSyntaxRegistry};
use snafu::{ResultExt, Snafu};
use tracing::{debug, info, warn};

use opal_dimse::commands::{self, CommandField, Priority};
use opal_dimse::message::{self, ReadError};
use opal_dimse::mux::Multiplexer;
use opal_dimse::progress::DicomProgress;
use opal_dimse::status::{self, codes, StatusType};
use opal_transcode::{transcode_object, AdaptTransferSyntax, ImageEditor, PixelCodec};
use opal_ul::address::DicomNode;
use opal_ul::association::server::ServerAssociationOptions;
use opal_ul::association::ClientAssociationOptions;
use opal_ul::pdu::Pdu;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// could not accept the source association
    Accept {
        source: opal_ul::association::server::Error,
    },

    /// the source association failed
    SourceExchange {
        source: opal_dimse::message::ReadError,
    },

    /// failed to respond on the source association
    SourceRespond {
        source: opal_dimse::message::WriteError,
    },

    /// could not open the destination association
    OpenDestination {
        source: opal_ul::association::client::Error,
    },

    /// could not set up the destination multiplexer
    Multiplex { source: opal_dimse::mux::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How an attribute editor wants the current object
/// or connection handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForwardAbort {
    /// carry on normally
    #[default]
    None,
    /// skip this object, recording a failure
    FileException,
    /// abort the destination association
    ConnectionException,
}

/// The context handed to each attribute editor.
pub struct EditorContext<'a> {
    /// the node the object came from
    pub source_node: &'a DicomNode,
    /// the node the object is forwarded to
    pub destination_node: &'a DicomNode,
    /// the transfer syntax the object arrived in
    pub original_transfer_syntax: &'a str,
    /// set by editors to skip the object or drop the connection
    pub abort: ForwardAbort,
    /// pixel-level mutations to run inside the transcode pipeline
    pub image_editors: Vec<Box<dyn ImageEditor>>,
}

/// An ordered attribute rewrite applied to each forwarded data set.
pub trait AttributeEditor: Send + Sync {
    fn edit(
        &self,
        obj: &mut InMemDicomObject<StandardDataDictionary>,
        context: &mut EditorContext<'_>,
    ) -> std::result::Result<(), String>;
}

struct DestinationLink {
    mux: Multiplexer,
    /// the presentation contexts this link was opened with
    covered: Vec<(String, Vec<String>)>,
}

/// A proxy between a retrieving peer and a destination peer.
pub struct ForwardingProxy {
    source_node: DicomNode,
    destination_node: DicomNode,
    editors: Vec<Box<dyn AttributeEditor>>,
    codec: Box<dyn PixelCodec>,
    progress: Arc<DicomProgress>,
    destination: Mutex<Option<DestinationLink>>,
}

impl ForwardingProxy {
    /// Create a proxy forwarding to `destination_node`,
    /// presenting itself as `source_node` on both sides.
    pub fn new(
        source_node: DicomNode,
        destination_node: DicomNode,
        codec: Box<dyn PixelCodec>,
    ) -> ForwardingProxy {
        ForwardingProxy {
            source_node,
            destination_node,
            editors: Vec::new(),
            codec,
            progress: DicomProgress::new(),
            destination: Mutex::new(None),
        }
    }

    /// Append an attribute editor to the rewrite chain.
    pub fn add_editor(&mut self, editor: Box<dyn AttributeEditor>) {
        self.editors.push(editor);
    }

    /// The progress handle tracking forwarded objects.
    pub fn progress(&self) -> &Arc<DicomProgress> {
        &self.progress
    }

    /// Drive one source-side association until release or abort,
    /// forwarding every stored object.
    pub fn handle_association(&self, stream: TcpStream) -> Result<()> {
        let options = ServerAssociationOptions::new()
            .accept_any()
            .ae_title(self.source_node.aet().to_string())
            .promiscuous(true)
            .with_abstract_syntax(uids::VERIFICATION);

        let mut association = options.establish(stream).context(AcceptSnafu)?;
        info!(
            "proxying association from {} towards {}",
            association.client_ae_title(),
            self.destination_node
        );

        loop {
            match message::read_message(&mut association) {
                Ok(incoming) => {
                    let field = match commands::command_field(&incoming.command) {
                        Ok(field) => field,
                        Err(e) => {
                            warn!("discarding message with bad command set: {}", e);
                            continue;
                        }
                    };
                    match field {
                        CommandField::CEchoRq => {
                            let message_id = commands::message_id(&incoming.command).unwrap_or(0);
                            let response =
                                commands::echo_rsp(message_id, uids::VERIFICATION, codes::SUCCESS);
                            message::write_message(
                                &mut association,
                                incoming.presentation_context_id,
                                &response,
                                None,
                            )
                            .context(SourceRespondSnafu)?;
                        }
                        CommandField::CStoreRq => {
                            let message_id = commands::message_id(&incoming.command).unwrap_or(1);
                            let cuid = commands::affected_sop_class_uid(&incoming.command)
                                .unwrap_or_default();
                            let iuid = commands::affected_sop_instance_uid(&incoming.command)
                                .unwrap_or_default();
                            let pcid = incoming.presentation_context_id;
                            let source_ts = association
                                .contexts()
                                .get(pcid)
                                .map(|pc| pc.transfer_syntax.clone())
                                .unwrap_or_default();

                            let status = match incoming.data {
                                Some(data) => {
                                    self.forward_object(&cuid, &iuid, &source_ts, data)
                                }
                                None => codes::CANNOT_UNDERSTAND,
                            };

                            let response = commands::store_rsp(message_id, &cuid, &iuid, status);
                            message::write_message(&mut association, pcid, &response, None)
                                .context(SourceRespondSnafu)?;
                        }
                        field => {
                            warn!("ignoring unsupported {:?} on proxy association", field);
                        }
                    }
                }
                Err(ReadError::Released) => {
                    let _ = association.send(&Pdu::ReleaseRP);
                    break;
                }
                Err(ReadError::PeerAborted) | Err(ReadError::ReceiveMessage { .. }) => break,
                Err(e) => return Err(e).context(SourceExchangeSnafu),
            }
        }
        Ok(())
    }

    /// Forward one object to the destination,
    /// returning the status to report back to the source.
    ///
    /// Any failure is recorded in the progress handle
    /// with the processing-failure status.
    pub fn forward_object(
        &self,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        source_transfer_syntax: &str,
        data: Vec<u8>,
    ) -> u16 {
        match self.try_forward(sop_class_uid, sop_instance_uid, source_transfer_syntax, data) {
            Ok(status) => status,
            Err(e) => {
                warn!("failed to forward {}: {}", sop_instance_uid, e);
                self.progress.add_failed();
                self.progress.notify();
                codes::PROCESSING_FAILURE
            }
        }
    }

    fn try_forward(
        &self,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        source_transfer_syntax: &str,
        data: Vec<u8>,
    ) -> std::result::Result<u16, Box<dyn std::error::Error>> {
        let mut destination = self.destination.lock().unwrap();
        self.ensure_destination(&mut destination, sop_class_uid, source_transfer_syntax)?;
        let link = destination.as_mut().expect("destination link is open");

        let context = link
            .mux
            .contexts()
            .select_transfer_syntax(sop_class_uid, source_transfer_syntax)?;
        let pc_id = context.id;
        let accepted_ts = context.transfer_syntax.clone();

        // fast path: nothing to edit and the destination
        // takes the source encoding, splice the bytes through
        let payload = if self.editors.is_empty() && accepted_ts == source_transfer_syntax {
            data
        } else {
            let (payload, pc_id_override) = self.rewrite(
                link,
                sop_class_uid,
                source_transfer_syntax,
                &accepted_ts,
                data,
            )?;
            match pc_id_override {
                ForwardPayload::Skip => {
                    self.progress.add_failed();
                    self.progress.notify();
                    return Ok(codes::PROCESSING_FAILURE);
                }
                ForwardPayload::DropConnection => {
                    if let Some(link) = destination.take() {
                        let _ = link.mux.abort();
                    }
                    self.progress.add_failed();
                    self.progress.notify();
                    return Ok(codes::PROCESSING_FAILURE);
                }
                ForwardPayload::Send(id) => {
                    // fall through with the possibly re-selected context
                    return self.send_to_destination(
                        destination,
                        id,
                        sop_class_uid,
                        sop_instance_uid,
                        payload,
                    );
                }
            }
        };

        self.send_to_destination(destination, pc_id, sop_class_uid, sop_instance_uid, payload)
    }

    fn send_to_destination(
        &self,
        mut destination: std::sync::MutexGuard<'_, Option<DestinationLink>>,
        pc_id: u8,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        payload: Vec<u8>,
    ) -> std::result::Result<u16, Box<dyn std::error::Error>> {
        let link = destination.as_mut().expect("destination link is open");
        let sop_class = sop_class_uid.to_string();
        let sop_instance = sop_instance_uid.to_string();
        let mut handle = link.mux.send_request(pc_id, Some(payload), |message_id| {
            commands::store_rq(message_id, &sop_class, &sop_instance, Priority::Medium)
        })?;
        drop(destination);

        let response = handle.recv()?;
        match status::classify_store(response.status) {
            StatusType::Success => self.progress.add_completed(),
            StatusType::Warning => self.progress.add_warning(),
            _ => self.progress.add_failed(),
        }
        self.progress.notify();
        Ok(response.status)
    }

    /// Parse, edit and re-encode one object.
    fn rewrite(
        &self,
        link: &DestinationLink,
        sop_class_uid: &str,
        source_transfer_syntax: &str,
        accepted_transfer_syntax: &str,
        data: Vec<u8>,
    ) -> std::result::Result<(Vec<u8>, ForwardPayload), Box<dyn std::error::Error>> {
        let source_ts = TransferSyntaxRegistry
            .get(source_transfer_syntax)
            .ok_or_else(|| format!("unknown transfer syntax {}", source_transfer_syntax))?;
        let mut object = InMemDicomObject::read_dataset_with_ts(data.as_slice(), source_ts)?;

        let mut context = EditorContext {
            source_node: &self.source_node,
            destination_node: &self.destination_node,
            original_transfer_syntax: source_transfer_syntax,
            abort: ForwardAbort::None,
            image_editors: Vec::new(),
        };
        for editor in &self.editors {
            editor.edit(&mut object, &mut context)?;
            match context.abort {
                ForwardAbort::None => {}
                ForwardAbort::FileException => {
                    return Ok((Vec::new(), ForwardPayload::Skip));
                }
                ForwardAbort::ConnectionException => {
                    return Ok((Vec::new(), ForwardPayload::DropConnection));
                }
            }
        }

        let mut syntax =
            AdaptTransferSyntax::new(source_transfer_syntax, accepted_transfer_syntax);
        transcode_object(
            &mut object,
            &mut syntax,
            self.codec.as_ref(),
            &context.image_editors,
        )?;

        // a downgrade may force a different context
        let context = link
            .mux
            .contexts()
            .select_transfer_syntax(sop_class_uid, &syntax.suitable)?;
        if context.transfer_syntax != syntax.suitable {
            return Err(format!(
                "destination does not accept the adapted transfer syntax {}",
                syntax.suitable
            )
            .into());
        }

        let fallback = entries::EXPLICIT_VR_LITTLE_ENDIAN.erased();
        let ts = TransferSyntaxRegistry
            .get(&syntax.suitable)
            .unwrap_or(&fallback);
        let mut payload = Vec::with_capacity(data.len());
        object.write_dataset_with_ts(&mut payload, ts)?;
        Ok((payload, ForwardPayload::Send(context.id)))
    }

    /// Make sure the destination association is open
    /// and covers `(SOP class, transfer syntax)`.
    ///
    /// When the open association does not cover the pair,
    /// outstanding responses are drained first,
    /// then the association is released
    /// and re-opened with the widened context list.
    fn ensure_destination(
        &self,
        destination: &mut Option<DestinationLink>,
        sop_class_uid: &str,
        source_transfer_syntax: &str,
    ) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let wanted = proposal_for(sop_class_uid, source_transfer_syntax);

        if let Some(link) = destination.as_ref() {
            if link
                .mux
                .contexts()
                .select_transfer_syntax(sop_class_uid, source_transfer_syntax)
                .is_ok()
            {
                return Ok(());
            }
            debug!(
                "destination association does not cover ({}, {}); reopening",
                sop_class_uid, source_transfer_syntax
            );
            let link = destination.take().expect("link is present");
            // drain in-flight responses before closing
            let _ = link.mux.wait_outstanding();
            let mut covered = link.covered.clone();
            let _ = link.mux.release();
            merge_proposal(&mut covered, wanted);
            *destination = Some(self.open_destination(covered)?);
            return Ok(());
        }

        *destination = Some(self.open_destination(vec![wanted])?);
        Ok(())
    }

    fn open_destination(
        &self,
        covered: Vec<(String, Vec<String>)>,
    ) -> std::result::Result<DestinationLink, Box<dyn std::error::Error>> {
        let mut options = ClientAssociationOptions::new()
            .calling_ae_title(self.source_node.aet().to_string())
            .called_ae_title(self.destination_node.aet().to_string());
        for (sop_class_uid, transfer_syntaxes) in &covered {
            options = options
                .with_presentation_context(sop_class_uid.clone(), transfer_syntaxes.clone());
        }
        let association = options
            .establish(self.destination_node.socket_addr().as_str())
            .context(OpenDestinationSnafu)?;
        let mux = Multiplexer::new(association).context(MultiplexSnafu)?;
        Ok(DestinationLink { mux, covered })
    }
}

/// What to do with a rewritten payload.
enum ForwardPayload {
    Send(u8),
    Skip,
    DropConnection,
}

fn proposal_for(sop_class_uid: &str, transfer_syntax: &str) -> (String, Vec<String>) {
    let mut transfer_syntaxes = vec![transfer_syntax.to_string()];
    for fallback in [uids::EXPLICIT_VR_LITTLE_ENDIAN, uids::IMPLICIT_VR_LITTLE_ENDIAN] {
        if fallback != transfer_syntax {
            transfer_syntaxes.push(fallback.to_string());
        }
    }
    (sop_class_uid.to_string(), transfer_syntaxes)
}

fn merge_proposal(
    covered: &mut Vec<(String, Vec<String>)>,
    (sop_class_uid, transfer_syntaxes): (String, Vec<String>),
) {
    if let Some((_, known)) = covered
        .iter_mut()
        .find(|(covered_class, _)| *covered_class == sop_class_uid)
    {
        for ts in transfer_syntaxes {
            if !known.contains(&ts) {
                known.push(ts);
            }
        }
    } else {
        covered.push((sop_class_uid, transfer_syntaxes));
    }
}
