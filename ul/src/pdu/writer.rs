//! PDU encoding.
//!
//! Each PDU body is assembled in memory first,
//! with the nested item lengths patched in as the items close,
//! and then committed to the stream behind one six byte header.
//! This keeps the stream write a single fallible step
//! and makes the length bookkeeping local to [`BodyBuilder`].

use byteordered::byteorder::{BigEndian, WriteBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{Backtrace, ResultExt, Snafu};
use std::io::Write;

use crate::pdu::*;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("could not encode text field `{}`", field))]
    EncodeText {
        field: &'static str,
        #[snafu(backtrace)]
        source: dicom_encoding::text::EncodeTextError,
    },

    /// could not write the PDU to the stream
    WriteStream {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Write one PDU to `writer`.
pub fn write_pdu<W>(writer: &mut W, pdu: &Pdu) -> Result<()>
where
    W: Write,
{
    let (pdu_type, body) = match pdu {
        Pdu::AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        } => {
            let mut body = BodyBuilder::default();
            body.associate_preamble(*protocol_version, called_ae_title, calling_ae_title)?;
            body.item(0x10, |b| {
                b.text(application_context_name, "Application-context-name")
            })?;
            for pc in presentation_contexts {
                body.item(0x20, |b| {
                    b.u8(pc.id);
                    b.zeros(3);
                    b.uid_item(0x30, &pc.abstract_syntax, "Abstract-syntax-name")?;
                    for transfer_syntax in &pc.transfer_syntaxes {
                        b.uid_item(0x40, transfer_syntax, "Transfer-syntax-name")?;
                    }
                    Ok(())
                })?;
            }
            body.user_information(user_variables)?;
            (0x01, body.bytes)
        }
        Pdu::AssociationAC {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts,
            user_variables,
        } => {
            let mut body = BodyBuilder::default();
            // the AE title fields of an AC are reserved:
            // they echo the request and are not tested when received
            body.associate_preamble(*protocol_version, called_ae_title, calling_ae_title)?;
            body.item(0x10, |b| {
                b.text(application_context_name, "Application-context-name")
            })?;
            for pc in presentation_contexts {
                body.item(0x21, |b| {
                    b.u8(pc.id);
                    b.u8(0);
                    b.u8(pc.reason.clone() as u8);
                    b.u8(0);
                    b.uid_item(0x40, &pc.transfer_syntax, "Transfer-syntax-name")
                })?;
            }
            body.user_information(user_variables)?;
            (0x02, body.bytes)
        }
        Pdu::AssociationRJ { result, source } => {
            let (source_code, reason_code) = reject_codes(source);
            let result_code = match result {
                AssociationRJResult::Permanent => 0x01,
                AssociationRJResult::Transient => 0x02,
            };
            (0x03, vec![0x00, result_code, source_code, reason_code])
        }
        Pdu::PData { data } => {
            let mut body = BodyBuilder::default();
            for pdv in data {
                // PDV length covers the context id,
                // the control header and the fragment bytes
                body.be32(pdv.data.len() as u32 + 2);
                body.u8(pdv.presentation_context_id);
                let mut control = 0x00;
                if pdv.value_type == PDataValueType::Command {
                    control |= 0x01;
                }
                if pdv.is_last {
                    control |= 0x02;
                }
                body.u8(control);
                body.raw(&pdv.data);
            }
            (0x04, body.bytes)
        }
        Pdu::ReleaseRQ => (0x05, vec![0; 4]),
        Pdu::ReleaseRP => (0x06, vec![0; 4]),
        Pdu::AbortRQ { source } => {
            let (source_code, reason_code) = abort_codes(source);
            (0x07, vec![0x00, 0x00, source_code, reason_code])
        }
        Pdu::Unknown { pdu_type, data } => (*pdu_type, data.clone()),
    };

    writer.write_u8(pdu_type).context(WriteStreamSnafu)?;
    writer.write_u8(0x00).context(WriteStreamSnafu)?;
    writer
        .write_u32::<BigEndian>(body.len() as u32)
        .context(WriteStreamSnafu)?;
    writer.write_all(&body).context(WriteStreamSnafu)
}

/// An append-only buffer for the body of one PDU.
///
/// Items and length-prefixed fields reserve their length slot up front
/// and patch it once their content is in place.
#[derive(Default)]
struct BodyBuilder {
    bytes: Vec<u8>,
}

impl BodyBuilder {
    fn u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    fn be16(&mut self, value: u16) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    fn be32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    fn raw(&mut self, value: &[u8]) {
        self.bytes.extend_from_slice(value);
    }

    fn zeros(&mut self, count: usize) {
        self.bytes.resize(self.bytes.len() + count, 0);
    }

    fn text(&mut self, value: &str, field: &'static str) -> Result<()> {
        let encoded = DefaultCharacterSetCodec
            .encode(value)
            .context(EncodeTextSnafu { field })?;
        self.raw(&encoded);
        Ok(())
    }

    /// An application entity name, space padded to its fixed 16 bytes.
    fn ae_title(&mut self, value: &str, field: &'static str) -> Result<()> {
        let mut encoded = DefaultCharacterSetCodec
            .encode(value)
            .context(EncodeTextSnafu { field })?;
        encoded.resize(16, b' ');
        self.raw(&encoded);
        Ok(())
    }

    /// The fixed fields every associate PDU opens with:
    /// protocol version, reserved bytes,
    /// the two AE title fields and the 32 reserved bytes.
    fn associate_preamble(
        &mut self,
        protocol_version: u16,
        called_ae_title: &str,
        calling_ae_title: &str,
    ) -> Result<()> {
        self.be16(protocol_version);
        self.be16(0);
        self.ae_title(called_ae_title, "Called-AE-title")?;
        self.ae_title(calling_ae_title, "Calling-AE-title")?;
        self.zeros(32);
        Ok(())
    }

    /// One `(type, reserved, u16 length, content)` item.
    fn item<F>(&mut self, kind: u8, fill: F) -> Result<()>
    where
        F: FnOnce(&mut BodyBuilder) -> Result<()>,
    {
        self.u8(kind);
        self.u8(0);
        self.counted(fill)
    }

    /// A `u16` length-prefixed run, patched after `fill` completes.
    fn counted<F>(&mut self, fill: F) -> Result<()>
    where
        F: FnOnce(&mut BodyBuilder) -> Result<()>,
    {
        let patch = self.bytes.len();
        self.be16(0);
        fill(self)?;
        let length = (self.bytes.len() - patch - 2) as u16;
        self.bytes[patch..patch + 2].copy_from_slice(&length.to_be_bytes());
        Ok(())
    }

    /// An item holding nothing but a UID.
    fn uid_item(&mut self, kind: u8, uid: &str, field: &'static str) -> Result<()> {
        self.item(kind, |b| b.text(uid, field))
    }

    /// A `u16` length-prefixed UID, as used inside user sub-items.
    fn counted_uid(&mut self, uid: &str, field: &'static str) -> Result<()> {
        self.counted(|b| b.text(uid, field))
    }

    /// The user information item with all its sub-items.
    fn user_information(&mut self, user_variables: &[UserVariableItem]) -> Result<()> {
        if user_variables.is_empty() {
            return Ok(());
        }
        self.item(0x50, |b| {
            for variable in user_variables {
                match variable {
                    UserVariableItem::MaxLength(max_length) => {
                        b.item(0x51, |b| {
                            b.be32(*max_length);
                            Ok(())
                        })?;
                    }
                    UserVariableItem::ImplementationClassUID(uid) => {
                        b.uid_item(0x52, uid, "Implementation-class-uid")?;
                    }
                    UserVariableItem::AsyncOperationsWindow(invoked, performed) => {
                        b.item(0x53, |b| {
                            b.be16(*invoked);
                            b.be16(*performed);
                            Ok(())
                        })?;
                    }
                    UserVariableItem::RoleSelection(role) => {
                        b.item(0x54, |b| {
                            b.counted_uid(&role.sop_class_uid, "SOP-class-uid")?;
                            b.u8(role.scu_role as u8);
                            b.u8(role.scp_role as u8);
                            Ok(())
                        })?;
                    }
                    UserVariableItem::ImplementationVersionName(name) => {
                        b.uid_item(0x55, name, "Implementation-version-name")?;
                    }
                    UserVariableItem::SopClassExtendedNegotiation(uid, info) => {
                        b.item(0x56, |b| {
                            b.counted_uid(uid, "SOP-class-uid")?;
                            // service class application information, verbatim
                            b.raw(info);
                            Ok(())
                        })?;
                    }
                    UserVariableItem::SopClassCommonExtendedNegotiation(negotiation) => {
                        b.item(0x57, |b| {
                            b.counted_uid(&negotiation.sop_class_uid, "SOP-class-uid")?;
                            b.counted_uid(&negotiation.service_class_uid, "Service-class-uid")?;
                            b.counted(|b| {
                                for uid in &negotiation.related_general_sop_class_uids {
                                    b.counted_uid(uid, "Related-general-sop-class-uid")?;
                                }
                                Ok(())
                            })
                        })?;
                    }
                    UserVariableItem::Unknown(kind, data) => {
                        b.item(*kind, |b| {
                            b.raw(data);
                            Ok(())
                        })?;
                    }
                }
            }
            Ok(())
        })
    }
}

fn reject_codes(source: &AssociationRJSource) -> (u8, u8) {
    match source {
        AssociationRJSource::ServiceUser(reason) => {
            let reason = match reason {
                AssociationRJServiceUserReason::NoReasonGiven => 0x01,
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported => 0x02,
                AssociationRJServiceUserReason::CallingAETitleNotRecognized => 0x03,
                AssociationRJServiceUserReason::CalledAETitleNotRecognized => 0x07,
                AssociationRJServiceUserReason::Reserved(code) => *code,
            };
            (0x01, reason)
        }
        AssociationRJSource::ServiceProviderAsce(reason) => {
            let reason = match reason {
                AssociationRJServiceProviderAsceReason::NoReasonGiven => 0x01,
                AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported => 0x02,
            };
            (0x02, reason)
        }
        AssociationRJSource::ServiceProviderPresentation(reason) => {
            let reason = match reason {
                AssociationRJServiceProviderPresentationReason::TemporaryCongestion => 0x01,
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => 0x02,
                AssociationRJServiceProviderPresentationReason::Reserved(code) => *code,
            };
            (0x03, reason)
        }
    }
}

fn abort_codes(source: &AbortRQSource) -> (u8, u8) {
    match source {
        AbortRQSource::ServiceUser => (0x00, 0x00),
        AbortRQSource::Reserved => (0x01, 0x00),
        AbortRQSource::ServiceProvider(reason) => {
            let reason = match reason {
                AbortRQServiceProviderReason::ReasonNotSpecifiedUnrecognizedPdu => 0x00,
                AbortRQServiceProviderReason::UnrecognizedPdu => 0x01,
                AbortRQServiceProviderReason::UnexpectedPdu => 0x02,
                AbortRQServiceProviderReason::Reserved => 0x03,
                AbortRQServiceProviderReason::UnrecognizedPduParameter => 0x04,
                AbortRQServiceProviderReason::UnexpectedPduParameter => 0x05,
                AbortRQServiceProviderReason::InvalidPduParameter => 0x06,
            };
            (0x02, reason)
        }
    }
}
