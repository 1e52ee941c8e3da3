//! PDU decoding.
//!
//! A PDU arrives as a six byte header (type, reserved, big endian length)
//! followed by its body. The body is buffered whole and then walked by a
//! bounds-checked [`Decoder`], so that a short PDU surfaces as a decode
//! error naming the field, never as an I/O error in the middle of a frame.

use byteordered::byteorder::{BigEndian, ReadBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use std::io::{ErrorKind, Read};
use tracing::warn;

use crate::pdu::*;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// no PDU available: the stream ended before a full header arrived
    NoPduAvailable { backtrace: Backtrace },

    /// could not read the PDU header
    ReadHeader {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not read the PDU body
    ReadBody {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("invalid maximum PDU length {}", max_pdu_length))]
    InvalidMaxPdu {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "incoming PDU too large: length {}, maximum is {}",
        pdu_length,
        max_pdu_length
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("PDU ended while decoding `{}`", field))]
    Truncated {
        field: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("unsupported {} code {}", field, code))]
    UnsupportedCode {
        field: &'static str,
        code: u8,
        backtrace: Backtrace,
    },

    #[snafu(display("invalid presentation data value length {}", length))]
    InvalidPdvLength { length: u32, backtrace: Backtrace },

    #[snafu(display("association PDU without {}", item))]
    MissingItem {
        item: &'static str,
        backtrace: Backtrace,
    },

    /// the acceptor answered a presentation context
    /// with more than one transfer syntax
    AmbiguousTransferSyntax { backtrace: Backtrace },

    #[snafu(display("could not decode text field `{}`", field))]
    DecodeText {
        field: &'static str,
        #[snafu(backtrace)]
        source: dicom_encoding::text::DecodeTextError,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Read one PDU from `reader`.
///
/// In strict mode, a PDU longer than `max_pdu_length` is an error;
/// otherwise oversized PDUs are tolerated up to the absolute maximum
/// of the standard, with a warning.
pub fn read_pdu<R>(reader: &mut R, max_pdu_length: u32, strict: bool) -> Result<Pdu>
where
    R: Read,
{
    ensure!(
        (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&max_pdu_length),
        InvalidMaxPduSnafu { max_pdu_length }
    );

    // A blocked read often wakes up because the peer closed the stream.
    // End of stream on the header therefore means "no more PDUs" rather
    // than a framing problem; inside the body it stays an I/O error.
    let mut pdu_type = [0u8; 2];
    if let Err(e) = reader.read_exact(&mut pdu_type) {
        ensure!(e.kind() != ErrorKind::UnexpectedEof, NoPduAvailableSnafu);
        return Err(e).context(ReadHeaderSnafu);
    }
    let pdu_type = pdu_type[0];
    let pdu_length = reader.read_u32::<BigEndian>().context(ReadHeaderSnafu)?;

    if pdu_length > max_pdu_length {
        ensure!(
            !strict,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length
            }
        );
        ensure!(
            pdu_length <= MAXIMUM_PDU_SIZE,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length: MAXIMUM_PDU_SIZE
            }
        );
        warn!(
            "tolerating oversized PDU: length {}, negotiated maximum is {}",
            pdu_length, max_pdu_length
        );
    }

    let mut body = vec![0; pdu_length as usize];
    reader.read_exact(&mut body).context(ReadBodySnafu)?;

    match pdu_type {
        // A-ASSOCIATE-RQ and A-ASSOCIATE-AC share their whole layout;
        // they only differ in which presentation context items they carry
        0x01 | 0x02 => decode_associate(pdu_type, Decoder::over(&body)),
        0x03 => decode_reject(Decoder::over(&body)),
        0x04 => decode_pdata(Decoder::over(&body)),
        // A-RELEASE-RQ and -RP carry 4 reserved bytes,
        // sent as zero but not tested when received
        0x05 => Ok(Pdu::ReleaseRQ),
        0x06 => Ok(Pdu::ReleaseRP),
        0x07 => decode_abort(Decoder::over(&body)),
        _ => Ok(Pdu::Unknown {
            pdu_type,
            data: body,
        }),
    }
}

/// A bounds-checked walker over the body of one PDU.
///
/// Every read names the wire field it is after,
/// so running off the end reports *what* was truncated.
struct Decoder<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Decoder<'a> {
    fn over(data: &'a [u8]) -> Decoder<'a> {
        Decoder { data, position: 0 }
    }

    fn is_empty(&self) -> bool {
        self.position >= self.data.len()
    }

    fn take(&mut self, count: usize, field: &'static str) -> Result<&'a [u8]> {
        let end = self
            .position
            .checked_add(count)
            .filter(|end| *end <= self.data.len())
            .context(TruncatedSnafu { field })?;
        let bytes = &self.data[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    /// All bytes not yet consumed.
    fn rest(&mut self) -> &'a [u8] {
        let bytes = &self.data[self.position..];
        self.position = self.data.len();
        bytes
    }

    fn u8(&mut self, field: &'static str) -> Result<u8> {
        Ok(self.take(1, field)?[0])
    }

    fn u16(&mut self, field: &'static str) -> Result<u16> {
        let bytes = self.take(2, field)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self, field: &'static str) -> Result<u32> {
        let bytes = self.take(4, field)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn skip(&mut self, count: usize, field: &'static str) -> Result<()> {
        self.take(count, field).map(|_| ())
    }

    /// A fixed-width text field, trimmed of padding.
    fn text(&mut self, count: usize, field: &'static str) -> Result<String> {
        let bytes = self.take(count, field)?;
        decode_text(bytes, field)
    }

    /// A `u16` length-prefixed UID, as used inside user sub-items.
    fn counted_uid(&mut self, field: &'static str) -> Result<String> {
        let count = self.u16(field)? as usize;
        self.text(count, field)
    }

    /// Everything not yet consumed, as trimmed text.
    fn rest_text(&mut self, field: &'static str) -> Result<String> {
        let bytes = self.rest();
        decode_text(bytes, field)
    }

    /// A sub-decoder over the next `count` bytes.
    fn sub(&mut self, count: usize, field: &'static str) -> Result<Decoder<'a>> {
        Ok(Decoder::over(self.take(count, field)?))
    }

    /// The next `(type, reserved, u16 length, body)` item,
    /// or `None` at the end of this decoder's range.
    fn next_item(&mut self) -> Result<Option<(u8, Decoder<'a>)>> {
        if self.is_empty() {
            return Ok(None);
        }
        let kind = self.u8("Item-type")?;
        self.skip(1, "item reserved byte")?;
        let length = self.u16("Item-length")? as usize;
        Ok(Some((kind, self.sub(length, "item body")?)))
    }
}

fn decode_text(bytes: &[u8], field: &'static str) -> Result<String> {
    Ok(DefaultCharacterSetCodec
        .decode(bytes)
        .context(DecodeTextSnafu { field })?
        .trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
        .trim_start()
        .to_string())
}

fn decode_associate(pdu_type: u8, mut body: Decoder) -> Result<Pdu> {
    let protocol_version = body.u16("Protocol-version")?;
    body.skip(2, "reserved")?;
    // fixed 16-character application entity names, space padded;
    // in an AC these fields merely echo the request
    let called_ae_title = body.text(16, "Called-AE-title")?;
    let calling_ae_title = body.text(16, "Calling-AE-title")?;
    body.skip(32, "reserved")?;

    let mut application_context_name = None;
    let mut proposed = Vec::new();
    let mut results = Vec::new();
    let mut user_variables = Vec::new();

    while let Some((kind, item)) = body.next_item()? {
        match (kind, pdu_type) {
            (0x10, _) => {
                let mut item = item;
                application_context_name =
                    Some(item.rest_text("Application-context-name")?);
            }
            (0x20, 0x01) => proposed.push(decode_context_proposal(item)?),
            (0x21, 0x02) => results.push(decode_context_result(item)?),
            (0x50, _) => user_variables = decode_user_information(item)?,
            (other, _) => {
                return UnsupportedCodeSnafu {
                    field: "association item type",
                    code: other,
                }
                .fail();
            }
        }
    }

    let application_context_name =
        application_context_name.context(MissingItemSnafu {
            item: "an application context item",
        })?;

    if pdu_type == 0x01 {
        Ok(Pdu::AssociationRQ {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts: proposed,
            user_variables,
        })
    } else {
        Ok(Pdu::AssociationAC {
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            presentation_contexts: results,
            user_variables,
        })
    }
}

/// A proposed presentation context:
/// the context identifier, one abstract syntax sub-item,
/// and one or more transfer syntax sub-items.
fn decode_context_proposal(mut item: Decoder) -> Result<PresentationContextProposed> {
    let id = item.u8("Presentation-context-ID")?;
    item.skip(3, "reserved")?;

    let mut abstract_syntax = None;
    let mut transfer_syntaxes = Vec::new();
    while let Some((kind, mut sub)) = item.next_item()? {
        match kind {
            0x30 => abstract_syntax = Some(sub.rest_text("Abstract-syntax-name")?),
            0x40 => transfer_syntaxes.push(sub.rest_text("Transfer-syntax-name")?),
            other => {
                return UnsupportedCodeSnafu {
                    field: "presentation context sub-item",
                    code: other,
                }
                .fail();
            }
        }
    }

    Ok(PresentationContextProposed {
        id,
        abstract_syntax: abstract_syntax.context(MissingItemSnafu {
            item: "an abstract syntax sub-item",
        })?,
        transfer_syntaxes,
    })
}

/// A negotiated presentation context:
/// the context identifier, the result/reason code,
/// and exactly one transfer syntax sub-item
/// (only significant on acceptance).
fn decode_context_result(mut item: Decoder) -> Result<PresentationContextResult> {
    let id = item.u8("Presentation-context-ID")?;
    item.skip(1, "reserved")?;
    let reason_code = item.u8("Result/Reason")?;
    let reason =
        PresentationContextResultReason::from(reason_code).context(UnsupportedCodeSnafu {
            field: "presentation context result",
            code: reason_code,
        })?;
    item.skip(1, "reserved")?;

    let mut transfer_syntax = None;
    while let Some((kind, mut sub)) = item.next_item()? {
        ensure!(
            kind == 0x40,
            UnsupportedCodeSnafu {
                field: "presentation context result sub-item",
                code: kind,
            }
        );
        // the acceptor commits to at most one transfer syntax per context
        ensure!(transfer_syntax.is_none(), AmbiguousTransferSyntaxSnafu);
        transfer_syntax = Some(sub.rest_text("Transfer-syntax-name")?);
    }

    Ok(PresentationContextResult {
        id,
        reason,
        transfer_syntax: transfer_syntax.context(MissingItemSnafu {
            item: "a transfer syntax sub-item",
        })?,
    })
}

fn decode_user_information(mut item: Decoder) -> Result<Vec<UserVariableItem>> {
    let mut user_variables = Vec::new();
    while let Some((kind, mut sub)) = item.next_item()? {
        let variable = match kind {
            0x51 => UserVariableItem::MaxLength(sub.u32("Maximum-length-received")?),
            0x52 => UserVariableItem::ImplementationClassUID(
                sub.rest_text("Implementation-class-uid")?,
            ),
            0x53 => UserVariableItem::AsyncOperationsWindow(
                sub.u16("Maximum-number-operations-invoked")?,
                sub.u16("Maximum-number-operations-performed")?,
            ),
            0x54 => {
                let sop_class_uid = sub.counted_uid("SOP-class-uid")?;
                UserVariableItem::RoleSelection(RoleSelection {
                    sop_class_uid,
                    scu_role: sub.u8("SCU-role")? == 1,
                    scp_role: sub.u8("SCP-role")? == 1,
                })
            }
            0x55 => UserVariableItem::ImplementationVersionName(
                sub.rest_text("Implementation-version-name")?,
            ),
            0x56 => {
                let sop_class_uid = sub.counted_uid("SOP-class-uid")?;
                // the service class application information
                // takes the rest of the sub-item, verbatim
                UserVariableItem::SopClassExtendedNegotiation(
                    sop_class_uid,
                    sub.rest().to_vec(),
                )
            }
            0x57 => {
                let sop_class_uid = sub.counted_uid("SOP-class-uid")?;
                let service_class_uid = sub.counted_uid("Service-class-uid")?;
                let related_length =
                    sub.u16("Related-general-sop-class-identification-length")? as usize;
                let mut related =
                    sub.sub(related_length, "related general SOP class identification")?;
                let mut related_general_sop_class_uids = Vec::new();
                while !related.is_empty() {
                    related_general_sop_class_uids
                        .push(related.counted_uid("Related-general-sop-class-uid")?);
                }
                UserVariableItem::SopClassCommonExtendedNegotiation(CommonExtendedNegotiation {
                    sop_class_uid,
                    service_class_uid,
                    related_general_sop_class_uids,
                })
            }
            // anything else is carried verbatim for the service layer
            other => UserVariableItem::Unknown(other, sub.rest().to_vec()),
        };
        user_variables.push(variable);
    }
    Ok(user_variables)
}

fn decode_reject(mut body: Decoder) -> Result<Pdu> {
    body.skip(1, "reserved")?;
    let result_code = body.u8("Result")?;
    let result = AssociationRJResult::from(result_code).context(UnsupportedCodeSnafu {
        field: "reject result",
        code: result_code,
    })?;
    let source_code = body.u8("Source")?;
    let reason_code = body.u8("Reason/Diag.")?;
    let source =
        AssociationRJSource::from(source_code, reason_code).context(UnsupportedCodeSnafu {
            field: "reject source/reason",
            code: reason_code,
        })?;
    Ok(Pdu::AssociationRJ { result, source })
}

fn decode_pdata(mut body: Decoder) -> Result<Pdu> {
    let mut data = Vec::new();
    while !body.is_empty() {
        // PDV length covers the context id, the control header
        // and the fragment bytes
        let length = body.u32("PDV Item-length")?;
        ensure!(length >= 2, InvalidPdvLengthSnafu { length });
        let mut pdv = body.sub(length as usize, "presentation data value")?;

        let presentation_context_id = pdv.u8("Presentation-context-ID")?;
        // message control header:
        // bit 0 set marks a command fragment,
        // bit 1 set marks the last fragment of its stream
        let control = pdv.u8("Message Control Header")?;

        data.push(PDataValue {
            presentation_context_id,
            value_type: if control & 0x01 != 0 {
                PDataValueType::Command
            } else {
                PDataValueType::Data
            },
            is_last: control & 0x02 != 0,
            data: pdv.rest().to_vec(),
        });
    }
    Ok(Pdu::PData { data })
}

fn decode_abort(mut body: Decoder) -> Result<Pdu> {
    body.skip(2, "reserved")?;
    let source_code = body.u8("Source")?;
    let reason_code = body.u8("Reason/Diag")?;
    let source = AbortRQSource::from(source_code, reason_code).context(UnsupportedCodeSnafu {
        field: "abort source/reason",
        code: source_code,
    })?;
    Ok(Pdu::AbortRQ { source })
}
