//! Assembly and emission of whole DIMSE messages.
//!
//! A DIMSE message is a command set followed by an optional data set,
//! carried over an association as a sequence of presentation data values.
//! Command fragments are always encoded in implicit VR little endian;
//! data set fragments use the transfer syntax
//! accepted for their presentation context.

use dicom_object::{InMemDicomObject, StandardDataDictionary};
use dicom_transfer_syntax_registry::entries;
use opal_ul::association::{ClientAssociation, ServerAssociation};
use opal_ul::context::NegotiatedContexts;
use opal_ul::pdu::{PDataValue, PDataValueType, Pdu};
use snafu::{ResultExt, Snafu};

use crate::commands;

/// Common interface over the two association endpoint types,
/// giving the message layer a single channel abstraction.
pub trait AssociationChannel {
    /// Send a PDU over the association.
    fn send(&mut self, pdu: &Pdu) -> opal_ul::association::Result<()>;
    /// Receive the next PDU from the association.
    fn receive(&mut self) -> opal_ul::association::Result<Pdu>;
    /// The negotiated presentation contexts of this association.
    fn contexts(&self) -> &NegotiatedContexts;
    /// The maximum PDU length that the peer is willing to receive.
    fn peer_max_pdu_length(&self) -> u32;
}

impl AssociationChannel for ClientAssociation {
    fn send(&mut self, pdu: &Pdu) -> opal_ul::association::Result<()> {
        ClientAssociation::send(self, pdu)
    }
    fn receive(&mut self) -> opal_ul::association::Result<Pdu> {
        ClientAssociation::receive(self)
    }
    fn contexts(&self) -> &NegotiatedContexts {
        ClientAssociation::contexts(self)
    }
    fn peer_max_pdu_length(&self) -> u32 {
        self.acceptor_max_pdu_length()
    }
}

impl AssociationChannel for ServerAssociation {
    fn send(&mut self, pdu: &Pdu) -> opal_ul::association::Result<()> {
        ServerAssociation::send(self, pdu)
    }
    fn receive(&mut self) -> opal_ul::association::Result<Pdu> {
        ServerAssociation::receive(self)
    }
    fn contexts(&self) -> &NegotiatedContexts {
        ServerAssociation::contexts(self)
    }
    fn peer_max_pdu_length(&self) -> u32 {
        self.requestor_max_pdu_length()
    }
}

/// A DIMSE message:
/// a parsed command set plus the raw bytes of its data set, if any.
///
/// The data set is kept as bytes so that callers may
/// parse it, stream it to a file, or splice it onwards verbatim.
pub struct DicomMessage {
    /// the parsed command set
    pub command: InMemDicomObject<StandardDataDictionary>,
    /// the data set bytes, in the transfer syntax of the context
    pub data: Option<Vec<u8>>,
    /// the presentation context which carried the message
    pub presentation_context_id: u8,
}

impl std::fmt::Debug for DicomMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.data {
            Some(data) => write!(
                f,
                "DicomMessage {{ command, data: {} bytes, pcid: {} }}",
                data.len(),
                self.presentation_context_id
            ),
            None => write!(
                f,
                "DicomMessage {{ command, pcid: {} }}",
                self.presentation_context_id
            ),
        }
    }
}

impl DicomMessage {
    /// Parse the data set bytes with the transfer syntax
    /// accepted for this message's presentation context.
    pub fn data_object(
        &self,
        contexts: &NegotiatedContexts,
    ) -> Result<Option<InMemDicomObject<StandardDataDictionary>>, ReadError> {
        use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
        use dicom_transfer_syntax_registry::TransferSyntaxRegistry;

        let Some(data) = &self.data else {
            return Ok(None);
        };
        let context = contexts
            .get(self.presentation_context_id)
            .ok_or(ReadError::NoPresentationContext {
                id: self.presentation_context_id,
            })?;
        let ts = TransferSyntaxRegistry
            .get(&context.transfer_syntax)
            .ok_or_else(|| ReadError::UnknownTransferSyntax {
                uid: context.transfer_syntax.clone(),
            })?;
        let obj = InMemDicomObject::read_dataset_with_ts(data.as_slice(), ts)
            .context(ReadDataSetSnafu)?;
        Ok(Some(obj))
    }
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ReadError {
    /// failed to receive from the association
    ReceiveMessage {
        source: opal_ul::association::Error,
    },

    /// failed to read the command set object
    ReadCommandSet { source: dicom_object::ReadError },

    /// failed to read the data set object
    ReadDataSet { source: dicom_object::ReadError },

    #[snafu(display("unexpected PDU while reading message: {}", description))]
    UnexpectedPdu { description: String },

    /// received message fragments out of order
    OutOfOrder,

    #[snafu(display("presentation context {} was not negotiated", id))]
    NoPresentationContext { id: u8 },

    #[snafu(display("unknown transfer syntax with UID `{}`", uid))]
    UnknownTransferSyntax { uid: String },

    /// the peer released the association
    Released,

    /// the peer aborted the association
    PeerAborted,
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum WriteError {
    /// failed to send over the association
    SendMessage {
        source: opal_ul::association::Error,
    },

    /// failed to write the command set object
    WriteCommandSet { source: dicom_object::WriteError },

    #[snafu(display("presentation context {} was not negotiated", id))]
    NotNegotiated { id: u8 },
}

/// Incremental assembly of one DIMSE message
/// from presentation data values.
///
/// Feed fragments in arrival order with [`push`](Self::push);
/// a complete message is returned as soon as its last fragment
/// is consumed, after which the assembler is ready for the next message.
#[derive(Default)]
pub struct MessageAssembler {
    command_fragments: Vec<u8>,
    data_fragments: Vec<u8>,
    command: Option<InMemDicomObject<StandardDataDictionary>>,
    presentation_context_id: Option<u8>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Digest one presentation data value.
    pub fn push(&mut self, mut pdv: PDataValue) -> Result<Option<DicomMessage>, ReadError> {
        // fragments of one message must share the same presentation context
        let pcid = *self
            .presentation_context_id
            .get_or_insert(pdv.presentation_context_id);
        if pcid != pdv.presentation_context_id {
            return OutOfOrderSnafu.fail();
        }
        match pdv.value_type {
            PDataValueType::Command => {
                if self.command.is_some() || !self.data_fragments.is_empty() {
                    // command fragments may not follow
                    // the start of the data set
                    return OutOfOrderSnafu.fail();
                }
                self.command_fragments.append(&mut pdv.data);
                if !pdv.is_last {
                    return Ok(None);
                }
                let obj = InMemDicomObject::read_dataset_with_ts(
                    self.command_fragments.as_slice(),
                    &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
                )
                .context(ReadCommandSetSnafu)?;
                self.command_fragments.clear();

                if commands::has_data_set(&obj) {
                    self.command = Some(obj);
                    Ok(None)
                } else {
                    self.presentation_context_id = None;
                    Ok(Some(DicomMessage {
                        command: obj,
                        data: None,
                        presentation_context_id: pcid,
                    }))
                }
            }
            PDataValueType::Data => {
                if self.command.is_none() {
                    // data fragments cannot precede the complete command set
                    return OutOfOrderSnafu.fail();
                }
                self.data_fragments.append(&mut pdv.data);
                if !pdv.is_last {
                    return Ok(None);
                }
                self.presentation_context_id = None;
                Ok(Some(DicomMessage {
                    command: self.command.take().expect("command set present"),
                    data: Some(std::mem::take(&mut self.data_fragments)),
                    presentation_context_id: pcid,
                }))
            }
        }
    }
}

/// Read PDUs from the channel until one whole DIMSE message
/// has been assembled.
///
/// A release request or an abort from the peer
/// surfaces as [`ReadError::Released`] or [`ReadError::PeerAborted`].
pub fn read_message<C>(channel: &mut C) -> Result<DicomMessage, ReadError>
where
    C: AssociationChannel,
{
    let mut assembler = MessageAssembler::new();

    loop {
        let pdu = channel.receive().context(ReceiveMessageSnafu)?;
        match pdu {
            Pdu::PData { data } => {
                for pdv in data {
                    if let Some(message) = assembler.push(pdv)? {
                        return Ok(message);
                    }
                }
            }
            Pdu::ReleaseRQ => return ReleasedSnafu.fail(),
            Pdu::AbortRQ { .. } => return PeerAbortedSnafu.fail(),
            pdu => {
                return UnexpectedPduSnafu {
                    description: pdu.short_description(),
                }
                .fail()
            }
        }
    }
}

/// Send one whole DIMSE message over the channel:
/// the command set in implicit VR little endian,
/// followed by the data set bytes, if any,
/// fragmented to honor the peer's maximum PDU length.
pub fn write_message<C>(
    channel: &mut C,
    presentation_context_id: u8,
    command: &InMemDicomObject<StandardDataDictionary>,
    data: Option<&[u8]>,
) -> Result<(), WriteError>
where
    C: AssociationChannel,
{
    snafu::ensure!(
        channel.contexts().is_accepted(presentation_context_id),
        NotNegotiatedSnafu {
            id: presentation_context_id
        }
    );

    let mut command_data = Vec::with_capacity(128);
    command
        .write_dataset_with_ts(
            &mut command_data,
            &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
        )
        .context(WriteCommandSetSnafu)?;

    // a message's P-DATA-TF must not exceed the peer's maximum PDU length;
    // PDV header (6) plus PDU header (6) are accounted for
    let max_fragment = max_fragment_length(channel.peer_max_pdu_length());

    send_fragmented(
        channel,
        presentation_context_id,
        PDataValueType::Command,
        &command_data,
        max_fragment,
    )?;

    if let Some(data) = data {
        send_fragmented(
            channel,
            presentation_context_id,
            PDataValueType::Data,
            data,
            max_fragment,
        )?;
    }

    Ok(())
}

fn max_fragment_length(peer_max_pdu_length: u32) -> usize {
    use opal_ul::pdu::{DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE};
    let max_pdu = if peer_max_pdu_length == 0 || peer_max_pdu_length > MAXIMUM_PDU_SIZE {
        // no maximum specified: pick a reasonable cap
        DEFAULT_MAX_PDU
    } else {
        peer_max_pdu_length
    };
    // PDV item length (4), context id (1), message control header (1)
    (max_pdu as usize).saturating_sub(6).max(1)
}

fn send_fragmented<C>(
    channel: &mut C,
    presentation_context_id: u8,
    value_type: PDataValueType,
    bytes: &[u8],
    max_fragment: usize,
) -> Result<(), WriteError>
where
    C: AssociationChannel,
{
    let mut chunks = bytes.chunks(max_fragment).peekable();
    // an empty payload still emits one empty last fragment
    if chunks.peek().is_none() {
        let pdu = Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type,
                is_last: true,
                data: Vec::new(),
            }],
        };
        return channel.send(&pdu).context(SendMessageSnafu);
    }
    while let Some(chunk) = chunks.next() {
        let pdu = Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type,
                is_last: chunks.peek().is_none(),
                data: chunk.to_vec(),
            }],
        };
        channel.send(&pdu).context(SendMessageSnafu)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::max_fragment_length;
    use opal_ul::pdu::DEFAULT_MAX_PDU;

    #[test]
    fn fragment_length_accounts_for_headers() {
        assert_eq!(max_fragment_length(4096), 4090);
        // zero means unlimited, the sender picks its own cap
        assert_eq!(max_fragment_length(0), DEFAULT_MAX_PDU as usize - 6);
    }

    #[test]
    fn oversized_advertisements_are_capped() {
        assert_eq!(
            max_fragment_length(u32::MAX),
            DEFAULT_MAX_PDU as usize - 6
        );
    }
}
