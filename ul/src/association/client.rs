//! Association requester module
//!
//! [`ClientAssociationOptions`] collects everything this node wants to
//! propose (presentation contexts, role selections, negotiation payloads),
//! turns it into one A-ASSOCIATE-RQ, and drives the handshake to either an
//! established [`ClientAssociation`] or a diagnosable failure.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use snafu::{ensure, IntoError, ResultExt, Snafu};
use tracing::debug;

use crate::address::AeAddr;
use crate::context::NegotiatedContexts;
use crate::pdu::{
    read_pdu, write_pdu, AbortRQSource, AssociationRJResult, AssociationRJSource,
    CommonExtendedNegotiation, Pdu, PresentationContextProposed, RoleSelection, UserVariableItem,
    DEFAULT_MAX_PDU,
};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

use super::pdata::{PDataReader, PDataWriter};
use super::{declared_max_length, declared_role_selections, effective_max_pdu, AssociationState};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// nothing to negotiate: no presentation context was proposed
    NothingProposed,

    /// could not resolve the peer address
    ResolveAddress { source: std::io::Error },

    /// could not connect to the peer
    ConnectFailed { source: std::io::Error },

    /// could not set a timeout on the connection
    SetTimeout { source: std::io::Error },

    /// could not send the association request
    HandshakeSend { source: crate::pdu::writer::Error },

    /// could not receive the association response
    HandshakeReceive { source: crate::pdu::reader::Error },

    #[snafu(display("peer talks protocol version {}, expected {}", got, expected))]
    PeerVersionMismatch { expected: u16, got: u16 },

    /// the peer rejected the association
    Rejected {
        association_result: AssociationRJResult,
        association_source: AssociationRJSource,
    },

    #[snafu(display("peer answered the association request with {}", pdu.short_description()))]
    #[non_exhaustive]
    UnexpectedReply {
        /// the PDU obtained from the peer
        pdu: Box<Pdu>,
    },

    /// the peer accepted none of the proposed presentation contexts
    NothingAccepted,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A DICOM association builder for a service class user (SCU).
///
/// The outcome of a successful negotiation is a [`ClientAssociation`].
///
/// # Example
///
/// ```no_run
/// # use opal_ul::association::client::ClientAssociationOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let association = ClientAssociationOptions::new()
///    .with_presentation_context("1.2.840.10008.1.1", vec!["1.2.840.10008.1.2.1"])
///    .establish("129.168.0.5:104")?;
/// # Ok(())
/// # }
/// ```
///
/// A presentation context proposed with no transfer syntaxes
/// falls back to _Explicit VR Little Endian_
/// and _Implicit VR Little Endian_.
#[derive(Debug, Clone)]
pub struct ClientAssociationOptions {
    calling_ae_title: String,
    called_ae_title: String,
    application_context_name: String,
    /// abstract syntax plus candidate transfer syntaxes, one per context
    presentation_contexts: Vec<(String, Vec<String>)>,
    role_selections: Vec<RoleSelection>,
    extended_negotiations: Vec<(String, Vec<u8>)>,
    common_extended_negotiations: Vec<CommonExtendedNegotiation>,
    /// maximum number of operations invoked / performed, if negotiated
    async_operations_window: Option<(u16, u16)>,
    protocol_version: u16,
    /// the largest PDU this node is willing to receive
    max_pdu_length: u32,
    strict: bool,
    connect_timeout: Option<Duration>,
    io_timeout: Option<Duration>,
}

impl Default for ClientAssociationOptions {
    fn default() -> Self {
        ClientAssociationOptions {
            calling_ae_title: "THIS-SCU".to_string(),
            called_ae_title: "ANY-SCP".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: Vec::new(),
            role_selections: Vec::new(),
            extended_negotiations: Vec::new(),
            common_extended_negotiations: Vec::new(),
            async_operations_window: None,
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            connect_timeout: None,
            io_timeout: None,
        }
    }
}

impl ClientAssociationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// The application entity title of this node. Default: `THIS-SCU`.
    pub fn calling_ae_title(mut self, value: impl Into<String>) -> Self {
        self.calling_ae_title = value.into();
        self
    }

    /// The application entity title of the target node. Default: `ANY-SCP`.
    pub fn called_ae_title(mut self, value: impl Into<String>) -> Self {
        self.called_ae_title = value.into();
        self
    }

    /// Propose a presentation context:
    /// one abstract syntax with its candidate transfer syntaxes.
    pub fn with_presentation_context(
        mut self,
        abstract_syntax_uid: impl Into<String>,
        transfer_syntax_uids: Vec<impl Into<String>>,
    ) -> Self {
        let mut transfer_syntaxes: Vec<String> =
            transfer_syntax_uids.into_iter().map(Into::into).collect();
        if transfer_syntaxes.is_empty() {
            transfer_syntaxes.push("1.2.840.10008.1.2.1".to_string());
            transfer_syntaxes.push("1.2.840.10008.1.2".to_string());
        }
        self.presentation_contexts
            .push((abstract_syntax_uid.into(), transfer_syntaxes));
        self
    }

    /// Propose an SCP/SCU role selection for a SOP class.
    pub fn with_role_selection(
        mut self,
        sop_class_uid: impl Into<String>,
        scu_role: bool,
        scp_role: bool,
    ) -> Self {
        self.role_selections.push(RoleSelection {
            sop_class_uid: sop_class_uid.into(),
            scu_role,
            scp_role,
        });
        self
    }

    /// Attach a SOP class extended negotiation payload, carried verbatim.
    pub fn with_extended_negotiation(
        mut self,
        sop_class_uid: impl Into<String>,
        info: Vec<u8>,
    ) -> Self {
        self.extended_negotiations.push((sop_class_uid.into(), info));
        self
    }

    /// Attach a SOP class common extended negotiation item, carried verbatim.
    pub fn with_common_extended_negotiation(
        mut self,
        negotiation: CommonExtendedNegotiation,
    ) -> Self {
        self.common_extended_negotiations.push(negotiation);
        self
    }

    /// Negotiate the maximum number of operations invoked and performed.
    pub fn max_ops(mut self, invoked: u16, performed: u16) -> Self {
        self.async_operations_window = Some((invoked, performed));
        self
    }

    /// Override the maximum PDU length this node advertises.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Whether incoming PDUs above the advertised maximum are an error.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Bound the initial TCP connection attempt.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Bound every read and write on the underlying socket.
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = Some(timeout);
        self
    }

    /// Connect to the given address and negotiate a new association.
    pub fn establish<A: ToSocketAddrs>(self, address: A) -> Result<ClientAssociation> {
        let target = first_address(&address)?;
        let socket = match self.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&target, timeout),
            None => TcpStream::connect(target),
        }
        .context(ConnectFailedSnafu)?;
        self.handshake(socket)
    }

    /// Connect from a compound `AE_TITLE@host:port` address,
    /// taking the called AE title from it when one is present.
    pub fn establish_with(mut self, ae_address: &str) -> Result<ClientAssociation> {
        match ae_address.parse::<AeAddr>() {
            Ok(ae_addr) => {
                if let Some(ae_title) = ae_addr.ae_title() {
                    self.called_ae_title = ae_title.to_string();
                }
                let addr = ae_addr.socket_addr().to_string();
                self.establish(addr.as_str())
            }
            Err(_) => self.establish(ae_address),
        }
    }

    /// Run the A-ASSOCIATE handshake over a connected stream.
    fn handshake(self, mut socket: TcpStream) -> Result<ClientAssociation> {
        // an association without intent is a caller bug
        ensure!(!self.presentation_contexts.is_empty(), NothingProposedSnafu);

        socket
            .set_read_timeout(self.io_timeout)
            .context(SetTimeoutSnafu)?;
        socket
            .set_write_timeout(self.io_timeout)
            .context(SetTimeoutSnafu)?;

        let proposed = self.numbered_contexts();
        let request = self.request_pdu(&proposed);
        write_pdu(&mut socket, &request).context(HandshakeSendSnafu)?;

        let reply =
            read_pdu(&mut socket, self.max_pdu_length, self.strict).context(HandshakeReceiveSnafu)?;
        let (results, user_variables) = match reply {
            Pdu::AssociationAC {
                protocol_version,
                presentation_contexts,
                user_variables,
                ..
            } => {
                ensure!(
                    protocol_version == self.protocol_version,
                    PeerVersionMismatchSnafu {
                        expected: self.protocol_version,
                        got: protocol_version,
                    }
                );
                (presentation_contexts, user_variables)
            }
            Pdu::AssociationRJ { result, source } => {
                return RejectedSnafu {
                    association_result: result,
                    association_source: source,
                }
                .fail();
            }
            other => {
                // anything else in answer to an A-ASSOCIATE-RQ
                // is a protocol violation
                let _ = write_pdu(
                    &mut socket,
                    &Pdu::AbortRQ {
                        source: AbortRQSource::ServiceUser,
                    },
                );
                return UnexpectedReplySnafu {
                    pdu: Box::new(other),
                }
                .fail();
            }
        };

        // role selections are accepted as the acceptor echoes them;
        // where absent, the requester is SCU and the acceptor is SCP
        let contexts = NegotiatedContexts::from_negotiation(
            &proposed,
            &results,
            &declared_role_selections(&user_variables),
        );
        ensure!(contexts.has_accepted(), NothingAcceptedSnafu);

        debug!(
            "association established, {} of {} context(s) accepted",
            contexts.accepted_count(),
            proposed.len()
        );

        Ok(ClientAssociation {
            contexts,
            requestor_max_pdu_length: self.max_pdu_length,
            acceptor_max_pdu_length: declared_max_length(&user_variables)
                .unwrap_or(DEFAULT_MAX_PDU),
            user_variables,
            socket,
            strict: self.strict,
            state: AssociationState::Established,
        })
    }

    /// Assign the odd identifiers 1, 3, 5, … to the proposed contexts.
    fn numbered_contexts(&self) -> Vec<PresentationContextProposed> {
        self.presentation_contexts
            .iter()
            .zip((1..=255).step_by(2))
            .map(|((abstract_syntax, transfer_syntaxes), id)| PresentationContextProposed {
                id,
                abstract_syntax: abstract_syntax.clone(),
                transfer_syntaxes: transfer_syntaxes.clone(),
            })
            .collect()
    }

    fn request_pdu(&self, proposed: &[PresentationContextProposed]) -> Pdu {
        let mut user_variables = vec![
            UserVariableItem::MaxLength(self.max_pdu_length),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ];
        if let Some((invoked, performed)) = self.async_operations_window {
            user_variables.push(UserVariableItem::AsyncOperationsWindow(invoked, performed));
        }
        user_variables.extend(
            self.role_selections
                .iter()
                .cloned()
                .map(UserVariableItem::RoleSelection),
        );
        user_variables.extend(self.extended_negotiations.iter().map(|(uid, info)| {
            UserVariableItem::SopClassExtendedNegotiation(uid.clone(), info.clone())
        }));
        user_variables.extend(
            self.common_extended_negotiations
                .iter()
                .cloned()
                .map(UserVariableItem::SopClassCommonExtendedNegotiation),
        );

        Pdu::AssociationRQ {
            protocol_version: self.protocol_version,
            calling_ae_title: self.calling_ae_title.clone(),
            called_ae_title: self.called_ae_title.clone(),
            application_context_name: self.application_context_name.clone(),
            presentation_contexts: proposed.to_vec(),
            user_variables,
        }
    }
}

fn first_address<A: ToSocketAddrs>(address: &A) -> Result<SocketAddr> {
    let mut candidates = address.to_socket_addrs().context(ResolveAddressSnafu)?;
    candidates.next().ok_or_else(|| {
        ResolveAddressSnafu.into_error(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no address resolved",
        ))
    })
}

/// An established association, from the requester's point of view.
///
/// Send and receive PDUs with [`send`](Self::send) and
/// [`receive`](Self::receive); large data sets go out more conveniently
/// through [`send_pdata`](Self::send_pdata).
/// If the association is still established when the value is dropped,
/// a release handshake is attempted before the connection goes down.
#[derive(Debug)]
pub struct ClientAssociation {
    /// the negotiated presentation contexts
    contexts: NegotiatedContexts,
    /// the largest PDU this node told the peer it accepts
    requestor_max_pdu_length: u32,
    /// the largest PDU the peer declared it accepts
    acceptor_max_pdu_length: u32,
    /// the user variables returned by the acceptor, verbatim
    user_variables: Vec<UserVariableItem>,
    socket: TcpStream,
    strict: bool,
    state: AssociationState,
}

impl ClientAssociation {
    /// The current life cycle state of the association.
    pub fn state(&self) -> AssociationState {
        self.state
    }

    /// The negotiated presentation context registry.
    pub fn contexts(&self) -> &NegotiatedContexts {
        &self.contexts
    }

    /// The maximum PDU length the acceptor is willing to receive.
    pub fn acceptor_max_pdu_length(&self) -> u32 {
        self.acceptor_max_pdu_length
    }

    /// The maximum PDU length this node is willing to receive.
    pub fn requestor_max_pdu_length(&self) -> u32 {
        self.requestor_max_pdu_length
    }

    /// The user variables returned by the acceptor, verbatim.
    pub fn acceptor_user_variables(&self) -> &[UserVariableItem] {
        &self.user_variables
    }

    /// Send a PDU. Only valid while the association is established.
    pub fn send(&mut self, msg: &Pdu) -> super::Result<()> {
        ensure!(
            self.state == AssociationState::Established,
            super::InvalidStateSnafu { state: self.state }
        );
        write_pdu(&mut self.socket, msg).context(super::SendSnafu)
    }

    /// Receive the next PDU.
    ///
    /// An A-ABORT from the peer closes the association on the spot;
    /// the abort PDU is still handed back to the caller.
    pub fn receive(&mut self) -> super::Result<Pdu> {
        ensure!(
            matches!(
                self.state,
                AssociationState::Established | AssociationState::AwaitingRp
            ),
            super::InvalidStateSnafu { state: self.state }
        );
        let pdu = read_pdu(&mut self.socket, self.requestor_max_pdu_length, self.strict)
            .context(super::ReceiveSnafu)?;
        if let Pdu::AbortRQ { .. } = pdu {
            self.close();
        }
        Ok(pdu)
    }

    /// Gracefully release the association.
    ///
    /// After the release request goes out no more data may be sent.
    /// While waiting for the reply, any PDU other than an A-RELEASE-RP
    /// or an A-ABORT is a protocol violation and aborts the association.
    pub fn release(&mut self) -> super::Result<()> {
        if self.state == AssociationState::Closed {
            return Ok(());
        }
        ensure!(
            self.state == AssociationState::Established,
            super::InvalidStateSnafu { state: self.state }
        );
        write_pdu(&mut self.socket, &Pdu::ReleaseRQ).context(super::SendSnafu)?;
        self.state = AssociationState::AwaitingRp;

        let outcome = match read_pdu(&mut self.socket, self.requestor_max_pdu_length, self.strict)
        {
            Ok(Pdu::ReleaseRP) => Ok(()),
            Ok(Pdu::AbortRQ { source }) => super::AbortedSnafu { reason: source }.fail(),
            Ok(pdu) => {
                let _ = write_pdu(
                    &mut self.socket,
                    &Pdu::AbortRQ {
                        source: AbortRQSource::ServiceUser,
                    },
                );
                super::UnexpectedResponseSnafu { pdu: Box::new(pdu) }.fail()
            }
            Err(e) => Err(e).context(super::ReceiveSnafu),
        };

        self.close();
        outcome
    }

    /// Send an A-ABORT and tear the association down immediately.
    pub fn abort(&mut self) -> super::Result<()> {
        if self.state == AssociationState::Closed {
            return Ok(());
        }
        let outcome = write_pdu(
            &mut self.socket,
            &Pdu::AbortRQ {
                source: AbortRQSource::ServiceUser,
            },
        )
        .context(super::SendSnafu);
        self.close();
        outcome
    }

    /// A fragmenting writer for one data set
    /// over the given presentation context.
    pub fn send_pdata(&mut self, presentation_context_id: u8) -> PDataWriter<&mut TcpStream> {
        PDataWriter::new(
            &mut self.socket,
            presentation_context_id,
            effective_max_pdu(self.acceptor_max_pdu_length),
        )
    }

    /// A reader collecting one full data set from the peer.
    pub fn receive_pdata(&mut self) -> PDataReader<&mut TcpStream> {
        PDataReader::new(&mut self.socket, self.requestor_max_pdu_length)
    }

    /// Access to the inner TCP stream,
    /// e.g. to clone it for a dedicated reader task.
    ///
    /// Keep a single reader and a single writer when doing so.
    pub fn inner_stream(&mut self) -> &mut TcpStream {
        &mut self.socket
    }

    /// Shut down the TCP connection without the release handshake
    /// and mark the association as closed.
    ///
    /// Useful when the release exchange was already performed
    /// through other means, such as a dedicated reader task.
    pub fn close(&mut self) {
        self.state = AssociationState::Closed;
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
    }
}

impl Drop for ClientAssociation {
    fn drop(&mut self) {
        if self.state == AssociationState::Established {
            let _ = self.release();
        }
    }
}
