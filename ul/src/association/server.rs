//! Association acceptor module
//!
//! [`ServerAssociationOptions`] holds what this node is willing to accept
//! (abstract syntaxes, transfer syntaxes, callers) and answers each
//! incoming A-ASSOCIATE-RQ with an acceptance, a rejection, or an abort.
//! Callers screen requesting nodes through the [`AccessControl`] seam.

use std::net::TcpStream;
use std::time::Duration;

use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::{ensure, ResultExt, Snafu};
use tracing::debug;

use crate::context::{NegotiatedContext, NegotiatedContexts};
use crate::pdu::{
    read_pdu, write_pdu, AbortRQServiceProviderReason, AbortRQSource, AssociationRJResult,
    AssociationRJServiceProviderAsceReason, AssociationRJServiceUserReason, AssociationRJSource,
    CommonExtendedNegotiation, Pdu, PresentationContextProposed, PresentationContextResult,
    PresentationContextResultReason, RoleSelection, UserVariableItem, DEFAULT_MAX_PDU,
};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

use super::pdata::{PDataReader, PDataWriter};
use super::{declared_max_length, declared_role_selections, effective_max_pdu, AssociationState};

/// The transfer syntax quoted in declined presentation contexts,
/// where the field is reserved and not tested by the peer.
const FALLBACK_TS: &str = "1.2.840.10008.1.2";

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// nothing to accept: no abstract syntax was configured
    NothingToAccept,

    /// could not set a timeout on the connection
    SetTimeout { source: std::io::Error },

    /// could not receive the association request
    HandshakeReceive { source: crate::pdu::reader::Error },

    /// could not answer the association request
    HandshakeSend { source: crate::pdu::writer::Error },

    #[snafu(display("rejected association request from `{}`", calling_ae_title))]
    Rejected { calling_ae_title: String },

    /// the negotiation was cut short
    Aborted,

    #[snafu(display("expected an association request, got {}", pdu.short_description()))]
    #[non_exhaustive]
    UnexpectedRequest {
        /// the PDU obtained from the peer
        pdu: Box<Pdu>,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The identities involved in one incoming association request.
#[derive(Debug, Copy, Clone)]
pub struct AccessRequest<'a> {
    /// the AE title of this node
    pub this_ae_title: &'a str,
    /// the AE title the requester presents itself as
    pub calling_ae_title: &'a str,
    /// the AE title the requester asked for
    pub called_ae_title: &'a str,
}

/// Decides whether an incoming association request is given clearance.
///
/// Ships with [`AcceptAny`], [`AcceptCalledAeTitle`]
/// and [`AcceptCallingAeTitles`]; anything else can be plugged in
/// through [`ServerAssociationOptions::ae_access_control`].
pub trait AccessControl: Send + Sync {
    /// `Ok(())` grants clearance; otherwise the given reason
    /// is sent back in an association rejection.
    fn check(&self, request: &AccessRequest<'_>) -> Result<(), AssociationRJServiceUserReason>;
}

/// Accepts any requesting node.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptAny;

impl AccessControl for AcceptAny {
    fn check(&self, _request: &AccessRequest<'_>) -> Result<(), AssociationRJServiceUserReason> {
        Ok(())
    }
}

/// Accepts a request only when its called AE title
/// names this node.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptCalledAeTitle;

impl AccessControl for AcceptCalledAeTitle {
    fn check(&self, request: &AccessRequest<'_>) -> Result<(), AssociationRJServiceUserReason> {
        if request.this_ae_title == request.called_ae_title {
            Ok(())
        } else {
            Err(AssociationRJServiceUserReason::CalledAETitleNotRecognized)
        }
    }
}

/// Accepts requests from a fixed list of calling AE titles.
///
/// An empty list accepts any caller.
#[derive(Debug, Default, Clone, Eq, Hash, PartialEq)]
pub struct AcceptCallingAeTitles {
    /// the authorized calling AE titles
    pub calling_ae_titles: Vec<String>,
}

impl AccessControl for AcceptCallingAeTitles {
    fn check(&self, request: &AccessRequest<'_>) -> Result<(), AssociationRJServiceUserReason> {
        let authorized = self.calling_ae_titles.is_empty()
            || self
                .calling_ae_titles
                .iter()
                .any(|ae_title| ae_title == request.calling_ae_title);
        if authorized {
            Ok(())
        } else {
            Err(AssociationRJServiceUserReason::CallingAETitleNotRecognized)
        }
    }
}

/// A DICOM association builder for an acceptor node,
/// usually a service class provider (SCP).
///
/// One value answers any number of connections;
/// each call to [`establish`](Self::establish)
/// negotiates one [`ServerAssociation`].
///
/// With no transfer syntaxes configured, every syntax known to the
/// transfer syntax registry is fair game; otherwise only the listed
/// ones are. At most one transfer syntax is ever accepted per
/// presentation context, the first offered one this node supports.
///
/// # Example
///
/// ```no_run
/// # use std::net::TcpListener;
/// # use opal_ul::association::server::ServerAssociationOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// # let tcp_listener: TcpListener = unimplemented!();
/// let scp_options = ServerAssociationOptions::new()
///    .with_abstract_syntax("1.2.840.10008.1.1")
///    .with_transfer_syntax("1.2.840.10008.1.2.1");
///
/// let (stream, _address) = tcp_listener.accept()?;
/// scp_options.establish(stream)?;
/// # Ok(())
/// # }
/// ```
pub struct ServerAssociationOptions {
    access_control: Box<dyn AccessControl>,
    ae_title: String,
    application_context_name: String,
    abstract_syntax_uids: Vec<String>,
    transfer_syntax_uids: Vec<String>,
    protocol_version: u16,
    /// the largest PDU this node is willing to receive
    max_pdu_length: u32,
    strict: bool,
    /// whether to accept unknown abstract syntaxes
    promiscuous: bool,
    io_timeout: Option<Duration>,
}

impl Default for ServerAssociationOptions {
    fn default() -> Self {
        ServerAssociationOptions {
            access_control: Box::new(AcceptAny),
            ae_title: "THIS-SCP".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            abstract_syntax_uids: Vec::new(),
            transfer_syntax_uids: Vec::new(),
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            promiscuous: false,
            io_timeout: None,
        }
    }
}

impl ServerAssociationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept requests from anyone. This is the default policy.
    pub fn accept_any(self) -> Self {
        self.ae_access_control(AcceptAny)
    }

    /// Accept a request only when its called AE title names this node.
    pub fn accept_called_ae_title(self) -> Self {
        self.ae_access_control(AcceptCalledAeTitle)
    }

    /// Accept requests from the given calling AE titles only.
    pub fn accept_calling_ae_titles(self, calling_ae_titles: Vec<String>) -> Self {
        self.ae_access_control(AcceptCallingAeTitles { calling_ae_titles })
    }

    /// Install a custom access control policy.
    pub fn ae_access_control(mut self, policy: impl AccessControl + 'static) -> Self {
        self.access_control = Box::new(policy);
        self
    }

    /// The application entity title of this node. Default: `THIS-SCP`.
    pub fn ae_title(mut self, value: impl Into<String>) -> Self {
        self.ae_title = value.into();
        self
    }

    /// Add an abstract syntax this node accepts.
    pub fn with_abstract_syntax(mut self, abstract_syntax_uid: impl Into<String>) -> Self {
        let uid = abstract_syntax_uid.into();
        self.abstract_syntax_uids.push(clean_uid(&uid).to_string());
        self
    }

    /// Add a transfer syntax this node accepts.
    pub fn with_transfer_syntax(mut self, transfer_syntax_uid: impl Into<String>) -> Self {
        let uid = transfer_syntax_uid.into();
        self.transfer_syntax_uids.push(clean_uid(&uid).to_string());
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

    /// Whether to accept abstract syntaxes this node never heard of.
    pub fn promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
        self
    }

    /// Bound every read and write on the underlying socket.
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = Some(timeout);
        self
    }

    /// Negotiate an association over the given TCP stream.
    pub fn establish(&self, mut socket: TcpStream) -> Result<ServerAssociation> {
        ensure!(
            !self.abstract_syntax_uids.is_empty() || self.promiscuous,
            NothingToAcceptSnafu
        );

        socket
            .set_read_timeout(self.io_timeout)
            .context(SetTimeoutSnafu)?;
        socket
            .set_write_timeout(self.io_timeout)
            .context(SetTimeoutSnafu)?;

        let request = read_pdu(&mut socket, self.max_pdu_length, self.strict)
            .context(HandshakeReceiveSnafu)?;

        let (
            protocol_version,
            calling_ae_title,
            called_ae_title,
            application_context_name,
            proposed,
            user_variables,
        ) = match request {
            Pdu::AssociationRQ {
                protocol_version,
                calling_ae_title,
                called_ae_title,
                application_context_name,
                presentation_contexts,
                user_variables,
            } => (
                protocol_version,
                calling_ae_title,
                called_ae_title,
                application_context_name,
                presentation_contexts,
                user_variables,
            ),
            Pdu::ReleaseRQ => {
                // the requester gave up before negotiating anything
                let _ = write_pdu(&mut socket, &Pdu::ReleaseRP);
                return AbortedSnafu.fail();
            }
            pdu @ Pdu::Unknown { .. } => {
                let _ = write_pdu(
                    &mut socket,
                    &Pdu::AbortRQ {
                        source: AbortRQSource::ServiceProvider(
                            AbortRQServiceProviderReason::UnrecognizedPdu,
                        ),
                    },
                );
                return UnexpectedRequestSnafu { pdu: Box::new(pdu) }.fail();
            }
            pdu => {
                let _ = write_pdu(
                    &mut socket,
                    &Pdu::AbortRQ {
                        source: AbortRQSource::ServiceProvider(
                            AbortRQServiceProviderReason::UnexpectedPdu,
                        ),
                    },
                );
                return UnexpectedRequestSnafu { pdu: Box::new(pdu) }.fail();
            }
        };

        if let Some(decline) = self.screen(
            protocol_version,
            &application_context_name,
            &calling_ae_title,
            &called_ae_title,
        ) {
            debug!("declining association from {}: {:?}", calling_ae_title, decline);
            write_pdu(
                &mut socket,
                &Pdu::AssociationRJ {
                    result: AssociationRJResult::Permanent,
                    source: decline,
                },
            )
            .context(HandshakeSendSnafu)?;
            return RejectedSnafu { calling_ae_title }.fail();
        }

        // role selections are accepted as sent;
        // extended negotiation payloads are carried verbatim
        // and surfaced to the service layer
        let role_selections = declared_role_selections(&user_variables);
        let negotiated = self.negotiate(&proposed, &role_selections);
        let requestor_max_pdu_length =
            declared_max_length(&user_variables).unwrap_or(DEFAULT_MAX_PDU);

        let extended_negotiations: Vec<(String, Vec<u8>)> = user_variables
            .iter()
            .filter_map(|variable| match variable {
                UserVariableItem::SopClassExtendedNegotiation(uid, info) => {
                    Some((uid.clone(), info.clone()))
                }
                _ => None,
            })
            .collect();
        let common_extended_negotiations: Vec<CommonExtendedNegotiation> = user_variables
            .iter()
            .filter_map(|variable| match variable {
                UserVariableItem::SopClassCommonExtendedNegotiation(negotiation) => {
                    Some(negotiation.clone())
                }
                _ => None,
            })
            .collect();

        let answer = self.acceptance_pdu(
            &calling_ae_title,
            called_ae_title,
            application_context_name,
            &negotiated,
            &role_selections,
        );
        write_pdu(&mut socket, &answer).context(HandshakeSendSnafu)?;
        debug!(
            "association from {} established, {} context(s) accepted",
            calling_ae_title,
            negotiated.iter().filter(|pc| pc.is_accepted()).count()
        );

        Ok(ServerAssociation {
            contexts: NegotiatedContexts::from_contexts(negotiated),
            requestor_max_pdu_length,
            acceptor_max_pdu_length: self.max_pdu_length,
            client_ae_title: calling_ae_title,
            role_selections,
            extended_negotiations,
            common_extended_negotiations,
            socket,
            strict: self.strict,
            state: AssociationState::Established,
        })
    }

    /// Decide whether the request is declined outright, and why.
    fn screen(
        &self,
        protocol_version: u16,
        application_context_name: &str,
        calling_ae_title: &str,
        called_ae_title: &str,
    ) -> Option<AssociationRJSource> {
        if protocol_version != self.protocol_version {
            return Some(AssociationRJSource::ServiceProviderAsce(
                AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported,
            ));
        }
        if application_context_name != self.application_context_name {
            return Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            ));
        }
        let request = AccessRequest {
            this_ae_title: &self.ae_title,
            calling_ae_title,
            called_ae_title,
        };
        self.access_control
            .check(&request)
            .err()
            .map(AssociationRJSource::ServiceUser)
    }

    /// Answer every proposed context:
    /// the first offered transfer syntax this node supports wins,
    /// unknown abstract syntaxes and unsupported syntax lists
    /// are declined with their respective reasons.
    fn negotiate(
        &self,
        proposed: &[PresentationContextProposed],
        role_selections: &[RoleSelection],
    ) -> Vec<NegotiatedContext> {
        proposed
            .iter()
            .map(|pc| {
                let abstract_syntax = clean_uid(&pc.abstract_syntax).to_string();
                let known = self.promiscuous
                    || self
                        .abstract_syntax_uids
                        .iter()
                        .any(|uid| *uid == abstract_syntax);
                let accepted_ts = if known {
                    pc.transfer_syntaxes
                        .iter()
                        .find(|ts| self.supports_transfer_syntax(ts))
                } else {
                    None
                };
                let reason = match (known, accepted_ts) {
                    (false, _) => PresentationContextResultReason::AbstractSyntaxNotSupported,
                    (true, None) => PresentationContextResultReason::TransferSyntaxesNotSupported,
                    (true, Some(_)) => PresentationContextResultReason::Acceptance,
                };
                let roles = role_selections
                    .iter()
                    .find(|role| role.sop_class_uid == abstract_syntax);
                NegotiatedContext {
                    id: pc.id,
                    abstract_syntax,
                    transfer_syntax: accepted_ts
                        .cloned()
                        .unwrap_or_else(|| FALLBACK_TS.to_string()),
                    reason,
                    scu_role: roles.map(|role| role.scu_role).unwrap_or(true),
                    scp_role: roles.map(|role| role.scp_role).unwrap_or(false),
                }
            })
            .collect()
    }

    fn supports_transfer_syntax(&self, uid: &str) -> bool {
        if self.transfer_syntax_uids.is_empty() {
            TransferSyntaxRegistry
                .get(uid)
                .map(|ts| !ts.is_unsupported())
                .unwrap_or(false)
        } else {
            self.transfer_syntax_uids.iter().any(|known| known == uid)
        }
    }

    fn acceptance_pdu(
        &self,
        calling_ae_title: &str,
        called_ae_title: String,
        application_context_name: String,
        negotiated: &[NegotiatedContext],
        role_selections: &[RoleSelection],
    ) -> Pdu {
        let mut user_variables = vec![
            UserVariableItem::MaxLength(self.max_pdu_length),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ];
        // acknowledge the role selections as sent
        user_variables.extend(
            role_selections
                .iter()
                .cloned()
                .map(UserVariableItem::RoleSelection),
        );

        Pdu::AssociationAC {
            protocol_version: self.protocol_version,
            calling_ae_title: calling_ae_title.to_string(),
            called_ae_title,
            application_context_name,
            presentation_contexts: negotiated
                .iter()
                .map(|pc| PresentationContextResult {
                    id: pc.id,
                    reason: pc.reason.clone(),
                    transfer_syntax: pc.transfer_syntax.clone(),
                })
                .collect(),
            user_variables,
        }
    }
}

/// Trailing padding shows up on UIDs decoded from fixed fields.
fn clean_uid(uid: &str) -> &str {
    uid.trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
}

/// An established association, from the acceptor's point of view.
#[derive(Debug)]
pub struct ServerAssociation {
    /// the negotiated presentation contexts
    contexts: NegotiatedContexts,
    /// the largest PDU the requester declared it accepts
    requestor_max_pdu_length: u32,
    /// the largest PDU this node told the peer it accepts
    acceptor_max_pdu_length: u32,
    /// the AE title of the requesting node
    client_ae_title: String,
    /// the role selections proposed by the requester, acknowledged as sent
    role_selections: Vec<RoleSelection>,
    /// SOP class extended negotiation payloads from the requester, verbatim
    extended_negotiations: Vec<(String, Vec<u8>)>,
    /// SOP class common extended negotiation items from the requester, verbatim
    common_extended_negotiations: Vec<CommonExtendedNegotiation>,
    socket: TcpStream,
    strict: bool,
    state: AssociationState,
}

impl ServerAssociation {
    /// The current life cycle state of the association.
    pub fn state(&self) -> AssociationState {
        self.state
    }

    /// The negotiated presentation context registry.
    pub fn contexts(&self) -> &NegotiatedContexts {
        &self.contexts
    }

    /// The AE title of the requesting node.
    pub fn client_ae_title(&self) -> &str {
        &self.client_ae_title
    }

    /// The maximum PDU length the requester is willing to receive.
    pub fn requestor_max_pdu_length(&self) -> u32 {
        self.requestor_max_pdu_length
    }

    /// The role selections proposed by the requester.
    pub fn role_selections(&self) -> &[RoleSelection] {
        &self.role_selections
    }

    /// The SOP class extended negotiation payloads from the requester.
    pub fn extended_negotiations(&self) -> &[(String, Vec<u8>)] {
        &self.extended_negotiations
    }

    /// The SOP class common extended negotiation items from the requester.
    pub fn common_extended_negotiations(&self) -> &[CommonExtendedNegotiation] {
        &self.common_extended_negotiations
    }

    /// Send a PDU. Only valid while the association is established.
    ///
    /// Sending the release reply closes the association.
    pub fn send(&mut self, msg: &Pdu) -> super::Result<()> {
        ensure!(
            self.state == AssociationState::Established,
            super::InvalidStateSnafu { state: self.state }
        );
        write_pdu(&mut self.socket, msg).context(super::SendSnafu)?;
        if let Pdu::ReleaseRP = msg {
            self.close();
        }
        Ok(())
    }

    /// Receive the next PDU.
    ///
    /// An A-ABORT from the peer closes the association on the spot;
    /// the abort PDU is still handed back to the caller.
    pub fn receive(&mut self) -> super::Result<Pdu> {
        ensure!(
            self.state == AssociationState::Established,
            super::InvalidStateSnafu { state: self.state }
        );
        let pdu = read_pdu(&mut self.socket, self.acceptor_max_pdu_length, self.strict)
            .context(super::ReceiveSnafu)?;
        if let Pdu::AbortRQ { .. } = pdu {
            self.close();
        }
        Ok(pdu)
    }

    /// Send an A-ABORT and tear the association down immediately.
    pub fn abort(&mut self) -> super::Result<()> {
        if self.state == AssociationState::Closed {
            return Ok(());
        }
        let outcome = write_pdu(
            &mut self.socket,
            &Pdu::AbortRQ {
                source: AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::ReasonNotSpecifiedUnrecognizedPdu,
                ),
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
            effective_max_pdu(self.requestor_max_pdu_length),
        )
    }

    /// A reader collecting one full data set from the peer.
    pub fn receive_pdata(&mut self) -> PDataReader<&mut TcpStream> {
        PDataReader::new(&mut self.socket, self.acceptor_max_pdu_length)
    }

    /// Access to the inner TCP stream.
    pub fn inner_stream(&mut self) -> &mut TcpStream {
        &mut self.socket
    }

    /// The address of the requesting node, if available.
    pub fn peer_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.socket.peer_addr()
    }

    fn close(&mut self) {
        self.state = AssociationState::Closed;
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
    }
}
