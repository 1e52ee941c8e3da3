//! Protocol data unit module.
//!
//! The DICOM upper layer exchanges seven kinds of framed messages,
//! here modeled by the [`Pdu`] enum.
//! The sub-modules [`reader`] and [`writer`] hold the wire codec.

pub mod reader;
pub mod writer;

#[cfg(test)]
mod test;

pub use reader::read_pdu;
pub use writer::write_pdu;

/// The default maximum PDU size
pub const DEFAULT_MAX_PDU: u32 = 16_384;

/// The minimum PDU size,
/// as specified by the standard
pub const MINIMUM_PDU_SIZE: u32 = 4_096;

/// The maximum PDU size,
/// as specified by the standard
pub const MAXIMUM_PDU_SIZE: u32 = 131_072;

/// The length of the PDU header in bytes,
/// comprising the PDU type (1 byte),
/// reserved byte (1 byte),
/// and PDU length (4 bytes).
pub const PDU_HEADER_SIZE: u32 = 6;

/// A presentation context as proposed in an A-ASSOCIATE-RQ:
/// one abstract syntax paired with the transfer syntaxes
/// the requester is able to use for it.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextProposed {
    /// the presentation context identifier, an odd number between 1 and 255
    pub id: u8,
    /// the abstract syntax (SOP class) UID
    pub abstract_syntax: String,
    /// the candidate transfer syntax UIDs, in order of preference
    pub transfer_syntaxes: Vec<String>,
}

/// The outcome of the negotiation of a single presentation context,
/// as carried in an A-ASSOCIATE-AC.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextResult {
    /// the presentation context identifier from the proposal
    pub id: u8,
    /// whether the context was accepted, and if not, why
    pub reason: PresentationContextResultReason,
    /// the single transfer syntax accepted by the association acceptor
    /// (not significant unless `reason` is `Acceptance`)
    pub transfer_syntax: String,
}

impl PresentationContextResult {
    /// Whether this context was accepted by the peer.
    pub fn is_accepted(&self) -> bool {
        self.reason == PresentationContextResultReason::Acceptance
    }
}

/// The reason code attached to a negotiated presentation context.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PresentationContextResultReason {
    Acceptance = 0,
    UserRejection = 1,
    NoReason = 2,
    AbstractSyntaxNotSupported = 3,
    TransferSyntaxesNotSupported = 4,
}

impl PresentationContextResultReason {
    fn from(reason: u8) -> Option<PresentationContextResultReason> {
        let result = match reason {
            0 => PresentationContextResultReason::Acceptance,
            1 => PresentationContextResultReason::UserRejection,
            2 => PresentationContextResultReason::NoReason,
            3 => PresentationContextResultReason::AbstractSyntaxNotSupported,
            4 => PresentationContextResultReason::TransferSyntaxesNotSupported,
            _ => {
                return None;
            }
        };

        Some(result)
    }
}

/// Whether an association rejection is permanent or transient.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJResult {
    Permanent,
    Transient,
}

impl AssociationRJResult {
    fn from(value: u8) -> Option<AssociationRJResult> {
        match value {
            1 => Some(AssociationRJResult::Permanent),
            2 => Some(AssociationRJResult::Transient),
            _ => None,
        }
    }
}

/// The source (and per-source reason) of an association rejection.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJSource {
    ServiceUser(AssociationRJServiceUserReason),
    ServiceProviderAsce(AssociationRJServiceProviderAsceReason),
    ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason),
}

impl AssociationRJSource {
    fn from(source: u8, reason: u8) -> Option<AssociationRJSource> {
        let result = match (source, reason) {
            (1, 1) => {
                AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::NoReasonGiven)
            }
            (1, 2) => AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            ),
            (1, 3) => AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CallingAETitleNotRecognized,
            ),
            (1, x) if (4..=6).contains(&x) => {
                AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::Reserved(x))
            }
            (1, 7) => AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAETitleNotRecognized,
            ),
            (1, x) if (8..=10).contains(&x) => {
                AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::Reserved(x))
            }
            (1, _) => {
                return None;
            }
            (2, 1) => AssociationRJSource::ServiceProviderAsce(
                AssociationRJServiceProviderAsceReason::NoReasonGiven,
            ),
            (2, 2) => AssociationRJSource::ServiceProviderAsce(
                AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported,
            ),
            (2, _) => {
                return None;
            }
            (3, 1) => AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::TemporaryCongestion,
            ),
            (3, 2) => AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
            ),
            (3, x) if x == 0 || (3..=7).contains(&x) => {
                AssociationRJSource::ServiceProviderPresentation(
                    AssociationRJServiceProviderPresentationReason::Reserved(x),
                )
            }
            _ => {
                return None;
            }
        };
        Some(result)
    }
}

/// Rejection reasons attributed to the DICOM UL service user.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceUserReason {
    NoReasonGiven,
    ApplicationContextNameNotSupported,
    CallingAETitleNotRecognized,
    CalledAETitleNotRecognized,
    Reserved(u8),
}

/// Rejection reasons attributed to the service provider (ACSE).
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceProviderAsceReason {
    NoReasonGiven,
    ProtocolVersionNotSupported,
}

/// Rejection reasons attributed to the service provider (presentation).
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AssociationRJServiceProviderPresentationReason {
    TemporaryCongestion,
    LocalLimitExceeded,
    Reserved(u8),
}

/// A single presentation data value:
/// one fragment of command or data set bytes
/// bound to a presentation context.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PDataValue {
    pub presentation_context_id: u8,
    pub value_type: PDataValueType,
    pub is_last: bool,
    pub data: Vec<u8>,
}

/// Whether a presentation data value fragment carries
/// command set or data set bytes.
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PDataValueType {
    Command,
    Data,
}

/// The source of an A-ABORT.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AbortRQSource {
    ServiceUser,
    ServiceProvider(AbortRQServiceProviderReason),
    Reserved,
}

impl AbortRQSource {
    fn from(source: u8, reason: u8) -> Option<AbortRQSource> {
        let result = match (source, reason) {
            (0, _) => AbortRQSource::ServiceUser,
            (1, _) => AbortRQSource::Reserved,
            (2, 0) => AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::ReasonNotSpecifiedUnrecognizedPdu,
            ),
            (2, 1) => AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnrecognizedPdu),
            (2, 2) => AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
            (2, 3) => AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::Reserved),
            (2, 4) => {
                AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnrecognizedPduParameter)
            }
            (2, 5) => {
                AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPduParameter)
            }
            (2, 6) => {
                AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::InvalidPduParameter)
            }
            (_, _) => {
                return None;
            }
        };

        Some(result)
    }
}

/// Abort reasons attributed to the service provider.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AbortRQServiceProviderReason {
    ReasonNotSpecifiedUnrecognizedPdu,
    UnrecognizedPdu,
    UnexpectedPdu,
    Reserved,
    UnrecognizedPduParameter,
    UnexpectedPduParameter,
    InvalidPduParameter,
}

/// An SCP/SCU role selection proposal or acknowledgment
/// for one SOP class (user information sub-item 54H).
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct RoleSelection {
    pub sop_class_uid: String,
    /// whether the association requester may act as SCU for this SOP class
    pub scu_role: bool,
    /// whether the association requester may act as SCP for this SOP class
    pub scp_role: bool,
}

/// A SOP class common extended negotiation sub-item (57H).
///
/// The service class and related general SOP class UIDs are carried
/// verbatim; the upper layer attaches no semantics to them.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct CommonExtendedNegotiation {
    pub sop_class_uid: String,
    pub service_class_uid: String,
    pub related_general_sop_class_uids: Vec<String>,
}

/// A user information sub-item.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum UserVariableItem {
    /// an unrecognized sub-item, carried verbatim
    Unknown(u8, Vec<u8>),
    /// maximum length of P-DATA-TF PDUs the emitter is willing to receive;
    /// zero means no maximum
    MaxLength(u32),
    ImplementationClassUID(String),
    ImplementationVersionName(String),
    /// maximum number of operations invoked / performed (53H)
    AsyncOperationsWindow(u16, u16),
    RoleSelection(RoleSelection),
    /// SOP class extended negotiation (56H):
    /// the service class application information is carried verbatim
    SopClassExtendedNegotiation(String, Vec<u8>),
    SopClassCommonExtendedNegotiation(CommonExtendedNegotiation),
}

/// A DICOM upper layer protocol data unit.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum Pdu {
    /// an unrecognized PDU type, carried verbatim
    Unknown {
        pdu_type: u8,
        data: Vec<u8>,
    },
    AssociationRQ {
        protocol_version: u16,
        calling_ae_title: String,
        called_ae_title: String,
        application_context_name: String,
        presentation_contexts: Vec<PresentationContextProposed>,
        user_variables: Vec<UserVariableItem>,
    },
    AssociationAC {
        protocol_version: u16,
        calling_ae_title: String,
        called_ae_title: String,
        application_context_name: String,
        presentation_contexts: Vec<PresentationContextResult>,
        user_variables: Vec<UserVariableItem>,
    },
    AssociationRJ {
        result: AssociationRJResult,
        source: AssociationRJSource,
    },
    PData {
        data: Vec<PDataValue>,
    },
    ReleaseRQ,
    ReleaseRP,
    AbortRQ {
        source: AbortRQSource,
    },
}

impl Pdu {
    /// A short description of the PDU for diagnostic output,
    /// without dumping data set fragments.
    pub fn short_description(&self) -> String {
        match self {
            Pdu::Unknown { pdu_type, data } => {
                format!("Unknown {{ type: {:#04x}, {} bytes }}", pdu_type, data.len())
            }
            Pdu::AssociationRQ {
                calling_ae_title,
                called_ae_title,
                presentation_contexts,
                ..
            } => format!(
                "AssociationRQ {{ calling: {}, called: {}, contexts: {} }}",
                calling_ae_title,
                called_ae_title,
                presentation_contexts.len()
            ),
            Pdu::AssociationAC {
                presentation_contexts,
                ..
            } => format!(
                "AssociationAC {{ contexts: {} }}",
                presentation_contexts.len()
            ),
            Pdu::AssociationRJ { result, source } => {
                format!("AssociationRJ {{ result: {:?}, source: {:?} }}", result, source)
            }
            Pdu::PData { data } => {
                let bytes: usize = data.iter().map(|pdv| pdv.data.len()).sum();
                format!("PData {{ {} value(s), {} bytes }}", data.len(), bytes)
            }
            Pdu::ReleaseRQ => "ReleaseRQ".to_string(),
            Pdu::ReleaseRP => "ReleaseRP".to_string(),
            Pdu::AbortRQ { source } => format!("AbortRQ {{ source: {:?} }}", source),
        }
    }
}
