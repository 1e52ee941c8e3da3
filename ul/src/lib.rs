//! Types and methods for speaking the DICOM upper layer protocol
//! between application entities over TCP.
//!
//! - The [`address`] module provides compound addresses
//!   for application entities in a network
//!   and the immutable [`DicomNode`](address::DicomNode) peer record.
//! - The [`pdu`] module provides the data structures and codec
//!   for _protocol data units_, the framed elements of the wire protocol.
//! - The [`association`] module negotiates and drives associations
//!   between application entities,
//!   on both the requesting and the accepting end.
//! - The [`context`] module keeps the negotiated presentation contexts
//!   of one association and selects transfer syntaxes for outgoing objects.

pub mod address;
pub mod association;
pub mod context;
pub mod pdu;

/// The implementation class UID advertised during association negotiation.
///
/// Generated as per the standard, part 5, section B.2.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.318618871618426297628226354782684264382";

/// The implementation version name advertised during association negotiation.
pub const IMPLEMENTATION_VERSION_NAME: &str = "OPAL 0.1.0";

// re-exports

pub use address::{AeAddr, DicomNode};
pub use association::client::{ClientAssociation, ClientAssociationOptions};
pub use association::server::{ServerAssociation, ServerAssociationOptions};
pub use association::AssociationState;
pub use context::NegotiatedContexts;
pub use pdu::read_pdu;
pub use pdu::write_pdu;
pub use pdu::Pdu;
