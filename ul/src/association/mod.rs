//! DICOM association module
//!
//! This module contains the mechanisms to negotiate and drive associations
//! between DICOM nodes over TCP/IP:
//! the [client][client::ClientAssociationOptions] (requester) side
//! and the [server][server::ServerAssociationOptions] (acceptor) side.
//!
//! Both sides track the association life cycle explicitly
//! (see [`AssociationState`]):
//! data transfer is only permitted while the association is established,
//! a release request forbids further sends,
//! and an abort tears the association down from any state.

use snafu::Snafu;

use crate::pdu::{AbortRQSource, Pdu, RoleSelection, UserVariableItem};

pub mod client;
pub mod pdata;
pub mod server;

pub use client::{ClientAssociation, ClientAssociationOptions};
pub use pdata::{PDataReader, PDataWriter};
pub use server::{ServerAssociation, ServerAssociationOptions};

/// The life cycle of an association, from the local point of view.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum AssociationState {
    /// no connection attempt was made yet
    Idle,
    /// an A-ASSOCIATE-RQ was sent, waiting for the acceptor's answer
    AwaitingAc,
    /// the association is established and may carry DIMSE traffic
    Established,
    /// an A-RELEASE-RQ was sent, no further data may be sent
    AwaitingRp,
    /// the association ended, by release, rejection, or abort
    Closed,
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// failed to send PDU message
    #[non_exhaustive]
    Send {
        source: crate::pdu::writer::Error,
    },

    /// failed to receive PDU message
    #[non_exhaustive]
    Receive {
        source: crate::pdu::reader::Error,
    },

    #[snafu(display("unexpected response `{:?}`", pdu))]
    #[non_exhaustive]
    UnexpectedResponse {
        /// the PDU obtained from the other node
        pdu: Box<Pdu>,
    },

    #[snafu(display("operation is not valid in association state {:?}", state))]
    InvalidState { state: AssociationState },

    #[snafu(display("presentation context {} was not accepted", id))]
    ContextNotAccepted { id: u8 },

    #[snafu(display("association aborted (source: {:?})", reason))]
    Aborted { reason: AbortRQSource },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Compute the effective cap for outgoing P-DATA-TF PDUs
/// given the maximum PDU length advertised by the peer.
///
/// An advertised length of zero means "no maximum";
/// the sender still picks a reasonable cap.
pub(crate) fn effective_max_pdu(advertised: u32) -> u32 {
    use crate::pdu::{DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE};
    if advertised == 0 || advertised > MAXIMUM_PDU_SIZE {
        DEFAULT_MAX_PDU
    } else {
        advertised.max(MINIMUM_PDU_SIZE)
    }
}

/// The maximum PDU length a peer declared in its user variables, if any.
pub(crate) fn declared_max_length(user_variables: &[UserVariableItem]) -> Option<u32> {
    user_variables.iter().find_map(|variable| match variable {
        UserVariableItem::MaxLength(value) => Some(*value),
        _ => None,
    })
}

/// The role selections a peer declared in its user variables.
pub(crate) fn declared_role_selections(user_variables: &[UserVariableItem]) -> Vec<RoleSelection> {
    user_variables
        .iter()
        .filter_map(|variable| match variable {
            UserVariableItem::RoleSelection(role) => Some(role.clone()),
            _ => None,
        })
        .collect()
}
