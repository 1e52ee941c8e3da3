//! DIMSE message layer for the DICOM upper layer protocol.
//!
//! This crate builds on [`opal_ul`] to exchange DIMSE messages
//! (command sets plus optional data sets) over an established association:
//!
//! - the [`commands`] module constructs and inspects command sets
//!   for the composite services
//!   (C-ECHO, C-STORE, C-FIND, C-GET, C-MOVE, and C-CANCEL);
//! - the [`status`] module classifies DIMSE status codes;
//! - the [`message`] module assembles and emits whole messages
//!   from and to presentation data values;
//! - the [`mux`] module multiplexes concurrent outstanding requests
//!   over one association,
//!   routing responses back to their callers by message ID;
//! - the [`progress`] module tracks operation counters
//!   and cooperative cancellation.

pub mod commands;
pub mod message;
pub mod mux;
pub mod progress;
pub mod status;

pub use commands::{CommandField, Priority};
pub use message::{AssociationChannel, DicomMessage};
pub use mux::{Multiplexer, RequestHandle};
pub use progress::{DicomProgress, DicomState};
pub use status::StatusType;

/// An alias for the in-memory object type used for command sets
/// and small data sets.
pub type CommandSet = dicom_object::InMemDicomObject;
