//! DICOM composite and query/retrieve services.
//!
//! This crate implements the service class users and providers
//! of the composite DIMSE services on top of [`opal_ul`]
//! (associations) and [`opal_dimse`] (messages and multiplexing):
//!
//! - [`echo`]: the verification service (C-ECHO SCU);
//! - [`query`]: the query/retrieve information models;
//! - [`find`]: the query service (C-FIND SCU),
//!   streaming matches with cancel support and optional disk output;
//! - [`retrieve`]: the retrieve services (C-MOVE and C-GET SCUs),
//!   with sub-operation progress tracking;
//! - [`store`]: the storage service:
//!   the file scanner, the C-STORE SCU pipeline
//!   and the storage SCP;
//! - [`proxy`]: the retrieve-to-store forwarding bridge
//!   with its attribute editor chain;
//! - [`hp`]: the hanging protocol data model;
//! - [`path`]: attribute-driven file path patterns;
//! - [`capability`]: transfer capability configuration files.

pub mod capability;
pub mod echo;
pub mod find;
pub mod hp;
pub mod path;
pub mod proxy;
pub mod query;
pub mod retrieve;
pub mod store;

pub use echo::EchoScu;
pub use find::{FindScu, FindOptions};
pub use proxy::{AttributeEditor, EditorContext, ForwardAbort, ForwardingProxy};
pub use query::InformationModel;
pub use retrieve::{GetScu, MoveScu, RetrieveOptions};
pub use store::scan::{ScanEntry, Scanner};
pub use store::scp::{StorageScp, StorageScpOptions};
pub use store::scu::{StoreScu, StoreScuOptions};
