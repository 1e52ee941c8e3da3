//! The storage service:
//! the pre-association file scanner,
//! the C-STORE service class user,
//! and the storage service class provider.

pub mod scan;
pub mod scp;
pub mod scu;
