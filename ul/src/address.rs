//! Application entity addressing.
//!
//! This module provides [`AeAddr`],
//! a compound address of the form `AE_TITLE@host:port`
//! used by command line tools and service builders,
//! and [`DicomNode`], the immutable record of a known peer.

use snafu::{ensure, Backtrace, OptionExt, Snafu};
use std::fmt;
use std::str::FromStr;

/// The default port assigned to the DICOM upper layer protocol.
pub const DEFAULT_PORT: u16 = 104;

/// An alternative port in widespread use by archives and test tools.
pub const ALTERNATIVE_PORT: u16 = 11112;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ParseAeAddressError {
    /// missing socket address after `@`
    MissingSocketAddress { backtrace: Backtrace },
    /// the application entity title is empty
    EmptyAeTitle { backtrace: Backtrace },
    #[snafu(display("application entity title has {} characters, maximum is 16", length))]
    AeTitleTooLong { length: usize, backtrace: Backtrace },
    #[snafu(display("application entity title must be ASCII"))]
    AeTitleNotAscii { backtrace: Backtrace },
}

/// Validate an application entity title:
/// non-empty, ASCII, at most 16 characters.
pub fn check_ae_title(ae_title: &str) -> Result<(), ParseAeAddressError> {
    ensure!(!ae_title.is_empty(), EmptyAeTitleSnafu);
    ensure!(
        ae_title.len() <= 16,
        AeTitleTooLongSnafu {
            length: ae_title.len()
        }
    );
    ensure!(ae_title.is_ascii(), AeTitleNotAsciiSnafu);
    Ok(())
}

/// A compound address of a network accessible application entity:
/// a socket address plus an optional AE title.
///
/// # Example
///
/// ```
/// # use opal_ul::address::AeAddr;
/// let addr: AeAddr = "PACS@10.0.0.7:11112".parse()?;
/// assert_eq!(addr.ae_title(), Some("PACS"));
/// assert_eq!(addr.socket_addr(), "10.0.0.7:11112");
/// # Ok::<(), opal_ul::address::ParseAeAddressError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AeAddr {
    ae_title: Option<String>,
    socket_addr: String,
}

impl AeAddr {
    /// Create an address with an explicit AE title.
    pub fn new(ae_title: impl Into<String>, socket_addr: impl Into<String>) -> Self {
        AeAddr {
            ae_title: Some(ae_title.into()),
            socket_addr: socket_addr.into(),
        }
    }

    /// The application entity title portion, if present.
    pub fn ae_title(&self) -> Option<&str> {
        self.ae_title.as_deref()
    }

    /// The socket address portion (`host:port`).
    pub fn socket_addr(&self) -> &str {
        &self.socket_addr
    }
}

impl FromStr for AeAddr {
    type Err = ParseAeAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('@') {
            Some((ae_title, socket_addr)) => {
                check_ae_title(ae_title)?;
                ensure!(!socket_addr.is_empty(), MissingSocketAddressSnafu);
                Ok(AeAddr {
                    ae_title: Some(ae_title.to_string()),
                    socket_addr: socket_addr.to_string(),
                })
            }
            None => Ok(AeAddr {
                ae_title: None,
                socket_addr: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for AeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ae_title {
            Some(ae_title) => write!(f, "{}@{}", ae_title, self.socket_addr),
            None => f.write_str(&self.socket_addr),
        }
    }
}

/// An addressable DICOM peer.
///
/// Values of this type are immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DicomNode {
    aet: String,
    hostname: String,
    port: u16,
    secure: bool,
    validate_hostname: bool,
}

impl DicomNode {
    /// Create a new node description.
    ///
    /// Fails if the AE title is empty, non-ASCII,
    /// or longer than 16 characters.
    pub fn new(
        aet: impl Into<String>,
        hostname: impl Into<String>,
        port: u16,
    ) -> Result<Self, ParseAeAddressError> {
        let aet = aet.into();
        check_ae_title(&aet)?;
        Ok(DicomNode {
            aet,
            hostname: hostname.into(),
            port,
            secure: false,
            validate_hostname: false,
        })
    }

    /// Create a node description from an `AET@host:port` address.
    pub fn from_ae_addr(addr: &AeAddr) -> Result<Self, ParseAeAddressError> {
        let aet = addr.ae_title().context(EmptyAeTitleSnafu)?.to_string();
        check_ae_title(&aet)?;
        let (hostname, port) = match addr.socket_addr().rsplit_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse().ok().unwrap_or(DEFAULT_PORT),
            ),
            None => (addr.socket_addr().to_string(), DEFAULT_PORT),
        };
        Ok(DicomNode {
            aet,
            hostname,
            port,
            secure: false,
            validate_hostname: false,
        })
    }

    /// Request a secure transport when connecting to this node.
    ///
    /// The transport itself is provided by the caller;
    /// this is only a negotiation knob.
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Whether to validate the peer hostname on secure transports.
    pub fn validate_hostname(mut self, validate: bool) -> Self {
        self.validate_hostname = validate;
        self
    }

    pub fn aet(&self) -> &str {
        &self.aet
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn validates_hostname(&self) -> bool {
        self.validate_hostname
    }

    /// The `host:port` form of this node's endpoint.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

impl fmt::Display for DicomNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.aet, self.hostname, self.port)
    }
}
