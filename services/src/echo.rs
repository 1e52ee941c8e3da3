//! The verification service (C-ECHO) as a service class user.

use std::time::Duration;

use dicom_dictionary_std::uids;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::info;

use opal_dimse::commands;
use opal_dimse::mux::Multiplexer;
use opal_dimse::progress::DicomState;
use opal_dimse::status::codes;
use opal_ul::association::ClientAssociationOptions;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// could not establish the association
    Establish {
        source: opal_ul::association::client::Error,
    },

    /// could not set up the request multiplexer
    Multiplex { source: opal_dimse::mux::Error },

    /// no presentation context accepted for verification
    NoVerificationContext,

    /// the echo request failed
    Echo { source: opal_dimse::mux::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A verification service class user.
///
/// # Example
///
/// ```no_run
/// # use opal_services::echo::EchoScu;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let mut scu = EchoScu::open("ECHO-SCU", "ANY-SCP", "pacs.example.org:104")?;
/// let state = scu.echo()?;
/// assert_eq!(state.status(), 0x0000);
/// scu.close()?;
/// # Ok(())
/// # }
/// ```
pub struct EchoScu {
    mux: Option<Multiplexer>,
    pc_id: u8,
    response_timeout: Option<Duration>,
}

impl EchoScu {
    /// Establish an association proposing the verification SOP class.
    pub fn open(
        calling_ae_title: &str,
        called_ae_title: &str,
        address: &str,
    ) -> Result<EchoScu> {
        let association = ClientAssociationOptions::new()
            .calling_ae_title(calling_ae_title.to_string())
            .called_ae_title(called_ae_title.to_string())
            .with_presentation_context(uids::VERIFICATION, Vec::<String>::new())
            .establish_with(address)
            .context(EstablishSnafu)?;

        let pc_id = association
            .contexts()
            .accepted()
            .find(|pc| pc.abstract_syntax == uids::VERIFICATION)
            .map(|pc| pc.id)
            .context(NoVerificationContextSnafu)?;

        let mux = Multiplexer::new(association).context(MultiplexSnafu)?;
        Ok(EchoScu {
            mux: Some(mux),
            pc_id,
            response_timeout: None,
        })
    }

    /// Set a timeout for the echo response.
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    /// Send one C-ECHO-RQ and wait for its response.
    pub fn echo(&mut self) -> Result<DicomState> {
        let mux = self.mux.as_ref().expect("association is open");
        let mut handle = mux
            .send_request(self.pc_id, None, |message_id| {
                commands::echo_rq(message_id, uids::VERIFICATION)
            })
            .context(EchoSnafu)?;

        let response = match self.response_timeout {
            Some(timeout) => handle.recv_timeout(timeout),
            None => handle.recv(),
        }
        .context(EchoSnafu)?;

        let mut state = DicomState::default();
        state.set_status(response.status);
        if response.status == codes::SUCCESS {
            state.progress().add_completed();
            info!("verification succeeded");
        } else {
            state.progress().add_failed();
            state.set_message(format!(
                "verification failed with status {:04X}H",
                response.status
            ));
        }
        state.progress().notify();
        Ok(state)
    }

    /// Release the association.
    pub fn close(mut self) -> Result<()> {
        if let Some(mux) = self.mux.take() {
            mux.release().context(EchoSnafu)?;
        }
        Ok(())
    }
}
