//! Multiplexed DIMSE request handling over one association.
//!
//! The [`Multiplexer`] splits an established client association
//! into a single reader task and a serialized writer:
//!
//! - the reader is the only thread that reads from the socket;
//!   it parses PDUs, assembles response messages,
//!   and routes each one to the caller waiting on its message ID;
//! - all writes go through a mutex held across one whole PDU,
//!   so exactly one PDU is on the wire at any instant.
//!
//! Callers obtain a [`RequestHandle`] per request and may hold
//! several outstanding requests at once (e.g. pipelined C-STOREs).
//! Responses with a pending status keep the continuation alive;
//! a final status retires it.
//! Each handle can issue a C-CANCEL-RQ for its own message ID.

use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use snafu::{ensure, OptionExt, ResultExt, Snafu};
use tracing::{debug, warn};

use opal_ul::association::ClientAssociation;
use opal_ul::context::NegotiatedContexts;
use opal_ul::pdu::{read_pdu, write_pdu, AbortRQSource, Pdu};

use crate::commands::{self, CommandField};
use crate::message::{self, DicomMessage, MessageAssembler};
use crate::status::{self, StatusType};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// could not clone the association socket for the reader task
    CloneStream { source: std::io::Error },

    /// could not spawn the reader task
    SpawnReader { source: std::io::Error },

    #[snafu(display("presentation context {} was not accepted", id))]
    ContextNotAccepted { id: u8 },

    #[snafu(display("SCU role was not negotiated for presentation context {}", id))]
    RoleNotNegotiated { id: u8 },

    /// failed to send the request message
    SendRequest {
        #[snafu(source(from(message::WriteError, Box::from)))]
        source: Box<message::WriteError>,
    },

    /// failed to send the cancel request
    SendCancel {
        #[snafu(source(from(message::WriteError, Box::from)))]
        source: Box<message::WriteError>,
    },

    /// the association was aborted
    AssociationAborted,

    /// the association was released while requests were outstanding
    AssociationReleased,

    #[snafu(display("protocol error: {}", message))]
    ProtocolError { message: String },

    /// timed out waiting for a response
    Timeout,

    /// the operation was cancelled
    Cancelled,

    /// failed to release the association
    Release { source: opal_ul::association::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The terminal failure of an association,
/// reported to every pending continuation.
#[derive(Debug, Clone)]
enum Failure {
    Aborted,
    Released,
    Protocol(String),
}

impl Failure {
    fn to_error(&self) -> Error {
        match self {
            Failure::Aborted => Error::AssociationAborted,
            Failure::Released => Error::AssociationReleased,
            Failure::Protocol(message) => Error::ProtocolError {
                message: message.clone(),
            },
        }
    }
}

enum Event {
    Response { message: DicomMessage, status: u16 },
    Failed(Failure),
}

/// One routed DIMSE response.
#[derive(Debug)]
pub struct Response {
    /// the parsed command set of the response
    pub command: dicom_object::InMemDicomObject,
    /// the raw data set bytes, if the response carries one
    pub data: Option<Vec<u8>>,
    /// the status code from the command set
    pub status: u16,
    /// the classification of the status code
    pub kind: StatusType,
}

#[derive(Debug)]
struct PendingMap {
    map: HashMap<u16, mpsc::Sender<Event>>,
    next_id: u16,
}

#[derive(Debug)]
struct Shared {
    pending: Mutex<PendingMap>,
    pending_cond: Condvar,
    state: Mutex<MuxState>,
    state_cond: Condvar,
    /// messages sent and received, tallied by DIMSE command field
    counters: Mutex<HashMap<CommandField, (u64, u64)>>,
}

impl Shared {
    fn count_sent(&self, field: CommandField) {
        self.counters.lock().unwrap().entry(field).or_default().0 += 1;
    }

    fn count_received(&self, field: CommandField) {
        self.counters.lock().unwrap().entry(field).or_default().1 += 1;
    }
}

#[derive(Default, Debug)]
struct MuxState {
    closed: bool,
    release_acked: bool,
    interrupted: bool,
    failure: Option<Failure>,
}

impl Shared {
    /// Fail every pending continuation and mark the association closed.
    fn fail_all(&self, failure: Failure) {
        {
            let mut state = self.state.lock().unwrap();
            state.closed = true;
            if state.failure.is_none() {
                state.failure = Some(failure.clone());
            }
        }
        self.state_cond.notify_all();
        let mut pending = self.pending.lock().unwrap();
        for (_, tx) in pending.map.drain() {
            let _ = tx.send(Event::Failed(failure.clone()));
        }
        self.pending_cond.notify_all();
    }
}

/// A multiplexer of concurrent DIMSE requests over one association.
///
/// Dropping the multiplexer aborts the association
/// unless it was released beforehand.
pub struct Multiplexer {
    assoc: Arc<Mutex<ClientAssociation>>,
    shared: Arc<Shared>,
    contexts: NegotiatedContexts,
    reader: Option<JoinHandle<()>>,
}

impl Multiplexer {
    /// Take over an established client association,
    /// spawning the dedicated reader task.
    pub fn new(mut association: ClientAssociation) -> Result<Self> {
        let contexts = association.contexts().clone();
        let read_stream = association
            .inner_stream()
            .try_clone()
            .context(CloneStreamSnafu)?;
        let max_pdu_length = association.requestor_max_pdu_length();

        let shared = Arc::new(Shared {
            pending: Mutex::new(PendingMap {
                map: HashMap::new(),
                next_id: 1,
            }),
            pending_cond: Condvar::new(),
            state: Mutex::new(MuxState::default()),
            state_cond: Condvar::new(),
            counters: Mutex::new(HashMap::new()),
        });

        let assoc = Arc::new(Mutex::new(association));

        let reader = thread::Builder::new()
            .name("dimse-reader".to_string())
            .spawn({
                let shared = Arc::clone(&shared);
                let assoc = Arc::clone(&assoc);
                move || reader_loop(read_stream, max_pdu_length, &shared, &assoc)
            })
            .context(SpawnReaderSnafu)?;

        Ok(Multiplexer {
            assoc,
            shared,
            contexts,
            reader: Some(reader),
        })
    }

    /// The negotiated presentation contexts of the association.
    pub fn contexts(&self) -> &NegotiatedContexts {
        &self.contexts
    }

    /// The number of requests with outstanding responses.
    pub fn outstanding(&self) -> usize {
        self.shared.pending.lock().unwrap().map.len()
    }

    /// The number of messages sent and received so far,
    /// tallied by DIMSE command field.
    pub fn message_counts(&self) -> Vec<(CommandField, u64, u64)> {
        let counters = self.shared.counters.lock().unwrap();
        let mut counts: Vec<_> = counters
            .iter()
            .map(|(field, (sent, received))| (*field, *sent, *received))
            .collect();
        counts.sort_by_key(|(field, _, _)| field.code());
        counts
    }

    /// Send a DIMSE request over the given presentation context.
    ///
    /// The command set is produced by `build`,
    /// which receives the allocated message ID.
    /// Returns a handle on which the responses for this request
    /// can be awaited.
    pub fn send_request<F>(
        &self,
        presentation_context_id: u8,
        data: Option<Vec<u8>>,
        build: F,
    ) -> Result<RequestHandle>
    where
        F: FnOnce(u16) -> dicom_object::InMemDicomObject,
    {
        let context = self
            .contexts
            .get(presentation_context_id)
            .filter(|pc| pc.is_accepted())
            .context(ContextNotAcceptedSnafu {
                id: presentation_context_id,
            })?;
        // sending a request requires the SCU role on this context
        ensure!(
            context.scu_role,
            RoleNotNegotiatedSnafu {
                id: presentation_context_id
            }
        );

        {
            let state = self.shared.state.lock().unwrap();
            if state.closed {
                return Err(state
                    .failure
                    .as_ref()
                    .map(Failure::to_error)
                    .unwrap_or(Error::AssociationAborted));
            }
        }

        let (message_id, rx) = {
            let mut pending = self.shared.pending.lock().unwrap();
            let message_id = allocate_id(&mut pending);
            let (tx, rx) = mpsc::channel();
            pending.map.insert(message_id, tx);
            (message_id, rx)
        };

        let command = build(message_id);

        let send_result = {
            let mut assoc = self.assoc.lock().unwrap();
            message::write_message(
                &mut *assoc,
                presentation_context_id,
                &command,
                data.as_deref(),
            )
        };

        if let Err(e) = send_result {
            // roll the registration back
            let mut pending = self.shared.pending.lock().unwrap();
            pending.map.remove(&message_id);
            self.shared.pending_cond.notify_all();
            return Err(e).context(SendRequestSnafu);
        }

        if let Ok(field) = commands::command_field(&command) {
            self.shared.count_sent(field);
        }
        debug!(message_id, pcid = presentation_context_id, "request sent");

        Ok(RequestHandle {
            message_id,
            presentation_context_id,
            rx,
            shared: Arc::clone(&self.shared),
            assoc: Arc::clone(&self.assoc),
            cancelled: false,
            finished: false,
        })
    }

    /// Block until the response map is empty,
    /// i.e. every outstanding request has received its final response.
    ///
    /// Completes immediately with [`Error::Cancelled`]
    /// when [`interrupt`](Self::interrupt) is called,
    /// and with the terminal failure when the association goes down.
    pub fn wait_outstanding(&self) -> Result<()> {
        let mut pending = self.shared.pending.lock().unwrap();
        loop {
            if pending.map.is_empty() {
                return Ok(());
            }
            {
                let state = self.shared.state.lock().unwrap();
                if state.interrupted {
                    return Err(Error::Cancelled);
                }
                if state.closed {
                    return Err(state
                        .failure
                        .as_ref()
                        .map(Failure::to_error)
                        .unwrap_or(Error::AssociationAborted));
                }
            }
            let (guard, _timeout) = self
                .shared
                .pending_cond
                .wait_timeout(pending, Duration::from_millis(100))
                .unwrap();
            pending = guard;
        }
    }

    /// Wake any caller blocked in [`wait_outstanding`](Self::wait_outstanding),
    /// making it complete with [`Error::Cancelled`].
    pub fn interrupt(&self) {
        self.shared.state.lock().unwrap().interrupted = true;
        self.shared.state_cond.notify_all();
        self.shared.pending_cond.notify_all();
    }

    /// Gracefully release the association:
    /// send A-RELEASE-RQ and wait for the peer's release reply.
    pub fn release(mut self) -> Result<()> {
        {
            let mut assoc = self.assoc.lock().unwrap();
            assoc.send(&Pdu::ReleaseRQ).context(ReleaseSnafu)?;
        }
        // the reader task observes the A-RELEASE-RP
        let mut state = self.shared.state.lock().unwrap();
        let deadline = Duration::from_secs(30);
        let (guard, timeout) = self
            .shared
            .state_cond
            .wait_timeout_while(state, deadline, |s| !s.release_acked && !s.closed)
            .unwrap();
        state = guard;
        let acked = state.release_acked;
        drop(state);

        self.assoc.lock().unwrap().close();
        self.join_reader();
        if acked {
            Ok(())
        } else if timeout.timed_out() {
            Err(Error::Timeout)
        } else {
            Err(Error::AssociationAborted)
        }
    }

    /// Abort the association immediately.
    /// Outstanding requests fail with [`Error::AssociationAborted`].
    pub fn abort(mut self) -> Result<()> {
        let _ = self.assoc.lock().unwrap().abort();
        self.shared.fail_all(Failure::Aborted);
        self.join_reader();
        Ok(())
    }

    fn join_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        let closed = self.shared.state.lock().unwrap().closed;
        if !closed {
            let _ = self.assoc.lock().unwrap().abort();
            self.shared.fail_all(Failure::Aborted);
        }
        self.join_reader();
    }
}

/// Allocate the next free message ID:
/// monotonically increasing, wrapping at 2^16 - 1,
/// skipping identifiers still in flight.
fn allocate_id(pending: &mut PendingMap) -> u16 {
    loop {
        let candidate = pending.next_id;
        pending.next_id = if pending.next_id == u16::MAX {
            1
        } else {
            pending.next_id + 1
        };
        if !pending.map.contains_key(&candidate) {
            return candidate;
        }
    }
}

fn reader_loop(
    mut stream: TcpStream,
    max_pdu_length: u32,
    shared: &Shared,
    assoc: &Mutex<ClientAssociation>,
) {
    let mut assembler = MessageAssembler::new();
    loop {
        let pdu = match read_pdu(&mut stream, max_pdu_length, false) {
            Ok(pdu) => pdu,
            Err(opal_ul::pdu::reader::Error::NoPduAvailable { .. }) => {
                shared.fail_all(Failure::Aborted);
                return;
            }
            Err(e) => {
                // a framing violation aborts the association
                let _ = write_pdu(
                    &mut stream,
                    &Pdu::AbortRQ {
                        source: AbortRQSource::ServiceUser,
                    },
                );
                shared.fail_all(Failure::Protocol(e.to_string()));
                return;
            }
        };

        match pdu {
            Pdu::PData { data } => {
                for pdv in data {
                    match assembler.push(pdv) {
                        Ok(Some(message)) => dispatch_response(message, shared),
                        Ok(None) => {}
                        Err(e) => {
                            let _ = write_pdu(
                                &mut stream,
                                &Pdu::AbortRQ {
                                    source: AbortRQSource::ServiceUser,
                                },
                            );
                            shared.fail_all(Failure::Protocol(e.to_string()));
                            return;
                        }
                    }
                }
            }
            Pdu::ReleaseRP => {
                {
                    let mut state = shared.state.lock().unwrap();
                    state.release_acked = true;
                    state.closed = true;
                }
                shared.state_cond.notify_all();
                // any request still outstanding at this point is lost
                let mut pending = shared.pending.lock().unwrap();
                for (_, tx) in pending.map.drain() {
                    let _ = tx.send(Event::Failed(Failure::Released));
                }
                shared.pending_cond.notify_all();
                return;
            }
            Pdu::ReleaseRQ => {
                // peer-initiated release: acknowledge and close
                {
                    let mut guard = assoc.lock().unwrap();
                    let _ = guard.send(&Pdu::ReleaseRP);
                    guard.close();
                }
                shared.fail_all(Failure::Released);
                return;
            }
            Pdu::AbortRQ { source } => {
                debug!("association aborted by peer: {:?}", source);
                shared.fail_all(Failure::Aborted);
                return;
            }
            pdu => {
                let _ = write_pdu(
                    &mut stream,
                    &Pdu::AbortRQ {
                        source: AbortRQSource::ServiceUser,
                    },
                );
                shared.fail_all(Failure::Protocol(format!(
                    "unexpected PDU: {}",
                    pdu.short_description()
                )));
                return;
            }
        }
    }
}

/// Route one assembled message to the continuation
/// registered under its message ID.
fn dispatch_response(message: DicomMessage, shared: &Shared) {
    let command_field = match commands::command_field(&message.command) {
        Ok(field) => field,
        Err(e) => {
            warn!("discarding message with bad command set: {}", e);
            return;
        }
    };
    if !command_field.is_response() {
        warn!(
            "discarding unexpected {:?} request on multiplexed association",
            command_field
        );
        return;
    }
    shared.count_received(command_field);
    let message_id = match commands::message_id_responded(&message.command) {
        Ok(id) => id,
        Err(e) => {
            warn!("discarding response without message ID: {}", e);
            return;
        }
    };
    let status = match commands::status(&message.command) {
        Ok(status) => status,
        Err(e) => {
            warn!("discarding response without status: {}", e);
            return;
        }
    };

    let is_final = status::classify(status).is_final();

    let mut pending = shared.pending.lock().unwrap();
    let Some(tx) = pending.map.get(&message_id) else {
        warn!(message_id, "response for unknown message ID");
        return;
    };
    let _ = tx.send(Event::Response { message, status });
    if is_final {
        pending.map.remove(&message_id);
        drop(pending);
        shared.pending_cond.notify_all();
    }
}

/// The continuation of one DIMSE request:
/// receives the pending and final responses for its message ID.
#[derive(Debug)]
pub struct RequestHandle {
    message_id: u16,
    presentation_context_id: u8,
    rx: mpsc::Receiver<Event>,
    shared: Arc<Shared>,
    assoc: Arc<Mutex<ClientAssociation>>,
    cancelled: bool,
    finished: bool,
}

impl RequestHandle {
    /// The message ID allocated to this request.
    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    /// Whether a cancel request was issued for this request.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Await the next response for this request.
    ///
    /// Responses arrive in the order sent by the peer.
    /// After [`cancel`](Self::cancel), pending responses are skipped
    /// and only the final response is delivered.
    pub fn recv(&mut self) -> Result<Response> {
        self.recv_inner(None)
    }

    /// Await the next response, giving up after `timeout`.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Response> {
        self.recv_inner(Some(timeout))
    }

    fn recv_inner(&mut self, timeout: Option<Duration>) -> Result<Response> {
        loop {
            let event = match timeout {
                Some(timeout) => self.rx.recv_timeout(timeout).map_err(|e| match e {
                    mpsc::RecvTimeoutError::Timeout => Error::Timeout,
                    mpsc::RecvTimeoutError::Disconnected => Error::AssociationAborted,
                })?,
                None => self.rx.recv().map_err(|_| Error::AssociationAborted)?,
            };
            match event {
                Event::Response { message, status } => {
                    let kind = status::classify(status);
                    if kind.is_final() {
                        self.finished = true;
                    } else if self.cancelled {
                        // pending responses after a cancel are ignored,
                        // but the final response is still awaited
                        continue;
                    }
                    return Ok(Response {
                        command: message.command,
                        data: message.data,
                        status,
                        kind,
                    });
                }
                Event::Failed(failure) => {
                    self.finished = true;
                    return Err(failure.to_error());
                }
            }
        }
    }

    /// Transmit a C-CANCEL-RQ for this request's message ID.
    ///
    /// The request stays registered until its final response arrives.
    pub fn cancel(&mut self) -> Result<()> {
        if self.cancelled || self.finished {
            return Ok(());
        }
        self.cancelled = true;
        let command = commands::cancel_rq(self.message_id);
        let mut assoc = self.assoc.lock().unwrap();
        message::write_message(&mut *assoc, self.presentation_context_id, &command, None)
            .context(SendCancelSnafu)
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        // retire the continuation if the caller gives up early
        let mut pending = self.shared.pending.lock().unwrap();
        if pending.map.remove(&self.message_id).is_some() {
            drop(pending);
            self.shared.pending_cond.notify_all();
        }
    }
}
