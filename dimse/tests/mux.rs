//! Integration tests for the DIMSE multiplexer
//! against a scripted SCP over loopback TCP.

use std::net::TcpListener;
use std::thread;

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries;

use opal_dimse::commands;
use opal_dimse::message;
use opal_dimse::mux::{Error as MuxError, Multiplexer};
use opal_dimse::status::{codes, StatusType};
use opal_ul::association::server::ServerAssociationOptions;
use opal_ul::association::ClientAssociationOptions;
use opal_ul::ServerAssociation;

static VERIFICATION: &str = "1.2.840.10008.1.1";
static STUDY_ROOT_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";
static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

fn spawn_scp<F>(abstract_syntaxes: Vec<&'static str>, handler: F) -> std::net::SocketAddr
where
    F: FnOnce(ServerAssociation) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (stream, _addr) = listener.accept().unwrap();
        let mut options = ServerAssociationOptions::new()
            .accept_any()
            .ae_title("MUX-SCP")
            .with_transfer_syntax(IMPLICIT_VR_LE);
        for uid in &abstract_syntaxes {
            options = options.with_abstract_syntax(*uid);
        }
        let association = options.establish(stream).unwrap();
        handler(association);
    });
    addr
}

fn identifier_bytes(name: &str) -> Vec<u8> {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::PATIENT_NAME,
        VR::PN,
        dicom_value!(Str, name),
    ));
    let mut bytes = Vec::new();
    obj.write_dataset_with_ts(&mut bytes, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .unwrap();
    bytes
}

fn connect(addr: std::net::SocketAddr, abstract_syntaxes: &[&str]) -> Multiplexer {
    let mut options = ClientAssociationOptions::new().calling_ae_title("MUX-SCU");
    for uid in abstract_syntaxes {
        options = options.with_presentation_context(*uid, vec![IMPLICIT_VR_LE]);
    }
    let association = options.establish(addr).unwrap();
    Multiplexer::new(association).unwrap()
}

#[test]
fn echo_roundtrip() {
    let addr = spawn_scp(vec![VERIFICATION], |mut association| {
        let message = message::read_message(&mut association).unwrap();
        let message_id = commands::message_id(&message.command).unwrap();
        let response = commands::echo_rsp(message_id, VERIFICATION, codes::SUCCESS);
        message::write_message(
            &mut association,
            message.presentation_context_id,
            &response,
            None,
        )
        .unwrap();
        // wait for release
        let _ = association.receive();
        let _ = association.send(&opal_ul::Pdu::ReleaseRP);
    });

    let mux = connect(addr, &[VERIFICATION]);
    let pc_id = mux.contexts().accepted().next().unwrap().id;

    let mut handle = mux
        .send_request(pc_id, None, |id| commands::echo_rq(id, VERIFICATION))
        .unwrap();
    let response = handle.recv().unwrap();
    assert_eq!(response.status, codes::SUCCESS);
    assert_eq!(response.kind, StatusType::Success);

    // one echo request out, one echo response in
    let counts = mux.message_counts();
    assert!(counts.contains(&(commands::CommandField::CEchoRq, 1, 0)));
    assert!(counts.contains(&(commands::CommandField::CEchoRsp, 0, 1)));

    mux.wait_outstanding().unwrap();
    drop(handle);
    mux.release().unwrap();
}

#[test]
fn responses_route_to_their_requests() {
    let addr = spawn_scp(vec![STUDY_ROOT_FIND], |mut association| {
        // collect the two requests first
        let first = message::read_message(&mut association).unwrap();
        let second = message::read_message(&mut association).unwrap();
        let first_id = commands::message_id(&first.command).unwrap();
        let second_id = commands::message_id(&second.command).unwrap();
        let pcid = first.presentation_context_id;

        // answer out of request order, interleaving pending responses
        let send = |association: &mut ServerAssociation, id: u16, status: u16, data: bool| {
            let rsp = commands::find_rsp(id, STUDY_ROOT_FIND, status, data);
            let payload = data.then(|| identifier_bytes("DOE^JANE"));
            message::write_message(association, pcid, &rsp, payload.as_deref()).unwrap();
        };
        send(&mut association, second_id, codes::PENDING, true);
        send(&mut association, first_id, codes::PENDING, true);
        send(&mut association, second_id, codes::SUCCESS, false);
        send(&mut association, first_id, codes::SUCCESS, false);

        let _ = association.receive();
        let _ = association.send(&opal_ul::Pdu::ReleaseRP);
    });

    let mux = connect(addr, &[STUDY_ROOT_FIND]);
    let pc_id = mux.contexts().accepted().next().unwrap().id;
    let identifier = identifier_bytes("DOE^*");

    let mut first = mux
        .send_request(pc_id, Some(identifier.clone()), |id| {
            commands::find_rq(id, STUDY_ROOT_FIND, commands::Priority::Medium)
        })
        .unwrap();
    let mut second = mux
        .send_request(pc_id, Some(identifier), |id| {
            commands::find_rq(id, STUDY_ROOT_FIND, commands::Priority::Medium)
        })
        .unwrap();
    assert_ne!(first.message_id(), second.message_id());
    assert_eq!(mux.outstanding(), 2);

    // each handle sees its own pending match and then its final response,
    // in the order sent by the peer
    let pending = first.recv().unwrap();
    assert_eq!(pending.kind, StatusType::Pending);
    assert!(pending.data.is_some());
    let done = first.recv().unwrap();
    assert_eq!(done.kind, StatusType::Success);

    let pending = second.recv().unwrap();
    assert_eq!(pending.kind, StatusType::Pending);
    let done = second.recv().unwrap();
    assert_eq!(done.kind, StatusType::Success);

    mux.wait_outstanding().unwrap();
    drop((first, second));
    mux.release().unwrap();
}

#[test]
fn cancel_produces_cancel_status() {
    let addr = spawn_scp(vec![STUDY_ROOT_FIND], |mut association| {
        let request = message::read_message(&mut association).unwrap();
        let message_id = commands::message_id(&request.command).unwrap();
        let pcid = request.presentation_context_id;

        // one pending match, then the cancel arrives
        let rsp = commands::find_rsp(message_id, STUDY_ROOT_FIND, codes::PENDING, true);
        message::write_message(&mut association, pcid, &rsp, Some(&identifier_bytes("X")))
            .unwrap();

        let cancel = message::read_message(&mut association).unwrap();
        assert_eq!(
            commands::command_field(&cancel.command).unwrap(),
            commands::CommandField::CCancelRq
        );
        assert_eq!(
            commands::message_id_responded(&cancel.command).unwrap(),
            message_id
        );

        let rsp = commands::find_rsp(message_id, STUDY_ROOT_FIND, codes::CANCEL, false);
        message::write_message(&mut association, pcid, &rsp, None).unwrap();

        let _ = association.receive();
        let _ = association.send(&opal_ul::Pdu::ReleaseRP);
    });

    let mux = connect(addr, &[STUDY_ROOT_FIND]);
    let pc_id = mux.contexts().accepted().next().unwrap().id;

    let mut handle = mux
        .send_request(pc_id, Some(identifier_bytes("*")), |id| {
            commands::find_rq(id, STUDY_ROOT_FIND, commands::Priority::Medium)
        })
        .unwrap();

    let pending = handle.recv().unwrap();
    assert_eq!(pending.kind, StatusType::Pending);

    handle.cancel().unwrap();
    // pending responses are skipped after the cancel,
    // the final response is still delivered
    let done = handle.recv().unwrap();
    assert_eq!(done.status, codes::CANCEL);
    assert_eq!(done.kind, StatusType::Cancel);

    drop(handle);
    mux.release().unwrap();
}

#[test]
fn abort_fails_outstanding_requests() {
    let addr = spawn_scp(vec![STUDY_ROOT_FIND], |mut association| {
        let _request = message::read_message(&mut association).unwrap();
        // never respond; wait for the abort
        let _ = association.receive();
    });

    let mux = connect(addr, &[STUDY_ROOT_FIND]);
    let pc_id = mux.contexts().accepted().next().unwrap().id;

    let mut handle = mux
        .send_request(pc_id, Some(identifier_bytes("*")), |id| {
            commands::find_rq(id, STUDY_ROOT_FIND, commands::Priority::Medium)
        })
        .unwrap();

    mux.abort().unwrap();
    let err = handle.recv().unwrap_err();
    assert!(matches!(err, MuxError::AssociationAborted));
}

#[test]
fn request_on_unaccepted_context_fails_without_breaking_association() {
    let addr = spawn_scp(vec![VERIFICATION], |mut association| {
        let message = message::read_message(&mut association).unwrap();
        let message_id = commands::message_id(&message.command).unwrap();
        let response = commands::echo_rsp(message_id, VERIFICATION, codes::SUCCESS);
        message::write_message(
            &mut association,
            message.presentation_context_id,
            &response,
            None,
        )
        .unwrap();
        let _ = association.receive();
        let _ = association.send(&opal_ul::Pdu::ReleaseRP);
    });

    let mux = connect(addr, &[VERIFICATION]);
    let pc_id = mux.contexts().accepted().next().unwrap().id;

    // an unknown context is a caller fault, not fatal to the association
    let err = mux
        .send_request(99, None, |id| commands::echo_rq(id, VERIFICATION))
        .unwrap_err();
    assert!(matches!(err, MuxError::ContextNotAccepted { id: 99 }));

    let mut handle = mux
        .send_request(pc_id, None, |id| commands::echo_rq(id, VERIFICATION))
        .unwrap();
    assert_eq!(handle.recv().unwrap().status, codes::SUCCESS);
    drop(handle);
    mux.release().unwrap();
}
