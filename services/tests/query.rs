//! End-to-end query/retrieve tests against scripted providers:
//! C-FIND with cancel-after, and C-MOVE sub-operation accounting.

use std::net::TcpListener;
use std::sync::Arc;
use std::thread;

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries;

use opal_dimse::commands::{self, CommandField};
use opal_dimse::message;
use opal_dimse::progress::DicomProgress;
use opal_dimse::status::codes;
use opal_services::find::{FindOptions, FindScu};
use opal_services::query::InformationModel;
use opal_services::retrieve::{MoveScu, RetrieveOptions};
use opal_ul::association::server::ServerAssociationOptions;
use opal_ul::ServerAssociation;

fn spawn_scripted_scp<F>(
    abstract_syntax: &'static str,
    handler: F,
) -> std::net::SocketAddr
where
    F: FnOnce(ServerAssociation) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (stream, _addr) = listener.accept().unwrap();
        let association = ServerAssociationOptions::new()
            .accept_any()
            .ae_title("SCRIPTED")
            .with_abstract_syntax(abstract_syntax)
            .establish(stream)
            .unwrap();
        handler(association);
    });
    addr
}

fn match_identifier(index: u32) -> Vec<u8> {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::QUERY_RETRIEVE_LEVEL,
        VR::CS,
        dicom_value!(Str, "STUDY"),
    ));
    obj.put(DataElement::new(
        tags::PATIENT_NAME,
        VR::PN,
        dicom_value!(Str, format!("PATIENT^{:02}", index)),
    ));
    let mut bytes = Vec::new();
    obj.write_dataset_with_ts(&mut bytes, &entries::EXPLICIT_VR_LITTLE_ENDIAN.erased())
        .unwrap();
    bytes
}

fn finish_release(mut association: ServerAssociation) {
    let _ = association.receive();
    let _ = association.send(&opal_ul::Pdu::ReleaseRP);
}

#[test]
fn find_cancels_after_three_matches() {
    let find_uid = InformationModel::StudyRoot.find_uid();
    let addr = spawn_scripted_scp(find_uid, move |mut association| {
        let request = message::read_message(&mut association).unwrap();
        assert_eq!(
            commands::command_field(&request.command).unwrap(),
            CommandField::CFindRq
        );
        let message_id = commands::message_id(&request.command).unwrap();
        let pcid = request.presentation_context_id;

        // the provider would have ten matches;
        // it stops as soon as the cancel arrives
        for index in 1..=3 {
            let rsp = commands::find_rsp(message_id, find_uid, codes::PENDING, true);
            message::write_message(
                &mut association,
                pcid,
                &rsp,
                Some(&match_identifier(index)),
            )
            .unwrap();
        }

        // exactly three pending responses went out; now the cancel
        let cancel = message::read_message(&mut association).unwrap();
        assert_eq!(
            commands::command_field(&cancel.command).unwrap(),
            CommandField::CCancelRq
        );
        assert_eq!(
            commands::message_id_responded(&cancel.command).unwrap(),
            message_id
        );

        let rsp = commands::find_rsp(message_id, find_uid, codes::CANCEL, false);
        message::write_message(&mut association, pcid, &rsp, None).unwrap();
        finish_release(association);
    });

    let mut scu = FindScu::open(
        "FIND-SCU",
        "SCRIPTED",
        &addr.to_string(),
        InformationModel::StudyRoot,
    )
    .unwrap();

    let mut keys = InMemDicomObject::new_empty();
    keys.put(DataElement::new(
        tags::QUERY_RETRIEVE_LEVEL,
        VR::CS,
        dicom_value!(Str, "STUDY"),
    ));
    keys.put(DataElement::new(
        tags::PATIENT_NAME,
        VR::PN,
        dicom_value!(Str, "*"),
    ));

    let options = FindOptions {
        cancel_after: 3,
        ..FindOptions::default()
    };
    let progress = DicomProgress::new();
    let mut seen = Vec::new();
    let state = scu
        .find(&keys, &options, &progress, |number, identifier| {
            let name = identifier
                .element(tags::PATIENT_NAME)
                .unwrap()
                .to_str()
                .unwrap()
                .to_string();
            seen.push((number, name));
        })
        .unwrap();
    scu.close().unwrap();

    // exactly three matches were delivered, then the final cancel status
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[0].0, 1);
    assert_eq!(state.status(), 0xFE00);
    assert_eq!(progress.completed(), 3);
}

#[test]
fn move_counts_down_sub_operations() {
    let move_uid = InformationModel::StudyRoot.move_uid().unwrap();
    let addr = spawn_scripted_scp(move_uid, move |mut association| {
        let request = message::read_message(&mut association).unwrap();
        assert_eq!(
            commands::command_field(&request.command).unwrap(),
            CommandField::CMoveRq
        );
        assert_eq!(
            commands::move_destination(&request.command).unwrap(),
            "DEST-AET"
        );
        let message_id = commands::message_id(&request.command).unwrap();
        let pcid = request.presentation_context_id;

        // count five sub-operations down to zero
        for completed in 0..5u16 {
            let rsp = commands::retrieve_rsp(
                CommandField::CMoveRsp,
                message_id,
                move_uid,
                codes::PENDING,
                5 - completed,
                completed,
                0,
                0,
            );
            message::write_message(&mut association, pcid, &rsp, None).unwrap();
        }
        let rsp = commands::retrieve_rsp(
            CommandField::CMoveRsp,
            message_id,
            move_uid,
            codes::SUCCESS,
            0,
            5,
            0,
            0,
        );
        message::write_message(&mut association, pcid, &rsp, None).unwrap();
        finish_release(association);
    });

    let mut scu = MoveScu::open(
        "MOVE-SCU",
        "SCRIPTED",
        &addr.to_string(),
        InformationModel::StudyRoot,
    )
    .unwrap();

    let mut keys = InMemDicomObject::new_empty();
    keys.put(DataElement::new(
        tags::QUERY_RETRIEVE_LEVEL,
        VR::CS,
        dicom_value!(Str, "STUDY"),
    ));
    keys.put(DataElement::new(
        tags::STUDY_INSTANCE_UID,
        VR::UI,
        dicom_value!(Str, "1.2.3.4"),
    ));

    let progress = DicomProgress::new();
    let state = scu
        .retrieve(&keys, "DEST-AET", &RetrieveOptions::default(), &progress)
        .unwrap();
    scu.close().unwrap();

    assert_eq!(state.status(), 0x0000);
    assert_eq!(progress.remaining(), 0);
    assert_eq!(progress.completed(), 5);
    assert_eq!(progress.failed(), 0);
}

#[test]
fn progress_listener_cancels_a_find() {
    let find_uid = InformationModel::PatientRoot.find_uid();
    let addr = spawn_scripted_scp(find_uid, move |mut association| {
        let request = message::read_message(&mut association).unwrap();
        let message_id = commands::message_id(&request.command).unwrap();
        let pcid = request.presentation_context_id;

        let rsp = commands::find_rsp(message_id, find_uid, codes::PENDING, true);
        message::write_message(&mut association, pcid, &rsp, Some(&match_identifier(1)))
            .unwrap();

        // the listener flips the cancel flag on the first match
        let cancel = message::read_message(&mut association).unwrap();
        assert_eq!(
            commands::command_field(&cancel.command).unwrap(),
            CommandField::CCancelRq
        );

        let rsp = commands::find_rsp(message_id, find_uid, codes::CANCEL, false);
        message::write_message(&mut association, pcid, &rsp, None).unwrap();
        finish_release(association);
    });

    let mut scu = FindScu::open(
        "FIND-SCU",
        "SCRIPTED",
        &addr.to_string(),
        InformationModel::PatientRoot,
    )
    .unwrap();

    let progress = DicomProgress::new();
    progress.add_listener(Box::new(|p| p.cancel()));

    let mut keys = InMemDicomObject::new_empty();
    keys.put(DataElement::new(
        tags::QUERY_RETRIEVE_LEVEL,
        VR::CS,
        dicom_value!(Str, "PATIENT"),
    ));

    let state = scu
        .find(&keys, &FindOptions::default(), &progress, |_, _| {})
        .unwrap();
    scu.close().unwrap();

    assert_eq!(state.status(), 0xFE00);
    assert!(progress.is_cancelled());
}
