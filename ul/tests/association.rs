//! Integration tests for association negotiation and data transfer
//! between a requester and an acceptor over loopback TCP.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::thread;

use opal_ul::association::client::Error as ClientError;
use opal_ul::association::server::ServerAssociationOptions;
use opal_ul::association::ClientAssociationOptions;
use opal_ul::pdu::{PDataValue, PDataValueType, Pdu};

static VERIFICATION: &str = "1.2.840.10008.1.1";
static CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

fn spawn_scp<F>(handler: F) -> (thread::JoinHandle<()>, std::net::SocketAddr)
where
    F: FnOnce(opal_ul::ServerAssociation) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (stream, _addr) = listener.accept().unwrap();
        let association = ServerAssociationOptions::new()
            .accept_any()
            .ae_title("TEST-SCP")
            .with_abstract_syntax(VERIFICATION)
            .with_abstract_syntax(CT_IMAGE_STORAGE)
            .with_transfer_syntax(IMPLICIT_VR_LE)
            .with_transfer_syntax(EXPLICIT_VR_LE)
            .establish(stream)
            .unwrap();
        handler(association);
    });
    (handle, addr)
}

#[test]
fn establish_send_and_release() {
    let (scp, addr) = spawn_scp(|mut association| {
        assert_eq!(association.client_ae_title(), "TEST-SCU");
        let pdu = association.receive().unwrap();
        match pdu {
            Pdu::PData { data } => {
                assert_eq!(data.len(), 1);
                assert_eq!(data[0].value_type, PDataValueType::Command);
                assert!(data[0].is_last);
                assert_eq!(data[0].data, vec![0xCA, 0xFE]);
            }
            pdu => panic!("unexpected PDU {:?}", pdu),
        }
        // answer something back
        association
            .send(&Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id: 1,
                    value_type: PDataValueType::Command,
                    is_last: true,
                    data: vec![0xBE, 0xEF],
                }],
            })
            .unwrap();
        // expect release
        let pdu = association.receive().unwrap();
        assert_eq!(pdu, Pdu::ReleaseRQ);
        association.send(&Pdu::ReleaseRP).unwrap();
    });

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title("TEST-SCU")
        .called_ae_title("TEST-SCP")
        .with_presentation_context(VERIFICATION, vec![IMPLICIT_VR_LE])
        .establish(addr)
        .unwrap();

    let contexts = association.contexts();
    assert_eq!(contexts.accepted_count(), 1);
    let pc = contexts.accepted().next().unwrap();
    assert_eq!(pc.id, 1);
    assert_eq!(pc.transfer_syntax, IMPLICIT_VR_LE);

    association
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0xCA, 0xFE],
            }],
        })
        .unwrap();

    let pdu = association.receive().unwrap();
    match pdu {
        Pdu::PData { data } => assert_eq!(data[0].data, vec![0xBE, 0xEF]),
        pdu => panic!("unexpected PDU {:?}", pdu),
    }

    association.release().unwrap();
    scp.join().unwrap();
}

#[test]
fn acceptor_takes_one_transfer_syntax_per_context() {
    let (scp, addr) = spawn_scp(|mut association| {
        let contexts: Vec<_> = association.contexts().accepted().cloned().collect();
        assert_eq!(contexts.len(), 2);
        // expect release
        let pdu = association.receive().unwrap();
        assert_eq!(pdu, Pdu::ReleaseRQ);
        association.send(&Pdu::ReleaseRP).unwrap();
    });

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title("TEST-SCU")
        .with_presentation_context(VERIFICATION, vec![EXPLICIT_VR_LE, IMPLICIT_VR_LE])
        .with_presentation_context(CT_IMAGE_STORAGE, vec![EXPLICIT_VR_LE, IMPLICIT_VR_LE])
        .establish(addr)
        .unwrap();

    for pc in association.contexts().accepted() {
        // exactly one transfer syntax comes back per context:
        // the first supported one proposed
        assert_eq!(pc.transfer_syntax, EXPLICIT_VR_LE);
    }
    assert_eq!(association.contexts().accepted_count(), 2);

    association.release().unwrap();
    scp.join().unwrap();
}

#[test]
fn unknown_abstract_syntax_is_not_accepted() {
    let (scp, addr) = spawn_scp(|mut association| {
        // no context accepted, the client is expected to give up
        assert_eq!(association.contexts().accepted_count(), 0);
        let _ = association.receive();
    });

    let result = ClientAssociationOptions::new()
        .calling_ae_title("TEST-SCU")
        .with_presentation_context("1.2.840.10008.999.999", vec![IMPLICIT_VR_LE])
        .establish(addr);

    assert!(matches!(result, Err(ClientError::NothingAccepted { .. })));
    scp.join().unwrap();
}

#[test]
fn calling_ae_title_allow_list_rejects_unknown_caller() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let scp = thread::spawn(move || {
        let (stream, _addr) = listener.accept().unwrap();
        let result = ServerAssociationOptions::new()
            .accept_calling_ae_titles(vec!["FRIEND".to_string()])
            .ae_title("TEST-SCP")
            .with_abstract_syntax(VERIFICATION)
            .establish(stream);
        assert!(result.is_err());
    });

    let result = ClientAssociationOptions::new()
        .calling_ae_title("STRANGER")
        .with_presentation_context(VERIFICATION, vec![IMPLICIT_VR_LE])
        .establish(addr);

    assert!(matches!(result, Err(ClientError::Rejected { .. })));
    scp.join().unwrap();
}

#[test]
fn role_selection_is_acknowledged_as_sent() {
    let (scp, addr) = spawn_scp(|mut association| {
        let roles = association.role_selections().to_vec();
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].sop_class_uid, CT_IMAGE_STORAGE);
        assert!(!roles[0].scu_role);
        assert!(roles[0].scp_role);
        let pdu = association.receive().unwrap();
        assert_eq!(pdu, Pdu::ReleaseRQ);
        association.send(&Pdu::ReleaseRP).unwrap();
    });

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title("TEST-SCU")
        .with_presentation_context(CT_IMAGE_STORAGE, vec![IMPLICIT_VR_LE])
        .with_role_selection(CT_IMAGE_STORAGE, false, true)
        .establish(addr)
        .unwrap();

    let pc = association.contexts().accepted().next().unwrap();
    assert!(!pc.scu_role);
    assert!(pc.scp_role);

    association.release().unwrap();
    scp.join().unwrap();
}

#[test]
fn abort_closes_both_ends() {
    let (scp, addr) = spawn_scp(|mut association| {
        let pdu = association.receive().unwrap();
        assert!(matches!(pdu, Pdu::AbortRQ { .. }));
    });

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title("TEST-SCU")
        .with_presentation_context(VERIFICATION, vec![IMPLICIT_VR_LE])
        .establish(addr)
        .unwrap();

    association.abort().unwrap();
    // no further sends are possible
    assert!(association
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0x00],
            }],
        })
        .is_err());
    scp.join().unwrap();
}

#[test]
fn large_data_set_is_fragmented_on_the_wire() {
    let payload: Vec<u8> = (0..opal_ul::pdu::DEFAULT_MAX_PDU * 2)
        .map(|i| (i % 251) as u8)
        .collect();
    let expected = payload.clone();

    let (scp, addr) = spawn_scp(move |mut association| {
        let mut reader = association.receive_pdata();
        let mut received = Vec::new();
        reader.read_to_end(&mut received).unwrap();
        assert_eq!(received.len(), expected.len());
        assert_eq!(received, expected);
        let pdu = association.receive().unwrap();
        assert_eq!(pdu, Pdu::ReleaseRQ);
        association.send(&Pdu::ReleaseRP).unwrap();
    });

    let mut association = ClientAssociationOptions::new()
        .calling_ae_title("TEST-SCU")
        .with_presentation_context(CT_IMAGE_STORAGE, vec![IMPLICIT_VR_LE])
        .establish(addr)
        .unwrap();

    {
        let mut writer = association.send_pdata(1);
        writer.write_all(&payload).unwrap();
        writer.finish().unwrap();
    }

    association.release().unwrap();
    scp.join().unwrap();
}
