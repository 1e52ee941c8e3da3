use super::*;
use matches::assert_matches;

fn roundtrip(pdu: &Pdu) -> Pdu {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, pdu).expect("writing should succeed");
    let mut cursor = &bytes[..];
    let out = read_pdu(&mut cursor, MAXIMUM_PDU_SIZE, true).expect("reading should succeed");
    assert_eq!(cursor.len(), 0, "reader must consume the whole PDU");
    out
}

#[test]
fn roundtrip_association_rq() {
    let pdu = Pdu::AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SCU-1".to_string(),
        called_ae_title: "THE-SCP".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec![
                    "1.2.840.10008.1.2.1".to_string(),
                    "1.2.840.10008.1.2".to_string(),
                ],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2.4.50".to_string()],
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(16384),
            UserVariableItem::ImplementationClassUID("2.25.1".to_string()),
            UserVariableItem::ImplementationVersionName("TEST 0.1".to_string()),
            UserVariableItem::RoleSelection(RoleSelection {
                sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                scu_role: false,
                scp_role: true,
            }),
            UserVariableItem::SopClassExtendedNegotiation(
                "1.2.840.10008.5.1.4.1.2.2.1".to_string(),
                vec![1, 1, 1],
            ),
            UserVariableItem::SopClassCommonExtendedNegotiation(CommonExtendedNegotiation {
                sop_class_uid: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                service_class_uid: "1.2.840.10008.4.2".to_string(),
                related_general_sop_class_uids: vec!["1.2.840.10008.5.1.4.1.1.2.1".to_string()],
            }),
        ],
    };

    assert_eq!(roundtrip(&pdu), pdu);
}

#[test]
fn roundtrip_association_ac() {
    let pdu = Pdu::AssociationAC {
        protocol_version: 1,
        calling_ae_title: "SCU-1".to_string(),
        called_ae_title: "THE-SCP".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: "1.2.840.10008.1.2.1".to_string(),
            },
            PresentationContextResult {
                id: 3,
                reason: PresentationContextResultReason::TransferSyntaxesNotSupported,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(0),
            UserVariableItem::ImplementationClassUID("2.25.1".to_string()),
        ],
    };

    assert_eq!(roundtrip(&pdu), pdu);
}

#[test]
fn roundtrip_association_rj() {
    let pdu = Pdu::AssociationRJ {
        result: AssociationRJResult::Permanent,
        source: AssociationRJSource::ServiceUser(
            AssociationRJServiceUserReason::CalledAETitleNotRecognized,
        ),
    };
    assert_eq!(roundtrip(&pdu), pdu);
}

#[test]
fn roundtrip_pdata() {
    let pdu = Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: (0..64).collect(),
            },
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: false,
                data: (0..255).collect(),
            },
        ],
    };
    assert_eq!(roundtrip(&pdu), pdu);
}

#[test]
fn roundtrip_release_and_abort() {
    assert_eq!(roundtrip(&Pdu::ReleaseRQ), Pdu::ReleaseRQ);
    assert_eq!(roundtrip(&Pdu::ReleaseRP), Pdu::ReleaseRP);

    let pdu = Pdu::AbortRQ {
        source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
    };
    assert_eq!(roundtrip(&pdu), pdu);
}

#[test]
fn strict_mode_rejects_oversized_pdu() {
    let pdu = Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![0; MINIMUM_PDU_SIZE as usize + 16],
        }],
    };
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &pdu).unwrap();

    let mut cursor = &bytes[..];
    let err = read_pdu(&mut cursor, MINIMUM_PDU_SIZE, true).unwrap_err();
    assert_matches!(err, reader::Error::PduTooLarge { .. });

    // lenient mode tolerates it below the absolute cap
    let mut cursor = &bytes[..];
    let out = read_pdu(&mut cursor, MINIMUM_PDU_SIZE, false).unwrap();
    assert_eq!(out, pdu);
}

#[test]
fn unknown_user_variables_are_preserved() {
    let pdu = Pdu::AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "A".to_string(),
        called_ae_title: "B".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.1.1".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![UserVariableItem::Unknown(0x66, vec![9, 9, 9, 9])],
    };
    assert_eq!(roundtrip(&pdu), pdu);
}
