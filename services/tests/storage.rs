//! End-to-end storage tests over loopback TCP:
//! echo, scan-and-store with splice identity,
//! authorization, and the forwarding proxy.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_object::{FileMetaTableBuilder, InMemDicomObject};

use opal_dimse::progress::DicomProgress;
use opal_services::echo::EchoScu;
use opal_services::proxy::ForwardingProxy;
use opal_services::store::scan::Scanner;
use opal_services::store::scp::{StorageScp, StorageScpOptions};
use opal_services::store::scu::{StoreScu, StoreScuOptions};
use opal_transcode::NativeCodec;
use opal_ul::DicomNode;

fn temp_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "opal-e2e-{}-{}",
        label,
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_image(dir: &Path, name: &str, sop_instance_uid: &str) -> PathBuf {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::SOP_CLASS_UID,
        VR::UI,
        dicom_value!(Str, uids::SECONDARY_CAPTURE_IMAGE_STORAGE),
    ));
    obj.put(DataElement::new(
        tags::SOP_INSTANCE_UID,
        VR::UI,
        dicom_value!(Str, sop_instance_uid),
    ));
    obj.put(DataElement::new(
        tags::PATIENT_NAME,
        VR::PN,
        dicom_value!(Str, "DOE^JANE"),
    ));
    obj.put(DataElement::new(tags::ROWS, VR::US, dicom_value!(U16, [2])));
    obj.put(DataElement::new(
        tags::COLUMNS,
        VR::US,
        dicom_value!(U16, [2]),
    ));
    obj.put(DataElement::new(
        tags::BITS_ALLOCATED,
        VR::US,
        dicom_value!(U16, [8]),
    ));
    obj.put(DataElement::new(
        tags::BITS_STORED,
        VR::US,
        dicom_value!(U16, [8]),
    ));
    obj.put(DataElement::new(
        tags::HIGH_BIT,
        VR::US,
        dicom_value!(U16, [7]),
    ));
    obj.put(DataElement::new(
        tags::SAMPLES_PER_PIXEL,
        VR::US,
        dicom_value!(U16, [1]),
    ));
    obj.put(DataElement::new(
        tags::PHOTOMETRIC_INTERPRETATION,
        VR::CS,
        dicom_value!(Str, "MONOCHROME2"),
    ));
    obj.put(DataElement::new(
        tags::PIXEL_DATA,
        VR::OW,
        dicom_value!(U8, [1, 2, 3, 4]),
    ));
    let meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(uids::SECONDARY_CAPTURE_IMAGE_STORAGE)
        .media_storage_sop_instance_uid(sop_instance_uid)
        .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
        .build()
        .unwrap();
    let path = dir.join(name);
    obj.with_exact_meta(meta).write_to_file(&path).unwrap();
    path
}

fn spawn_storage_scp(options: StorageScpOptions) -> (Arc<StorageScp>, std::net::SocketAddr) {
    let scp = Arc::new(StorageScp::new(options));
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    {
        let scp = Arc::clone(&scp);
        thread::spawn(move || {
            let _ = scp.listen(listener);
        });
    }
    (scp, addr)
}

/// The bytes of a Part 10 file after its file meta group.
fn data_set_bytes(path: &Path) -> Vec<u8> {
    let outcome = Scanner::new()
        .scan(&[path.parent().unwrap().to_path_buf()])
        .unwrap();
    let entry = outcome
        .entries
        .iter()
        .find(|entry| entry.path == path)
        .expect("file was scanned");
    std::fs::read(path).unwrap()[entry.file_meta_end as usize..].to_vec()
}

#[test]
fn echo_against_storage_scp() {
    let dir = temp_dir("echo");
    let (_scp, addr) = spawn_storage_scp(StorageScpOptions {
        ae_title: "B".to_string(),
        storage_dir: dir.clone(),
        ..StorageScpOptions::default()
    });

    let mut scu = EchoScu::open("A", "B", &addr.to_string()).unwrap();
    let state = scu.echo().unwrap();
    assert_eq!(state.status(), 0x0000);
    assert_eq!(state.progress().completed(), 1);
    assert_eq!(state.progress().failed(), 0);
    scu.close().unwrap();

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn scan_store_and_splice_identity() {
    let source_dir = temp_dir("store-src");
    let storage_dir = temp_dir("store-dst");
    let a = write_image(&source_dir, "a.dcm", "1.2.3.100.1");
    let b = write_image(&source_dir, "b.dcm", "1.2.3.100.2");

    let (scp, addr) = spawn_storage_scp(StorageScpOptions {
        ae_title: "STORE-SCP".to_string(),
        storage_dir: storage_dir.clone(),
        ..StorageScpOptions::default()
    });

    let outcome = Scanner::new().scan(&[source_dir.clone()]).unwrap();
    assert_eq!(outcome.entries.len(), 2);

    let progress = DicomProgress::new();
    let mut scu = StoreScu::open(
        "STORE-SCU",
        "STORE-SCP",
        &addr.to_string(),
        &outcome.presentation_contexts,
        StoreScuOptions::default(),
    )
    .unwrap();
    let state = scu
        .send_all(&outcome.entries, &progress, &NativeCodec)
        .unwrap();
    scu.close().unwrap();

    assert_eq!(state.status(), 0x0000);
    assert_eq!(progress.completed(), 2);
    assert_eq!(progress.failed(), 0);
    // total size accounts for every accepted file
    let expected: u64 = outcome.entries.iter().map(|entry| entry.file_size).sum();
    assert_eq!(progress.total_size(), expected);
    assert_eq!(scp.progress().completed(), 2);

    // splice identity: the stored data sets are byte for byte
    // identical to the source data sets
    let stored_a = storage_dir.join("1.2.3.100.1");
    let stored_b = storage_dir.join("1.2.3.100.2");
    assert!(stored_a.is_file());
    assert!(stored_b.is_file());
    assert_eq!(data_set_bytes(&a), data_set_bytes(&stored_a));
    assert_eq!(data_set_bytes(&b), data_set_bytes(&stored_b));

    let _ = std::fs::remove_dir_all(&source_dir);
    let _ = std::fs::remove_dir_all(&storage_dir);
}

#[test]
fn empty_file_list_reports_no_files_found() {
    let source_dir = temp_dir("store-empty");
    let (_, addr) = spawn_storage_scp(StorageScpOptions {
        ae_title: "STORE-SCP".to_string(),
        storage_dir: temp_dir("store-empty-dst"),
        ..StorageScpOptions::default()
    });

    let outcome = Scanner::new().scan(&[source_dir.clone()]).unwrap();
    assert!(outcome.entries.is_empty());

    // with nothing to scan there are no presentation contexts either;
    // propose verification so the association can be established
    let progress = DicomProgress::new();
    let mut scu = StoreScu::open(
        "STORE-SCU",
        "STORE-SCP",
        &addr.to_string(),
        &[(uids::VERIFICATION.to_string(), vec![
            uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
        ])],
        StoreScuOptions::default(),
    )
    .unwrap();
    let state = scu
        .send_all(&outcome.entries, &progress, &NativeCodec)
        .unwrap();
    assert_eq!(state.status(), 0xC000);
    assert_eq!(state.message(), Some("no DICOM files found"));

    let _ = std::fs::remove_dir_all(&source_dir);
}

#[test]
fn unauthorized_caller_is_refused_with_0124() {
    let source_dir = temp_dir("auth-src");
    let storage_dir = temp_dir("auth-dst");
    write_image(&source_dir, "a.dcm", "1.2.3.200.1");

    let (_, addr) = spawn_storage_scp(StorageScpOptions {
        ae_title: "STORE-SCP".to_string(),
        storage_dir: storage_dir.clone(),
        authorized_callers: vec!["FRIEND".to_string()],
        ..StorageScpOptions::default()
    });

    let outcome = Scanner::new().scan(&[source_dir.clone()]).unwrap();
    let progress = DicomProgress::new();
    let mut scu = StoreScu::open(
        "STRANGER",
        "STORE-SCP",
        &addr.to_string(),
        &outcome.presentation_contexts,
        StoreScuOptions::default(),
    )
    .unwrap();
    let state = scu
        .send_all(&outcome.entries, &progress, &NativeCodec)
        .unwrap();
    scu.close().unwrap();

    assert_eq!(state.status(), 0x0124);
    assert_eq!(progress.failed(), 1);
    assert_eq!(progress.completed(), 0);
    // nothing was written
    assert!(!storage_dir.join("1.2.3.200.1").exists());

    let _ = std::fs::remove_dir_all(&source_dir);
    let _ = std::fs::remove_dir_all(&storage_dir);
}

#[test]
fn store_with_warning_counts_and_keeps_total_size() {
    use opal_dimse::{commands, message};
    use opal_ul::association::server::ServerAssociationOptions;

    let source_dir = temp_dir("warn-src");
    write_image(&source_dir, "a.dcm", "1.2.3.500.1");

    // a scripted provider which accepts the object with a warning
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut association = ServerAssociationOptions::new()
            .accept_any()
            .ae_title("COERCING-SCP")
            .with_abstract_syntax(uids::SECONDARY_CAPTURE_IMAGE_STORAGE)
            .establish(stream)
            .unwrap();
        let incoming = message::read_message(&mut association).unwrap();
        let message_id = commands::message_id(&incoming.command).unwrap();
        let cuid = commands::affected_sop_class_uid(&incoming.command).unwrap();
        let iuid = commands::affected_sop_instance_uid(&incoming.command).unwrap();
        // 0xB000: coercion of data elements
        let response = commands::store_rsp(message_id, &cuid, &iuid, 0xB000);
        message::write_message(
            &mut association,
            incoming.presentation_context_id,
            &response,
            None,
        )
        .unwrap();
        let _ = association.receive();
        let _ = association.send(&opal_ul::Pdu::ReleaseRP);
    });

    let outcome = Scanner::new().scan(&[source_dir.clone()]).unwrap();
    let progress = DicomProgress::new();
    let mut scu = StoreScu::open(
        "STORE-SCU",
        "COERCING-SCP",
        &addr.to_string(),
        &outcome.presentation_contexts,
        StoreScuOptions::default(),
    )
    .unwrap();
    let state = scu
        .send_all(&outcome.entries, &progress, &NativeCodec)
        .unwrap();
    scu.close().unwrap();

    assert_eq!(state.status(), 0xB000);
    assert_eq!(progress.warning(), 1);
    assert_eq!(progress.completed(), 0);
    assert_eq!(progress.failed(), 0);
    // the payload still counts towards the total size
    assert_eq!(progress.total_size(), outcome.entries[0].file_size);
    assert_eq!(
        progress.processed_file(),
        Some(outcome.entries[0].path.clone())
    );

    let _ = std::fs::remove_dir_all(&source_dir);
}

#[test]
fn concurrent_stores_do_not_cross_contaminate() {
    let mut handles = Vec::new();
    for index in 0..3 {
        handles.push(thread::spawn(move || {
            let source_dir = temp_dir(&format!("conc-src-{}", index));
            let storage_dir = temp_dir(&format!("conc-dst-{}", index));
            // each sender has its own number of files
            for file in 0..=index {
                write_image(
                    &source_dir,
                    &format!("f{}.dcm", file),
                    &format!("1.2.3.400.{}.{}", index, file),
                );
            }

            let (_, addr) = spawn_storage_scp(StorageScpOptions {
                ae_title: format!("SCP-{}", index),
                storage_dir: storage_dir.clone(),
                ..StorageScpOptions::default()
            });

            let outcome = Scanner::new().scan(&[source_dir.clone()]).unwrap();
            let progress = DicomProgress::new();
            let mut scu = StoreScu::open(
                &format!("SCU-{}", index),
                &format!("SCP-{}", index),
                &addr.to_string(),
                &outcome.presentation_contexts,
                StoreScuOptions::default(),
            )
            .unwrap();
            let state = scu
                .send_all(&outcome.entries, &progress, &NativeCodec)
                .unwrap();
            scu.close().unwrap();

            assert_eq!(state.status(), 0x0000);
            // every sender's counters reflect its own files only
            assert_eq!(progress.completed(), index + 1);
            assert_eq!(progress.failed(), 0);

            let _ = std::fs::remove_dir_all(&source_dir);
            let _ = std::fs::remove_dir_all(&storage_dir);
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn proxy_splices_objects_bit_identically() {
    let source_dir = temp_dir("proxy-src");
    let destination_dir = temp_dir("proxy-dst");
    let source_file = write_image(&source_dir, "a.dcm", "1.2.3.300.1");

    // the final destination storage provider
    let (_, destination_addr) = spawn_storage_scp(StorageScpOptions {
        ae_title: "ARCHIVE".to_string(),
        storage_dir: destination_dir.clone(),
        ..StorageScpOptions::default()
    });

    // the forwarding proxy in between, with no editors configured
    let proxy = Arc::new(ForwardingProxy::new(
        DicomNode::new("PROXY", "127.0.0.1", 0).unwrap(),
        DicomNode::new(
            "ARCHIVE",
            destination_addr.ip().to_string(),
            destination_addr.port(),
        )
        .unwrap(),
        Box::new(NativeCodec),
    ));
    let proxy_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let proxy_addr = proxy_listener.local_addr().unwrap();
    {
        let proxy = Arc::clone(&proxy);
        thread::spawn(move || loop {
            let Ok((stream, _)) = proxy_listener.accept() else {
                break;
            };
            let proxy = Arc::clone(&proxy);
            thread::spawn(move || {
                let _ = proxy.handle_association(stream);
            });
        });
    }

    // drive a store through the proxy
    let outcome = Scanner::new().scan(&[source_dir.clone()]).unwrap();
    let progress = DicomProgress::new();
    let mut scu = StoreScu::open(
        "MODALITY",
        "PROXY",
        &proxy_addr.to_string(),
        &outcome.presentation_contexts,
        StoreScuOptions::default(),
    )
    .unwrap();
    let state = scu
        .send_all(&outcome.entries, &progress, &NativeCodec)
        .unwrap();
    scu.close().unwrap();

    assert_eq!(state.status(), 0x0000);
    assert_eq!(progress.completed(), 1);
    assert_eq!(proxy.progress().completed(), 1);

    // splice identity through the whole chain
    let stored = destination_dir.join("1.2.3.300.1");
    assert!(stored.is_file());
    assert_eq!(data_set_bytes(&source_file), data_set_bytes(&stored));

    let _ = std::fs::remove_dir_all(&source_dir);
    let _ = std::fs::remove_dir_all(&destination_dir);
}
