//! The storage service class provider.
//!
//! Each incoming object is staged under `<storage_dir>/tmp/<iuid>`,
//! written as a Part 10 file with a file meta group
//! synthesized from the association,
//! and only then renamed to its final location.
//! The primary directory therefore never holds partial files.

use std::fs::File;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dicom_dictionary_std::uids;
use dicom_object::FileMetaTableBuilder;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use snafu::{ResultExt, Snafu};
use tracing::{debug, info, warn};

use opal_dimse::commands::{self, CommandField};
use opal_dimse::message::{self, ReadError};
use opal_dimse::progress::DicomProgress;
use opal_dimse::status::codes;
use opal_ul::association::server::ServerAssociationOptions;
use opal_ul::association::ServerAssociation;
use opal_ul::pdu::Pdu;

use crate::path::FilePathPattern;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// could not accept the incoming association
    Accept {
        source: opal_ul::association::server::Error,
    },

    /// the association failed while exchanging messages
    Exchange {
        source: opal_dimse::message::ReadError,
    },

    /// failed to send a response
    Respond {
        source: opal_dimse::message::WriteError,
    },

    #[snafu(display("could not stage object at {}", path.display()))]
    StageObject {
        path: PathBuf,
        source: std::io::Error,
    },

    /// could not synthesize the file meta group
    BuildMeta {
        source: dicom_object::meta::Error,
    },

    /// could not write the file meta group
    WriteMeta {
        source: dicom_object::meta::Error,
    },

    #[snafu(display("could not move object into place at {}", path.display()))]
    Commit {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Configuration of a storage SCP.
#[derive(Debug, Clone)]
pub struct StorageScpOptions {
    /// the AE title of this provider
    pub ae_title: String,
    /// where received objects are stored
    pub storage_dir: PathBuf,
    /// calling AE titles authorized to store; empty accepts anyone
    pub authorized_callers: Vec<String>,
    /// how to build the final relative path of each object;
    /// the SOP instance UID is used when absent
    pub file_path_pattern: Option<FilePathPattern>,
    /// accept only the uncompressed transfer syntaxes
    pub uncompressed_only: bool,
    /// accept unknown SOP classes
    pub promiscuous: bool,
    /// the maximum PDU length advertised to requesters
    pub max_pdu_length: u32,
    /// artificial delay before each object is processed, for testing
    pub receive_delay: Option<Duration>,
    /// artificial delay before each response is sent, for testing
    pub response_delay: Option<Duration>,
}

impl Default for StorageScpOptions {
    fn default() -> Self {
        StorageScpOptions {
            ae_title: "STORE-SCP".to_string(),
            storage_dir: PathBuf::from("."),
            authorized_callers: Vec::new(),
            file_path_pattern: None,
            uncompressed_only: false,
            promiscuous: false,
            max_pdu_length: opal_ul::pdu::DEFAULT_MAX_PDU,
            receive_delay: None,
            response_delay: None,
        }
    }
}

/// A storage service class provider.
///
/// Shared across the connection handler threads;
/// all counters live in the progress handle.
pub struct StorageScp {
    options: StorageScpOptions,
    progress: Arc<DicomProgress>,
}

impl StorageScp {
    pub fn new(options: StorageScpOptions) -> StorageScp {
        StorageScp {
            options,
            progress: DicomProgress::new(),
        }
    }

    /// The progress handle fed by every connection.
    pub fn progress(&self) -> &Arc<DicomProgress> {
        &self.progress
    }

    /// Accept connections forever,
    /// one handler thread per incoming association.
    pub fn listen(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!(
            "{} listening on {}",
            self.options.ae_title,
            listener.local_addr()?
        );
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let scp = Arc::clone(&self);
                    std::thread::spawn(move || {
                        if let Err(e) = scp.handle_connection(stream) {
                            warn!("association ended with error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    warn!("could not accept connection: {}", e);
                }
            }
        }
        Ok(())
    }

    /// Drive one association until release or abort.
    pub fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let mut options = ServerAssociationOptions::new()
            .accept_any()
            .ae_title(self.options.ae_title.clone())
            .max_pdu_length(self.options.max_pdu_length)
            .promiscuous(self.options.promiscuous)
            .with_abstract_syntax(uids::VERIFICATION);
        for capability in crate::capability::TransferCapabilities::common_storage().iter() {
            options = options.with_abstract_syntax(capability.sop_class_uid.clone());
        }
        if self.options.uncompressed_only {
            options = options
                .with_transfer_syntax(uids::IMPLICIT_VR_LITTLE_ENDIAN)
                .with_transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN);
        }

        let mut association = options.establish(stream).context(AcceptSnafu)?;
        info!("new association from {}", association.client_ae_title());

        let authorized = self.options.authorized_callers.is_empty()
            || self
                .options
                .authorized_callers
                .iter()
                .any(|caller| caller == association.client_ae_title());

        loop {
            match message::read_message(&mut association) {
                Ok(incoming) => {
                    self.handle_message(&mut association, incoming, authorized)?;
                }
                Err(ReadError::Released) => {
                    let _ = association.send(&Pdu::ReleaseRP);
                    info!(
                        "released association with {}",
                        association.client_ae_title()
                    );
                    break;
                }
                Err(ReadError::PeerAborted) => {
                    warn!("association aborted by {}", association.client_ae_title());
                    break;
                }
                Err(ReadError::ReceiveMessage { .. }) => {
                    // connection went away without release
                    break;
                }
                Err(e) => return Err(e).context(ExchangeSnafu),
            }
        }
        Ok(())
    }

    fn handle_message(
        &self,
        association: &mut ServerAssociation,
        incoming: message::DicomMessage,
        authorized: bool,
    ) -> Result<()> {
        let field = match commands::command_field(&incoming.command) {
            Ok(field) => field,
            Err(e) => {
                warn!("discarding message with bad command set: {}", e);
                return Ok(());
            }
        };
        match field {
            CommandField::CEchoRq => {
                let message_id = commands::message_id(&incoming.command).unwrap_or(0);
                let response = commands::echo_rsp(message_id, uids::VERIFICATION, codes::SUCCESS);
                message::write_message(
                    association,
                    incoming.presentation_context_id,
                    &response,
                    None,
                )
                .context(RespondSnafu)
            }
            CommandField::CStoreRq => self.handle_store(association, incoming, authorized),
            field => {
                warn!("ignoring unsupported {:?}", field);
                Ok(())
            }
        }
    }

    fn handle_store(
        &self,
        association: &mut ServerAssociation,
        incoming: message::DicomMessage,
        authorized: bool,
    ) -> Result<()> {
        if let Some(delay) = self.options.receive_delay {
            std::thread::sleep(delay);
        }

        let message_id = commands::message_id(&incoming.command).unwrap_or(1);
        let cuid = commands::affected_sop_class_uid(&incoming.command).unwrap_or_default();
        let iuid = commands::affected_sop_instance_uid(&incoming.command).unwrap_or_default();
        let pcid = incoming.presentation_context_id;

        let status = if !authorized {
            // drop the data set, refuse the operation
            warn!(
                "refusing store from unauthorized caller {}",
                association.client_ae_title()
            );
            codes::NOT_AUTHORIZED
        } else {
            let transfer_syntax = association
                .contexts()
                .get(pcid)
                .map(|pc| pc.transfer_syntax.clone())
                .unwrap_or_default();
            match &incoming.data {
                Some(data) => {
                    match store_object_bytes(
                        &self.options.storage_dir,
                        self.options.file_path_pattern.as_ref(),
                        &cuid,
                        &iuid,
                        &transfer_syntax,
                        data,
                    ) {
                        Ok(path) => {
                            debug!("stored {}", path.display());
                            self.progress.add_completed();
                            self.progress.set_processed_file(path);
                            self.progress.notify();
                            codes::SUCCESS
                        }
                        Err(e) => {
                            warn!("processing failure: {}", e);
                            self.progress.add_failed();
                            self.progress.notify();
                            codes::CANNOT_UNDERSTAND
                        }
                    }
                }
                None => {
                    warn!("C-STORE-RQ without a data set");
                    self.progress.add_failed();
                    self.progress.notify();
                    codes::CANNOT_UNDERSTAND
                }
            }
        };

        if let Some(delay) = self.options.response_delay {
            std::thread::sleep(delay);
        }

        let response = commands::store_rsp(message_id, &cuid, &iuid, status);
        message::write_message(association, pcid, &response, None).context(RespondSnafu)
    }
}

/// Stage and commit one received object.
///
/// The object goes to `<dir>/tmp/<iuid>` first,
/// written as a Part 10 file whose meta group is synthesized
/// from the association parameters.
/// With a path pattern, the staged file is re-parsed
/// (bulk data excluded) to format the final relative path;
/// otherwise the SOP instance UID names the file.
/// The staged file is atomically renamed into place,
/// replacing any previous object with the same name.
///
/// On any I/O error the temporary file is removed
/// and the error propagated;
/// the caller converts it into a ProcessingFailure response.
pub fn store_object_bytes(
    dir: &Path,
    pattern: Option<&FilePathPattern>,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    transfer_syntax_uid: &str,
    data: &[u8],
) -> Result<PathBuf> {
    let tmp_dir = dir.join("tmp");
    std::fs::create_dir_all(&tmp_dir).context(StageObjectSnafu {
        path: tmp_dir.clone(),
    })?;
    let tmp_path = tmp_dir.join(sanitize_uid(sop_instance_uid));

    let write_result = write_part10(
        &tmp_path,
        sop_class_uid,
        sop_instance_uid,
        transfer_syntax_uid,
        data,
    );
    if let Err(e) = write_result {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e);
    }

    // a configured pattern derives the final path
    // from the object's own attributes
    let relative = match pattern {
        Some(pattern) => {
            match reparse_for_path(&tmp_path, transfer_syntax_uid, pattern) {
                Ok(relative) => relative,
                Err(e) => {
                    let _ = std::fs::remove_file(&tmp_path);
                    return Err(e);
                }
            }
        }
        None => PathBuf::from(sanitize_uid(sop_instance_uid)),
    };

    let final_path = dir.join(relative);
    if let Some(parent) = final_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e).context(CommitSnafu { path: final_path });
        }
    }
    // the rename replaces an existing object of the same name
    if let Err(e) = std::fs::rename(&tmp_path, &final_path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e).context(CommitSnafu { path: final_path });
    }
    Ok(final_path)
}

fn write_part10(
    path: &Path,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    transfer_syntax_uid: &str,
    data: &[u8],
) -> Result<()> {
    let meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(sop_class_uid)
        .media_storage_sop_instance_uid(sop_instance_uid)
        .transfer_syntax(transfer_syntax_uid)
        .build()
        .context(BuildMetaSnafu)?;

    let mut file = File::create(path).context(StageObjectSnafu { path })?;
    // 128-byte preamble and the magic code
    file.write_all(&[0u8; 128])
        .context(StageObjectSnafu { path })?;
    file.write_all(b"DICM").context(StageObjectSnafu { path })?;
    meta.write(&mut file).context(WriteMetaSnafu)?;
    // the data set bytes go in verbatim,
    // preserving the encoding of the presentation context
    file.write_all(data).context(StageObjectSnafu { path })?;
    file.flush().context(StageObjectSnafu { path })?;
    Ok(())
}

/// Re-parse the staged file, bulk data excluded,
/// and format its final relative path.
fn reparse_for_path(
    tmp_path: &Path,
    transfer_syntax_uid: &str,
    pattern: &FilePathPattern,
) -> Result<PathBuf> {
    // fall back to the staged name when the syntax is unknown
    if TransferSyntaxRegistry.get(transfer_syntax_uid).is_none() {
        return Ok(tmp_path.file_name().map(PathBuf::from).unwrap_or_default());
    }
    let object = dicom_object::OpenFileOptions::new()
        .read_until(dicom_dictionary_std::tags::PIXEL_DATA)
        .open_file(tmp_path)
        .map_err(|e| Error::StageObject {
            path: tmp_path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;
    Ok(pattern.format(&object))
}

fn sanitize_uid(uid: &str) -> String {
    uid.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{dicom_value, DataElement, VR};
    use dicom_dictionary_std::tags;
    use dicom_object::InMemDicomObject;
    use dicom_transfer_syntax_registry::entries;

    fn temp_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "opal-scp-test-{}-{}",
            label,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn sample_dataset() -> Vec<u8> {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, uids::SECONDARY_CAPTURE_IMAGE_STORAGE),
        ));
        obj.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "1.2.3.4.5"),
        ));
        obj.put(DataElement::new(
            tags::STUDY_DATE,
            VR::DA,
            dicom_value!(Str, "20240101"),
        ));
        let mut bytes = Vec::new();
        obj.write_dataset_with_ts(&mut bytes, &entries::EXPLICIT_VR_LITTLE_ENDIAN.erased())
            .unwrap();
        bytes
    }

    #[test]
    fn store_commits_atomically_with_default_name() {
        let dir = temp_dir("default");
        let data = sample_dataset();
        let path = store_object_bytes(
            &dir,
            None,
            uids::SECONDARY_CAPTURE_IMAGE_STORAGE,
            "1.2.3.4.5",
            uids::EXPLICIT_VR_LITTLE_ENDIAN,
            &data,
        )
        .unwrap();

        assert_eq!(path, dir.join("1.2.3.4.5"));
        assert!(path.is_file());
        // nothing is left in the staging area
        let tmp_entries: Vec<_> = std::fs::read_dir(dir.join("tmp")).unwrap().collect();
        assert!(tmp_entries.is_empty());

        // the stored file opens as a Part 10 object
        // with the synthesized meta group
        let stored = dicom_object::open_file(&path).unwrap();
        assert_eq!(
            stored.meta().media_storage_sop_instance_uid.trim_end_matches('\0'),
            "1.2.3.4.5"
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn store_formats_final_path_from_pattern() {
        let dir = temp_dir("pattern");
        let pattern: FilePathPattern = "{00080020,date,yyyy/MM/dd}/{00080018}.dcm".parse().unwrap();
        let data = sample_dataset();
        let path = store_object_bytes(
            &dir,
            Some(&pattern),
            uids::SECONDARY_CAPTURE_IMAGE_STORAGE,
            "1.2.3.4.5",
            uids::EXPLICIT_VR_LITTLE_ENDIAN,
            &data,
        )
        .unwrap();

        assert_eq!(path, dir.join("2024/01/01/1.2.3.4.5.dcm"));
        assert!(path.is_file());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rename_replaces_existing_object() {
        let dir = temp_dir("replace");
        let data = sample_dataset();
        for _ in 0..2 {
            store_object_bytes(
                &dir,
                None,
                uids::SECONDARY_CAPTURE_IMAGE_STORAGE,
                "1.2.3.4.5",
                uids::EXPLICIT_VR_LITTLE_ENDIAN,
                &data,
            )
            .unwrap();
        }
        assert!(dir.join("1.2.3.4.5").is_file());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
