//! Recursive file scanning ahead of a store operation.
//!
//! The scanner walks the given roots,
//! opens every candidate file as DICOM up to the start of the data set,
//! and collects one manifest row per accepted object.
//! Alongside the manifest it accumulates the presentation contexts
//! the subsequent association must propose:
//! every distinct `(SOP class, transfer syntax)` pair,
//! plus the two uncompressed little endian syntaxes
//! for every new SOP class.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use dicom_core::Tag;
use dicom_dictionary_std::{tags, uids};
use dicom_object::OpenFileOptions;
use snafu::{ResultExt, Snafu};
use tracing::{debug, warn};
use walkdir::WalkDir;

use opal_ul::pdu::CommonExtendedNegotiation;

use crate::capability::RelatedSopClasses;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("could not create scan manifest at {}", path.display()))]
    CreateManifest {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("could not write scan manifest at {}", path.display()))]
    WriteManifest {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One accepted object from a scan:
/// the key attributes plus where the encoded data set begins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    pub sop_instance_uid: String,
    pub sop_class_uid: String,
    pub transfer_syntax_uid: String,
    /// byte offset of the first data set byte in the file,
    /// i.e. the end of the file meta group
    pub file_meta_end: u64,
    pub path: PathBuf,
    pub file_size: u64,
}

/// The outcome of a scan.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// the accepted objects, in scan order
    pub entries: Vec<ScanEntry>,
    /// the tab-separated manifest file
    pub manifest_path: Option<PathBuf>,
    /// the accumulated presentation context proposals:
    /// abstract syntax plus candidate transfer syntaxes
    pub presentation_contexts: Vec<(String, Vec<String>)>,
    /// common extended negotiation items,
    /// one per SOP class when enabled
    pub common_extended_negotiations: Vec<CommonExtendedNegotiation>,
    /// the number of files skipped as non-DICOM
    pub skipped: usize,
}

impl ScanOutcome {
    /// Delete the temporary manifest file.
    pub fn cleanup(&mut self) {
        if let Some(path) = self.manifest_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// A recursive DICOM file scanner.
#[derive(Debug, Default)]
pub struct Scanner {
    /// emit one `.` per scanned file and one `I` per skipped file
    pub printout: bool,
    /// add a common extended negotiation item per SOP class
    pub extended_negotiation: bool,
    /// related general SOP classes for extended negotiation
    pub related_sop_classes: RelatedSopClasses,
}

impl Scanner {
    pub fn new() -> Scanner {
        Scanner::default()
    }

    pub fn with_printout(mut self, printout: bool) -> Scanner {
        self.printout = printout;
        self
    }

    pub fn with_extended_negotiation(mut self, enabled: bool) -> Scanner {
        self.extended_negotiation = enabled;
        self
    }

    /// Scan the given roots recursively,
    /// writing the manifest to a fresh temporary file.
    ///
    /// Files which cannot be opened as DICOM are skipped and counted,
    /// never failing the scan as a whole.
    pub fn scan(&self, roots: &[PathBuf]) -> Result<ScanOutcome> {
        let manifest_path = temp_manifest_path();
        let manifest = File::create(&manifest_path).context(CreateManifestSnafu {
            path: manifest_path.clone(),
        })?;
        let mut manifest = BufWriter::new(manifest);

        let mut outcome = ScanOutcome {
            manifest_path: Some(manifest_path.clone()),
            ..ScanOutcome::default()
        };
        // SOP class -> transfer syntaxes already covered
        let mut covered: HashMap<String, Vec<String>> = HashMap::new();

        for root in roots {
            for entry in WalkDir::new(root)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| !entry.file_type().is_dir())
            {
                let path = entry.into_path();
                match scan_file(&path) {
                    Ok(scan_entry) => {
                        if self.printout {
                            print!(".");
                            let _ = std::io::stdout().flush();
                        }
                        self.accumulate(&scan_entry, &mut covered, &mut outcome);
                        writeln!(
                            manifest,
                            "{}\t{}\t{}\t{}\t{}",
                            scan_entry.sop_instance_uid,
                            scan_entry.sop_class_uid,
                            scan_entry.transfer_syntax_uid,
                            scan_entry.file_meta_end,
                            scan_entry.path.display()
                        )
                        .context(WriteManifestSnafu {
                            path: manifest_path.clone(),
                        })?;
                        outcome.entries.push(scan_entry);
                    }
                    Err(e) => {
                        if self.printout {
                            print!("I");
                            let _ = std::io::stdout().flush();
                        }
                        debug!("skipping {}: {}", path.display(), e);
                        outcome.skipped += 1;
                    }
                }
            }
        }
        if self.printout {
            println!();
        }

        manifest.flush().context(WriteManifestSnafu {
            path: manifest_path,
        })?;
        Ok(outcome)
    }

    fn accumulate(
        &self,
        entry: &ScanEntry,
        covered: &mut HashMap<String, Vec<String>>,
        outcome: &mut ScanOutcome,
    ) {
        let known = covered.entry(entry.sop_class_uid.clone()).or_default();
        let new_class = known.is_empty();
        if known.contains(&entry.transfer_syntax_uid) {
            return;
        }
        known.push(entry.transfer_syntax_uid.clone());

        let mut transfer_syntaxes = vec![entry.transfer_syntax_uid.clone()];
        if new_class {
            // also offer the uncompressed syntaxes,
            // as mandated by the storage service
            for fallback in [uids::EXPLICIT_VR_LITTLE_ENDIAN, uids::IMPLICIT_VR_LITTLE_ENDIAN] {
                if fallback != entry.transfer_syntax_uid {
                    transfer_syntaxes.push(fallback.to_string());
                    known.push(fallback.to_string());
                }
            }

            if self.extended_negotiation {
                outcome
                    .common_extended_negotiations
                    .push(CommonExtendedNegotiation {
                        sop_class_uid: entry.sop_class_uid.clone(),
                        service_class_uid: uids::STORAGE.to_string(),
                        related_general_sop_class_uids: self
                            .related_sop_classes
                            .get(&entry.sop_class_uid),
                    });
            }
        }

        // merge into an existing proposal for the class if possible
        if let Some((_, proposal)) = outcome
            .presentation_contexts
            .iter_mut()
            .find(|(sop_class, _)| *sop_class == entry.sop_class_uid)
        {
            for ts in transfer_syntaxes {
                if !proposal.contains(&ts) {
                    proposal.push(ts);
                }
            }
        } else {
            outcome
                .presentation_contexts
                .push((entry.sop_class_uid.clone(), transfer_syntaxes));
        }
    }
}

/// Open one file as DICOM and pull out the manifest attributes.
///
/// Reads the file meta group and the start of the data set;
/// when the meta group misses required items,
/// they are synthesized from the data set.
fn scan_file(path: &Path) -> std::result::Result<ScanEntry, Box<dyn std::error::Error>> {
    // DICOMDIR indexes are not composite objects
    if path.file_name().map(|name| name == "DICOMDIR").unwrap_or(false) {
        return Err("DICOMDIR is not supported".into());
    }

    let object = OpenFileOptions::new()
        // stop before the patient group: the file meta group
        // plus the group 0008 identifiers are all we need
        .read_until(Tag(0x0010, 0x0000))
        .open_file(path)?;
    let meta = object.meta();

    let transfer_syntax_uid = meta.transfer_syntax().trim_end_matches('\0').to_string();

    let mut sop_class_uid = meta
        .media_storage_sop_class_uid
        .trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string();
    let mut sop_instance_uid = meta
        .media_storage_sop_instance_uid
        .trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string();

    // fall back to the data set for absent meta items
    if sop_class_uid.is_empty() {
        sop_class_uid = object
            .element(tags::SOP_CLASS_UID)?
            .to_str()?
            .trim_end_matches('\0')
            .to_string();
        warn!(
            "{}: SOP class synthesized from data set",
            path.display()
        );
    }
    if sop_instance_uid.is_empty() {
        sop_instance_uid = object
            .element(tags::SOP_INSTANCE_UID)?
            .to_str()?
            .trim_end_matches('\0')
            .to_string();
        warn!(
            "{}: SOP instance synthesized from data set",
            path.display()
        );
    }

    // preamble (128) + "DICM" (4) + group length element (12) + group data
    let file_meta_end = 128 + 4 + 12 + u64::from(meta.information_group_length);

    let file_size = std::fs::metadata(path)?.len();

    Ok(ScanEntry {
        sop_instance_uid,
        sop_class_uid,
        transfer_syntax_uid,
        file_meta_end,
        path: path.to_path_buf(),
        file_size,
    })
}

fn temp_manifest_path() -> PathBuf {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "opal-scan-{}-{}.tsv",
        std::process::id(),
        n
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{dicom_value, DataElement, VR};
    use dicom_object::{FileMetaTableBuilder, InMemDicomObject};

    fn write_test_file(dir: &Path, name: &str, sop_instance_uid: &str) -> PathBuf {
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
            dicom_value!(Str, "DOE^JOHN"),
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

    fn temp_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "opal-scan-test-{}-{}",
            label,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn scan_collects_entries_and_contexts() {
        let dir = temp_dir("collect");
        write_test_file(&dir, "a.dcm", "1.2.3.1");
        write_test_file(&dir, "b.dcm", "1.2.3.2");
        std::fs::write(dir.join("notes.txt"), "not dicom").unwrap();

        let outcome = Scanner::new().scan(&[dir.clone()]).unwrap();
        assert_eq!(outcome.entries.len(), 2);
        assert_eq!(outcome.skipped, 1);

        // one context for the SOP class, source TS first,
        // then the uncompressed fallbacks
        assert_eq!(outcome.presentation_contexts.len(), 1);
        let (sop_class, transfer_syntaxes) = &outcome.presentation_contexts[0];
        assert_eq!(sop_class, uids::SECONDARY_CAPTURE_IMAGE_STORAGE);
        assert_eq!(transfer_syntaxes[0], uids::EXPLICIT_VR_LITTLE_ENDIAN);
        assert!(transfer_syntaxes.contains(&uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string()));

        // manifest rows are tab separated with five columns
        let manifest = std::fs::read_to_string(outcome.manifest_path.unwrap()).unwrap();
        for line in manifest.lines() {
            assert_eq!(line.split('\t').count(), 5);
        }

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn file_meta_end_points_at_data_set() {
        let dir = temp_dir("offset");
        let path = write_test_file(&dir, "a.dcm", "1.2.3.1");

        let outcome = Scanner::new().scan(&[dir.clone()]).unwrap();
        let entry = &outcome.entries[0];

        // the data set must start with the first group 0008 element
        // in explicit VR little endian
        let bytes = std::fs::read(&path).unwrap();
        let offset = entry.file_meta_end as usize;
        assert_eq!(&bytes[offset..offset + 2], &[0x08, 0x00]);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
