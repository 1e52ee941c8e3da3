//! Transfer capability configuration.
//!
//! A transfer capability file is a properties-style text file
//! mapping a SOP class UID to the comma-separated transfer syntaxes
//! this node is willing to negotiate for it:
//!
//! ```text
//! # storage capabilities
//! 1.2.840.10008.5.1.4.1.1.2 = 1.2.840.10008.1.2.4.50, 1.2.840.10008.1.2.1, 1.2.840.10008.1.2
//! 1.2.840.10008.5.1.4.1.1.4 = 1.2.840.10008.1.2.1, 1.2.840.10008.1.2
//! ```
//!
//! The same format with an empty value extends the SOP class list
//! with default transfer syntaxes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use dicom_dictionary_std::uids;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("could not read capability file {}", path))]
    ReadFile {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("malformed capability line {}: `{}`", line_no, line))]
    MalformedLine { line_no: usize, line: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The transfer syntaxes negotiated for one SOP class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCapability {
    pub sop_class_uid: String,
    pub transfer_syntax_uids: Vec<String>,
}

/// A set of transfer capabilities, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct TransferCapabilities {
    entries: Vec<TransferCapability>,
}

impl TransferCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// The common composite storage SOP classes
    /// with the two uncompressed little endian syntaxes.
    pub fn common_storage() -> Self {
        let classes = [
            uids::COMPUTED_RADIOGRAPHY_IMAGE_STORAGE,
            uids::CT_IMAGE_STORAGE,
            uids::ENHANCED_CT_IMAGE_STORAGE,
            uids::MR_IMAGE_STORAGE,
            uids::ENHANCED_MR_IMAGE_STORAGE,
            uids::ULTRASOUND_IMAGE_STORAGE,
            uids::ULTRASOUND_MULTI_FRAME_IMAGE_STORAGE,
            uids::SECONDARY_CAPTURE_IMAGE_STORAGE,
            uids::DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
            uids::DIGITAL_MAMMOGRAPHY_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
            uids::NUCLEAR_MEDICINE_IMAGE_STORAGE,
            uids::POSITRON_EMISSION_TOMOGRAPHY_IMAGE_STORAGE,
            uids::RT_IMAGE_STORAGE,
            uids::RT_DOSE_STORAGE,
            uids::RT_STRUCTURE_SET_STORAGE,
            uids::RT_PLAN_STORAGE,
        ];
        let mut capabilities = TransferCapabilities::new();
        for sop_class_uid in classes {
            capabilities.add(
                sop_class_uid,
                vec![
                    uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
                    uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
                ],
            );
        }
        capabilities
    }

    /// Parse a properties-style capability listing.
    ///
    /// Lines starting with `#` or `!` and blank lines are skipped.
    /// A line without a separator, or with an empty value,
    /// maps the SOP class to the uncompressed little endian syntaxes.
    pub fn parse(text: &str) -> Result<Self> {
        let mut capabilities = TransferCapabilities::new();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let (sop_class_uid, value) = match line.split_once(&['=', ':'][..]) {
                Some((key, value)) => (key.trim(), value.trim()),
                None => (line, ""),
            };
            if sop_class_uid.is_empty() {
                return MalformedLineSnafu {
                    line_no: line_no + 1,
                    line,
                }
                .fail();
            }
            let transfer_syntax_uids: Vec<String> = if value.is_empty() {
                vec![
                    uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
                    uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
                ]
            } else {
                value
                    .split(',')
                    .map(|ts| ts.trim().to_string())
                    .filter(|ts| !ts.is_empty())
                    .collect()
            };
            capabilities.add(sop_class_uid, transfer_syntax_uids);
        }
        Ok(capabilities)
    }

    /// Load a capability file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).context(ReadFileSnafu {
            path: path.display().to_string(),
        })?;
        Self::parse(&text)
    }

    /// Add or extend the capability of one SOP class.
    pub fn add(&mut self, sop_class_uid: impl Into<String>, transfer_syntax_uids: Vec<String>) {
        let sop_class_uid = sop_class_uid.into();
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.sop_class_uid == sop_class_uid)
        {
            for ts in transfer_syntax_uids {
                if !entry.transfer_syntax_uids.contains(&ts) {
                    entry.transfer_syntax_uids.push(ts);
                }
            }
        } else {
            self.entries.push(TransferCapability {
                sop_class_uid,
                transfer_syntax_uids,
            });
        }
    }

    /// Merge another capability set into this one.
    pub fn extend(&mut self, other: TransferCapabilities) {
        for entry in other.entries {
            self.add(entry.sop_class_uid, entry.transfer_syntax_uids);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &TransferCapability> {
        self.entries.iter()
    }

    pub fn get(&self, sop_class_uid: &str) -> Option<&TransferCapability> {
        self.entries
            .iter()
            .find(|entry| entry.sop_class_uid == sop_class_uid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A shared map from a SOP class to its related general SOP classes,
/// used to build common extended negotiation items.
///
/// Reads vastly outnumber writes, so the map sits behind a `RwLock`.
#[derive(Debug, Default)]
pub struct RelatedSopClasses {
    map: RwLock<HashMap<String, Vec<String>>>,
}

impl RelatedSopClasses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load relations from a properties-style listing:
    /// `sop-class-uid = related-uid, related-uid`.
    pub fn load_properties(&self, text: &str) {
        let mut map = self.map.write().unwrap();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            if let Some((key, value)) = line.split_once(&['=', ':'][..]) {
                let related: Vec<String> = value
                    .split(',')
                    .map(|uid| uid.trim().to_string())
                    .filter(|uid| !uid.is_empty())
                    .collect();
                map.insert(key.trim().to_string(), related);
            }
        }
    }

    pub fn get(&self, sop_class_uid: &str) -> Vec<String> {
        self.map
            .read()
            .unwrap()
            .get(sop_class_uid)
            .cloned()
            .unwrap_or_default()
    }

    pub fn insert(&self, sop_class_uid: impl Into<String>, related: Vec<String>) {
        self.map
            .write()
            .unwrap()
            .insert(sop_class_uid.into(), related);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_properties_listing() {
        let text = "\
# storage
1.2.840.10008.5.1.4.1.1.2 = 1.2.840.10008.1.2.4.50, 1.2.840.10008.1.2.1
1.2.840.10008.5.1.4.1.1.4
";
        let capabilities = TransferCapabilities::parse(text).unwrap();
        assert_eq!(capabilities.len(), 2);

        let ct = capabilities.get("1.2.840.10008.5.1.4.1.1.2").unwrap();
        assert_eq!(
            ct.transfer_syntax_uids,
            vec!["1.2.840.10008.1.2.4.50", "1.2.840.10008.1.2.1"]
        );

        // a bare SOP class maps to the uncompressed syntaxes
        let mr = capabilities.get("1.2.840.10008.5.1.4.1.1.4").unwrap();
        assert_eq!(mr.transfer_syntax_uids.len(), 2);
    }

    #[test]
    fn add_merges_transfer_syntaxes() {
        let mut capabilities = TransferCapabilities::new();
        capabilities.add("1.2.3", vec!["1.2.840.10008.1.2".to_string()]);
        capabilities.add(
            "1.2.3",
            vec![
                "1.2.840.10008.1.2".to_string(),
                "1.2.840.10008.1.2.1".to_string(),
            ],
        );
        assert_eq!(capabilities.len(), 1);
        assert_eq!(
            capabilities.get("1.2.3").unwrap().transfer_syntax_uids.len(),
            2
        );
    }

    #[test]
    fn related_sop_classes_are_shared() {
        let related = RelatedSopClasses::new();
        related.load_properties("1.2.840.10008.5.1.4.1.1.2 = 1.2.840.10008.5.1.4.1.1.2.1\n");
        assert_eq!(
            related.get("1.2.840.10008.5.1.4.1.1.2"),
            vec!["1.2.840.10008.5.1.4.1.1.2.1".to_string()]
        );
        assert!(related.get("1.2.3").is_empty());
    }
}
