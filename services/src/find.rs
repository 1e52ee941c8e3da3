//! The query service (C-FIND) as a service class user.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use dicom_dictionary_std::tags;
use dicom_object::{InMemDicomObject, StandardDataDictionary};
use dicom_transfer_syntax_registry::entries;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::{debug, info, warn};

use opal_dimse::commands::{self, Priority};
use opal_dimse::mux::Multiplexer;
use opal_dimse::progress::{DicomProgress, DicomState};
use opal_dimse::status::StatusType;
use opal_ul::association::ClientAssociationOptions;

use crate::query::{relational_datetime_query_info, InformationModel};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// could not establish the association
    Establish {
        source: opal_ul::association::client::Error,
    },

    /// could not set up the request multiplexer
    Multiplex { source: opal_dimse::mux::Error },

    #[snafu(display("no presentation context accepted for `{}`", sop_class_uid))]
    NoContext { sop_class_uid: String },

    /// could not encode the query identifier
    EncodeIdentifier { source: dicom_object::WriteError },

    /// could not decode a match identifier
    DecodeIdentifier {
        source: opal_dimse::message::ReadError,
    },

    /// the find operation failed
    Find { source: opal_dimse::mux::Error },

    #[snafu(display("could not write match output to {}", path.display()))]
    WriteOutput {
        path: PathBuf,
        source: std::io::Error,
    },

    /// could not serialize a match to JSON
    SerializeMatch { source: serde_json::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The format of match output files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// bare data sets in explicit VR little endian
    #[default]
    Dicom,
    /// the DICOM JSON model
    Json,
}

/// Options for one C-FIND operation.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// the request priority
    pub priority: Priority,
    /// issue a C-CANCEL-RQ after this many matches; zero disables
    pub cancel_after: u32,
    /// write matches into this directory
    pub output_dir: Option<PathBuf>,
    /// counter file name pattern, e.g. `match-####.dcm`;
    /// a run of `#` is replaced by the zero-padded match number
    pub output_pattern: String,
    /// the output format for matches written to disk
    pub output_format: OutputFormat,
    /// write all matches into one file instead of one file per match
    pub concatenate: bool,
}

/// A query service class user bound to one information model.
pub struct FindScu {
    mux: Option<Multiplexer>,
    pc_id: u8,
    model: InformationModel,
}

impl FindScu {
    /// Establish an association proposing the C-FIND SOP class
    /// of the given information model.
    ///
    /// Worklist-style models automatically propose
    /// relational and combined date-time matching
    /// through SOP class extended negotiation.
    pub fn open(
        calling_ae_title: &str,
        called_ae_title: &str,
        address: &str,
        model: InformationModel,
    ) -> Result<FindScu> {
        let sop_class_uid = model.find_uid();
        let mut options = ClientAssociationOptions::new()
            .calling_ae_title(calling_ae_title.to_string())
            .called_ae_title(called_ae_title.to_string())
            .with_presentation_context(sop_class_uid, Vec::<String>::new());
        if model.is_worklist_style() {
            options = options
                .with_extended_negotiation(sop_class_uid, relational_datetime_query_info());
        }

        let association = options.establish_with(address).context(EstablishSnafu)?;
        let pc_id = association
            .contexts()
            .accepted()
            .find(|pc| pc.abstract_syntax == sop_class_uid)
            .map(|pc| pc.id)
            .context(NoContextSnafu { sop_class_uid })?;

        let mux = Multiplexer::new(association).context(MultiplexSnafu)?;
        Ok(FindScu {
            mux: Some(mux),
            pc_id,
            model,
        })
    }

    /// The information model this SCU negotiates.
    pub fn model(&self) -> InformationModel {
        self.model
    }

    /// Perform one query.
    ///
    /// Pending matches are decoded and handed to `on_match`
    /// in the order received.
    /// A `cancel_after` of N issues a C-CANCEL-RQ synchronously
    /// upon delivery of the N-th pending response;
    /// the cancel flag of `progress` is honored the same way.
    pub fn find(
        &mut self,
        keys: &InMemDicomObject<StandardDataDictionary>,
        options: &FindOptions,
        progress: &Arc<DicomProgress>,
        mut on_match: impl FnMut(u32, &InMemDicomObject<StandardDataDictionary>),
    ) -> Result<DicomState> {
        let mux = self.mux.as_ref().expect("association is open");
        let sop_class_uid = self.model.find_uid();

        // worklist-style queries have no query/retrieve level
        if !self.model.is_worklist_style() && keys.get(tags::QUERY_RETRIEVE_LEVEL).is_none() {
            warn!("query identifier has no QueryRetrieveLevel attribute");
        }

        let context = mux
            .contexts()
            .get(self.pc_id)
            .expect("negotiated context is present");
        let mut identifier = Vec::with_capacity(256);
        encode_identifier(keys, &context.transfer_syntax, &mut identifier)?;

        let priority = options.priority;
        let mut handle = mux
            .send_request(self.pc_id, Some(identifier), |message_id| {
                commands::find_rq(message_id, sop_class_uid, priority)
            })
            .context(FindSnafu)?;

        let mut state = DicomState::new(Arc::clone(progress));
        let mut writer = MatchWriter::new(options);
        let mut matches: u32 = 0;

        loop {
            let response = handle.recv().context(FindSnafu)?;
            match response.kind {
                StatusType::Pending => {
                    matches += 1;
                    let message = opal_dimse::message::DicomMessage {
                        command: response.command,
                        data: response.data,
                        presentation_context_id: self.pc_id,
                    };
                    let identifier = message
                        .data_object(mux.contexts())
                        .context(DecodeIdentifierSnafu)?;
                    if let Some(identifier) = identifier {
                        writer.write(matches, &identifier)?;
                        on_match(matches, &identifier);
                        progress.add_completed();
                        progress.notify();
                    }

                    // cancel synchronously on the N-th pending response
                    let cancel_now = (options.cancel_after != 0
                        && matches >= options.cancel_after)
                        || progress.is_cancelled();
                    if cancel_now && !handle.is_cancelled() {
                        debug!("issuing C-CANCEL-RQ after {} matches", matches);
                        handle.cancel().context(FindSnafu)?;
                    }
                }
                kind => {
                    state.set_status(response.status);
                    match kind {
                        StatusType::Success => {
                            info!("query complete, {} match(es)", matches);
                        }
                        StatusType::Cancel => {
                            info!("query cancelled after {} match(es)", matches);
                        }
                        _ => {
                            warn!(
                                "query ended with status {:04X}H after {} match(es)",
                                response.status, matches
                            );
                            progress.add_failed();
                        }
                    }
                    progress.notify();
                    break;
                }
            }
        }

        writer.finish()?;
        Ok(state)
    }

    /// Release the association.
    pub fn close(mut self) -> Result<()> {
        if let Some(mux) = self.mux.take() {
            mux.release().context(FindSnafu)?;
        }
        Ok(())
    }
}

/// Encode a data set with the registry entry for `transfer_syntax_uid`,
/// falling back to implicit VR little endian for unknown identifiers.
fn encode_identifier(
    keys: &InMemDicomObject<StandardDataDictionary>,
    transfer_syntax_uid: &str,
    out: &mut Vec<u8>,
) -> Result<()> {
    use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
    use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
    match TransferSyntaxRegistry.get(transfer_syntax_uid) {
        Some(ts) => keys.write_dataset_with_ts(out, ts),
        None => keys.write_dataset_with_ts(out, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased()),
    }
    .context(EncodeIdentifierSnafu)
}

/// Writes match identifiers to disk,
/// one file per match or one concatenated file.
struct MatchWriter<'a> {
    options: &'a FindOptions,
    concatenated: Option<File>,
    concatenated_path: Option<PathBuf>,
    json_matches: Vec<serde_json::Value>,
}

impl<'a> MatchWriter<'a> {
    fn new(options: &'a FindOptions) -> MatchWriter<'a> {
        MatchWriter {
            options,
            concatenated: None,
            concatenated_path: None,
            json_matches: Vec::new(),
        }
    }

    fn write(
        &mut self,
        number: u32,
        identifier: &InMemDicomObject<StandardDataDictionary>,
    ) -> Result<()> {
        let Some(dir) = &self.options.output_dir else {
            return Ok(());
        };

        match self.options.output_format {
            OutputFormat::Json if self.options.concatenate => {
                let value =
                    dicom_json::to_value(identifier).context(SerializeMatchSnafu)?;
                self.json_matches.push(value);
                Ok(())
            }
            format => {
                let path = if self.options.concatenate {
                    dir.join(expand_pattern(&self.options.output_pattern, 0))
                } else {
                    dir.join(expand_pattern(&self.options.output_pattern, number))
                };

                let mut bytes = Vec::new();
                match format {
                    OutputFormat::Dicom => {
                        identifier
                            .write_dataset_with_ts(
                                &mut bytes,
                                &entries::EXPLICIT_VR_LITTLE_ENDIAN.erased(),
                            )
                            .context(EncodeIdentifierSnafu)?;
                    }
                    OutputFormat::Json => {
                        let json =
                            dicom_json::to_string(identifier).context(SerializeMatchSnafu)?;
                        bytes = json.into_bytes();
                        bytes.push(b'\n');
                    }
                }

                if self.options.concatenate {
                    if self.concatenated.is_none() {
                        let file =
                            File::create(&path).context(WriteOutputSnafu { path: path.clone() })?;
                        self.concatenated = Some(file);
                        self.concatenated_path = Some(path.clone());
                    }
                    let file = self.concatenated.as_mut().expect("file was just opened");
                    file.write_all(&bytes)
                        .context(WriteOutputSnafu { path })?;
                } else {
                    std::fs::write(&path, &bytes).context(WriteOutputSnafu { path })?;
                }
                Ok(())
            }
        }
    }

    fn finish(&mut self) -> Result<()> {
        if !self.json_matches.is_empty() {
            let dir = self
                .options
                .output_dir
                .as_ref()
                .expect("output directory is set");
            let path = dir.join(expand_pattern(&self.options.output_pattern, 0));
            let array = serde_json::Value::Array(std::mem::take(&mut self.json_matches));
            let text =
                serde_json::to_string_pretty(&array).context(SerializeMatchSnafu)?;
            std::fs::write(&path, text).context(WriteOutputSnafu { path })?;
        }
        Ok(())
    }
}

/// Expand a counter pattern:
/// the first run of `#` characters becomes the zero-padded number.
///
/// `match-###.dcm` with number 7 becomes `match-007.dcm`;
/// a pattern without `#` gets the number appended before any extension.
pub fn expand_pattern(pattern: &str, number: u32) -> String {
    if pattern.is_empty() {
        return format!("{:04}.dcm", number);
    }
    if let Some(start) = pattern.find('#') {
        let width = pattern[start..].chars().take_while(|c| *c == '#').count();
        let mut out = String::with_capacity(pattern.len() + 8);
        out.push_str(&pattern[..start]);
        out.push_str(&format!("{:0width$}", number, width = width));
        out.push_str(&pattern[start + width..]);
        out
    } else {
        match pattern.rsplit_once('.') {
            Some((stem, extension)) => format!("{}{:04}.{}", stem, number, extension),
            None => format!("{}{:04}", pattern, number),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_patterns_expand() {
        assert_eq!(expand_pattern("match-###.dcm", 7), "match-007.dcm");
        assert_eq!(expand_pattern("m#.json", 12), "m12.json");
        assert_eq!(expand_pattern("result.dcm", 3), "result0003.dcm");
        assert_eq!(expand_pattern("", 1), "0001.dcm");
    }
}
