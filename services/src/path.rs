//! Attribute-driven file path patterns.
//!
//! A pattern is a path template over DICOM attributes, for example:
//!
//! ```text
//! {00080020,date,yyyy/MM/dd}/{0020000D,hash}/{00080018}.dcm
//! ```
//!
//! Each `{...}` placeholder names a tag in `GGGGEEEE` form,
//! optionally followed by a transform:
//! `date` re-formats a DA/DT value with the given date pattern,
//! `hash` shortens an identifier to a fixed-width hex digest.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::str::FromStr;

use chrono::NaiveDate;
use dicom_core::Tag;
use dicom_object::{InMemDicomObject, StandardDataDictionary};
use snafu::{OptionExt, Snafu};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("malformed placeholder `{{{}}}`", placeholder))]
    MalformedPlaceholder { placeholder: String },

    #[snafu(display("invalid tag `{}` in path pattern", tag))]
    InvalidTag { tag: String },

    #[snafu(display("unknown transform `{}` in path pattern", transform))]
    UnknownTransform { transform: String },

    /// unterminated placeholder in path pattern
    Unterminated,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A value transform applied to one placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Transform {
    None,
    /// shorten to a fixed-width hex digest
    Hash,
    /// parse as a DICOM date and re-format
    Date { format: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Attribute { tag: Tag, transform: Transform },
}

/// A compiled file path pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePathPattern {
    segments: Vec<Segment>,
}

impl FromStr for FilePathPattern {
    type Err = Error;

    fn from_str(pattern: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = pattern;
        while let Some(open) = rest.find('{') {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let close = rest[open..].find('}').context(UnterminatedSnafu)? + open;
            let placeholder = &rest[open + 1..close];
            segments.push(parse_placeholder(placeholder)?);
            rest = &rest[close + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        Ok(FilePathPattern { segments })
    }
}

fn parse_placeholder(placeholder: &str) -> Result<Segment> {
    let mut parts = placeholder.split(',').map(str::trim);
    let tag_text = parts.next().filter(|t| !t.is_empty()).context(
        MalformedPlaceholderSnafu { placeholder },
    )?;
    let tag = parse_tag(tag_text)?;
    let transform = match parts.next() {
        None => Transform::None,
        Some("hash") => Transform::Hash,
        Some("date") => {
            let format = parts.next().unwrap_or("yyyyMMdd").to_string();
            Transform::Date { format }
        }
        Some(other) => {
            return UnknownTransformSnafu { transform: other }.fail();
        }
    };
    Ok(Segment::Attribute { tag, transform })
}

fn parse_tag(text: &str) -> Result<Tag> {
    let digits = text.trim_start_matches('(').trim_end_matches(')').replace(',', "");
    if digits.len() != 8 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return InvalidTagSnafu { tag: text }.fail();
    }
    let group = u16::from_str_radix(&digits[0..4], 16).map_err(|_| Error::InvalidTag {
        tag: text.to_string(),
    })?;
    let element = u16::from_str_radix(&digits[4..8], 16).map_err(|_| Error::InvalidTag {
        tag: text.to_string(),
    })?;
    Ok(Tag(group, element))
}

impl FilePathPattern {
    /// Format the relative path for one data set.
    ///
    /// Attributes that are missing or unreadable
    /// contribute the literal `UNKNOWN`.
    pub fn format(&self, obj: &InMemDicomObject<StandardDataDictionary>) -> PathBuf {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(literal) => out.push_str(literal),
                Segment::Attribute { tag, transform } => {
                    let value = obj
                        .element(*tag)
                        .ok()
                        .and_then(|e| e.to_str().ok())
                        .map(|s| {
                            s.trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
                                .to_string()
                        })
                        .filter(|s| !s.is_empty());
                    match value {
                        None => out.push_str("UNKNOWN"),
                        Some(value) => match transform {
                            Transform::None => out.push_str(&sanitize(&value)),
                            Transform::Hash => {
                                let mut hasher = DefaultHasher::new();
                                value.hash(&mut hasher);
                                out.push_str(&format!("{:08x}", hasher.finish() as u32));
                            }
                            Transform::Date { format } => {
                                out.push_str(&format_date(&value, format));
                            }
                        },
                    }
                }
            }
        }
        PathBuf::from(out)
    }
}

/// Re-format a DICOM DA/DT value (`YYYYMMDD...`)
/// with a Java-style date pattern such as `yyyy/MM/dd`.
///
/// Unparseable values come through unchanged, sanitized.
fn format_date(value: &str, pattern: &str) -> String {
    let digits: String = value.chars().filter(char::is_ascii_digit).take(8).collect();
    match NaiveDate::parse_from_str(&digits, "%Y%m%d") {
        Ok(date) => date.format(&to_chrono_format(pattern)).to_string(),
        Err(_) => sanitize(value),
    }
}

/// Translate the Java date format tokens used in configuration files
/// (`yyyy`, `MM`, `dd`, `HH`, `mm`, `ss`) to a chrono format string.
fn to_chrono_format(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        let mut run = 1;
        while chars.peek() == Some(&c) {
            chars.next();
            run += 1;
        }
        match (c, run) {
            ('y', _) => out.push_str("%Y"),
            ('M', _) => out.push_str("%m"),
            ('d', _) => out.push_str("%d"),
            ('H', _) => out.push_str("%H"),
            ('m', _) => out.push_str("%M"),
            ('s', _) => out.push_str("%S"),
            _ => {
                for _ in 0..run {
                    out.push(c);
                }
            }
        }
    }
    out
}

/// Strip characters that are unsafe in file names.
fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
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

    fn sample_object() -> InMemDicomObject<StandardDataDictionary> {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(
            tags::STUDY_DATE,
            VR::DA,
            dicom_value!(Str, "20240317"),
        ));
        obj.put(DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "1.2.840.1.555"),
        ));
        obj.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "1.2.840.1.555.1"),
        ));
        obj
    }

    #[test]
    fn full_pattern_formats() {
        let pattern: FilePathPattern = "{00080020,date,yyyy/MM/dd}/{0020000D,hash}/{00080018}.dcm"
            .parse()
            .unwrap();
        let path = pattern.format(&sample_object());
        let text = path.to_string_lossy();
        assert!(text.starts_with("2024/03/17/"), "got {}", text);
        assert!(text.ends_with("/1.2.840.1.555.1.dcm"), "got {}", text);
        // the hash component is 8 hex characters
        let hash = text.split('/').nth(3).unwrap();
        assert_eq!(hash.len(), 8);
    }

    #[test]
    fn hashing_is_stable() {
        let pattern: FilePathPattern = "{0020000D,hash}".parse().unwrap();
        let a = pattern.format(&sample_object());
        let b = pattern.format(&sample_object());
        assert_eq!(a, b);
    }

    #[test]
    fn missing_attributes_become_unknown() {
        let pattern: FilePathPattern = "{00100010}/{00080018}.dcm".parse().unwrap();
        let path = pattern.format(&sample_object());
        assert_eq!(
            path.to_string_lossy(),
            "UNKNOWN/1.2.840.1.555.1.dcm"
        );
    }

    #[test]
    fn bad_patterns_are_rejected() {
        assert!("{0008}".parse::<FilePathPattern>().is_err());
        assert!("{00080020,frobnicate}".parse::<FilePathPattern>().is_err());
        assert!("{00080020".parse::<FilePathPattern>().is_err());
    }
}
