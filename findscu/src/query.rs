//! Parsing of `«tag»=«value»` query terms into DICOM attributes.

use std::str::FromStr;

use dicom_core::{DataDictionary, DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::StandardDataDictionary;
use dicom_object::InMemDicomObject;
use snafu::{whatever, OptionExt, ResultExt, Whatever};

#[derive(Debug, Clone, Eq, Hash, PartialEq)]
struct TermQuery {
    field: Tag,
    match_value: String,
}

/// Term queries use the syntax `«tag»=«value»`,
/// where `«tag»` is either a DICOM tag group-element pair
/// or the respective tag keyword,
/// and `=«value»` is optional.
impl FromStr for TermQuery {
    type Err = Whatever;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('=');

        let tag_part = parts.next().whatever_context("empty query")?;
        let value_part = parts.next().unwrap_or_default();

        let field: Tag = tag_part.parse().or_else(|_| {
            // look for the tag in the standard data dictionary
            let data_entry = StandardDataDictionary
                .by_name(tag_part)
                .whatever_context("could not resolve query field name")?;
            Ok(data_entry.tag.inner())
        })?;

        Ok(TermQuery {
            field,
            match_value: value_part.to_owned(),
        })
    }
}

/// Put the given query terms into the query object.
pub fn parse_queries<T>(mut obj: InMemDicomObject, qs: &[T]) -> Result<InMemDicomObject, Whatever>
where
    T: AsRef<str>,
{
    for q in qs {
        let term_query: TermQuery = q.as_ref().parse()?;
        obj.put(term_to_element(term_query.field, &term_query.match_value)?);
    }
    Ok(obj)
}

fn term_to_element(tag: Tag, txt_value: &str) -> Result<DataElement<InMemDicomObject>, Whatever> {
    let vr = StandardDataDictionary
        .by_tag(tag)
        .map(|e| e.vr.relaxed())
        .unwrap_or(VR::LO);
    let value = match vr {
        VR::SS => PrimitiveValue::from(
            txt_value
                .parse::<i16>()
                .whatever_context("Failed to parse value as SS")?,
        ),
        VR::SL => PrimitiveValue::from(
            txt_value
                .parse::<i32>()
                .whatever_context("Failed to parse value as SL")?,
        ),
        VR::US => PrimitiveValue::from(
            txt_value
                .parse::<u16>()
                .whatever_context("Failed to parse value as US")?,
        ),
        VR::UL => PrimitiveValue::from(
            txt_value
                .parse::<u32>()
                .whatever_context("Failed to parse value as UL")?,
        ),
        VR::FL => PrimitiveValue::from(
            txt_value
                .parse::<f32>()
                .whatever_context("Failed to parse value as FL")?,
        ),
        VR::FD => PrimitiveValue::from(
            txt_value
                .parse::<f64>()
                .whatever_context("Failed to parse value as FD")?,
        ),
        VR::SQ | VR::OB | VR::OW | VR::UN | VR::AT => {
            whatever!("Unsupported VR {} in query term", vr)
        }
        _ => PrimitiveValue::from(txt_value),
    };
    Ok(DataElement::new(tag, vr, value))
}
