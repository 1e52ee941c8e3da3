//! Key image attributes of a data set with pixel data.

use dicom_dictionary_std::tags;
use dicom_object::{InMemDicomObject, StandardDataDictionary};
use snafu::{OptionExt, ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("missing required attribute `{}`", name))]
    MissingRequiredField { name: &'static str },

    #[snafu(display("could not convert attribute `{}`", name))]
    CastValue {
        name: &'static str,
        source: dicom_core::value::ConvertValueError,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The photometric interpretation of the pixel data samples.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PhotometricInterpretation {
    Monochrome1,
    Monochrome2,
    PaletteColor,
    Rgb,
    YbrFull,
    YbrFull422,
    YbrPartial420,
    /// an interpretation this crate attaches no semantics to
    Other(String),
}

impl PhotometricInterpretation {
    pub fn from_keyword(keyword: &str) -> PhotometricInterpretation {
        match keyword {
            "MONOCHROME1" => PhotometricInterpretation::Monochrome1,
            "MONOCHROME2" => PhotometricInterpretation::Monochrome2,
            "PALETTE COLOR" => PhotometricInterpretation::PaletteColor,
            "RGB" => PhotometricInterpretation::Rgb,
            "YBR_FULL" => PhotometricInterpretation::YbrFull,
            "YBR_FULL_422" => PhotometricInterpretation::YbrFull422,
            "YBR_PARTIAL_420" => PhotometricInterpretation::YbrPartial420,
            other => PhotometricInterpretation::Other(other.to_string()),
        }
    }

    pub fn keyword(&self) -> &str {
        match self {
            PhotometricInterpretation::Monochrome1 => "MONOCHROME1",
            PhotometricInterpretation::Monochrome2 => "MONOCHROME2",
            PhotometricInterpretation::PaletteColor => "PALETTE COLOR",
            PhotometricInterpretation::Rgb => "RGB",
            PhotometricInterpretation::YbrFull => "YBR_FULL",
            PhotometricInterpretation::YbrFull422 => "YBR_FULL_422",
            PhotometricInterpretation::YbrPartial420 => "YBR_PARTIAL_420",
            PhotometricInterpretation::Other(keyword) => keyword,
        }
    }

    pub fn is_monochrome(&self) -> bool {
        matches!(
            self,
            PhotometricInterpretation::Monochrome1 | PhotometricInterpretation::Monochrome2
        )
    }

    /// The length in bytes of one frame in native form.
    ///
    /// Chroma-subsampled interpretations store two samples per pixel
    /// on average instead of three.
    pub fn frame_length(
        &self,
        columns: u16,
        rows: u16,
        samples_per_pixel: u16,
        bits_allocated: u16,
    ) -> usize {
        let pixels = columns as usize * rows as usize;
        let bytes_per_sample = (bits_allocated as usize + 7) / 8;
        match self {
            PhotometricInterpretation::YbrFull422 => pixels * 2 * bytes_per_sample,
            PhotometricInterpretation::YbrPartial420 => pixels * 3 / 2 * bytes_per_sample,
            _ => pixels * samples_per_pixel as usize * bytes_per_sample,
        }
    }
}

/// The image attributes needed to interpret the _Pixel Data_ element.
///
/// Derived once from the source data set
/// and carried through the transcode pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub rows: u16,
    pub columns: u16,
    pub bits_allocated: u16,
    pub bits_stored: u16,
    pub high_bit: u16,
    pub samples_per_pixel: u16,
    pub photometric: PhotometricInterpretation,
    /// 0 = interleaved samples, 1 = separate sample planes
    pub planar_configuration: u16,
    pub number_of_frames: u32,
    /// whether the samples are signed (_Pixel Representation_ = 1)
    pub signed: bool,
    pub pixel_padding_value: Option<i32>,
}

impl ImageDescriptor {
    /// Gather the descriptor from a data set.
    pub fn from_object(obj: &InMemDicomObject<StandardDataDictionary>) -> Result<ImageDescriptor> {
        let rows = required_u16(obj, tags::ROWS, "Rows")?;
        let columns = required_u16(obj, tags::COLUMNS, "Columns")?;
        let bits_allocated = required_u16(obj, tags::BITS_ALLOCATED, "BitsAllocated")?;
        let bits_stored = optional_u16(obj, tags::BITS_STORED).unwrap_or(bits_allocated);
        let high_bit = optional_u16(obj, tags::HIGH_BIT).unwrap_or(bits_stored.saturating_sub(1));
        let samples_per_pixel = optional_u16(obj, tags::SAMPLES_PER_PIXEL).unwrap_or(1);
        let photometric = obj
            .element(tags::PHOTOMETRIC_INTERPRETATION)
            .ok()
            .and_then(|e| e.to_str().ok())
            .map(|keyword| PhotometricInterpretation::from_keyword(keyword.trim()))
            .context(MissingRequiredFieldSnafu {
                name: "PhotometricInterpretation",
            })?;
        let planar_configuration = optional_u16(obj, tags::PLANAR_CONFIGURATION).unwrap_or(0);
        let number_of_frames = obj
            .element(tags::NUMBER_OF_FRAMES)
            .ok()
            .and_then(|e| e.to_int::<u32>().ok())
            .unwrap_or(1);
        let signed = optional_u16(obj, tags::PIXEL_REPRESENTATION).unwrap_or(0) == 1;
        let pixel_padding_value = obj
            .element(tags::PIXEL_PADDING_VALUE)
            .ok()
            .and_then(|e| e.to_int::<i32>().ok());

        Ok(ImageDescriptor {
            rows,
            columns,
            bits_allocated,
            bits_stored,
            high_bit,
            samples_per_pixel,
            photometric,
            planar_configuration,
            number_of_frames,
            signed,
            pixel_padding_value,
        })
    }

    /// The length in bytes of one frame of this image in native form.
    pub fn frame_length(&self) -> usize {
        self.photometric.frame_length(
            self.columns,
            self.rows,
            self.samples_per_pixel,
            self.bits_allocated,
        )
    }
}

fn required_u16(
    obj: &InMemDicomObject<StandardDataDictionary>,
    tag: dicom_core::Tag,
    name: &'static str,
) -> Result<u16> {
    obj.element(tag)
        .ok()
        .context(MissingRequiredFieldSnafu { name })?
        .to_int::<u16>()
        .context(CastValueSnafu { name })
}

fn optional_u16(obj: &InMemDicomObject<StandardDataDictionary>, tag: dicom_core::Tag) -> Option<u16> {
    obj.element(tag).ok().and_then(|e| e.to_int::<u16>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{dicom_value, DataElement, VR};

    fn minimal_object() -> InMemDicomObject<StandardDataDictionary> {
        let mut obj = InMemDicomObject::new_empty();
        obj.put(DataElement::new(tags::ROWS, VR::US, dicom_value!(U16, [4])));
        obj.put(DataElement::new(
            tags::COLUMNS,
            VR::US,
            dicom_value!(U16, [6]),
        ));
        obj.put(DataElement::new(
            tags::BITS_ALLOCATED,
            VR::US,
            dicom_value!(U16, [8]),
        ));
        obj.put(DataElement::new(
            tags::PHOTOMETRIC_INTERPRETATION,
            VR::CS,
            dicom_value!(Str, "MONOCHROME2"),
        ));
        obj
    }

    #[test]
    fn descriptor_defaults() {
        let descriptor = ImageDescriptor::from_object(&minimal_object()).unwrap();
        assert_eq!(descriptor.rows, 4);
        assert_eq!(descriptor.columns, 6);
        assert_eq!(descriptor.samples_per_pixel, 1);
        assert_eq!(descriptor.bits_stored, 8);
        assert_eq!(descriptor.number_of_frames, 1);
        assert!(!descriptor.signed);
        assert_eq!(descriptor.frame_length(), 24);
    }

    #[test]
    fn missing_photometric_is_an_error() {
        let mut obj = minimal_object();
        obj.remove_element(tags::PHOTOMETRIC_INTERPRETATION);
        let err = ImageDescriptor::from_object(&obj).unwrap_err();
        assert!(matches!(err, Error::MissingRequiredField { .. }));
    }

    #[test]
    fn frame_length_follows_photometric_interpretation() {
        let pm = PhotometricInterpretation::Rgb;
        assert_eq!(pm.frame_length(10, 10, 3, 8), 300);
        let pm = PhotometricInterpretation::YbrFull422;
        assert_eq!(pm.frame_length(10, 10, 3, 8), 200);
        let pm = PhotometricInterpretation::Monochrome2;
        assert_eq!(pm.frame_length(10, 10, 1, 16), 200);
    }
}
