//! The per-frame transcode loop and data set adaptation.

use dicom_core::value::PixelFragmentSequence;
use dicom_core::{dicom_value, DataElement, Length, PrimitiveValue, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_object::{InMemDicomObject, StandardDataDictionary};
use snafu::{ResultExt, Snafu};
use tracing::debug;

use crate::adapt::AdaptTransferSyntax;
use crate::codec::{self, DecodedFrame, EncodeOptions, PixelCodec};
use crate::descriptor::ImageDescriptor;
use crate::frames::PixelSource;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// could not derive the image descriptor
    Describe { source: crate::descriptor::Error },

    /// could not demultiplex the pixel data
    Frames { source: crate::frames::Error },

    /// could not decode a stored frame
    Decode { source: crate::codec::Error },

    /// could not encode a frame for the target transfer syntax
    Encode { source: crate::codec::Error },

    #[snafu(display("image editor failed: {}", message))]
    Edit { message: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A caller-supplied mutation applied to each decoded frame,
/// e.g. masking a region or burning in an overlay.
pub trait ImageEditor: Send + Sync {
    fn edit(
        &self,
        descriptor: &ImageDescriptor,
        frame_index: u32,
        frame: &mut DecodedFrame,
    ) -> std::result::Result<(), String>;
}

/// Adapt the pixel data of `obj` from its stored transfer syntax
/// to `syntax.suitable`.
///
/// The pipeline:
///
/// 1. derives the [`ImageDescriptor`] once;
/// 2. checks that the requested syntax is achievable for this image,
///    downgrading `syntax.suitable` if not
///    (callers must consult `syntax.suitable` afterwards
///    and advertise a matching presentation context);
/// 3. extracts each frame, decodes it through the codec,
///    runs the editors, and re-encodes it;
/// 4. replaces the _Pixel Data_ element,
///    either as one native run
///    or as an encapsulated fragment sequence
///    (empty basic offset table, one fragment per frame);
/// 5. adapts the affected image attributes.
///
/// Data sets without pixel data are left untouched.
pub fn transcode_object(
    obj: &mut InMemDicomObject<StandardDataDictionary>,
    syntax: &mut AdaptTransferSyntax,
    codec: &dyn PixelCodec,
    editors: &[Box<dyn ImageEditor>],
) -> Result<()> {
    if obj.get(tags::PIXEL_DATA).is_none() {
        return Ok(());
    }

    let descriptor = ImageDescriptor::from_object(obj).context(DescribeSnafu)?;

    // feasibility: 8-bit baseline JPEG cannot carry wider samples
    if syntax.suitable == uids::JPEG_BASELINE8_BIT && descriptor.bits_allocated > 8 {
        syntax.downgrade_to_native("8-bit baseline JPEG cannot encode wider samples");
    }
    // the codec must be able to produce the target encoding
    if !codec::is_native(syntax.suitable.as_str()) && !codec.supports(syntax.suitable.as_str()) {
        syntax.downgrade_to_native("no codec available for the requested transfer syntax");
    }

    if syntax.is_noop() && editors.is_empty() {
        return Ok(());
    }

    let source = PixelSource::from_object(obj).context(FramesSnafu)?;
    let options = EncodeOptions {
        quality: syntax.jpeg_quality,
        compression_ratio: syntax.compression_ratio,
    };

    let mut encoded_frames = Vec::with_capacity(descriptor.number_of_frames as usize);
    let mut last_layout: Option<DecodedFrame> = None;
    for index in 0..descriptor.number_of_frames {
        let stored = source
            .frame(&descriptor, &syntax.original, index)
            .context(FramesSnafu)?;

        let mut decoded = codec
            .decode_frame(&descriptor, &syntax.original, &stored)
            .context(DecodeSnafu)?;

        for editor in editors {
            editor
                .edit(&descriptor, index, &mut decoded)
                .map_err(|message| Error::Edit { message })?;
        }

        let encoded = codec
            .encode_frame(&descriptor, &syntax.suitable, &decoded, &options)
            .context(EncodeSnafu)?;
        // keep the sample layout of the last frame
        // for the attribute adaptation below
        last_layout = Some(DecodedFrame {
            data: Vec::new(),
            ..decoded
        });
        encoded_frames.push(encoded);
    }

    debug!(
        frames = encoded_frames.len(),
        from = %syntax.original,
        to = %syntax.suitable,
        "pixel data transcoded"
    );

    if codec::is_native(syntax.suitable.as_str()) {
        // one contiguous native pixel data run
        let data = crate::frames::pack_frames(encoded_frames);
        obj.put(DataElement::new_with_len(
            tags::PIXEL_DATA,
            VR::OW,
            Length::defined(data.len() as u32),
            PrimitiveValue::from(data),
        ));
    } else {
        // encapsulated: empty basic offset table,
        // one fragment per frame, delimited by the writer
        obj.put(DataElement::new_with_len(
            tags::PIXEL_DATA,
            VR::OB,
            Length::UNDEFINED,
            PixelFragmentSequence::new(Vec::<u32>::new(), encoded_frames),
        ));
    }

    if let Some(layout) = last_layout {
        adapt_attributes(obj, syntax, &layout);
    }

    Ok(())
}

/// Rewrite the image attributes affected by the new sample layout
/// and target transfer syntax.
fn adapt_attributes(
    obj: &mut InMemDicomObject<StandardDataDictionary>,
    syntax: &AdaptTransferSyntax,
    layout: &DecodedFrame,
) {
    obj.put(DataElement::new(
        tags::PHOTOMETRIC_INTERPRETATION,
        VR::CS,
        dicom_value!(Str, layout.photometric.keyword()),
    ));
    if layout.samples_per_pixel > 1 {
        obj.put(DataElement::new(
            tags::PLANAR_CONFIGURATION,
            VR::US,
            dicom_value!(U16, [layout.planar_configuration]),
        ));
    }
    obj.put(DataElement::new(
        tags::BITS_ALLOCATED,
        VR::US,
        dicom_value!(U16, [layout.bits_allocated]),
    ));
    obj.put(DataElement::new(
        tags::BITS_STORED,
        VR::US,
        dicom_value!(U16, [layout.bits_stored]),
    ));
    obj.put(DataElement::new(
        tags::HIGH_BIT,
        VR::US,
        dicom_value!(U16, [layout.high_bit]),
    ));

    if syntax.suitable == uids::JPEG_BASELINE8_BIT || syntax.suitable == uids::JPEG_EXTENDED12_BIT {
        obj.put(DataElement::new(
            tags::LOSSY_IMAGE_COMPRESSION,
            VR::CS,
            dicom_value!(Str, "01"),
        ));
        if let Some(ratio) = syntax.compression_ratio {
            obj.put(DataElement::new(
                tags::LOSSY_IMAGE_COMPRESSION_RATIO,
                VR::DS,
                dicom_value!(Str, format!("{}", ratio)),
            ));
        }
    }
}
