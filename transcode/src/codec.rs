//! The pixel codec facade.
//!
//! The transcoding pipeline is independent of the actual
//! compression engines; they are injected behind the
//! [`PixelCodec`] trait.
//! The built-in [`NativeCodec`] handles codec-free transfer syntaxes
//! only, passing sample bytes through unchanged.

use dicom_dictionary_std::uids;
use snafu::{ensure, Snafu};

use crate::descriptor::{ImageDescriptor, PhotometricInterpretation};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("transfer syntax `{}` is not supported by this codec", uid))]
    UnsupportedTransferSyntax { uid: String },

    #[snafu(display("cannot encode {}-bit samples to `{}`", bits_allocated, uid))]
    UnsupportedBitDepth { bits_allocated: u16, uid: String },

    #[snafu(display("codec failure: {}", message))]
    CodecFailure { message: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One decoded frame in native interleaved form,
/// along with the sample layout it uses.
///
/// The layout fields start out as a copy of the image descriptor
/// and may be changed by a codec or an image editor
/// (e.g. converting color spaces or widening samples).
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    /// native-form sample bytes, little endian
    pub data: Vec<u8>,
    pub bits_allocated: u16,
    pub bits_stored: u16,
    pub high_bit: u16,
    pub samples_per_pixel: u16,
    pub photometric: PhotometricInterpretation,
    pub planar_configuration: u16,
}

impl DecodedFrame {
    /// A decoded frame with the layout of the descriptor.
    pub fn with_descriptor_layout(data: Vec<u8>, descriptor: &ImageDescriptor) -> DecodedFrame {
        DecodedFrame {
            data,
            bits_allocated: descriptor.bits_allocated,
            bits_stored: descriptor.bits_stored,
            high_bit: descriptor.high_bit,
            samples_per_pixel: descriptor.samples_per_pixel,
            photometric: descriptor.photometric.clone(),
            planar_configuration: descriptor.planar_configuration,
        }
    }
}

/// Options forwarded to the encoding side of a codec.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct EncodeOptions {
    /// quality for lossy encoders, from 0 to 100
    pub quality: Option<u8>,
    /// the compression ratio to record in the data set
    pub compression_ratio: Option<f32>,
}

/// Facade over the pixel data compression engines.
///
/// One codec may handle several transfer syntaxes;
/// [`supports`](Self::supports) advertises which.
pub trait PixelCodec: Send + Sync {
    /// Whether this codec can decode and encode the given transfer syntax.
    fn supports(&self, transfer_syntax: &str) -> bool;

    /// Decode one stored frame into native form.
    fn decode_frame(
        &self,
        descriptor: &ImageDescriptor,
        transfer_syntax: &str,
        frame: &[u8],
    ) -> Result<DecodedFrame>;

    /// Encode one native frame for the given transfer syntax.
    fn encode_frame(
        &self,
        descriptor: &ImageDescriptor,
        transfer_syntax: &str,
        frame: &DecodedFrame,
        options: &EncodeOptions,
    ) -> Result<Vec<u8>>;
}

/// Whether a transfer syntax carries pixel data in native form.
pub fn is_native(transfer_syntax: &str) -> bool {
    matches!(
        transfer_syntax,
        uids::IMPLICIT_VR_LITTLE_ENDIAN
            | uids::EXPLICIT_VR_LITTLE_ENDIAN
            | uids::EXPLICIT_VR_BIG_ENDIAN
    )
}

/// The built-in codec for codec-free transfer syntaxes.
///
/// Decoding and encoding are pass-through;
/// any compressed transfer syntax is unsupported.
#[derive(Debug, Default, Copy, Clone)]
pub struct NativeCodec;

impl PixelCodec for NativeCodec {
    fn supports(&self, transfer_syntax: &str) -> bool {
        is_native(transfer_syntax)
    }

    fn decode_frame(
        &self,
        descriptor: &ImageDescriptor,
        transfer_syntax: &str,
        frame: &[u8],
    ) -> Result<DecodedFrame> {
        ensure!(
            self.supports(transfer_syntax),
            UnsupportedTransferSyntaxSnafu {
                uid: transfer_syntax
            }
        );
        Ok(DecodedFrame::with_descriptor_layout(
            frame.to_vec(),
            descriptor,
        ))
    }

    fn encode_frame(
        &self,
        _descriptor: &ImageDescriptor,
        transfer_syntax: &str,
        frame: &DecodedFrame,
        _options: &EncodeOptions,
    ) -> Result<Vec<u8>> {
        ensure!(
            self.supports(transfer_syntax),
            UnsupportedTransferSyntaxSnafu {
                uid: transfer_syntax
            }
        );
        Ok(frame.data.clone())
    }
}
