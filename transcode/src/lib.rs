//! Transfer syntax adaptation for DICOM pixel data.
//!
//! When an association accepts a transfer syntax
//! other than the one a composite object is stored in,
//! the object's pixel data must be re-encoded before sending.
//! This crate provides the pieces of that pipeline:
//!
//! - [`descriptor`]: the [`ImageDescriptor`](descriptor::ImageDescriptor),
//!   derived once from the source data set
//!   and carried through the pipeline;
//! - [`frames`]: demultiplexing of the _Pixel Data_ element
//!   into individual frames,
//!   for both native (contiguous) and encapsulated (fragmented) encodings;
//! - [`codec`]: the [`PixelCodec`](codec::PixelCodec) facade
//!   behind which the actual compression engines live;
//! - [`adapt`]: the requested/suitable transfer syntax pair
//!   with its downgrade rule;
//! - [`pipeline`]: the per-frame decode, edit and re-encode loop
//!   plus the data set attribute adaptation;
//! - [`lut`]: memoized modality/VOI look-up tables.

pub mod adapt;
pub mod codec;
pub mod descriptor;
pub mod frames;
pub mod lut;
pub mod pipeline;

pub use adapt::AdaptTransferSyntax;
pub use codec::{DecodedFrame, EncodeOptions, NativeCodec, PixelCodec};
pub use descriptor::{ImageDescriptor, PhotometricInterpretation};
pub use frames::PixelSource;
pub use lut::{Lut, LutCache, LutParameters};
pub use pipeline::{transcode_object, ImageEditor};
