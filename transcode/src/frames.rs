//! Demultiplexing of the _Pixel Data_ element into frames.
//!
//! Native pixel data is one contiguous run of samples,
//! frame after frame.
//! Encapsulated pixel data is a list of fragments
//! whose mapping to frames must be discovered:
//! trivially for single-frame objects,
//! one-to-one for RLE Lossless,
//! and by probing for compressed bit stream headers otherwise.

use dicom_core::value::Value;
use dicom_dictionary_std::{tags, uids};
use dicom_object::{InMemDicomObject, StandardDataDictionary};
use snafu::{ensure, OptionExt, Snafu};

use crate::descriptor::ImageDescriptor;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// the data set has no pixel data element
    MissingPixelData,

    /// the pixel data element could not be read as bytes
    UnreadablePixelData,

    #[snafu(display("frame index {} out of bounds ({} frames)", index, frames))]
    FrameOutOfBounds { index: u32, frames: u32 },

    #[snafu(display(
        "native pixel data too short: expected {} bytes for frame {}, got {}",
        expected,
        index,
        len
    ))]
    TruncatedPixelData {
        expected: usize,
        index: u32,
        len: usize,
    },

    #[snafu(display(
        "could not map {} fragments to {} frames",
        fragments,
        frames
    ))]
    FrameMappingFailed { fragments: usize, frames: u32 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The pixel data of one data set, in its stored form.
#[derive(Debug, Clone)]
pub enum PixelSource {
    /// contiguous native-format bytes
    Native { data: Vec<u8> },
    /// encapsulated fragments with their basic offset table
    Encapsulated {
        offset_table: Vec<u32>,
        fragments: Vec<Vec<u8>>,
    },
}

impl PixelSource {
    /// Extract the pixel data element from a data set.
    pub fn from_object(obj: &InMemDicomObject<StandardDataDictionary>) -> Result<PixelSource> {
        let element = obj.element(tags::PIXEL_DATA).ok().context(MissingPixelDataSnafu)?;
        match element.value() {
            Value::PixelSequence(sequence) => Ok(PixelSource::Encapsulated {
                offset_table: sequence.offset_table().to_vec(),
                fragments: sequence.fragments().to_vec(),
            }),
            _ => {
                let data = element
                    .to_bytes()
                    .ok()
                    .context(UnreadablePixelDataSnafu)?
                    .into_owned();
                Ok(PixelSource::Native { data })
            }
        }
    }

    /// Whether the stored pixel data is encapsulated.
    pub fn is_encapsulated(&self) -> bool {
        matches!(self, PixelSource::Encapsulated { .. })
    }

    /// Extract the bytes of one frame.
    ///
    /// `transfer_syntax` is the transfer syntax
    /// in which the pixel data is stored;
    /// it decides the fragment-to-frame mapping rule
    /// for encapsulated multi-frame objects.
    pub fn frame(
        &self,
        descriptor: &ImageDescriptor,
        transfer_syntax: &str,
        index: u32,
    ) -> Result<Vec<u8>> {
        let frames = descriptor.number_of_frames;
        ensure!(index < frames, FrameOutOfBoundsSnafu { index, frames });

        match self {
            PixelSource::Native { data } => {
                let frame_length = descriptor.frame_length();
                let start = frame_length * index as usize;
                let end = start + frame_length;
                ensure!(
                    end <= data.len(),
                    TruncatedPixelDataSnafu {
                        expected: end,
                        index,
                        len: data.len()
                    }
                );
                Ok(data[start..end].to_vec())
            }
            PixelSource::Encapsulated { fragments, .. } => {
                if frames == 1 {
                    // one frame takes all the fragments
                    let mut out =
                        Vec::with_capacity(fragments.iter().map(Vec::len).sum());
                    for fragment in fragments {
                        out.extend_from_slice(fragment);
                    }
                    return Ok(out);
                }

                let starts = fragment_starts(fragments, frames, transfer_syntax)?;
                let begin = starts[index as usize];
                let end = starts
                    .get(index as usize + 1)
                    .copied()
                    .unwrap_or(fragments.len());
                let mut out = Vec::new();
                for fragment in &fragments[begin..end] {
                    out.extend_from_slice(fragment);
                }
                Ok(out)
            }
        }
    }
}

/// Discover which fragments start a new frame.
///
/// For RLE Lossless the standard requires one fragment per frame.
/// For the JPEG family each frame is a complete compressed stream,
/// so a fragment opening with a JPEG start-of-image marker
/// begins a new frame.
/// Fails when the number of discovered starts
/// does not match the expected frame count.
pub fn fragment_starts(
    fragments: &[Vec<u8>],
    frames: u32,
    transfer_syntax: &str,
) -> Result<Vec<usize>> {
    if transfer_syntax == uids::RLE_LOSSLESS {
        ensure!(
            fragments.len() == frames as usize,
            FrameMappingFailedSnafu {
                fragments: fragments.len(),
                frames
            }
        );
        return Ok((0..fragments.len()).collect());
    }

    let starts: Vec<usize> = fragments
        .iter()
        .enumerate()
        .filter(|(_, fragment)| is_jpeg_stream_start(fragment))
        .map(|(i, _)| i)
        .collect();
    ensure!(
        starts.len() == frames as usize,
        FrameMappingFailedSnafu {
            fragments: fragments.len(),
            frames
        }
    );
    Ok(starts)
}

/// Whether the fragment begins a JPEG-family bit stream:
/// JPEG/JPEG-LS start-of-image, or a JPEG 2000 codestream or box.
fn is_jpeg_stream_start(fragment: &[u8]) -> bool {
    if fragment.len() < 4 {
        return false;
    }
    // JPEG and JPEG-LS: SOI marker
    if fragment[0] == 0xFF && fragment[1] == 0xD8 && fragment[2] == 0xFF {
        return true;
    }
    // JPEG 2000 codestream: SOC marker
    if fragment[0..4] == [0xFF, 0x4F, 0xFF, 0x51] {
        return true;
    }
    // JPEG 2000 file format: signature box
    fragment.len() >= 8 && fragment[4..8] == [0x6A, 0x50, 0x20, 0x20]
}

/// Concatenate frames back into one native pixel data run.
pub fn pack_frames(frames: Vec<Vec<u8>>) -> Vec<u8> {
    let mut out = Vec::with_capacity(frames.iter().map(Vec::len).sum());
    for frame in frames {
        out.extend(frame);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::PhotometricInterpretation;

    fn descriptor(frames: u32) -> ImageDescriptor {
        ImageDescriptor {
            rows: 2,
            columns: 3,
            bits_allocated: 8,
            bits_stored: 8,
            high_bit: 7,
            samples_per_pixel: 1,
            photometric: PhotometricInterpretation::Monochrome2,
            planar_configuration: 0,
            number_of_frames: frames,
            signed: false,
            pixel_padding_value: None,
        }
    }

    #[test]
    fn native_frames_round_trip() {
        let frame_0: Vec<u8> = (0..6).collect();
        let frame_1: Vec<u8> = (6..12).collect();
        let source = PixelSource::Native {
            data: pack_frames(vec![frame_0.clone(), frame_1.clone()]),
        };
        let descriptor = descriptor(2);

        assert_eq!(
            source.frame(&descriptor, "1.2.840.10008.1.2.1", 0).unwrap(),
            frame_0
        );
        assert_eq!(
            source.frame(&descriptor, "1.2.840.10008.1.2.1", 1).unwrap(),
            frame_1
        );
        assert!(source.frame(&descriptor, "1.2.840.10008.1.2.1", 2).is_err());
    }

    #[test]
    fn single_frame_takes_all_fragments() {
        let source = PixelSource::Encapsulated {
            offset_table: vec![],
            fragments: vec![vec![1, 2], vec![3, 4], vec![5]],
        };
        let out = source
            .frame(&descriptor(1), uids::JPEG_BASELINE8_BIT, 0)
            .unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn rle_maps_one_fragment_per_frame() {
        let starts =
            fragment_starts(&[vec![0; 4], vec![0; 4], vec![0; 4]], 3, uids::RLE_LOSSLESS).unwrap();
        assert_eq!(starts, vec![0, 1, 2]);

        let err =
            fragment_starts(&[vec![0; 4], vec![0; 4]], 3, uids::RLE_LOSSLESS).unwrap_err();
        assert!(matches!(err, Error::FrameMappingFailed { .. }));
    }

    #[test]
    fn jpeg_frames_found_by_marker_probe() {
        let soi = vec![0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3];
        let continuation = vec![4, 5, 6, 7];
        let fragments = vec![soi.clone(), continuation.clone(), soi.clone()];

        let starts = fragment_starts(&fragments, 2, uids::JPEG_BASELINE8_BIT).unwrap();
        assert_eq!(starts, vec![0, 2]);

        // the first frame spans its continuation fragment
        let source = PixelSource::Encapsulated {
            offset_table: vec![],
            fragments,
        };
        let frame_0 = source
            .frame(&descriptor(2), uids::JPEG_BASELINE8_BIT, 0)
            .unwrap();
        assert_eq!(frame_0.len(), soi.len() + continuation.len());

        let frame_1 = source
            .frame(&descriptor(2), uids::JPEG_BASELINE8_BIT, 1)
            .unwrap();
        assert_eq!(frame_1, soi);
    }

    #[test]
    fn mismatched_marker_count_fails() {
        let soi = vec![0xFF, 0xD8, 0xFF, 0xE0];
        let err = fragment_starts(&[soi.clone()], 2, uids::JPEG_BASELINE8_BIT).unwrap_err();
        assert!(matches!(
            err,
            Error::FrameMappingFailed {
                fragments: 1,
                frames: 2
            }
        ));
    }
}
