//! The transfer syntax adaptation request of one store operation.

use dicom_dictionary_std::uids;
use tracing::warn;

/// The transfer syntaxes involved in adapting one object,
/// together with the encoding options.
///
/// `requested` is what the caller asked for;
/// `suitable` starts out equal to it
/// and is downgraded by the pipeline when the request
/// is unachievable for a particular image.
/// The invariant to uphold by callers is that `suitable`
/// always names a syntax the peer accepted for the SOP class,
/// which is why downgrades only target the baseline
/// uncompressed syntaxes every acceptor must support.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptTransferSyntax {
    /// the transfer syntax of the source object
    pub original: String,
    /// the transfer syntax the caller wants to emit
    pub requested: String,
    /// the syntax actually used after feasibility checks
    pub suitable: String,
    /// quality for lossy JPEG encoding, 0 to 100
    pub jpeg_quality: Option<u8>,
    /// the compression ratio recorded for lossy output
    pub compression_ratio: Option<f32>,
}

impl AdaptTransferSyntax {
    /// An adaptation from `original` to `requested`.
    pub fn new(original: impl Into<String>, requested: impl Into<String>) -> AdaptTransferSyntax {
        let requested = requested.into();
        AdaptTransferSyntax {
            original: original.into(),
            suitable: requested.clone(),
            requested,
            jpeg_quality: None,
            compression_ratio: None,
        }
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = Some(quality);
        self
    }

    pub fn with_compression_ratio(mut self, ratio: f32) -> Self {
        self.compression_ratio = Some(ratio);
        self
    }

    /// Whether any re-encoding is required at all.
    pub fn is_noop(&self) -> bool {
        self.original == self.suitable
    }

    /// Downgrade the suitable syntax
    /// because the current one is unachievable for this image.
    pub fn downgrade(&mut self, to: impl Into<String>, reason: &str) {
        let to = to.into();
        warn!(
            "cannot adapt pixel data to {}: {}; falling back to {}",
            self.suitable, reason, to
        );
        self.suitable = to;
    }

    /// Downgrade to the uncompressed explicit VR little endian syntax.
    pub fn downgrade_to_native(&mut self, reason: &str) {
        self.downgrade(uids::EXPLICIT_VR_LITTLE_ENDIAN, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_suitable_as_requested() {
        let adapt = AdaptTransferSyntax::new(
            uids::JPEG_BASELINE8_BIT,
            uids::EXPLICIT_VR_LITTLE_ENDIAN,
        );
        assert_eq!(adapt.suitable, uids::EXPLICIT_VR_LITTLE_ENDIAN);
        assert!(!adapt.is_noop());
    }

    #[test]
    fn downgrade_changes_suitable_only() {
        let mut adapt = AdaptTransferSyntax::new(
            uids::EXPLICIT_VR_LITTLE_ENDIAN,
            uids::JPEG_BASELINE8_BIT,
        );
        adapt.downgrade_to_native("16-bit samples");
        assert_eq!(adapt.requested, uids::JPEG_BASELINE8_BIT);
        assert_eq!(adapt.suitable, uids::EXPLICIT_VR_LITTLE_ENDIAN);
        assert!(adapt.is_noop());
    }
}
