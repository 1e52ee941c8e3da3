//! Classification of DIMSE status codes.

/// Well-known DIMSE status codes.
pub mod codes {
    /// the operation completed successfully
    pub const SUCCESS: u16 = 0x0000;
    /// the operation was cancelled on request
    pub const CANCEL: u16 = 0xFE00;
    /// more responses are forthcoming
    pub const PENDING: u16 = 0xFF00;
    /// more responses are forthcoming, with warnings
    pub const PENDING_WARNING: u16 = 0xFF01;
    /// a general processing failure occurred
    pub const PROCESSING_FAILURE: u16 = 0x0110;
    /// the requesting node is not authorized for the operation
    pub const NOT_AUTHORIZED: u16 = 0x0124;
    /// the provider cannot understand the request
    pub const CANNOT_UNDERSTAND: u16 = 0xC000;
    /// storage coerced one or more data elements
    pub const COERCION_OF_DATA_ELEMENTS: u16 = 0xB000;
    /// storage discarded one or more data elements
    pub const ELEMENTS_DISCARDED: u16 = 0xB006;
    /// storage did not validate the data set
    pub const DATA_SET_DOES_NOT_MATCH_SOP_CLASS: u16 = 0xB007;
    /// retrieve completed with one or more failed sub-operations
    pub const SUB_OPERATIONS_COMPLETE_WITH_FAILURES: u16 = 0xB000;
}

/// The broad categories of DIMSE status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusType {
    Success,
    Warning,
    Failure,
    Cancel,
    Pending,
}

impl StatusType {
    /// Whether this is a pending status:
    /// the operation continues and more responses will follow.
    pub fn is_pending(self) -> bool {
        self == StatusType::Pending
    }

    /// Whether this status terminates the operation.
    pub fn is_final(self) -> bool {
        !self.is_pending()
    }
}

impl TryFrom<u16> for StatusType {
    type Error = u16;

    /// Classify a status code per PS3.7, annex C.
    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StatusType::Success),
            1 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => Ok(StatusType::Warning),
            0xA000..=0xAFFF | 0x0100..=0x01FF | 0x0200..=0x02FF | 0xC000..=0xCFFF => {
                Ok(StatusType::Failure)
            }
            0xFE00 => Ok(StatusType::Cancel),
            0xFF00 | 0xFF01 => Ok(StatusType::Pending),
            _ => Err(value),
        }
    }
}

/// Classify a status code,
/// treating unknown codes as failures.
pub fn classify(status: u16) -> StatusType {
    StatusType::try_from(status).unwrap_or(StatusType::Failure)
}

/// Classify a C-STORE response status:
/// success, the storage warning codes, or failure.
///
/// The storage service only recognizes
/// _Coercion of Data Elements_ (B000H),
/// _Elements Discarded_ (B006H),
/// and _Data Set does not match SOP Class_ (B007H)
/// as warnings; everything else which is not a success is a failure.
pub fn classify_store(status: u16) -> StatusType {
    match status {
        codes::SUCCESS => StatusType::Success,
        codes::COERCION_OF_DATA_ELEMENTS
        | codes::ELEMENTS_DISCARDED
        | codes::DATA_SET_DOES_NOT_MATCH_SOP_CLASS => StatusType::Warning,
        _ => StatusType::Failure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_general_codes() {
        assert_eq!(classify(0x0000), StatusType::Success);
        assert_eq!(classify(0xFF00), StatusType::Pending);
        assert_eq!(classify(0xFF01), StatusType::Pending);
        assert_eq!(classify(0xFE00), StatusType::Cancel);
        assert_eq!(classify(0xA700), StatusType::Failure);
        assert_eq!(classify(0xC001), StatusType::Failure);
        assert_eq!(classify(0xB000), StatusType::Warning);
    }

    #[test]
    fn classify_store_codes() {
        assert_eq!(classify_store(0x0000), StatusType::Success);
        assert_eq!(classify_store(0xB000), StatusType::Warning);
        assert_eq!(classify_store(0xB006), StatusType::Warning);
        assert_eq!(classify_store(0xB007), StatusType::Warning);
        // pending makes no sense for storage and counts as failure
        assert_eq!(classify_store(0xFF00), StatusType::Failure);
        assert_eq!(classify_store(0x0110), StatusType::Failure);
    }
}
