//! Construction and inspection of DIMSE command sets.
//!
//! Command sets are small data sets encoded in implicit VR little endian.
//! The constructors in this module produce complete command objects
//! with the command group length already in place;
//! the accessors read the standard fields back
//! with uniform error reporting.

use dicom_core::{dicom_value, DataElement, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::{InMemDicomObject, StandardDataDictionary};
use snafu::{OptionExt, ResultExt, Snafu};

/// The value of _CommandDataSetType_ (0000,0800)
/// indicating that no data set follows the command set.
pub const DATA_SET_ABSENT: u16 = 0x0101;

/// A conventional value of _CommandDataSetType_ (0000,0800)
/// indicating that a data set follows the command set.
/// When reading, any value other than [`DATA_SET_ABSENT`] means present.
pub const DATA_SET_PRESENT: u16 = 0x0001;

/// The command field values of the composite DIMSE services.
#[repr(u16)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum CommandField {
    CStoreRq = 0x0001,
    CStoreRsp = 0x8001,
    CGetRq = 0x0010,
    CGetRsp = 0x8010,
    CFindRq = 0x0020,
    CFindRsp = 0x8020,
    CMoveRq = 0x0021,
    CMoveRsp = 0x8021,
    CEchoRq = 0x0030,
    CEchoRsp = 0x8030,
    CCancelRq = 0x0FFF,
}

impl CommandField {
    /// The numeric command field code.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Interpret a command field code.
    pub fn from_code(code: u16) -> Option<CommandField> {
        let field = match code {
            0x0001 => CommandField::CStoreRq,
            0x8001 => CommandField::CStoreRsp,
            0x0010 => CommandField::CGetRq,
            0x8010 => CommandField::CGetRsp,
            0x0020 => CommandField::CFindRq,
            0x8020 => CommandField::CFindRsp,
            0x0021 => CommandField::CMoveRq,
            0x8021 => CommandField::CMoveRsp,
            0x0030 => CommandField::CEchoRq,
            0x8030 => CommandField::CEchoRsp,
            0x0FFF => CommandField::CCancelRq,
            _ => return None,
        };
        Some(field)
    }

    /// Whether this command field denotes a response message.
    pub fn is_response(self) -> bool {
        self.code() & 0x8000 != 0
    }
}

/// The priority attached to a DIMSE request.
#[repr(u16)]
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Priority {
    Low = 0x0002,
    #[default]
    Medium = 0x0000,
    High = 0x0001,
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("missing command field `{}`", name))]
    MissingField {
        name: &'static str,
        tag: Tag,
        source: dicom_object::AccessError,
    },
    #[snafu(display("could not convert command field `{}`", name))]
    ConvertField {
        name: &'static str,
        tag: Tag,
        source: dicom_core::value::ConvertValueError,
    },
    #[snafu(display("unrecognized command field code {:#06x}", code))]
    UnknownCommandField { code: u16 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

type CommandObj = InMemDicomObject<StandardDataDictionary>;

/// Create a C-ECHO-RQ command set.
pub fn echo_rq(message_id: u16, sop_class_uid: &str) -> CommandObj {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [CommandField::CEchoRq.code()]),
        ),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [DATA_SET_ABSENT]),
        ),
    ])
}

/// Create a C-ECHO-RSP command set.
pub fn echo_rsp(message_id_responded: u16, sop_class_uid: &str, status: u16) -> CommandObj {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [CommandField::CEchoRsp.code()]),
        ),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id_responded]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [DATA_SET_ABSENT]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
    ])
}

/// Create a C-STORE-RQ command set.
/// The data set with the composite object must follow.
pub fn store_rq(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    priority: Priority,
) -> CommandObj {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [CommandField::CStoreRq.code()]),
        ),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [priority as u16])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [DATA_SET_PRESENT]),
        ),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ),
    ])
}

/// Create a C-STORE-RSP command set.
pub fn store_rsp(
    message_id_responded: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    status: u16,
) -> CommandObj {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [CommandField::CStoreRsp.code()]),
        ),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id_responded]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [DATA_SET_ABSENT]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ),
    ])
}

/// Create a C-FIND-RQ command set.
/// The data set with the query identifier must follow.
pub fn find_rq(message_id: u16, sop_class_uid: &str, priority: Priority) -> CommandObj {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [CommandField::CFindRq.code()]),
        ),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [priority as u16])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [DATA_SET_PRESENT]),
        ),
    ])
}

/// Create a C-FIND-RSP command set.
pub fn find_rsp(
    message_id_responded: u16,
    sop_class_uid: &str,
    status: u16,
    with_data_set: bool,
) -> CommandObj {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [CommandField::CFindRsp.code()]),
        ),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id_responded]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(
                U16,
                [if with_data_set {
                    DATA_SET_PRESENT
                } else {
                    DATA_SET_ABSENT
                }]
            ),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
    ])
}

/// Create a C-GET-RQ command set.
/// The data set with the retrieve identifier must follow.
pub fn get_rq(message_id: u16, sop_class_uid: &str, priority: Priority) -> CommandObj {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [CommandField::CGetRq.code()]),
        ),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [priority as u16])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [DATA_SET_PRESENT]),
        ),
    ])
}

/// Create a C-MOVE-RQ command set.
/// The data set with the retrieve identifier must follow.
pub fn move_rq(
    message_id: u16,
    sop_class_uid: &str,
    destination_aet: &str,
    priority: Priority,
) -> CommandObj {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [CommandField::CMoveRq.code()]),
        ),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [priority as u16])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [DATA_SET_PRESENT]),
        ),
        DataElement::new(
            tags::MOVE_DESTINATION,
            VR::AE,
            dicom_value!(Str, destination_aet),
        ),
    ])
}

/// Create a C-GET-RSP or C-MOVE-RSP command set
/// carrying the sub-operation counters.
pub fn retrieve_rsp(
    field: CommandField,
    message_id_responded: u16,
    sop_class_uid: &str,
    status: u16,
    remaining: u16,
    completed: u16,
    failed: u16,
    warning: u16,
) -> CommandObj {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [field.code()])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id_responded]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [DATA_SET_ABSENT]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
        DataElement::new(
            tags::NUMBER_OF_REMAINING_SUBOPERATIONS,
            VR::US,
            dicom_value!(U16, [remaining]),
        ),
        DataElement::new(
            tags::NUMBER_OF_COMPLETED_SUBOPERATIONS,
            VR::US,
            dicom_value!(U16, [completed]),
        ),
        DataElement::new(
            tags::NUMBER_OF_FAILED_SUBOPERATIONS,
            VR::US,
            dicom_value!(U16, [failed]),
        ),
        DataElement::new(
            tags::NUMBER_OF_WARNING_SUBOPERATIONS,
            VR::US,
            dicom_value!(U16, [warning]),
        ),
    ])
}

/// Create a C-CANCEL-RQ command set
/// for the request with the given message ID.
pub fn cancel_rq(message_id_responded: u16) -> CommandObj {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [CommandField::CCancelRq.code()]),
        ),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id_responded]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [DATA_SET_ABSENT]),
        ),
    ])
}

fn read_u16_field(obj: &CommandObj, tag: Tag, name: &'static str) -> Result<u16> {
    obj.element(tag)
        .context(MissingFieldSnafu { name, tag })?
        .to_int::<u16>()
        .context(ConvertFieldSnafu { name, tag })
}

fn read_str_field(obj: &CommandObj, tag: Tag, name: &'static str) -> Result<String> {
    Ok(obj
        .element(tag)
        .context(MissingFieldSnafu { name, tag })?
        .to_str()
        .context(ConvertFieldSnafu { name, tag })?
        .trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string())
}

/// Read the command field of a command set.
pub fn command_field(obj: &CommandObj) -> Result<CommandField> {
    let code = read_u16_field(obj, tags::COMMAND_FIELD, "CommandField")?;
    CommandField::from_code(code).context(UnknownCommandFieldSnafu { code })
}

/// Read the message ID of a request command set.
pub fn message_id(obj: &CommandObj) -> Result<u16> {
    read_u16_field(obj, tags::MESSAGE_ID, "MessageID")
}

/// Read the message ID a response command set responds to.
pub fn message_id_responded(obj: &CommandObj) -> Result<u16> {
    read_u16_field(
        obj,
        tags::MESSAGE_ID_BEING_RESPONDED_TO,
        "MessageIDBeingRespondedTo",
    )
}

/// Read the status code of a response command set.
pub fn status(obj: &CommandObj) -> Result<u16> {
    read_u16_field(obj, tags::STATUS, "Status")
}

/// Read the affected SOP class UID.
pub fn affected_sop_class_uid(obj: &CommandObj) -> Result<String> {
    read_str_field(obj, tags::AFFECTED_SOP_CLASS_UID, "AffectedSOPClassUID")
}

/// Read the affected SOP instance UID.
pub fn affected_sop_instance_uid(obj: &CommandObj) -> Result<String> {
    read_str_field(
        obj,
        tags::AFFECTED_SOP_INSTANCE_UID,
        "AffectedSOPInstanceUID",
    )
}

/// Read the move destination AE title of a C-MOVE-RQ.
pub fn move_destination(obj: &CommandObj) -> Result<String> {
    read_str_field(obj, tags::MOVE_DESTINATION, "MoveDestination")
}

/// Whether the command set announces an accompanying data set.
pub fn has_data_set(obj: &CommandObj) -> bool {
    obj.element(tags::COMMAND_DATA_SET_TYPE)
        .ok()
        .and_then(|e| e.to_int::<u16>().ok())
        .map(|v| v != DATA_SET_ABSENT)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_transfer_syntax_registry::entries;

    #[test]
    fn echo_rq_roundtrip() {
        let cmd = echo_rq(7, "1.2.840.10008.1.1");

        let mut bytes = Vec::new();
        cmd.write_dataset_with_ts(&mut bytes, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
            .unwrap();
        let read = InMemDicomObject::read_dataset_with_ts(
            bytes.as_slice(),
            &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
        )
        .unwrap();

        assert_eq!(command_field(&read).unwrap(), CommandField::CEchoRq);
        assert_eq!(message_id(&read).unwrap(), 7);
        assert_eq!(
            affected_sop_class_uid(&read).unwrap(),
            "1.2.840.10008.1.1"
        );
        assert!(!has_data_set(&read));
    }

    #[test]
    fn store_rq_announces_data_set() {
        let cmd = store_rq(1, "1.2.840.10008.5.1.4.1.1.2", "1.2.3.4", Priority::Medium);
        assert!(has_data_set(&cmd));
        assert_eq!(command_field(&cmd).unwrap(), CommandField::CStoreRq);
        assert_eq!(affected_sop_instance_uid(&cmd).unwrap(), "1.2.3.4");
        assert!(!command_field(&cmd).unwrap().is_response());
    }

    #[test]
    fn retrieve_rsp_carries_counters() {
        let cmd = retrieve_rsp(
            CommandField::CMoveRsp,
            5,
            "1.2.840.10008.5.1.4.1.2.2.2",
            0xFF00,
            4,
            1,
            0,
            0,
        );
        assert_eq!(message_id_responded(&cmd).unwrap(), 5);
        assert_eq!(status(&cmd).unwrap(), 0xFF00);
        assert!(command_field(&cmd).unwrap().is_response());
        let progress = crate::progress::SubOperations::from_command(&cmd);
        assert_eq!(progress.remaining, Some(4));
        assert_eq!(progress.completed, Some(1));
    }

    #[test]
    fn cancel_rq_points_back() {
        let cmd = cancel_rq(33);
        assert_eq!(command_field(&cmd).unwrap(), CommandField::CCancelRq);
        assert_eq!(message_id_responded(&cmd).unwrap(), 33);
    }
}
