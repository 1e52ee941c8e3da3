//! Query/retrieve information models.

use dicom_dictionary_std::uids;

/// The information models of the query/retrieve services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InformationModel {
    PatientRoot,
    StudyRoot,
    PatientStudyOnly,
    ModalityWorklist,
    UnifiedProcedureStep,
    HangingProtocol,
    ColorPalette,
}

impl InformationModel {
    /// The SOP class UID negotiated for C-FIND with this model.
    pub fn find_uid(self) -> &'static str {
        match self {
            InformationModel::PatientRoot => {
                uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND
            }
            InformationModel::StudyRoot => {
                uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND
            }
            InformationModel::PatientStudyOnly => {
                uids::PATIENT_STUDY_ONLY_QUERY_RETRIEVE_INFORMATION_MODEL_FIND
            }
            InformationModel::ModalityWorklist => uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND,
            InformationModel::UnifiedProcedureStep => uids::UNIFIED_PROCEDURE_STEP_QUERY,
            InformationModel::HangingProtocol => uids::HANGING_PROTOCOL_INFORMATION_MODEL_FIND,
            InformationModel::ColorPalette => {
                uids::COLOR_PALETTE_QUERY_RETRIEVE_INFORMATION_MODEL_FIND
            }
        }
    }

    /// The SOP class UID negotiated for C-MOVE with this model,
    /// for the models which define one.
    pub fn move_uid(self) -> Option<&'static str> {
        match self {
            InformationModel::PatientRoot => {
                Some(uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE)
            }
            InformationModel::StudyRoot => {
                Some(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE)
            }
            InformationModel::PatientStudyOnly => {
                Some(uids::PATIENT_STUDY_ONLY_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE)
            }
            InformationModel::HangingProtocol => {
                Some(uids::HANGING_PROTOCOL_INFORMATION_MODEL_MOVE)
            }
            InformationModel::ColorPalette => {
                Some(uids::COLOR_PALETTE_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE)
            }
            InformationModel::ModalityWorklist | InformationModel::UnifiedProcedureStep => None,
        }
    }

    /// The SOP class UID negotiated for C-GET with this model,
    /// for the models which define one.
    pub fn get_uid(self) -> Option<&'static str> {
        match self {
            InformationModel::PatientRoot => {
                Some(uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET)
            }
            InformationModel::StudyRoot => {
                Some(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET)
            }
            InformationModel::PatientStudyOnly => {
                Some(uids::PATIENT_STUDY_ONLY_QUERY_RETRIEVE_INFORMATION_MODEL_GET)
            }
            InformationModel::HangingProtocol => {
                Some(uids::HANGING_PROTOCOL_INFORMATION_MODEL_GET)
            }
            InformationModel::ColorPalette => {
                Some(uids::COLOR_PALETTE_QUERY_RETRIEVE_INFORMATION_MODEL_GET)
            }
            InformationModel::ModalityWorklist | InformationModel::UnifiedProcedureStep => None,
        }
    }

    /// Whether this is a worklist-style model:
    /// queries carry no _QueryRetrieveLevel_,
    /// and relational plus date-time matching options
    /// are negotiated automatically.
    pub fn is_worklist_style(self) -> bool {
        matches!(
            self,
            InformationModel::ModalityWorklist | InformationModel::UnifiedProcedureStep
        )
    }
}

/// The extended negotiation payload announcing
/// relational queries plus combined date-time matching,
/// as sent for worklist-style models.
///
/// Byte 0: relational queries; byte 1: combined date and time matching;
/// byte 2: fuzzy semantic matching; byte 3: timezone query adjustment.
pub fn relational_datetime_query_info() -> Vec<u8> {
    vec![1, 1, 0, 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worklist_models_have_no_retrieve_uid() {
        assert!(InformationModel::ModalityWorklist.is_worklist_style());
        assert!(InformationModel::ModalityWorklist.move_uid().is_none());
        assert!(InformationModel::UnifiedProcedureStep.get_uid().is_none());
        assert!(!InformationModel::StudyRoot.is_worklist_style());
    }

    #[test]
    fn retrieve_models_pair_up() {
        for model in [
            InformationModel::PatientRoot,
            InformationModel::StudyRoot,
            InformationModel::PatientStudyOnly,
            InformationModel::HangingProtocol,
            InformationModel::ColorPalette,
        ] {
            assert!(model.move_uid().is_some());
            assert!(model.get_uid().is_some());
        }
    }
}
