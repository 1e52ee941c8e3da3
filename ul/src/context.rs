//! Negotiated presentation context registry.
//!
//! After association negotiation, each side holds a table of
//! presentation contexts keyed by their identifier.
//! The registry pairs the acceptor's per-context results with the
//! proposals they answer, tracks the SCU/SCP roles agreed upon for
//! each SOP class, and selects the context to use
//! when an object in a given transfer syntax must be sent.

use std::collections::BTreeMap;

use snafu::Snafu;

use crate::pdu::{
    PresentationContextProposed, PresentationContextResult, PresentationContextResultReason,
    RoleSelection,
};

/// There is no accepted presentation context for the given SOP class.
///
/// This is a caller-side fault and does not invalidate the association.
#[derive(Debug, Snafu)]
#[snafu(display("no accepted presentation context for SOP class {}", sop_class_uid))]
pub struct NoAcceptedContext {
    pub sop_class_uid: String,
}

/// One fully negotiated presentation context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedContext {
    /// the presentation context identifier
    pub id: u8,
    /// the abstract syntax (SOP class) UID from the proposal
    pub abstract_syntax: String,
    /// the transfer syntax accepted for this context
    pub transfer_syntax: String,
    /// negotiation outcome reason
    pub reason: PresentationContextResultReason,
    /// whether the association requester acts as SCU for this SOP class
    pub scu_role: bool,
    /// whether the association requester acts as SCP for this SOP class
    pub scp_role: bool,
}

impl NegotiatedContext {
    /// Whether this context was accepted by the acceptor.
    pub fn is_accepted(&self) -> bool {
        self.reason == PresentationContextResultReason::Acceptance
    }
}

/// The set of negotiated presentation contexts of one association,
/// keyed by presentation context identifier.
///
/// The registry lives exactly as long as its association.
#[derive(Debug, Clone, Default)]
pub struct NegotiatedContexts {
    by_id: BTreeMap<u8, NegotiatedContext>,
}

impl NegotiatedContexts {
    /// Build the registry from the proposed contexts,
    /// the acceptor's results, and the acknowledged role selections.
    ///
    /// Results with no matching proposal are discarded:
    /// the accepted set must be a subset of the proposed set by identifier.
    /// Where no role selection was negotiated for a SOP class,
    /// the requester is SCU and the acceptor is SCP.
    pub fn from_negotiation(
        proposed: &[PresentationContextProposed],
        results: &[PresentationContextResult],
        role_selections: &[RoleSelection],
    ) -> Self {
        let mut by_id = BTreeMap::new();
        for result in results {
            let Some(proposal) = proposed.iter().find(|pc| pc.id == result.id) else {
                continue;
            };
            let roles = role_selections
                .iter()
                .find(|role| role.sop_class_uid == proposal.abstract_syntax);
            by_id.insert(
                result.id,
                NegotiatedContext {
                    id: result.id,
                    abstract_syntax: proposal.abstract_syntax.clone(),
                    transfer_syntax: result.transfer_syntax.clone(),
                    reason: result.reason.clone(),
                    scu_role: roles.map(|r| r.scu_role).unwrap_or(true),
                    scp_role: roles.map(|r| r.scp_role).unwrap_or(false),
                },
            );
        }
        NegotiatedContexts { by_id }
    }

    /// Build a registry on the acceptor side,
    /// where each entry is already fully determined.
    pub fn from_contexts(contexts: impl IntoIterator<Item = NegotiatedContext>) -> Self {
        NegotiatedContexts {
            by_id: contexts.into_iter().map(|pc| (pc.id, pc)).collect(),
        }
    }

    /// Look up a context by its identifier.
    pub fn get(&self, id: u8) -> Option<&NegotiatedContext> {
        self.by_id.get(&id)
    }

    /// Whether the context with the given identifier was accepted.
    pub fn is_accepted(&self, id: u8) -> bool {
        self.get(id).map(|pc| pc.is_accepted()).unwrap_or(false)
    }

    /// Iterate over all accepted contexts, in identifier order.
    pub fn accepted(&self) -> impl Iterator<Item = &NegotiatedContext> {
        self.by_id.values().filter(|pc| pc.is_accepted())
    }

    /// Iterate over every negotiated context, accepted or not.
    pub fn iter(&self) -> impl Iterator<Item = &NegotiatedContext> {
        self.by_id.values()
    }

    /// The number of accepted contexts.
    pub fn accepted_count(&self) -> usize {
        self.accepted().count()
    }

    /// Whether at least one context was accepted.
    pub fn has_accepted(&self) -> bool {
        self.accepted().next().is_some()
    }

    /// Select the presentation context to use
    /// for an object of the given SOP class
    /// currently encoded in `source_ts`.
    ///
    /// If a context for the SOP class was accepted with `source_ts` itself,
    /// that context is returned, enabling the caller
    /// to send the object without re-encoding.
    /// Otherwise, the first accepted context for the SOP class is returned
    /// and the caller is expected to adapt the object
    /// to that context's transfer syntax.
    pub fn select_transfer_syntax(
        &self,
        sop_class_uid: &str,
        source_ts: &str,
    ) -> Result<&NegotiatedContext, NoAcceptedContext> {
        let mut candidates = self
            .accepted()
            .filter(|pc| pc.abstract_syntax == sop_class_uid);

        let mut first = None;
        for pc in &mut candidates {
            if pc.transfer_syntax == source_ts {
                return Ok(pc);
            }
            first.get_or_insert(pc);
        }

        first.ok_or_else(|| NoAcceptedContext {
            sop_class_uid: sop_class_uid.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NegotiatedContexts {
        let proposed = vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                transfer_syntaxes: vec![
                    "1.2.840.10008.1.2.4.50".to_string(),
                    "1.2.840.10008.1.2.1".to_string(),
                ],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2.1".to_string()],
            },
            PresentationContextProposed {
                id: 5,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.4".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2.1".to_string()],
            },
        ];
        let results = vec![
            PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::TransferSyntaxesNotSupported,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
            PresentationContextResult {
                id: 3,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: "1.2.840.10008.1.2.1".to_string(),
            },
            PresentationContextResult {
                id: 5,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: "1.2.840.10008.1.2.1".to_string(),
            },
        ];
        NegotiatedContexts::from_negotiation(&proposed, &results, &[])
    }

    #[test]
    fn accepted_is_subset_of_proposed() {
        let contexts = sample();
        assert_eq!(contexts.accepted_count(), 2);
        assert!(!contexts.is_accepted(1));
        assert!(contexts.is_accepted(3));
        assert!(contexts.is_accepted(5));
    }

    #[test]
    fn select_prefers_source_transfer_syntax() {
        let contexts = sample();
        // source TS accepted for the class on context 3
        let pc = contexts
            .select_transfer_syntax("1.2.840.10008.5.1.4.1.1.2", "1.2.840.10008.1.2.1")
            .unwrap();
        assert_eq!(pc.id, 3);

        // source TS not accepted: falls back to the first accepted context
        let pc = contexts
            .select_transfer_syntax("1.2.840.10008.5.1.4.1.1.2", "1.2.840.10008.1.2.4.50")
            .unwrap();
        assert_eq!(pc.id, 3);
        assert_eq!(pc.transfer_syntax, "1.2.840.10008.1.2.1");
    }

    #[test]
    fn select_fails_without_acceptance() {
        let contexts = sample();
        let err = contexts
            .select_transfer_syntax("1.2.840.10008.5.1.4.1.1.128", "1.2.840.10008.1.2")
            .unwrap_err();
        assert_eq!(err.sop_class_uid, "1.2.840.10008.5.1.4.1.1.128");
    }

    #[test]
    fn default_roles_without_role_selection() {
        let contexts = sample();
        let pc = contexts.get(3).unwrap();
        assert!(pc.scu_role);
        assert!(!pc.scp_role);
    }
}
