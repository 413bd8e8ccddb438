//! Certificate lifecycle state machine.

use std::fmt;

use serde::{Deserialize, Serialize};
use stackgrid_cloud::{CertificateTicket, ValidationToken};
use tracing::{info, warn};

use crate::error::{CertError, CertResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The authority did not confirm within the validation timeout.
    ValidationTimeout { waited_ms: u64 },
    /// The authority refused domain ownership.
    Rejected { reason: String },
    /// The wait was cancelled by the operator.
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ValidationTimeout { waited_ms } => {
                write!(f, "validation timed out after {waited_ms}ms")
            }
            FailureReason::Rejected { reason } => write!(f, "rejected: {reason}"),
            FailureReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CertificateState {
    Requested,
    PendingValidation,
    Validated,
    Failed { reason: FailureReason },
}

impl CertificateState {
    pub fn name(&self) -> &'static str {
        match self {
            CertificateState::Requested => "requested",
            CertificateState::PendingValidation => "pending_validation",
            CertificateState::Validated => "validated",
            CertificateState::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CertificateState::Validated | CertificateState::Failed { .. }
        )
    }
}

impl fmt::Display for CertificateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A certificate and every state it has entered, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub id: String,
    pub domain: String,
    pub token: ValidationToken,
    state: CertificateState,
    history: Vec<CertificateState>,
}

impl Certificate {
    pub fn requested(domain: &str, ticket: CertificateTicket) -> Self {
        Self {
            id: ticket.certificate_id,
            domain: domain.to_string(),
            token: ticket.token,
            state: CertificateState::Requested,
            history: vec![CertificateState::Requested],
        }
    }

    pub fn state(&self) -> &CertificateState {
        &self.state
    }

    pub fn history(&self) -> &[CertificateState] {
        &self.history
    }

    pub fn is_validated(&self) -> bool {
        self.state == CertificateState::Validated
    }

    /// How many times this certificate entered Failed. Never more than one.
    pub fn failure_count(&self) -> usize {
        self.history
            .iter()
            .filter(|s| matches!(s, CertificateState::Failed { .. }))
            .count()
    }

    /// The validation record exists in the zone.
    pub fn mark_pending(&mut self) -> CertResult<()> {
        match self.state {
            CertificateState::Requested => self.enter(CertificateState::PendingValidation),
            CertificateState::PendingValidation => Ok(()),
            _ => Err(self.illegal(CertificateState::PendingValidation)),
        }
    }

    /// The authority confirmed the validation record.
    pub fn mark_validated(&mut self) -> CertResult<()> {
        match self.state {
            CertificateState::PendingValidation => {
                self.enter(CertificateState::Validated)?;
                info!(domain = %self.domain, id = %self.id, "certificate validated");
                Ok(())
            }
            _ => Err(self.illegal(CertificateState::Validated)),
        }
    }

    /// Move to Failed. Only a non-terminal certificate can fail.
    pub fn fail(&mut self, reason: FailureReason) -> CertResult<()> {
        let next = CertificateState::Failed { reason };
        if self.state.is_terminal() {
            return Err(self.illegal(next));
        }
        warn!(domain = %self.domain, id = %self.id, state = %self.state, "certificate failed");
        self.enter(next)
    }

    /// Gate for listener binds.
    pub fn require_validated(&self) -> CertResult<()> {
        if self.is_validated() {
            Ok(())
        } else {
            Err(CertError::NotReady {
                domain: self.domain.clone(),
                state: self.state.to_string(),
            })
        }
    }

    fn enter(&mut self, next: CertificateState) -> CertResult<()> {
        self.history.push(next.clone());
        self.state = next;
        Ok(())
    }

    fn illegal(&self, to: CertificateState) -> CertError {
        CertError::IllegalTransition {
            from: self.state.to_string(),
            to: to.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use stackgrid_cloud::RecordType;

    use super::*;

    fn cert() -> Certificate {
        Certificate::requested(
            "app.example.com",
            CertificateTicket {
                certificate_id: "cert-1".to_string(),
                token: ValidationToken {
                    record_name: "_v.app.example.com.".to_string(),
                    record_value: "_t.validations.example.".to_string(),
                    record_type: RecordType::Cname,
                },
            },
        )
    }

    #[test]
    fn happy_path() {
        let mut c = cert();
        assert_eq!(c.state(), &CertificateState::Requested);
        c.mark_pending().unwrap();
        c.mark_validated().unwrap();
        assert!(c.is_validated());
        assert!(c.require_validated().is_ok());
        assert_eq!(c.history().len(), 3);
    }

    #[test]
    fn cannot_validate_before_record_published() {
        let mut c = cert();
        assert!(matches!(
            c.mark_validated(),
            Err(CertError::IllegalTransition { .. })
        ));
    }

    #[test]
    fn require_validated_reports_state() {
        let mut c = cert();
        let err = c.require_validated().unwrap_err();
        assert_eq!(
            err,
            CertError::NotReady {
                domain: "app.example.com".to_string(),
                state: "requested".to_string(),
            }
        );

        c.mark_pending().unwrap();
        assert!(matches!(
            c.require_validated(),
            Err(CertError::NotReady { .. })
        ));
    }

    #[test]
    fn fails_exactly_once() {
        let mut c = cert();
        c.mark_pending().unwrap();
        c.fail(FailureReason::ValidationTimeout { waited_ms: 1000 })
            .unwrap();
        assert!(c.fail(FailureReason::Cancelled).is_err());
        assert!(c.mark_pending().is_err());
        assert!(c.mark_validated().is_err());
        assert_eq!(c.failure_count(), 1);
        assert!(c.require_validated().is_err());
    }

    #[test]
    fn validated_cannot_fail() {
        let mut c = cert();
        c.mark_pending().unwrap();
        c.mark_validated().unwrap();
        assert!(c.fail(FailureReason::Cancelled).is_err());
        assert_eq!(c.failure_count(), 0);
    }

    #[test]
    fn survives_serde() {
        let mut c = cert();
        c.mark_pending().unwrap();
        let json = serde_json::to_value(&c).unwrap();
        let back: Certificate = serde_json::from_value(json).unwrap();
        assert_eq!(back.state(), &CertificateState::PendingValidation);
        assert_eq!(back.history().len(), 2);
    }
}
