//! Crate-wide error type

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Invalid or missing configuration
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Certificate generation or parsing failed
    #[error("certificate error: {0}")]
    CertError(String),

    /// A peer health request could not be completed
    #[error("peer request failed: {0}")]
    PeerError(String),

    /// Watchdog device or reboot invocation failed
    #[error("reboot error: {0}")]
    RebootError(String),

    /// A remediation step failed and should be retried with back-off
    #[error("{0}")]
    RemediationError(String),

    /// A remediation step can never succeed for this request. The message is
    /// recorded on the request status, but the reconciler reports success so
    /// the work queue does not spin on it.
    #[error("{0}")]
    Unreconcilable(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether a shorter retry interval is appropriate for this error
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(_) | Error::PeerError(_) | Error::RemediationError(_) => true,
            Error::ConfigError(_)
            | Error::CertError(_)
            | Error::RebootError(_)
            | Error::Unreconcilable(_) => false,
        }
    }
}

/// True if the underlying API error is an optimistic-concurrency conflict
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// True if the underlying API error is a 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(Error::RemediationError("taint failed".into()).is_retriable());
        assert!(!Error::Unreconcilable("unsupported strategy".into()).is_retriable());
        assert!(!Error::ConfigError("bad duration".into()).is_retriable());
    }

    #[test]
    fn test_conflict_detection() {
        let err = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "conflict".into(),
            reason: "Conflict".into(),
            code: 409,
        });
        assert!(is_conflict(&err));
        assert!(!is_not_found(&err));
    }
}
