use kube::Error;
use kube::error::ErrorResponse;

/// Coarse classification of a failed cluster call, used to decide how loudly
/// to report it. Nothing is retried within a tick either way; the next tick
/// is the retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// The object disappeared while we were acting on it. For evictions and
    /// deletions that is the outcome we wanted anyway.
    Gone,
    /// The api server is momentarily struggling.
    Transient,
    Other,
}

impl FailureKind {
    pub fn of(err: &Error) -> FailureKind {
        let Error::Api(ErrorResponse { code, reason, .. }) = err else {
            return FailureKind::Other;
        };

        match code {
            // 410 usually carries reason "Expired", historically "Gone"
            404 | 410 => FailureKind::Gone,
            408 | 429 | 502 | 503 | 504 => FailureKind::Transient,
            500 if reason == "ServerTimeout" => FailureKind::Transient,
            _ => FailureKind::Other,
        }
    }

    /// Low-cardinality reason for the per-pod error gauge.
    pub fn reason_label(self, failed: &'static str) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            _ => failed,
        }
    }
}
