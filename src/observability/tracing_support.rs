//! Tracing spans for stage and job execution.

use crate::config::ComputeDomain;
use crate::dispatch::RequestId;
use tracing::{Level, Span, span};

/// Create a span covering a stage's lifetime.
///
/// # Example
///
/// ```rust,ignore
/// use edgeflow::observability::span_stage;
///
/// let _guard = span_stage("detess", ComputeDomain::Vector).entered();
/// ```
#[inline]
pub fn span_stage(node: &str, domain: ComputeDomain) -> Span {
    span!(Level::INFO, "stage", node = %node, domain = %domain)
}

/// Create a span for one job.
#[inline]
pub fn span_job(node: &str, request_id: RequestId) -> Span {
    span!(Level::DEBUG, "job", node = %node, request_id = %request_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spans_without_subscriber() {
        let _stage = span_stage("mla", ComputeDomain::Accelerator).entered();
        let job = span_job("mla", RequestId::derive("mla", "cam0", 1));
        let _guard = job.enter();
    }
}
