//! The vendor-facing side of a stage.

use chrono::{DateTime, Duration, Utc};
use etl_data::Data;
use etl_stage_models::{IntermediateState, Stage};
use futures::stream::BoxStream;
use serde_json::Value;

/// How far back an onboarding (full) scan reaches.
pub const ONBOARDING_IN_DAYS: i64 = 90;

/// Generic parameter map handed to fetchers.
pub type ParameterMap = serde_json::Map<String, Value>;

/// Everything a fetcher needs to know about the run it is fetching for.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchContext {
    /// Owning tenant.
    pub tenant_id: String,
    /// Integration being extracted, if any.
    pub integration_id: Option<String>,
    /// Parameters produced by the job's supplier.
    pub parameters: ParameterMap,
    /// Whether this run is a full scan.
    pub full: bool,
    /// Inclusive lower bound of the extraction window.
    pub from: DateTime<Utc>,
    /// Exclusive upper bound of the extraction window.
    pub to: DateTime<Utc>,
}

impl FetchContext {
    /// Creates a context whose window is derived from the scan mode.
    ///
    /// Full scans reach back [`ONBOARDING_IN_DAYS`]. Incremental scans start
    /// at `since`, falling back to the onboarding window when the previous
    /// run time is unknown.
    #[must_use]
    pub fn new(
        tenant_id: impl Into<String>,
        full: bool,
        now: DateTime<Utc>,
        since: Option<DateTime<Utc>>,
    ) -> Self {
        let onboarding_start = now - Duration::days(ONBOARDING_IN_DAYS);
        let from = match since {
            Some(since) if !full => since.max(onboarding_start),
            _ => onboarding_start,
        };

        Self {
            tenant_id: tenant_id.into(),
            integration_id: None,
            parameters: ParameterMap::new(),
            full,
            from,
            to: now,
        }
    }

    /// Scopes the context to one integration.
    #[must_use]
    pub fn with_integration(mut self, integration_id: impl Into<String>) -> Self {
        self.integration_id = Some(integration_id.into());
        self
    }

    /// Sets the supplier parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: ParameterMap) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Fetches one stage's records from a vendor.
///
/// The returned stream is lazy: nothing is requested until it is polled, and
/// nothing more is requested once the consumer stops polling. A fatal error
/// is reported as a [`Data::Failed`] envelope whose snapshot holds the
/// cursors needed to resume mid-stage (e.g. `resume_from_project`).
pub trait StageFetcher: Send + Sync {
    /// Stage this fetcher serves.
    fn stage(&self) -> Stage;

    /// Streams the stage's records, resuming from the cursors in `state`.
    fn fetch<'a>(
        &'a self,
        context: &'a FetchContext,
        state: &'a IntermediateState,
    ) -> BoxStream<'a, Data<Value>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn full_scan_reaches_back_onboarding_window() {
        let context = FetchContext::new("lakers", true, now(), Some(now() - Duration::days(1)));
        assert_eq!(context.from, now() - Duration::days(ONBOARDING_IN_DAYS));
        assert_eq!(context.to, now());
    }

    #[test]
    fn incremental_scan_starts_at_previous_run() {
        let since = now() - Duration::hours(6);
        let context = FetchContext::new("lakers", false, now(), Some(since));
        assert_eq!(context.from, since);
    }

    #[test]
    fn incremental_scan_is_capped_at_onboarding_window() {
        let since = now() - Duration::days(400);
        let context = FetchContext::new("lakers", false, now(), Some(since));
        assert_eq!(context.from, now() - Duration::days(ONBOARDING_IN_DAYS));
    }
}
