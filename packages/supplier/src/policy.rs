//! Full-versus-incremental scan decision.
//!
//! Decisions are pure: the same previous instance, definition and clock
//! always produce the same [`ScanMode`].

use chrono::{DateTime, Duration, Utc};
use etl_job_models::{JobDefinition, JobInstance, JobStatus};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};

/// Why a scan mode was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScanReason {
    /// The definition metadata forces the mode.
    Override,
    /// The job has never run.
    FirstRun,
    /// The job ran before but never succeeded.
    NoSuccessfulRun,
    /// The job ran before but no full scan was ever recorded.
    NoRecordedFullRun,
    /// The full-resync interval has elapsed since the last full scan.
    IntervalElapsed,
    /// The last full scan is more recent than the resync interval.
    WithinInterval,
    /// No resync interval is configured.
    NoInterval,
    /// The supplier always scans fully.
    AlwaysFull,
    /// The supplier never scans fully.
    NeverFull,
}

/// Outcome of a scan-mode decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanMode {
    /// Whether to run a full scan.
    pub full: bool,
    /// Why.
    pub reason: ScanReason,
}

impl ScanMode {
    /// A full scan.
    #[must_use]
    pub const fn full(reason: ScanReason) -> Self {
        Self { full: true, reason }
    }

    /// An incremental scan.
    #[must_use]
    pub const fn incremental(reason: ScanReason) -> Self {
        Self {
            full: false,
            reason,
        }
    }
}

impl std::fmt::Display for ScanMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = if self.full { "full" } else { "incremental" };
        write!(f, "{mode} ({})", self.reason)
    }
}

/// How a supplier decides between full and incremental scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanModePolicy {
    /// Full until a run has succeeded, then again whenever `interval` has
    /// elapsed since the last full scan. The definition's own frequency wins
    /// over `interval`. Without any interval, only the runs up to the first
    /// success are full.
    FullResync {
        /// Supplier default resync interval.
        interval: Option<Duration>,
    },
    /// Every run is full.
    AlwaysFull,
    /// Every run is incremental.
    #[default]
    NeverFull,
}

impl ScanModePolicy {
    /// Decides the scan mode for the next run of `definition`.
    ///
    /// `previous` is the most recent successful earlier instance of the
    /// definition, if any; an instance with any other status counts as no
    /// successful run. An explicit `force_full` override in the definition
    /// metadata always wins.
    #[must_use]
    pub fn decide(
        &self,
        previous: Option<&JobInstance>,
        definition: &JobDefinition,
        now: DateTime<Utc>,
    ) -> ScanMode {
        if let Some(full) = definition.full_scan_override() {
            return ScanMode {
                full,
                reason: ScanReason::Override,
            };
        }

        match self {
            Self::AlwaysFull => ScanMode::full(ScanReason::AlwaysFull),
            Self::NeverFull => ScanMode::incremental(ScanReason::NeverFull),
            Self::FullResync { interval } => {
                match previous {
                    None => return ScanMode::full(ScanReason::FirstRun),
                    Some(previous) if previous.status != JobStatus::Success => {
                        return ScanMode::full(ScanReason::NoSuccessfulRun);
                    }
                    Some(_) => {}
                }
                let Some(last_full) = definition.last_full_sync_started_at else {
                    return ScanMode::full(ScanReason::NoRecordedFullRun);
                };
                let Some(interval) = definition.full_resync_interval().or(*interval) else {
                    return ScanMode::incremental(ScanReason::NoInterval);
                };

                if now - last_full >= interval {
                    ScanMode::full(ScanReason::IntervalElapsed)
                } else {
                    ScanMode::incremental(ScanReason::WithinInterval)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use etl_job_models::{FORCE_FULL_KEY, JobInstanceId, JobType};

    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn definition(last_full: Option<&str>) -> JobDefinition {
        let mut definition = JobDefinition::new("lakers", JobType::GenericTenantJob);
        definition.last_full_sync_started_at = last_full.map(at);
        definition
    }

    fn previous(definition: &JobDefinition) -> JobInstance {
        finished(definition, JobStatus::Success)
    }

    fn finished(definition: &JobDefinition, status: JobStatus) -> JobInstance {
        let mut instance = JobInstance::scheduled(
            JobInstanceId {
                job_definition_id: definition.id,
                instance_id: 1,
            },
            at("2024-01-01T00:00:00Z"),
        );
        instance.status = status;
        instance.start_time = Some(at("2024-01-01T00:00:00Z"));
        instance
    }

    fn daily() -> ScanModePolicy {
        ScanModePolicy::FullResync {
            interval: Some(Duration::days(1)),
        }
    }

    #[test]
    fn first_run_is_full() {
        let definition = definition(None);
        let mode = daily().decide(None, &definition, at("2024-01-02T00:00:00Z"));
        assert_eq!(mode, ScanMode::full(ScanReason::FirstRun));
    }

    #[test]
    fn interval_boundaries() {
        let definition = definition(Some("2024-01-01T00:00:00Z"));
        let prev = previous(&definition);

        let within = daily().decide(Some(&prev), &definition, at("2024-01-01T23:59:59Z"));
        assert_eq!(within, ScanMode::incremental(ScanReason::WithinInterval));

        let elapsed = daily().decide(Some(&prev), &definition, at("2024-01-02T00:00:00Z"));
        assert_eq!(elapsed, ScanMode::full(ScanReason::IntervalElapsed));
    }

    #[test]
    fn unsuccessful_previous_run_forces_full() {
        let policy = ScanModePolicy::FullResync {
            interval: Some(Duration::days(7)),
        };
        let definition = definition(Some("2024-01-01T00:00:00Z"));

        for status in [
            JobStatus::Failure,
            JobStatus::PartialSuccess,
            JobStatus::Canceled,
            JobStatus::Scheduled,
        ] {
            let prev = finished(&definition, status);
            let mode = policy.decide(Some(&prev), &definition, at("2024-01-01T01:00:00Z"));
            assert_eq!(mode, ScanMode::full(ScanReason::NoSuccessfulRun), "{status}");
        }

        let prev = previous(&definition);
        let mode = policy.decide(Some(&prev), &definition, at("2024-01-01T01:00:00Z"));
        assert_eq!(mode, ScanMode::incremental(ScanReason::WithinInterval));
    }

    #[test]
    fn definition_frequency_wins_over_supplier_interval() {
        let mut definition = definition(Some("2024-01-01T00:00:00Z"));
        definition.full_frequency_in_minutes = Some(60);
        let prev = previous(&definition);

        let mode = daily().decide(Some(&prev), &definition, at("2024-01-01T01:00:00Z"));
        assert!(mode.full);
    }

    #[test]
    fn no_interval_means_incremental_after_first_full() {
        let policy = ScanModePolicy::FullResync { interval: None };
        let definition = definition(Some("2020-01-01T00:00:00Z"));
        let prev = previous(&definition);

        let mode = policy.decide(Some(&prev), &definition, at("2024-01-01T00:00:00Z"));
        assert_eq!(mode, ScanMode::incremental(ScanReason::NoInterval));

        let unrecorded = self::definition(None);
        let mode = policy.decide(Some(&prev), &unrecorded, at("2024-01-01T00:00:00Z"));
        assert_eq!(mode, ScanMode::full(ScanReason::NoRecordedFullRun));
    }

    #[test]
    fn override_wins_everywhere() {
        let mut definition = definition(None);
        definition
            .metadata
            .insert(FORCE_FULL_KEY.to_string(), false.into());

        for policy in [daily(), ScanModePolicy::AlwaysFull, ScanModePolicy::NeverFull] {
            let mode = policy.decide(None, &definition, at("2024-01-01T00:00:00Z"));
            assert_eq!(mode, ScanMode::incremental(ScanReason::Override));
        }
    }

    #[test]
    fn decisions_are_deterministic() {
        let definition = definition(Some("2024-01-01T00:00:00Z"));
        let prev = previous(&definition);
        let now = at("2024-01-03T00:00:00Z");
        assert_eq!(
            daily().decide(Some(&prev), &definition, now),
            daily().decide(Some(&prev), &definition, now)
        );
        assert_eq!(
            daily().decide(Some(&prev), &definition, now).to_string(),
            "full (interval_elapsed)"
        );
    }
}
