//! Verification engine: count artifacts per category and reduce to a verdict.

use std::path::Path;
use std::thread;

use tracing::{info, instrument, warn};

use crate::config::VerificationConfig;
use crate::core::report::{ArtifactKind, VerificationReport};
use crate::io::store::TrackingStore;
use crate::io::tracking_env::TrackingEnv;

/// Query each category once. A failed query counts as zero and does not stop
/// the others.
#[instrument(skip_all, fields(experiment_id = %experiment_id))]
pub fn verify(
    store: &dyn TrackingStore,
    project_dir: &Path,
    env: &TrackingEnv,
    experiment_id: &str,
) -> VerificationReport {
    let mut counts = [0usize; 3];
    for (slot, kind) in counts.iter_mut().zip(ArtifactKind::ALL) {
        *slot = match store.count(project_dir, env, experiment_id, kind) {
            Ok(found) => found,
            Err(err) => {
                warn!(kind = %kind, err = %format!("{err:#}"), "store query failed; counting as zero");
                0
            }
        };
    }
    let [datasets, scorers, traces] = counts;
    VerificationReport::from_counts(experiment_id, datasets, scorers, traces)
}

/// [`verify`] up to `config.attempts` times, pausing `config.backoff()`
/// between attempts and stopping at the first passing report.
pub fn verify_with_retry(
    store: &dyn TrackingStore,
    project_dir: &Path,
    env: &TrackingEnv,
    experiment_id: &str,
    config: &VerificationConfig,
) -> VerificationReport {
    let mut report = verify(store, project_dir, env, experiment_id);
    for attempt in 2..=config.attempts {
        if report.overall_pass {
            break;
        }
        info!(
            attempt,
            missing = ?report.missing(),
            backoff_secs = config.backoff_secs,
            "artifacts missing; retrying verification"
        );
        thread::sleep(config.backoff());
        report = verify(store, project_dir, env, experiment_id);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeStore;

    fn env() -> TrackingEnv {
        TrackingEnv::new("http://127.0.0.1:5000").with_experiment("7")
    }

    #[test]
    fn reports_each_category_independently() {
        let store = FakeStore::with_counts(2, 0, 1);
        let report = verify(&store, Path::new("/p"), &env(), "7");

        assert!(report.datasets.pass);
        assert!(!report.scorers.pass);
        assert!(report.traces.pass);
        assert!(!report.overall_pass);
        assert_eq!(report.datasets.found, 2);
    }

    #[test]
    fn failed_query_counts_as_zero_without_aborting() {
        let store = FakeStore::with_counts(1, 1, 1).failing(ArtifactKind::Scorers);
        let report = verify(&store, Path::new("/p"), &env(), "7");

        assert_eq!(report.scorers.found, 0);
        assert!(report.datasets.pass);
        assert!(report.traces.pass);
        assert_eq!(store.count_calls(), 3);
    }

    #[test]
    fn single_attempt_reads_once() {
        let store = FakeStore::with_counts(0, 0, 0);
        let config = VerificationConfig {
            attempts: 1,
            backoff_secs: 0,
        };
        let report = verify_with_retry(&store, Path::new("/p"), &env(), "7", &config);
        assert!(!report.overall_pass);
        assert_eq!(store.count_calls(), 3);
    }

    #[test]
    fn retries_stop_once_report_passes() {
        let store = FakeStore::with_counts(1, 1, 1);
        let config = VerificationConfig {
            attempts: 5,
            backoff_secs: 0,
        };
        let report = verify_with_retry(&store, Path::new("/p"), &env(), "7", &config);
        assert!(report.overall_pass);
        assert_eq!(store.count_calls(), 3);
    }

    #[test]
    fn retries_exhaust_attempts_when_artifacts_never_appear() {
        let store = FakeStore::with_counts(1, 0, 1);
        let config = VerificationConfig {
            attempts: 3,
            backoff_secs: 0,
        };
        let report = verify_with_retry(&store, Path::new("/p"), &env(), "7", &config);
        assert!(!report.overall_pass);
        assert_eq!(store.count_calls(), 9);
    }
}
