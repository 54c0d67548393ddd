//! Runs several scenario profiles back to back.

use std::{fmt::Display, time::Duration};

use typed_builder::TypedBuilder;

use crate::{
    clock::WallClock,
    executor::{Executor, StopSignal},
    report::{CampaignResult, Reporter, RunResult, render_campaign, render_summary},
    scenario::ScenarioProfile,
};

/// Sequences profiles through one executor with a cooldown between runs.
///
/// A profile that fails to start becomes a failed [`RunResult`] and the
/// campaign moves on. Every result goes to the reporter; reporter errors are
/// logged and otherwise ignored. Run and campaign summaries are also logged,
/// so a log file of the campaign holds them too.
#[derive(TypedBuilder)]
pub struct Campaign<E, R> {
    executor: E,
    reporter: R,
    /// Share this with the executor so that a stop also ends the current run.
    #[builder(default)]
    stop: StopSignal,
    /// Stamps failed runs and the campaign start. Use the executor's clock so
    /// that all results of a campaign share one time line.
    #[builder(default)]
    clock: WallClock,
}

impl<E, R> Campaign<E, R>
where
    E: Executor,
    E::Error: Display,
    R: Reporter,
{
    pub async fn run(&self, profiles: &[ScenarioProfile], cooldown: Duration) -> CampaignResult {
        let clock = self.clock;
        let started_at = clock.now();
        let mut runs = Vec::with_capacity(profiles.len());

        for (i, profile) in profiles.iter().enumerate() {
            if self.stop.is_stopped() {
                tracing::info!(
                    "Stop requested, skipping {} remaining scenario(s)",
                    profiles.len() - i
                );
                break;
            }

            tracing::info!("Scenario {}/{}: {}", i + 1, profiles.len(), profile.name());
            let start = clock.now();
            let result = match self.executor.exec(profile).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(scenario = profile.name(), "Scenario failed: {e}");
                    RunResult::failed(profile.clone(), start, clock.now(), e.to_string())
                }
            };

            for line in render_summary(&result).lines() {
                tracing::info!("{line}");
            }
            if let Err(e) = self.reporter.report(&result).await {
                tracing::warn!(scenario = profile.name(), "Failed to report results: {e}");
            }
            runs.push(result);

            let last = i + 1 == profiles.len();
            if !last && !cooldown.is_zero() && !self.stop.is_stopped() {
                tracing::info!("Cooling down for {}s...", cooldown.as_secs_f64());
                tokio::select! {
                    _ = tokio::time::sleep(cooldown) => {}
                    _ = self.stop.stopped() => {}
                }
            }
        }

        let campaign = CampaignResult { started_at, runs };
        for line in render_campaign(&campaign).lines() {
            tracing::info!("{line}");
        }
        if let Err(e) = self.reporter.report_campaign(&campaign).await {
            tracing::warn!("Failed to report campaign summary: {e}");
        }
        campaign
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc};

    use chrono::TimeDelta;
    use parking_lot::Mutex;

    use super::*;
    use crate::{
        aggregate::OutcomeLog,
        config::EngineConfig,
        error::{ArtifactError, RunError},
        executor::Scheduler,
        mock::{MockBehavior, MockIdentityApi},
    };

    /// Holds each profile for its duration without generating load.
    struct IdleExecutor {
        clock: WallClock,
        failing: HashSet<&'static str>,
    }

    impl IdleExecutor {
        fn new(clock: WallClock, failing: &[&'static str]) -> Self {
            Self {
                clock,
                failing: failing.iter().copied().collect(),
            }
        }
    }

    impl Executor for IdleExecutor {
        type Error = RunError;

        async fn exec(&self, profile: &ScenarioProfile) -> Result<RunResult, RunError> {
            if self.failing.contains(profile.name()) {
                tokio::time::sleep(Duration::from_secs(5)).await;
                return Err(RunError::Setup("realm creation refused".into()));
            }
            let start = self.clock.now();
            tokio::time::sleep(profile.duration()).await;
            Ok(RunResult::completed(
                profile.clone(),
                start,
                self.clock.now(),
                OutcomeLog::default(),
                Vec::new(),
            ))
        }
    }

    #[derive(Default)]
    struct RecordingReporter {
        runs: Mutex<Vec<String>>,
        campaigns: Mutex<usize>,
        fail: bool,
    }

    impl Reporter for Arc<RecordingReporter> {
        async fn report(&self, result: &RunResult) -> Result<(), ArtifactError> {
            self.runs.lock().push(result.scenario_name.clone());
            if self.fail {
                return Err(ArtifactError::Io(std::io::Error::other("disk full")));
            }
            Ok(())
        }

        async fn report_campaign(&self, _: &CampaignResult) -> Result<(), ArtifactError> {
            *self.campaigns.lock() += 1;
            Ok(())
        }
    }

    fn named(names: &[&str]) -> Vec<ScenarioProfile> {
        names
            .iter()
            .map(|n| ScenarioProfile::named(n).unwrap())
            .collect()
    }

    fn gap(runs: &[RunResult]) -> TimeDelta {
        runs[1].start_time - runs[0].end_time
    }

    #[tokio::test(start_paused = true)]
    async fn runs_in_order_with_cooldown() {
        let clock = WallClock::new();
        let reporter = Arc::new(RecordingReporter::default());
        let campaign = Campaign::builder()
            .executor(IdleExecutor::new(clock, &[]))
            .clock(clock)
            .reporter(reporter.clone())
            .build();

        let result = campaign
            .run(&named(&["light", "medium"]), Duration::from_secs(30))
            .await;

        assert_eq!(result.runs.len(), 2);
        assert_eq!(result.completed(), 2);
        assert_eq!(result.runs[0].scenario_name, "light");
        assert_eq!(result.runs[1].scenario_name, "medium");
        assert!((gap(&result.runs) - TimeDelta::seconds(30)).abs() < TimeDelta::seconds(1));
        assert_eq!(*reporter.runs.lock(), ["light", "medium"]);
        assert_eq!(*reporter.campaigns.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_scenario_does_not_stop_the_campaign() {
        let clock = WallClock::new();
        let reporter = Arc::new(RecordingReporter::default());
        let campaign = Campaign::builder()
            .executor(IdleExecutor::new(clock, &["light"]))
            .clock(clock)
            .reporter(reporter.clone())
            .build();

        let result = campaign
            .run(&named(&["light", "medium"]), Duration::from_secs(30))
            .await;

        assert!(!result.runs[0].is_completed());
        assert!(result.runs[1].is_completed());
        assert!(result.any_failed());
        assert_eq!(reporter.runs.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reporter_errors_are_not_fatal() {
        let clock = WallClock::new();
        let reporter = Arc::new(RecordingReporter {
            fail: true,
            ..Default::default()
        });
        let campaign = Campaign::builder()
            .executor(IdleExecutor::new(clock, &[]))
            .clock(clock)
            .reporter(reporter.clone())
            .build();

        let result = campaign
            .run(&named(&["light", "medium"]), Duration::ZERO)
            .await;
        assert_eq!(result.completed(), 2);
        assert_eq!(*reporter.campaigns.lock(), 1);
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn summaries_reach_the_log() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer({
                let captured = captured.clone();
                move || captured.clone()
            })
            .finish();
        let _default = tracing::subscriber::set_default(subscriber);

        let clock = WallClock::new();
        let campaign = Campaign::builder()
            .executor(IdleExecutor::new(clock, &["medium"]))
            .clock(clock)
            .reporter(Arc::new(RecordingReporter::default()))
            .build();
        campaign
            .run(&named(&["light", "medium"]), Duration::ZERO)
            .await;

        let log = String::from_utf8(captured.0.lock().clone()).unwrap();
        assert!(log.contains("Scenario:          light"), "{log}");
        assert!(log.contains("Status:            completed"));
        assert!(log.contains("Scenario:          medium"));
        assert!(log.contains("Status:            failed ("));
        assert!(log.contains("2 run(s), 1 completed, 1 failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_skips_remaining_profiles() {
        let clock = WallClock::new();
        let stop = StopSignal::new();
        let campaign = Campaign::builder()
            .executor(IdleExecutor::new(clock, &[]))
            .clock(clock)
            .reporter(Arc::new(RecordingReporter::default()))
            .stop(stop.clone())
            .build();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            stop.stop();
        });
        let result = campaign
            .run(&named(&["light", "medium", "heavy"]), Duration::from_secs(30))
            .await;

        // the idle executor ignores the stop, so light runs to its end
        assert_eq!(result.runs.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn light_then_medium_against_mock_target() {
        let api = Arc::new(MockIdentityApi::default());
        let stop = StopSignal::new();
        let clock = WallClock::new();
        let scheduler = Scheduler::builder()
            .api(api.clone())
            .config(Arc::new(EngineConfig::builder().seed(3).build()))
            .stop(stop.clone())
            .clock(clock)
            .build();
        let campaign = Campaign::builder()
            .executor(scheduler)
            .reporter(Arc::new(RecordingReporter::default()))
            .stop(stop)
            .clock(clock)
            .build();

        let result = campaign
            .run(&named(&["light", "medium"]), Duration::from_secs(30))
            .await;

        assert_eq!(result.completed(), 2);
        let light = &result.runs[0];
        let medium = &result.runs[1];
        assert_eq!(light.users.len(), 20);
        assert_eq!(medium.users.len(), 100);
        assert!((light.duration().as_secs_f64() - 300.0).abs() < 1.0);
        assert!((medium.duration().as_secs_f64() - 600.0).abs() < 1.0);
        // teardown and readiness of the next run sit inside the gap
        let gap = gap(&result.runs);
        assert!(gap >= TimeDelta::seconds(30) && gap < TimeDelta::seconds(32), "{gap}");
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_first_scenario_is_recorded_and_skipped() {
        // the target answers only after the first scenario has used up its probes
        let api = Arc::new(MockIdentityApi::new(MockBehavior {
            unready_probes: 3,
            ..Default::default()
        }));
        let clock = WallClock::new();
        let config = EngineConfig::builder()
            .readiness_attempts(3)
            .readiness_interval(Duration::from_secs(1))
            .seed(5)
            .build();
        let scheduler = Scheduler::builder()
            .api(api.clone())
            .config(Arc::new(config))
            .clock(clock)
            .build();
        let reporter = Arc::new(RecordingReporter::default());
        let campaign = Campaign::builder()
            .executor(scheduler)
            .reporter(reporter.clone())
            .clock(clock)
            .build();
        let profiles = [
            ScenarioProfile::new("first", 2, 2.0, Duration::from_secs(10)).unwrap(),
            ScenarioProfile::new("second", 2, 2.0, Duration::from_secs(10)).unwrap(),
        ];

        let result = campaign.run(&profiles, Duration::from_secs(5)).await;

        assert_eq!(result.runs.len(), 2);
        let first = &result.runs[0];
        assert!(!first.is_completed());
        assert!(first.outcomes.is_empty());
        assert!(result.runs[1].is_completed());
        assert_eq!(result.runs[1].users.len(), 2);
        assert_eq!(result.completed(), 1);
        assert_eq!(api.probes(), 4);
        assert!(gap(&result.runs) >= TimeDelta::seconds(5));
        assert_eq!(*reporter.runs.lock(), ["first", "second"]);
    }
}
