use std::{
    collections::BTreeMap,
    fmt::{Debug, Write as _},
    fs,
    future::Future,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    Aggregate,
    aggregate::OutcomeLog,
    error::ArtifactError,
    executor::user::VirtualUserReport,
    metric::{RequestOutcome, ResourceType, TaskKind},
    scenario::ScenarioProfile,
};

/// The processed form of an [`Aggregate`].
///
/// Reports are pure data: they derive averages, percentiles and ratios from
/// the aggregate and perform no I/O. Writing them somewhere is the job of a
/// [`Reporter`].
pub trait Report<A>
where
    Self: Send + Sync + Debug + Serialize + DeserializeOwned + for<'a> From<&'a A>,
    A: Aggregate,
{
}

/// Latency distribution and success counts for a set of requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: u64,
    pub successes: u64,
    pub failures: u64,
    pub min: Duration,
    pub mean: Duration,
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub max: Duration,
}

impl LatencyStats {
    /// Min, max and mean are exact. Percentiles come from a histogram with
    /// three significant digits, recorded in microseconds.
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a RequestOutcome>) -> Self {
        let Ok(mut hist) = Histogram::<u64>::new(3) else {
            return Self::default();
        };
        let mut stats = Self {
            min: Duration::MAX,
            ..Self::default()
        };
        let mut total = Duration::ZERO;

        for outcome in outcomes {
            stats.count += 1;
            if outcome.is_success() {
                stats.successes += 1;
            } else {
                stats.failures += 1;
            }
            stats.min = stats.min.min(outcome.latency);
            stats.max = stats.max.max(outcome.latency);
            total += outcome.latency;
            let micros = u64::try_from(outcome.latency.as_micros()).unwrap_or(u64::MAX);
            let _ = hist.record(micros);
        }

        if stats.count == 0 {
            return Self::default();
        }
        stats.mean = Duration::from_nanos(
            u64::try_from(total.as_nanos() / u128::from(stats.count)).unwrap_or(u64::MAX),
        );
        stats.p50 = Duration::from_micros(hist.value_at_quantile(0.50));
        stats.p95 = Duration::from_micros(hist.value_at_quantile(0.95));
        stats.p99 = Duration::from_micros(hist.value_at_quantile(0.99));
        stats
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub overall: LatencyStats,
    pub by_kind: BTreeMap<TaskKind, LatencyStats>,
    pub by_resource: BTreeMap<ResourceType, LatencyStats>,
    /// Updates and deletes replaced by reads to protect the pool floors.
    pub redirected: u64,
    pub elapsed: Duration,
    /// Requests per second over `elapsed`.
    pub throughput: f64,
    pub virtual_users: usize,
    pub startup_failures: usize,
    pub expired_sessions: usize,
    pub total_downtime: Duration,
}

impl From<&OutcomeLog> for RunSummary {
    fn from(log: &OutcomeLog) -> Self {
        let outcomes = log.outcomes();
        let by_kind = TaskKind::ALL
            .into_iter()
            .filter(|k| outcomes.iter().any(|o| o.task_kind == *k))
            .map(|k| {
                let stats = LatencyStats::from_outcomes(outcomes.iter().filter(|o| o.task_kind == k));
                (k, stats)
            })
            .collect();
        let mut resources: Vec<ResourceType> = outcomes.iter().map(|o| o.resource_type).collect();
        resources.sort();
        resources.dedup();
        let by_resource = resources
            .into_iter()
            .map(|t| {
                let stats =
                    LatencyStats::from_outcomes(outcomes.iter().filter(|o| o.resource_type == t));
                (t, stats)
            })
            .collect();

        Self {
            overall: LatencyStats::from_outcomes(outcomes),
            by_kind,
            by_resource,
            redirected: outcomes.iter().filter(|o| o.redirected).count() as u64,
            ..Self::default()
        }
    }
}

impl Report<OutcomeLog> for RunSummary {}

impl RunSummary {
    /// Adds the run-level figures the outcome log cannot know.
    pub fn with_run(mut self, elapsed: Duration, users: &[VirtualUserReport]) -> Self {
        self.elapsed = elapsed;
        self.throughput = if elapsed.is_zero() {
            0.0
        } else {
            self.overall.count as f64 / elapsed.as_secs_f64()
        };
        self.virtual_users = users.len();
        self.startup_failures = users.iter().filter(|u| u.startup_failure.is_some()).count();
        self.expired_sessions = users.iter().filter(|u| u.session_expired).count();
        self.total_downtime = users.iter().map(|u| u.downtime).sum();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed { reason: String },
}

/// Everything known about one scenario run. Read-only once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub scenario_name: String,
    pub profile: ScenarioProfile,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: RunStatus,
    /// Ordered by timestamp.
    pub outcomes: Vec<RequestOutcome>,
    pub summary: RunSummary,
    pub users: Vec<VirtualUserReport>,
}

impl RunResult {
    pub fn completed(
        profile: ScenarioProfile,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        log: OutcomeLog,
        users: Vec<VirtualUserReport>,
    ) -> Self {
        let elapsed = (end_time - start_time).to_std().unwrap_or_default();
        let summary = RunSummary::from(&log).with_run(elapsed, &users);
        Self {
            scenario_name: profile.name().to_owned(),
            profile,
            start_time,
            end_time,
            status: RunStatus::Completed,
            outcomes: log.into_ordered(),
            summary,
            users,
        }
    }

    pub fn failed(
        profile: ScenarioProfile,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            scenario_name: profile.name().to_owned(),
            profile,
            start_time,
            end_time,
            status: RunStatus::Failed {
                reason: reason.into(),
            },
            outcomes: Vec::new(),
            summary: RunSummary::default(),
            users: Vec::new(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn duration(&self) -> Duration {
        (self.end_time - self.start_time).to_std().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignResult {
    pub started_at: DateTime<Utc>,
    pub runs: Vec<RunResult>,
}

impl CampaignResult {
    pub fn completed(&self) -> usize {
        self.runs.iter().filter(|r| r.is_completed()).count()
    }

    pub fn failed(&self) -> usize {
        self.runs.len() - self.completed()
    }

    pub fn any_failed(&self) -> bool {
        self.failed() > 0
    }
}

/// Sends finished results somewhere: stdout, files, a database.
///
/// Reporters are the I/O boundary of the pipeline. Two reporters compose as a
/// tuple and both receive every result.
pub trait Reporter: Send + Sync {
    fn report(&self, result: &RunResult) -> impl Future<Output = Result<(), ArtifactError>> + Send;

    fn report_campaign(
        &self,
        campaign: &CampaignResult,
    ) -> impl Future<Output = Result<(), ArtifactError>> + Send {
        let _ = campaign;
        async { Ok(()) }
    }
}

impl<A: Reporter, B: Reporter> Reporter for (A, B) {
    async fn report(&self, result: &RunResult) -> Result<(), ArtifactError> {
        let (a, b) = futures::join!(self.0.report(result), self.1.report(result));
        a.and(b)
    }

    async fn report_campaign(&self, campaign: &CampaignResult) -> Result<(), ArtifactError> {
        let (a, b) = futures::join!(
            self.0.report_campaign(campaign),
            self.1.report_campaign(campaign)
        );
        a.and(b)
    }
}

/// Prints summaries to standard output.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutReporter;

impl Reporter for StdoutReporter {
    async fn report(&self, result: &RunResult) -> Result<(), ArtifactError> {
        println!("{}", render_summary(result));
        Ok(())
    }

    async fn report_campaign(&self, campaign: &CampaignResult) -> Result<(), ArtifactError> {
        println!("{}", render_campaign(campaign));
        Ok(())
    }
}

/// Files written for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunArtifacts {
    pub csv: PathBuf,
    pub summary: PathBuf,
}

/// Writes `<scenario>_<YYYYmmdd_HHMMSS>.csv` and `..._summary.txt` into a
/// results directory. Existing files are never overwritten.
#[derive(Debug, Clone)]
pub struct ArtifactReporter {
    dir: PathBuf,
}

impl ArtifactReporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn write_run(&self, result: &RunResult) -> Result<RunArtifacts, ArtifactError> {
        let dir = self.dir.clone();
        let result = result.clone();
        tokio::task::spawn_blocking(move || write_run(&dir, &result)).await?
    }

    pub async fn write_campaign(&self, campaign: &CampaignResult) -> Result<PathBuf, ArtifactError> {
        let dir = self.dir.clone();
        let stem = format!("campaign_{}", campaign.started_at.format("%Y%m%d_%H%M%S"));
        let text = render_campaign(campaign);
        tokio::task::spawn_blocking(move || {
            fs::create_dir_all(&dir)?;
            let stem = unique_stem(&dir, &stem, &["_summary.txt"]);
            let path = dir.join(format!("{stem}_summary.txt"));
            fs::write(&path, text)?;
            Ok::<_, ArtifactError>(path)
        })
        .await?
    }
}

impl Reporter for ArtifactReporter {
    async fn report(&self, result: &RunResult) -> Result<(), ArtifactError> {
        let artifacts = self.write_run(result).await?;
        tracing::info!(
            csv = %artifacts.csv.display(),
            summary = %artifacts.summary.display(),
            "Results saved for {}",
            result.scenario_name
        );
        Ok(())
    }

    async fn report_campaign(&self, campaign: &CampaignResult) -> Result<(), ArtifactError> {
        let path = self.write_campaign(campaign).await?;
        tracing::info!(path = %path.display(), "Campaign summary saved");
        Ok(())
    }
}

/// `base`, or `base_1`, `base_2`, ... so that no `<stem><suffix>` exists yet.
fn unique_stem(dir: &Path, base: &str, suffixes: &[&str]) -> String {
    let taken = |stem: &str| {
        suffixes
            .iter()
            .any(|suffix| dir.join(format!("{stem}{suffix}")).exists())
    };
    if !taken(base) {
        return base.to_owned();
    }
    (1..)
        .map(|n| format!("{base}_{n}"))
        .find(|stem| !taken(stem))
        .unwrap_or_else(|| base.to_owned())
}

#[derive(Serialize)]
struct CsvRow<'a> {
    timestamp: String,
    virtual_user_id: usize,
    task: &'a str,
    task_kind: TaskKind,
    resource_type: ResourceType,
    latency_ms: f64,
    status: &'a str,
    http_status: Option<u16>,
    error_detail: Option<&'a str>,
    redirected: bool,
}

impl<'a> From<&'a RequestOutcome> for CsvRow<'a> {
    fn from(o: &'a RequestOutcome) -> Self {
        Self {
            timestamp: o.timestamp.to_rfc3339(),
            virtual_user_id: o.virtual_user_id,
            task: &o.task,
            task_kind: o.task_kind,
            resource_type: o.resource_type,
            latency_ms: o.latency.as_secs_f64() * 1000.0,
            status: if o.is_success() { "success" } else { "failure" },
            http_status: o.http_status,
            error_detail: o.error_detail.as_deref(),
            redirected: o.redirected,
        }
    }
}

fn write_run(dir: &Path, result: &RunResult) -> Result<RunArtifacts, ArtifactError> {
    fs::create_dir_all(dir)?;
    let base = format!(
        "{}_{}",
        result.scenario_name,
        result.start_time.format("%Y%m%d_%H%M%S")
    );
    let stem = unique_stem(dir, &base, &[".csv", "_summary.txt"]);
    let csv = dir.join(format!("{stem}.csv"));
    let summary = dir.join(format!("{stem}_summary.txt"));

    let mut writer = csv::Writer::from_path(&csv)?;
    for outcome in &result.outcomes {
        writer.serialize(CsvRow::from(outcome))?;
    }
    writer.flush()?;
    fs::write(&summary, render_summary(result))?;

    Ok(RunArtifacts { csv, summary })
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn stats_row(out: &mut String, label: &str, s: &LatencyStats) {
    let _ = writeln!(
        out,
        "  {label:<14} {:>8} {:>8} {:>8} {:>9.1} {:>9.1} {:>9.1} {:>9.1} {:>9.1} {:>9.1}",
        s.count,
        s.successes,
        s.failures,
        ms(s.min),
        ms(s.mean),
        ms(s.p50),
        ms(s.p95),
        ms(s.p99),
        ms(s.max),
    );
}

/// Human-readable run summary, as written to `*_summary.txt`.
pub fn render_summary(result: &RunResult) -> String {
    let mut out = String::new();
    let s = &result.summary;
    let p = &result.profile;

    let _ = writeln!(out, "Scenario:          {}", result.scenario_name);
    let status = match &result.status {
        RunStatus::Completed => "completed".to_owned(),
        RunStatus::Failed { reason } => format!("failed ({reason})"),
    };
    let _ = writeln!(out, "Status:            {status}");
    let _ = writeln!(
        out,
        "Profile:           {} users, {:.2} users/s, {} s",
        p.virtual_user_count(),
        p.spawn_rate(),
        p.duration().as_secs()
    );
    let _ = writeln!(out, "Started:           {}", result.start_time.to_rfc3339());
    let _ = writeln!(out, "Ended:             {}", result.end_time.to_rfc3339());
    let _ = writeln!(out, "Duration:          {:.1} s", result.duration().as_secs_f64());

    if !result.is_completed() {
        return out;
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "Requests:          {}", s.overall.count);
    let _ = writeln!(out, "Successes:         {}", s.overall.successes);
    let _ = writeln!(out, "Failures:          {}", s.overall.failures);
    let _ = writeln!(out, "Throughput:        {:.2} req/s", s.throughput);
    let _ = writeln!(out, "Redirected:        {}", s.redirected);
    let _ = writeln!(out, "Virtual users:     {}", s.virtual_users);
    let _ = writeln!(out, "Startup failures:  {}", s.startup_failures);
    let _ = writeln!(out, "Expired sessions:  {}", s.expired_sessions);
    let _ = writeln!(out, "Downtime:          {:.1} s", s.total_downtime.as_secs_f64());

    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "  {:<14} {:>8} {:>8} {:>8} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9}",
        "latency (ms)", "count", "ok", "failed", "min", "mean", "p50", "p95", "p99", "max"
    );
    stats_row(&mut out, "overall", &s.overall);
    for (kind, stats) in &s.by_kind {
        stats_row(&mut out, kind.as_str(), stats);
    }
    for (resource, stats) in &s.by_resource {
        stats_row(&mut out, resource.as_str(), stats);
    }
    out
}

/// One line per run, in campaign order.
pub fn render_campaign(campaign: &CampaignResult) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Campaign started {}: {} run(s), {} completed, {} failed",
        campaign.started_at.to_rfc3339(),
        campaign.runs.len(),
        campaign.completed(),
        campaign.failed()
    );
    let _ = writeln!(
        out,
        "  {:<10} {:<10} {:>9} {:>9} {:>10} {:>10} {:>10}",
        "scenario", "status", "requests", "failures", "p95 (ms)", "req/s", "duration"
    );
    for run in &campaign.runs {
        let status = if run.is_completed() { "completed" } else { "failed" };
        let _ = writeln!(
            out,
            "  {:<10} {:<10} {:>9} {:>9} {:>10.1} {:>10.2} {:>9.0}s",
            run.scenario_name,
            status,
            run.summary.overall.count,
            run.summary.overall.failures,
            ms(run.summary.overall.p95),
            run.summary.throughput,
            run.duration().as_secs_f64()
        );
        if let RunStatus::Failed { reason } = &run.status {
            let _ = writeln!(out, "    {reason}");
        }
    }
    out
}
