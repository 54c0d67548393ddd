use std::fmt::Debug;

use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::mpsc;

use crate::{Metric, macros::aggregate, metric::RequestOutcome};

/// Collects [`Metric`] samples into a mergeable intermediate representation.
///
/// An aggregate keeps raw, mergeable data only. Derived statistics such as
/// percentiles or throughput belong in a [`crate::Report`], which is built from
/// the finished aggregate.
///
/// ```rust
/// use realmload::{Aggregate, Metric, macros::*};
///
/// #[metric]
/// struct Hit(u64);
///
/// #[aggregate]
/// struct Hits {
///     count: u64,
/// }
///
/// impl Aggregate for Hits {
///     type Metric = Hit;
///
///     fn new() -> Self {
///         Self { count: 0 }
///     }
///
///     fn consume(&mut self, _: &Self::Metric) {
///         self.count += 1;
///     }
///
///     fn merge(&mut self, other: Self) {
///         self.count += other.count;
///     }
/// }
/// ```
///
/// `merge` must be associative and commutative.
pub trait Aggregate
where
    Self: Serialize + DeserializeOwned + PartialOrd + PartialEq + Send + Sync + Debug + Clone,
{
    type Metric: Metric;

    fn new() -> Self;

    /// Calls [`Aggregate::consume`] for each metric.
    fn aggregate(&mut self, metrics: &[Self::Metric]) {
        metrics.iter().for_each(|m| self.consume(m));
    }

    fn consume(&mut self, metric: &Self::Metric);

    fn merge(&mut self, other: Self);
}

/// Append-only log of every request outcome of a run.
///
/// Per-request rows are part of the run artifacts, so the log keeps each
/// outcome rather than a compressed summary.
#[aggregate]
#[derive(Default)]
pub struct OutcomeLog {
    outcomes: Vec<RequestOutcome>,
}

impl OutcomeLog {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn outcomes(&self) -> &[RequestOutcome] {
        &self.outcomes
    }

    /// Orders outcomes by timestamp. Outcomes with equal timestamps keep their
    /// arrival order, so a user's own outcomes stay in completion order.
    pub fn into_ordered(mut self) -> Vec<RequestOutcome> {
        self.outcomes.sort_by_key(|o| o.timestamp);
        self.outcomes
    }
}

impl Aggregate for OutcomeLog {
    type Metric = RequestOutcome;

    fn new() -> Self {
        Self::default()
    }

    fn aggregate(&mut self, metrics: &[Self::Metric]) {
        self.outcomes.extend_from_slice(metrics);
    }

    fn consume(&mut self, metric: &Self::Metric) {
        self.outcomes.push(metric.clone());
    }

    fn merge(&mut self, mut other: Self) {
        self.outcomes.append(&mut other.outcomes);
    }
}

/// Drains a metric channel into an aggregate until every sender is dropped.
///
/// After each blocking receive, whatever else is already queued (up to
/// `batch_size`) is taken without waiting and aggregated in one call.
pub async fn aggregator_task<A: Aggregate>(
    mut rx: mpsc::Receiver<A::Metric>,
    batch_size: usize,
) -> A {
    let mut agg = A::new();
    let mut batch = Vec::with_capacity(batch_size);

    while let Some(metric) = rx.recv().await {
        batch.push(metric);
        while batch.len() < batch_size {
            match rx.try_recv() {
                Ok(metric) => batch.push(metric),
                Err(_) => break,
            }
        }
        agg.aggregate(&batch);
        batch.clear();
    }
    agg
}
