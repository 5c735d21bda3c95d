//! Request coordinator (component C10)
//!
//! Wires the expander, cost calculator, circuit breaker, cache, worker pool,
//! and kernel together into a single `execute` call: expand the request,
//! price it, ask the breaker for admission, fan each point out to the
//! worker pool (coalesced through the cache), assemble the response in
//! declared axis order, and record metered usage — all without letting one
//! bad point fail an entire sweep, and without ever blocking on a worker
//! that a cancelled session no longer needs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::breaker::{CircuitBreaker, LoadSample};
use crate::cache::{Lookup, ResultCache};
use crate::config::Config;
use crate::error::AppError;
use crate::expander::{self, ExpansionResult};
use crate::fingerprint::{self, Fingerprint};
use crate::kernel;
use crate::types::{ComputeResponse, Layout, RequestSpec, ResponseMeta, ResultGrid, ResultPoint};
use crate::usage::{UsageEvent, UsageMeter};
use crate::worker_pool::WorkerPool;

type PointResult = BTreeMap<String, Option<f64>>;

pub struct Coordinator {
    config: Config,
    breaker: CircuitBreaker,
    cache: ResultCache<PointResult>,
    pool: WorkerPool,
    usage: UsageMeter,
}

impl Coordinator {
    pub fn new(config: Config) -> Self {
        let pool = WorkerPool::new(config.worker_pool.worker_count, config.worker_pool.queue_capacity);
        let cache = ResultCache::new(
            config.cache.max_entries,
            config.cache.max_age_secs,
            config.cache.negative_ttl_secs,
        );
        let breaker = CircuitBreaker::new(config.breaker.clone());
        let usage = UsageMeter::new(config.usage_retention_days);
        Self { config, breaker, cache, pool, usage }
    }

    pub fn worker_utilisation(&self) -> f64 {
        let capacity = self.config.worker_pool.queue_capacity.max(1);
        self.pool.queue_depth() as f64 / capacity as f64
    }

    pub fn breaker_state(&self) -> &'static str {
        self.breaker.state().as_str()
    }

    /// Execute one compute request end-to-end for the given identity key,
    /// returning the assembled response. `cancel` is checked before every
    /// point dispatch and is wired to the coordinator's session-cancel
    /// endpoint.
    pub async fn execute(
        &self,
        spec: &RequestSpec,
        key_id: &str,
        endpoint: &'static str,
        cancel: CancellationToken,
    ) -> Result<ComputeResponse, AppError> {
        let ExpansionResult { points, axes, layout } = expander::expand(spec, self.config.max_points)?;

        let base_cost = crate::cost::base_cost(&points);
        let sample = LoadSample {
            worker_utilisation: self.worker_utilisation(),
            queue_depth_ratio: self.worker_utilisation(),
            memory_ratio: 0.0,
        };
        let decision = self.breaker.admit(&sample);
        if !decision.allowed {
            return Err(AppError::OverCapacity {
                retry_after_seconds: decision.retry_after_seconds.unwrap_or(5),
                circuit_state: decision.state.as_str(),
            });
        }
        if decision.cost_multiplier != 1.0 && !self.breaker.half_open_admits_cost(base_cost, 1) {
            return Err(AppError::OverCapacity {
                retry_after_seconds: self.config.breaker.base_retry_after_secs,
                circuit_state: decision.state.as_str(),
            });
        }

        let metered = crate::cost::metered_cost(base_cost, decision.cost_multiplier);

        let started = Instant::now();
        let mut cached_points = 0u64;
        let mut flat_results = Vec::with_capacity(points.len());

        for point in &points {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }

            let fp = fingerprint::fingerprint(point);
            let point_started = Instant::now();
            match self.lookup_or_compute(fp, point.clone(), cancel.clone()).await {
                Ok((metrics, cached)) => {
                    cached_points += cached as u64;
                    flat_results.push(ResultPoint {
                        params: point.params.clone(),
                        metrics,
                        cached,
                        computation_time_ms: point_started.elapsed().as_millis() as u64,
                    });
                }
                // Cancellation ends the whole sweep; every other per-point
                // failure (a kernel error or timeout) degrades to a
                // sentinel-valued point so one bad point never fails the
                // batch.
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(err) => {
                    tracing::warn!(error = %err, "point computation failed, recording null metrics");
                    let metrics = point.metrics.iter().map(|m| (m.key().to_string(), None)).collect();
                    flat_results.push(ResultPoint {
                        params: point.params.clone(),
                        metrics,
                        cached: false,
                        computation_time_ms: point_started.elapsed().as_millis() as u64,
                    });
                }
            }
        }

        self.usage.record(UsageEvent {
            key_id: key_id.to_string(),
            endpoint: endpoint.to_string(),
            cost: metered,
            params_summary: format!("{} point(s)", points.len()),
            at: chrono::Utc::now(),
        });

        let results = match layout {
            Layout::Matrix if axes.len() == 2 => {
                let rows = axes[0].values.len();
                let cols = axes[1].values.len();
                let mut grid = Vec::with_capacity(rows);
                let mut iter = flat_results.into_iter();
                for _ in 0..rows {
                    let row: Vec<ResultPoint> = (0..cols).filter_map(|_| iter.next()).collect();
                    grid.push(row);
                }
                ResultGrid::Matrix(grid)
            }
            _ => ResultGrid::Flat(flat_results),
        };

        Ok(ComputeResponse {
            format: layout,
            axes,
            results,
            meta: ResponseMeta {
                total_points: points.len() as u64,
                cached_points,
                total_computation_time_ms: started.elapsed().as_millis() as u64,
            },
        })
    }

    /// Resolve one point through the cache's single-flight lookup, running
    /// the kernel on the worker pool when this call becomes the producer.
    async fn lookup_or_compute(
        &self,
        fp: Fingerprint,
        point: crate::types::ExpandedPoint,
        cancel: CancellationToken,
    ) -> Result<(PointResult, bool), AppError> {
        let result = self
            .cache
            .lookup_or_insert(fp, move || self.dispatch_to_pool(point, cancel))
            .await;

        match result {
            Ok(Lookup::Hit(value)) => Ok((value, true)),
            Ok(Lookup::Produced(value)) => Ok((value, false)),
            Ok(Lookup::Miss) => Err(AppError::Internal(anyhow::anyhow!(
                "point computation failed previously and remains negatively cached"
            ))),
            Err(err) => Err(err),
        }
    }

    /// Submit one point's kernel evaluation to the worker pool and await
    /// its result. A full queue surfaces as `OverCapacity`; a cancelled
    /// token short-circuits before the kernel ever runs.
    async fn dispatch_to_pool(
        &self,
        point: crate::types::ExpandedPoint,
        cancel: CancellationToken,
    ) -> Result<PointResult, AppError> {
        let (tx, rx) = oneshot::channel();
        let job_cancel = cancel.clone();
        let kernel_timeout = std::time::Duration::from_secs(self.config.kernel_timeout_secs);
        let handle = self
            .pool
            .submit(cancel, async move {
                if job_cancel.is_cancelled() {
                    let _ = tx.send(Err(AppError::Cancelled));
                    return;
                }
                // `kernel::compute` is synchronous and non-yielding, so it
                // is run on a blocking-pool thread and raced against the
                // timeout there; a plain `async { kernel::compute(..) }`
                // would never let the timeout's sleep future win the race
                // until the computation had already finished on its own.
                let join_handle = tokio::task::spawn_blocking(move || kernel::compute(&point));
                let outcome = match tokio::time::timeout(kernel_timeout, join_handle).await {
                    Ok(Ok(Ok(result))) => Ok(result),
                    Ok(Ok(Err(err))) => Err(AppError::Internal(anyhow::anyhow!("kernel failure: {err}"))),
                    Ok(Err(join_err)) => {
                        Err(AppError::Internal(anyhow::anyhow!("kernel task panicked: {join_err}")))
                    }
                    Err(_) => Err(AppError::Internal(anyhow::anyhow!(
                        "kernel evaluation exceeded its time budget"
                    ))),
                };
                let _ = tx.send(outcome);
            })
            .map_err(|_| AppError::OverCapacity {
                retry_after_seconds: self.config.breaker.base_retry_after_secs,
                circuit_state: self.breaker.state().as_str(),
            })?;

        handle.wait().await;
        rx.await.unwrap_or(Err(AppError::Cancelled))
    }

    pub fn usage(&self) -> &UsageMeter {
        &self.usage
    }
}

pub type SharedCoordinator = Arc<Coordinator>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Metric, Modulation, ModulationKind, ParamValue, SnrUnit};
    use indexmap::IndexMap;

    fn test_config() -> Config {
        let mut config = Config::from_env();
        config.worker_pool.worker_count = 2;
        config.worker_pool.queue_capacity = 8;
        config
    }

    fn spec() -> RequestSpec {
        let mut axes = IndexMap::new();
        axes.insert(
            "SNR".to_string(),
            ParamValue::RangePoints { min: 0.0, max: 4.0, points: 3 },
        );
        RequestSpec {
            axes,
            modulation: Modulation::Standard { m: 4, kind: ModulationKind::Pam, snr_unit: SnrUnit::Linear },
            metrics: vec![Metric::ErrorProbability],
            format: Layout::Flat,
        }
    }

    #[tokio::test]
    async fn executes_a_small_sweep() {
        let coordinator = Coordinator::new(test_config());
        let response = coordinator
            .execute(&spec(), "key-1", "/api/v1/compute/standard", CancellationToken::new())
            .await
            .unwrap();
        match response.results {
            ResultGrid::Flat(points) => assert_eq!(points.len(), 3),
            ResultGrid::Matrix(_) => panic!("expected flat layout"),
        }
        assert_eq!(response.meta.total_points, 3);
    }

    #[tokio::test]
    async fn repeated_request_hits_cache() {
        let coordinator = Coordinator::new(test_config());
        let first = coordinator
            .execute(&spec(), "key-1", "/api/v1/compute/standard", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.meta.cached_points, 0);
        let second = coordinator
            .execute(&spec(), "key-1", "/api/v1/compute/standard", CancellationToken::new())
            .await
            .unwrap();
        if let ResultGrid::Flat(points) = second.results {
            assert!(points.iter().all(|p| p.cached));
        }
        assert_eq!(second.meta.cached_points, 3);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let coordinator = Coordinator::new(test_config());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = coordinator
            .execute(&spec(), "key-1", "/api/v1/compute/standard", cancel)
            .await;
        assert!(matches!(result, Err(AppError::Cancelled)));
    }

    #[tokio::test]
    async fn oversized_sweep_is_rejected_before_compute() {
        let mut config = test_config();
        config.max_points = 2;
        let coordinator = Coordinator::new(config);
        let result = coordinator
            .execute(&spec(), "key-1", "/api/v1/compute/standard", CancellationToken::new())
            .await;
        assert!(matches!(result, Err(AppError::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn empty_key_id_records_no_billable_usage() {
        let coordinator = Coordinator::new(test_config());
        coordinator
            .execute(&spec(), "", "/api/v1/compute/standard", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(coordinator.usage().total_cost(""), 0);
    }

    #[tokio::test]
    async fn usage_is_metered_per_identity() {
        let coordinator = Coordinator::new(test_config());
        coordinator
            .execute(&spec(), "key-1", "/api/v1/compute/standard", CancellationToken::new())
            .await
            .unwrap();
        assert!(coordinator.usage().total_cost("key-1") > 0);
    }
}
