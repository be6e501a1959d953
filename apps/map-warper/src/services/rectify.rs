use chrono::Utc;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{OwnedMutexGuard, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::WarpError;
use crate::services::gcps::auto_order;
use crate::services::geotransform::FitKind;
use crate::services::lifecycle::MapStatus;
use crate::services::maps::{GeoBounds, MapRegistry, WarpedArtifacts};
use crate::services::tools::{RasterTools, WarpRequest};

pub const MIN_HARD_GCPS: usize = 3;
/// Finished jobs beyond this many are forgotten, oldest first.
pub const MAX_RETAINED_JOBS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransformSpec {
    /// Let the warper pick the polynomial order from the point count.
    #[default]
    Auto,
    P1,
    P2,
    P3,
    Tps,
}

impl TransformSpec {
    /// Unknown values fall back to `Auto`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "p1" => TransformSpec::P1,
            "p2" => TransformSpec::P2,
            "p3" => TransformSpec::P3,
            "tps" => TransformSpec::Tps,
            _ => TransformSpec::Auto,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransformSpec::Auto => "auto",
            TransformSpec::P1 => "p1",
            TransformSpec::P2 => "p2",
            TransformSpec::P3 => "p3",
            TransformSpec::Tps => "tps",
        }
    }

    pub fn gdalwarp_args(self) -> Vec<String> {
        match self {
            TransformSpec::Auto => Vec::new(),
            TransformSpec::P1 => vec!["-order".to_string(), "1".to_string()],
            TransformSpec::P2 => vec!["-order".to_string(), "2".to_string()],
            TransformSpec::P3 => vec!["-order".to_string(), "3".to_string()],
            TransformSpec::Tps => vec!["-tps".to_string()],
        }
    }

    pub fn fit_kind(self, hard_count: usize) -> FitKind {
        match self {
            TransformSpec::Auto => FitKind::Polynomial(auto_order(hard_count)),
            TransformSpec::P1 => FitKind::Polynomial(1),
            TransformSpec::P2 => FitKind::Polynomial(2),
            TransformSpec::P3 => FitKind::Polynomial(3),
            TransformSpec::Tps => FitKind::ThinPlateSpline,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResampleSpec {
    #[default]
    Near,
    Bilinear,
    Cubic,
    CubicSpline,
}

impl ResampleSpec {
    /// `lanczos` is too slow for full-size scans and, like unknown kernels,
    /// resolves to nearest neighbour.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "bilinear" => ResampleSpec::Bilinear,
            "cubic" => ResampleSpec::Cubic,
            "cubicspline" => ResampleSpec::CubicSpline,
            _ => ResampleSpec::Near,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResampleSpec::Near => "near",
            ResampleSpec::Bilinear => "bilinear",
            ResampleSpec::Cubic => "cubic",
            ResampleSpec::CubicSpline => "cubicspline",
        }
    }

    pub fn gdal_kernel(self) -> &'static str {
        self.as_str()
    }
}

#[derive(Debug, Clone, Default, Deserialize, utoipa::ToSchema)]
pub struct RectifyOptions {
    #[serde(default)]
    pub transform_options: Option<String>,
    #[serde(default)]
    pub resample_options: Option<String>,
    #[serde(default)]
    pub use_mask: bool,
}

impl RectifyOptions {
    pub fn transform(&self) -> Option<TransformSpec> {
        self.transform_options.as_deref().map(TransformSpec::parse)
    }

    pub fn resample(&self) -> Option<ResampleSpec> {
        self.resample_options.as_deref().map(ResampleSpec::parse)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub struct RectifyJob {
    pub id: Uuid,
    pub map_id: Uuid,
    pub status: JobStatus,
    pub transform_options: String,
    pub resample_options: String,
    pub use_mask: bool,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    /// Tool output on success, raw diagnostic on failure.
    pub output: Option<String>,
}

/// Job handles in submission order. Queued and running jobs are always kept.
struct JobTable {
    jobs: HashMap<Uuid, RectifyJob>,
    order: VecDeque<Uuid>,
    capacity: usize,
}

impl JobTable {
    fn new(capacity: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, id: &Uuid) -> Option<&RectifyJob> {
        self.jobs.get(id)
    }

    fn get_mut(&mut self, id: &Uuid) -> Option<&mut RectifyJob> {
        self.jobs.get_mut(id)
    }

    fn insert(&mut self, job: RectifyJob) {
        let id = job.id;
        if self.jobs.insert(id, job).is_none() {
            self.order.push_back(id);
        }
        self.prune();
    }

    fn prune(&mut self) {
        let mut excess = self.jobs.len().saturating_sub(self.capacity);
        if excess == 0 {
            return;
        }
        let jobs = &mut self.jobs;
        self.order.retain(|id| {
            if excess == 0 {
                return true;
            }
            match jobs.get(id) {
                Some(job) if job.status.is_finished() => {
                    jobs.remove(id);
                    excess -= 1;
                    false
                }
                Some(_) => true,
                None => false,
            }
        });
    }
}

/// A map that has been moved to `warping` and is waiting for its warp to run.
/// Holds the map's raster lock until the warp finishes.
pub struct PreparedWarp {
    pub job: RectifyJob,
    request: WarpRequest,
    _raster: OwnedMutexGuard<()>,
}

#[derive(Clone)]
pub struct RectificationService {
    maps: MapRegistry,
    tools: Arc<dyn RasterTools>,
    jobs: Arc<Mutex<JobTable>>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    warped_dir: PathBuf,
    work_dir: PathBuf,
}

impl RectificationService {
    pub fn new(
        maps: MapRegistry,
        tools: Arc<dyn RasterTools>,
        max_concurrent: usize,
        warped_dir: PathBuf,
        work_dir: PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            maps,
            tools,
            jobs: Arc::new(Mutex::new(JobTable::new(MAX_RETAINED_JOBS))),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            cancel,
            warped_dir,
            work_dir,
        }
    }

    fn jobs_lock(&self) -> MutexGuard<'_, JobTable> {
        match self.jobs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Recovering rectify job store from poisoned lock");
                poisoned.into_inner()
            }
        }
    }

    pub fn get_job(&self, job_id: Uuid) -> Option<RectifyJob> {
        self.jobs_lock().get(&job_id).cloned()
    }

    fn update_job(&self, job_id: Uuid, f: impl FnOnce(&mut RectifyJob)) {
        if let Some(job) = self.jobs_lock().get_mut(&job_id) {
            f(job);
        }
    }

    /// Validates preconditions and moves the map to `warping` in one step.
    ///
    /// Checks run in a fixed order: control point count, `Busy`, `Locked`,
    /// raster readiness, then mask presence. A failure leaves the map as it was.
    pub fn begin(&self, map_id: Uuid, options: &RectifyOptions) -> Result<PreparedWarp, WarpError> {
        let output = self.warped_dir.join(format!("{map_id}.tif"));
        let work_dir = self.work_dir.clone();
        let (request, raster) = self.maps.update_exclusive(map_id, |record| {
            let hard = record.gcps.hard_count();
            if hard < MIN_HARD_GCPS {
                return Err(WarpError::InsufficientControlPoints { hard });
            }
            match record.status {
                MapStatus::Warping => return Err(WarpError::Busy),
                status if status.is_locked() => return Err(WarpError::Locked { status }),
                status if !status.is_ready() => return Err(WarpError::Unavailable { status }),
                _ => {}
            }
            let upload = record
                .upload
                .clone()
                .ok_or(WarpError::Unavailable {
                    status: record.status,
                })?;
            let source = if options.use_mask {
                record
                    .masked_raster
                    .clone()
                    .filter(|path| path.is_file())
                    .ok_or(WarpError::MaskNotFound)?
            } else {
                upload.path
            };

            if let Some(transform) = options.transform() {
                record.transform_options = transform;
            }
            if let Some(resample) = options.resample() {
                record.resample_options = resample;
            }
            record.transition_to(MapStatus::Warping)?;

            Ok(WarpRequest {
                map_id,
                source,
                gcps: record.gcps.hard_points().cloned().collect(),
                srs: record.srs.clone(),
                transform: record.transform_options,
                resample: record.resample_options,
                use_mask: options.use_mask,
                output,
                work_dir,
            })
        })?;

        let job = RectifyJob {
            id: Uuid::new_v4(),
            map_id,
            status: JobStatus::Queued,
            transform_options: request.transform.as_str().to_string(),
            resample_options: request.resample.as_str().to_string(),
            use_mask: request.use_mask,
            created_at: Utc::now().to_rfc3339(),
            started_at: None,
            finished_at: None,
            output: None,
        };
        self.jobs_lock().insert(job.clone());
        tracing::info!(
            map_id = %map_id,
            job_id = %job.id,
            transform = request.transform.as_str(),
            resample = request.resample.as_str(),
            use_mask = request.use_mask,
            "map moved to warping"
        );

        Ok(PreparedWarp {
            job,
            request,
            _raster: raster,
        })
    }

    /// Runs the warp for a prepared map and records the outcome on the map.
    pub async fn execute(&self, prepared: PreparedWarp) -> RectifyJob {
        let job_id = prepared.job.id;
        let map_id = prepared.request.map_id;

        let permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => permit.ok(),
            _ = self.cancel.cancelled() => None,
        };
        let result = match permit {
            Some(_permit) => {
                self.update_job(job_id, |job| {
                    job.status = JobStatus::Running;
                    job.started_at = Some(Utc::now().to_rfc3339());
                });
                self.tools
                    .warp(&prepared.request, self.cancel.child_token())
                    .await
            }
            None => Err(WarpError::tool("gdalwarp", "warp cancelled before it started")),
        };

        let outcome = match result {
            Ok(output) => self
                .maps
                .update(map_id, |record| {
                    record.mark_warped(
                        GeoBounds {
                            bbox: output.bbox,
                            srid: 4326,
                        },
                        WarpedArtifacts {
                            raster: output.raster.clone(),
                            aux: output.aux.clone(),
                        },
                    )
                })
                .map(|()| output.log),
            Err(err) => Err(err),
        };

        let (status, message) = match outcome {
            Ok(log) => {
                tracing::info!(map_id = %map_id, job_id = %job_id, "map warped");
                (JobStatus::Success, log)
            }
            Err(err) => {
                let message = match &err {
                    WarpError::ExternalToolFailure { diagnostic, .. } => diagnostic.clone(),
                    other => other.to_string(),
                };
                tracing::warn!(map_id = %map_id, job_id = %job_id, error = %err, "warp failed");
                if let Err(mark_err) = self
                    .maps
                    .update(map_id, |record| record.transition_to(MapStatus::Failed))
                {
                    tracing::warn!(map_id = %map_id, error = %mark_err, "failed to mark map as failed");
                }
                (JobStatus::Failed, message)
            }
        };

        let mut finished = self
            .get_job(job_id)
            .unwrap_or_else(|| prepared.job.clone());
        finished.status = status;
        finished.finished_at = Some(Utc::now().to_rfc3339());
        finished.output = Some(message);
        self.jobs_lock().insert(finished.clone());
        drop(prepared);
        finished
    }

    /// Starts a rectification and returns its job handle without waiting.
    pub fn rectify(&self, map_id: Uuid, options: &RectifyOptions) -> Result<RectifyJob, WarpError> {
        let prepared = self.begin(map_id, options)?;
        let job = prepared.job.clone();
        let service = self.clone();
        tokio::spawn(async move {
            service.execute(prepared).await;
        });
        Ok(job)
    }

    /// A map left in `warping` by a previous process has no live warp.
    pub fn recover_interrupted(&self) -> usize {
        let mut recovered = 0;
        for record in self.maps.list() {
            if record.status != MapStatus::Warping {
                continue;
            }
            match self
                .maps
                .update(record.id, |r| r.transition_to(MapStatus::Failed))
            {
                Ok(()) => {
                    recovered += 1;
                    tracing::warn!(map_id = %record.id, "interrupted warp marked as failed");
                }
                Err(err) => {
                    tracing::warn!(map_id = %record.id, error = %err, "failed to recover map");
                }
            }
        }
        recovered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{add_hard_gcps, register_map, test_state};
    use std::sync::atomic::Ordering;

    #[test]
    fn option_parsing_falls_back() {
        assert_eq!(TransformSpec::parse("TPS"), TransformSpec::Tps);
        assert_eq!(TransformSpec::parse("p4"), TransformSpec::Auto);
        assert_eq!(ResampleSpec::parse("lanczos"), ResampleSpec::Near);
        assert_eq!(ResampleSpec::parse("cubicspline"), ResampleSpec::CubicSpline);
        assert_eq!(ResampleSpec::parse(""), ResampleSpec::Near);
        assert_eq!(TransformSpec::Auto.fit_kind(7), FitKind::Polynomial(2));
    }

    #[tokio::test]
    async fn too_few_hard_points_leaves_status_unchanged() {
        let (state, _tools) = test_state();
        let map_id = register_map(&state);
        add_hard_gcps(&state, map_id, 2);

        for _ in 0..2 {
            let err = state
                .rectifier
                .rectify(map_id, &RectifyOptions::default())
                .unwrap_err();
            assert!(matches!(err, WarpError::InsufficientControlPoints { hard: 2 }));
        }
        assert_eq!(state.maps.get(map_id).unwrap().status, MapStatus::Available);
    }

    #[tokio::test]
    async fn published_maps_are_locked() {
        let (state, _tools) = test_state();
        let map_id = register_map(&state);
        add_hard_gcps(&state, map_id, 3);
        let prepared = state
            .rectifier
            .begin(map_id, &RectifyOptions::default())
            .unwrap();
        state.rectifier.execute(prepared).await;

        for status in [MapStatus::Publishing, MapStatus::Published] {
            state
                .maps
                .update(map_id, |record| {
                    if record.status == MapStatus::Warped {
                        record.transition_to(MapStatus::Publishing)?;
                    }
                    if status == MapStatus::Published {
                        record.transition_to(MapStatus::Published)?;
                    }
                    Ok(())
                })
                .unwrap();
            let err = state
                .rectifier
                .rectify(map_id, &RectifyOptions::default())
                .unwrap_err();
            assert!(matches!(err, WarpError::Locked { .. }));
            assert_eq!(state.maps.get(map_id).unwrap().status, status);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_rectify_admits_exactly_one() {
        let (state, _tools) = test_state();
        let map_id = register_map(&state);
        add_hard_gcps(&state, map_id, 4);

        let barrier = Arc::new(tokio::sync::Barrier::new(8));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let rectifier = state.rectifier.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                rectifier
                    .begin(map_id, &RectifyOptions::default())
                    .map(|prepared| prepared.job.id)
            }));
        }

        let mut admitted = 0;
        let mut busy = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => admitted += 1,
                Err(WarpError::Busy) => busy += 1,
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(busy, 7);
        assert_eq!(state.maps.get(map_id).unwrap().status, MapStatus::Warping);
    }

    #[tokio::test]
    async fn gaining_control_points_allows_warp() {
        let (state, tools) = test_state();
        let map_id = register_map(&state);

        let err = state
            .rectifier
            .begin(map_id, &RectifyOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, WarpError::InsufficientControlPoints { hard: 0 }));

        add_hard_gcps(&state, map_id, 3);
        let options = RectifyOptions {
            transform_options: Some("p1".to_string()),
            resample_options: Some("lanczos".to_string()),
            use_mask: false,
        };
        let prepared = state.rectifier.begin(map_id, &options).unwrap();
        let record = state.maps.get(map_id).unwrap();
        assert_eq!(record.status, MapStatus::Warping);
        assert!(record.bbox.is_none());
        assert_eq!(record.transform_options, TransformSpec::P1);
        assert_eq!(record.resample_options, ResampleSpec::Near);

        let job = state.rectifier.execute(prepared).await;
        assert_eq!(job.status, JobStatus::Success);
        let record = state.maps.get(map_id).unwrap();
        assert_eq!(record.status, MapStatus::Warped);
        assert_eq!(record.bbox.unwrap().bbox, tools.bbox());
        assert!(record.warped.is_some());
        assert_eq!(tools.warp_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tool_failure_marks_map_failed_with_diagnostic() {
        let (state, tools) = test_state();
        let map_id = register_map(&state);
        add_hard_gcps(&state, map_id, 3);
        tools.fail_with("ERROR 1: Unable to compute a transformation");

        let prepared = state
            .rectifier
            .begin(map_id, &RectifyOptions::default())
            .unwrap();
        let job = state.rectifier.execute(prepared).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.output.as_deref(),
            Some("ERROR 1: Unable to compute a transformation")
        );
        let record = state.maps.get(map_id).unwrap();
        assert_eq!(record.status, MapStatus::Failed);
        assert!(record.bbox.is_none());

        // Failed maps can be retried.
        tools.succeed();
        let prepared = state
            .rectifier
            .begin(map_id, &RectifyOptions::default())
            .unwrap();
        assert_eq!(state.rectifier.execute(prepared).await.status, JobStatus::Success);
    }

    #[tokio::test]
    async fn use_mask_requires_masked_raster() {
        let (state, _tools) = test_state();
        let map_id = register_map(&state);
        add_hard_gcps(&state, map_id, 3);
        let options = RectifyOptions {
            use_mask: true,
            ..RectifyOptions::default()
        };
        assert!(matches!(
            state.rectifier.begin(map_id, &options),
            Err(WarpError::MaskNotFound)
        ));
        assert_eq!(state.maps.get(map_id).unwrap().status, MapStatus::Available);
    }

    #[tokio::test]
    async fn rectify_returns_job_handle_and_completes_in_background() {
        let (state, _tools) = test_state();
        let map_id = register_map(&state);
        add_hard_gcps(&state, map_id, 3);
        let job = state
            .rectifier
            .rectify(map_id, &RectifyOptions::default())
            .unwrap();
        assert_eq!(job.status, JobStatus::Queued);

        for _ in 0..100 {
            if state
                .rectifier
                .get_job(job.id)
                .is_some_and(|j| j.status == JobStatus::Success)
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(
            state.rectifier.get_job(job.id).unwrap().status,
            JobStatus::Success
        );
        assert_eq!(state.maps.get(map_id).unwrap().status, MapStatus::Warped);
    }

    fn job_with(status: JobStatus) -> RectifyJob {
        RectifyJob {
            id: Uuid::new_v4(),
            map_id: Uuid::new_v4(),
            status,
            transform_options: "auto".to_string(),
            resample_options: "near".to_string(),
            use_mask: false,
            created_at: Utc::now().to_rfc3339(),
            started_at: None,
            finished_at: None,
            output: None,
        }
    }

    #[test]
    fn job_table_forgets_oldest_finished_jobs_first() {
        let mut table = JobTable::new(2);
        let running = job_with(JobStatus::Running);
        let oldest = job_with(JobStatus::Success);
        let older = job_with(JobStatus::Failed);
        let newest = job_with(JobStatus::Success);
        for job in [&running, &oldest, &older, &newest] {
            table.insert(job.clone());
        }

        assert_eq!(table.jobs.len(), 2);
        assert!(table.get(&running.id).is_some());
        assert!(table.get(&oldest.id).is_none());
        assert!(table.get(&older.id).is_none());
        assert!(table.get(&newest.id).is_some());
        assert_eq!(table.order.len(), 2);
    }

    #[test]
    fn job_table_keeps_unfinished_jobs_past_capacity() {
        let mut table = JobTable::new(1);
        let queued: Vec<RectifyJob> = (0..3).map(|_| job_with(JobStatus::Queued)).collect();
        for job in &queued {
            table.insert(job.clone());
        }
        assert_eq!(table.jobs.len(), 3);

        // Finishing one makes it eligible; re-inserting keeps its slot.
        let mut done = queued[1].clone();
        done.status = JobStatus::Success;
        table.insert(done);
        assert_eq!(table.jobs.len(), 2);
        assert!(table.get(&queued[1].id).is_none());
        assert_eq!(table.order.len(), 2);
    }

    #[tokio::test]
    async fn interrupted_warps_are_failed_on_recovery() {
        let (state, _tools) = test_state();
        let map_id = register_map(&state);
        state
            .maps
            .update(map_id, |record| record.transition_to(MapStatus::Warping))
            .unwrap();
        assert_eq!(state.rectifier.recover_interrupted(), 1);
        assert_eq!(state.maps.get(map_id).unwrap().status, MapStatus::Failed);
    }
}
