use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;

use crate::cache::{ArtifactCache, CacheKey};
use crate::config::AppConfig;
use crate::images::{FetchError, FetchResizePipeline, ImageFetcher, ImagePipeline};
use crate::jobs::{Ensured, JobCoordinator, ProductionError, WaitOutcome};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("No artifact and no job for this key")]
    NotFound,

    #[error("Timed out waiting for the artifact")]
    Timeout,

    #[error("Production failed: {0}")]
    ProductionFailed(#[from] ProductionError),

    #[error("Artifact {0} was evicted before it could be read")]
    ArtifactMissing(CacheKey),
}

/// Whether a caller waits for production to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Sync,
    Async,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub key: CacheKey,
    /// `true` when the artifact was already cached before this call.
    pub cached: bool,
}

/// Resolves resize requests against the cache and the job coordinator, and
/// serves artifacts by key.
#[derive(Clone)]
pub struct ResizeService {
    coordinator: JobCoordinator,
    pipeline: Arc<dyn ImagePipeline>,
    wait_timeout: Duration,
}

impl ResizeService {
    pub fn new(
        coordinator: JobCoordinator,
        pipeline: Arc<dyn ImagePipeline>,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            coordinator,
            pipeline,
            wait_timeout,
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, FetchError> {
        let fetcher = ImageFetcher::new(
            config.fetch_timeout(),
            config.max_image_size,
            &config.user_agent,
        )?;
        let pipeline = FetchResizePipeline::new(fetcher, config.jpeg_quality);
        let coordinator = JobCoordinator::new(
            ArtifactCache::new(config.cache_capacity),
            config.fetch_timeout(),
        );

        Ok(Self::new(coordinator, Arc::new(pipeline), config.wait_timeout()))
    }

    fn cache(&self) -> &ArtifactCache {
        self.coordinator.cache()
    }

    /// Caller-supplied deadlines never exceed the configured wait timeout.
    fn deadline(&self, requested: Option<Duration>) -> Duration {
        requested.map_or(self.wait_timeout, |d| d.min(self.wait_timeout))
    }

    pub async fn resolve(
        &self,
        url: &str,
        width: u32,
        height: u32,
        mode: Mode,
        deadline: Option<Duration>,
    ) -> Result<Resolved, ServiceError> {
        let key = CacheKey::derive(url, width, height);

        if self.cache().get(&key).is_some() {
            return Ok(Resolved { key, cached: true });
        }

        let pipeline = self.pipeline.clone();
        let source = url.to_string();
        let job = match self
            .coordinator
            .ensure(&key, move || pipeline.produce(&source, width, height))
        {
            Ensured::Cached => return Ok(Resolved { key, cached: true }),
            Ensured::Joined(job) | Ensured::Started(job) => job,
        };

        if mode == Mode::Async {
            return Ok(Resolved { key, cached: false });
        }

        match job.wait(self.deadline(deadline)).await {
            WaitOutcome::Ready(Ok(())) => {
                if self.cache().contains(&key) {
                    Ok(Resolved { key, cached: false })
                } else {
                    log::error!("Job for {} succeeded but the artifact is not cached", key);
                    Err(ServiceError::ArtifactMissing(key))
                }
            }
            WaitOutcome::Ready(Err(err)) => Err(err.into()),
            WaitOutcome::DeadlineExceeded => {
                log::warn!("Gave up waiting for {} ({})", url, key);
                Err(ServiceError::Timeout)
            }
        }
    }

    /// Resolve every URL independently. The result has one entry per URL, in
    /// input order, and a failing URL never affects its siblings.
    pub async fn resolve_batch(
        &self,
        urls: &[String],
        width: u32,
        height: u32,
        mode: Mode,
        deadline: Option<Duration>,
    ) -> Vec<Result<Resolved, ServiceError>> {
        let results = join_all(
            urls.iter()
                .map(|url| self.resolve(url, width, height, mode, deadline)),
        )
        .await;

        for (url, result) in urls.iter().zip(&results) {
            if let Err(err) = result {
                log::warn!("Failed to resize {}: {}", url, err);
            }
        }

        results
    }

    /// Serve a previously issued key, waiting on its job if it is still running.
    pub async fn read_artifact(
        &self,
        key: &CacheKey,
        deadline: Option<Duration>,
    ) -> Result<Arc<[u8]>, ServiceError> {
        if let Some(data) = self.cache().get(key) {
            return Ok(data);
        }

        let Some(job) = self.coordinator.lookup(key) else {
            // The job may have finished between the two lookups above.
            return self.cache().get(key).ok_or(ServiceError::NotFound);
        };

        log::info!("Waiting for image {}", key);

        match job.wait(self.deadline(deadline)).await {
            WaitOutcome::Ready(Ok(())) => self
                .cache()
                .get(key)
                .ok_or_else(|| ServiceError::ArtifactMissing(key.clone())),
            WaitOutcome::Ready(Err(err)) => Err(err.into()),
            WaitOutcome::DeadlineExceeded => Err(ServiceError::Timeout),
        }
    }

    pub fn cached_artifacts(&self) -> usize {
        self.cache().len()
    }

    pub fn jobs_in_flight(&self) -> usize {
        self.coordinator.in_flight()
    }
}
