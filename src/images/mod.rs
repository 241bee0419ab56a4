mod fetch;
pub mod tools;

use futures::future::BoxFuture;
use thiserror::Error;

pub use fetch::{FetchError, ImageFetcher};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Fetch error: {0}")]
    FetchError(#[from] FetchError),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Resize error: {0}")]
    ResizeError(String),

    #[error("Encode error: {0}")]
    EncodeError(String),
}

/// Which pipeline stage failed, kept when the error itself is flattened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    Fetch,
    Decode,
    Resize,
    Encode,
}

impl PipelineError {
    pub fn kind(&self) -> PipelineErrorKind {
        match self {
            PipelineError::FetchError(_) => PipelineErrorKind::Fetch,
            PipelineError::DecodeError(_) => PipelineErrorKind::Decode,
            PipelineError::ResizeError(_) => PipelineErrorKind::Resize,
            PipelineError::EncodeError(_) => PipelineErrorKind::Encode,
        }
    }
}

/// Produces the resized bytes for one `(url, width, height)` triple.
///
/// The returned future owns everything it needs so it can be spawned and
/// outlive the request that triggered it.
pub trait ImagePipeline: Send + Sync + 'static {
    fn produce(
        &self,
        url: &str,
        width: u32,
        height: u32,
    ) -> BoxFuture<'static, Result<Vec<u8>, PipelineError>>;
}

/// Downloads the source image, then resizes it on the blocking pool.
pub struct FetchResizePipeline {
    fetcher: ImageFetcher,
    quality: u8,
}

impl FetchResizePipeline {
    pub fn new(fetcher: ImageFetcher, quality: u8) -> Self {
        Self { fetcher, quality }
    }
}

impl ImagePipeline for FetchResizePipeline {
    fn produce(
        &self,
        url: &str,
        width: u32,
        height: u32,
    ) -> BoxFuture<'static, Result<Vec<u8>, PipelineError>> {
        let fetcher = self.fetcher.clone();
        let url = url.to_string();
        let quality = self.quality;

        Box::pin(async move {
            let original_data = fetcher.fetch(&url).await?;

            tokio::task::spawn_blocking(move || {
                tools::resize_image(&original_data, width, height, quality)
            })
            .await
            .map_err(|e| PipelineError::ResizeError(format!("Resize task failed: {}", e)))?
        })
    }
}
