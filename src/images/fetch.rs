use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Image request failed with status: {0}")]
    StatusError(reqwest::StatusCode),

    #[error("Image is larger than {limit} bytes")]
    TooLarge { limit: usize },
}

/// Downloads source images, bounded in both time and size.
#[derive(Clone)]
pub struct ImageFetcher {
    client: reqwest::Client,
    max_size: usize,
}

impl ImageFetcher {
    pub fn new(timeout: Duration, max_size: usize, user_agent: &str) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;

        Ok(Self { client, max_size })
    }

    // Fetch an image from a URL
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        log::info!("Fetching {}", url);

        let mut response = self
            .client
            .get(url)
            .header("Accept", "image/*,*/*;q=0.8")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            log::error!("Image request for {} failed with status: {}", url, status);
            return Err(FetchError::StatusError(status));
        }

        // Reject early when the server announces an oversized body
        if let Some(length) = response.content_length() {
            if length > self.max_size as u64 {
                return Err(FetchError::TooLarge { limit: self.max_size });
            }
        }

        let mut image_data = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if image_data.len() + chunk.len() > self.max_size {
                return Err(FetchError::TooLarge { limit: self.max_size });
            }
            image_data.extend_from_slice(&chunk);
        }

        log::debug!("Fetched {} bytes from {}", image_data.len(), url);

        Ok(image_data)
    }
}
