use std::time::Duration;

use async_trait::async_trait;

use super::download_cache::{ArtifactFetcher, ArtifactStream, DownloadCacheError};

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(connect_timeout: Duration) -> Result<Self, DownloadCacheError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|err| DownloadCacheError::Network(err.to_string()))?;
        Ok(Self { client })
    }
}

struct ResponseStream {
    response: reqwest::Response,
}

#[async_trait]
impl ArtifactStream for ResponseStream {
    fn total_size(&self) -> Option<u64> {
        self.response.content_length()
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, DownloadCacheError> {
        self.response
            .chunk()
            .await
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .map_err(|err| DownloadCacheError::Network(err.to_string()))
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn open(&self, url: &str) -> Result<Box<dyn ArtifactStream>, DownloadCacheError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| DownloadCacheError::Network(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadCacheError::Network(format!(
                "{} answered with {}",
                url, status
            )));
        }
        Ok(Box::new(ResponseStream { response }))
    }
}
