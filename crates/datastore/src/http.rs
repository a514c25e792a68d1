//! Read-only store for single-file NetCDF datasets served over HTTP.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use cube_common::{CubeError, CubeResult, DataCube, EvalContext};

use crate::{apply_open_params, netcdf_io, DataStore, OpenParams};

/// Fetches `{base_url}/{data_id}` into a temp file and opens it as NetCDF.
/// Transient fetch failures are retried with a fixed delay.
pub struct HttpStore {
    name: String,
    base_url: String,
    client: reqwest::Client,
    max_retries: u32,
    retry_delay: Duration,
}

impl HttpStore {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            max_retries,
            retry_delay,
        }
    }

    fn url(&self, data_id: &str) -> String {
        format!("{}/{}", self.base_url, data_id)
    }

    fn access_err(&self, data_id: &str, message: String) -> CubeError {
        CubeError::SourceAccess {
            store: self.name.clone(),
            data_id: data_id.to_string(),
            message,
        }
    }

    async fn fetch_bytes(&self, data_id: &str) -> CubeResult<bytes::Bytes> {
        let url = self.url(data_id);
        let mut last_error = String::new();
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
            }
            match self.client.get(&url).send().await {
                Ok(response) => match response.error_for_status() {
                    Ok(response) => match response.bytes().await {
                        Ok(body) => {
                            debug!(store = %self.name, %url, bytes = body.len(), "fetched dataset");
                            return Ok(body);
                        }
                        Err(e) => last_error = e.to_string(),
                    },
                    Err(e) => last_error = e.to_string(),
                },
                Err(e) => last_error = e.to_string(),
            }
            warn!(
                store = %self.name,
                %url,
                attempt = attempt + 1,
                error = %last_error,
                "fetch attempt failed"
            );
        }
        Err(self.access_err(
            data_id,
            format!(
                "giving up after {} attempts: {last_error}",
                self.max_retries + 1
            ),
        ))
    }

    fn temp_path(data_id: &str) -> PathBuf {
        let sanitized: String = data_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
            .collect();
        std::env::temp_dir().join(format!(
            "cubegen_{}_{:?}_{sanitized}",
            std::process::id(),
            std::thread::current().id()
        ))
    }
}

#[async_trait]
impl DataStore for HttpStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open_data(&self, data_id: &str, params: &OpenParams) -> CubeResult<DataCube> {
        let body = self.fetch_bytes(data_id).await?;

        // The NetCDF library only reads from paths, so stage the response
        // in a temp file.
        let path = Self::temp_path(data_id);
        std::fs::write(&path, &body).map_err(|e| self.access_err(data_id, e.to_string()))?;
        let result = netcdf_io::read_cube(&path, &self.name, data_id);
        let _ = std::fs::remove_file(&path);

        apply_open_params(result?, params)
    }

    async fn write_data(
        &self,
        _cube: &DataCube,
        data_id: &str,
        _ctx: &EvalContext,
    ) -> CubeResult<()> {
        Err(CubeError::Write {
            data_id: data_id.to_string(),
            message: format!("store '{}' is read-only", self.name),
        })
    }

    async fn delete_data(&self, data_id: &str) -> CubeResult<()> {
        Err(CubeError::Write {
            data_id: data_id.to_string(),
            message: format!("store '{}' is read-only", self.name),
        })
    }

    async fn has_data(&self, data_id: &str) -> bool {
        match self.client.head(self.url(data_id)).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
