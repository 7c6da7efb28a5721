use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use camino::Utf8PathBuf;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, info};

use crate::error::CoidbError;
use crate::fs_util::{persist, staging_file};

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadJob {
    pub url: String,
    pub destination: Utf8PathBuf,
}

pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str, destination: &Path) -> Result<(), CoidbError>;
}

impl<T: Fetcher + ?Sized> Fetcher for &T {
    fn fetch(&self, url: &str, destination: &Path) -> Result<(), CoidbError> {
        (**self).fetch(url, destination)
    }
}

pub fn run<F: Fetcher + ?Sized>(fetcher: &F, job: &DownloadJob) -> Result<(), CoidbError> {
    info!(url = %job.url, destination = %job.destination, "downloading source archive");
    let temp = staging_file(&job.destination)?;
    fetcher.fetch(&job.url, temp.path())?;
    persist(temp, &job.destination)
}

/// Fetches `http(s)://` sources over the network and copies `file://` or plain paths.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, CoidbError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("coidb/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| CoidbError::Filesystem(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .timeout(Option::<Duration>::None)
            .build()
            .map_err(|err| CoidbError::Fetch {
                url: String::new(),
                message: err.to_string(),
            })?;
        Ok(Self { client })
    }

    fn send_with_retries(&self, url: &str) -> Result<reqwest::blocking::Response, CoidbError> {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 500;
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        debug!(url, status, attempt, "retrying download");
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        debug!(url, %err, attempt, "retrying download");
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(CoidbError::Fetch {
                        url: url.to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, destination: &Path) -> Result<(), CoidbError> {
        if let Some(source) = local_source(url) {
            fs::copy(&source, destination).map_err(|err| CoidbError::Fetch {
                url: url.to_string(),
                message: err.to_string(),
            })?;
            return Ok(());
        }

        let mut response = self.send_with_retries(url)?;
        if !response.status().is_success() {
            return Err(CoidbError::FetchStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        let mut file = File::create(destination)
            .map_err(|err| CoidbError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut file).map_err(|err| CoidbError::Fetch {
            url: url.to_string(),
            message: err.to_string(),
        })?;
        Ok(())
    }
}

fn local_source(url: &str) -> Option<PathBuf> {
    if let Some(path) = url.strip_prefix("file://") {
        return Some(PathBuf::from(path));
    }
    (!url.contains("://")).then(|| PathBuf::from(url))
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}
