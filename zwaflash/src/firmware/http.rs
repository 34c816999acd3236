//! HTTP seam for release indexes, manifests and firmware downloads.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;

#[cfg(test)]
use mockall::automock;

/// Fetches resources over HTTP(S).
#[cfg_attr(test, automock)]
pub trait HttpClient {
    /// GET `url` and return the body. Non-success statuses are errors.
    fn get(&self, url: &str) -> Result<Vec<u8>>;
}

/// GET `url` and decode the body as JSON.
pub fn get_json<T: DeserializeOwned>(http: &dyn HttpClient, url: &str) -> Result<T> {
    let body = http.get(url)?;
    serde_json::from_slice(&body)
        .map_err(|e| Error::DownloadFailed(format!("Invalid JSON from {url}: {e}")))
}

/// GET `url` and decode the body as UTF-8 text.
pub fn get_text(http: &dyn HttpClient, url: &str) -> Result<String> {
    let body = http.get(url)?;
    Ok(String::from_utf8_lossy(&body).into_owned())
}

#[cfg(feature = "http")]
pub use self::blocking::ReqwestClient;

#[cfg(feature = "http")]
mod blocking {
    use super::HttpClient;
    use crate::error::{Error, Result};
    use log::debug;
    use std::time::Duration;

    /// [`HttpClient`] backed by `reqwest`'s blocking client.
    #[derive(Debug, Clone)]
    pub struct ReqwestClient {
        client: reqwest::blocking::Client,
    }

    impl ReqwestClient {
        /// Client with the crate's user agent and a 60 s timeout.
        pub fn new() -> Result<Self> {
            Self::with_timeout(Duration::from_secs(60))
        }

        /// Client with a custom request timeout.
        pub fn with_timeout(timeout: Duration) -> Result<Self> {
            let client = reqwest::blocking::Client::builder()
                .user_agent(concat!("zwaflash/", env!("CARGO_PKG_VERSION")))
                .timeout(timeout)
                .build()?;
            Ok(Self { client })
        }
    }

    impl HttpClient for ReqwestClient {
        fn get(&self, url: &str) -> Result<Vec<u8>> {
            debug!("GET {url}");
            let response = self
                .client
                .get(url)
                .send()
                .map_err(|e| Error::DownloadFailed(format!("{url}: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                return Err(Error::DownloadFailed(format!("{url}: HTTP {status}")));
            }

            let body = response
                .bytes()
                .map_err(|e| Error::DownloadFailed(format!("{url}: {e}")))?;
            debug!("Received {} bytes", body.len());
            Ok(body.to_vec())
        }
    }
}
