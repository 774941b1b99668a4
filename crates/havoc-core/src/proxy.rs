//! Client for the upstream intercepting proxy's options API.
//!
//! All requests are routed *through* the proxy itself; the magic hostname
//! below is terminated by the proxy's controller addon rather than being
//! resolved.

use crate::HarnessError;
use serde_json::json;
use std::time::Duration;
use tracing::info;

/// Must match the magic URL the proxy's controller addon answers on.
const MAGIC_MITM_URL: &str = "http://mitm.code";

const PROXY_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for locking and unlocking proxy options.
#[derive(Debug, Clone)]
pub struct ProxyClient {
    http: reqwest::Client,
}

impl ProxyClient {
    pub fn new(proxy_url: &str) -> Result<Self, HarnessError> {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| HarnessError::Proxy(format!("invalid proxy url '{proxy_url}': {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(PROXY_TIMEOUT)
            .proxy(proxy)
            .build()
            .map_err(|e| HarnessError::Proxy(format!("failed to build proxy client: {e}")))?;
        Ok(Self { http })
    }

    /// Lock the proxy with the given options. The returned lock ID is an
    /// opaque byte string which must be passed back to
    /// [`ProxyClient::unlock_options`].
    pub async fn lock_options(
        &self,
        options: serde_json::Value,
    ) -> Result<Vec<u8>, HarnessError> {
        info!("Locking intercepting proxy with options {options}");
        let res = self
            .http
            .post(format!("{MAGIC_MITM_URL}/options/lock"))
            .json(&json!({ "options": options }))
            .send()
            .await
            .map_err(|e| HarnessError::Proxy(format!("lock options: {e}")))?;
        if !res.status().is_success() {
            return Err(HarnessError::Proxy(format!(
                "lock options returned HTTP {}",
                res.status()
            )));
        }
        let lock_id = res
            .bytes()
            .await
            .map_err(|e| HarnessError::Proxy(format!("lock options: {e}")))?;
        Ok(lock_id.to_vec())
    }

    /// Release a lock taken by [`ProxyClient::lock_options`]. Failing to do
    /// so leaves the proxy configured until manual intervention.
    pub async fn unlock_options(&self, lock_id: &[u8]) -> Result<(), HarnessError> {
        let res = self
            .http
            .post(format!("{MAGIC_MITM_URL}/options/unlock"))
            .header("Content-Type", "application/json")
            .body(lock_id.to_vec())
            .send()
            .await
            .map_err(|e| HarnessError::Proxy(format!("unlock options: {e}")))?;
        if !res.status().is_success() {
            return Err(HarnessError::Proxy(format!(
                "unlock options returned HTTP {}",
                res.status()
            )));
        }
        info!("Unlocked intercepting proxy");
        Ok(())
    }
}
