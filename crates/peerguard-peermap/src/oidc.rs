//! OIDC network join flow
//!
//! When no valid network secret is on disk, the node asks the peermap
//! server for a join session: the server answers with an authentication
//! URL the operator opens in a browser, and the node polls until the grant
//! comes through (or gives up after two minutes).

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::{PeermapError, PeermapResult};
use crate::secret::NetworkSecret;

/// How long the operator has to complete the browser authentication.
pub const JOIN_FLOW_TIMEOUT: Duration = Duration::from_secs(120);

/// Poll cadence while waiting for the grant.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct JoinResponse {
    join_id: String,
    auth_url: String,
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    granted: bool,
    #[serde(default)]
    secret: Option<NetworkSecret>,
}

/// An in-flight join request.
pub struct JoinSession {
    auth_url: String,
    poll_url: String,
    client: reqwest::Client,
}

/// Open a join session against the rendezvous server.
pub async fn join_oidc(server: &Url) -> PeermapResult<JoinSession> {
    let base = http_base(server)?;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;

    let response: JoinResponse = client
        .post(format!("{base}/api/join"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    debug!("join session {} opened", response.join_id);

    Ok(JoinSession {
        auth_url: response.auth_url,
        poll_url: format!("{base}/api/join/{}", response.join_id),
        client,
    })
}

impl JoinSession {
    /// The URL the operator must open to authenticate.
    pub fn auth_url(&self) -> &str {
        &self.auth_url
    }

    /// Poll until the join is granted, failing with
    /// [`PeermapError::JoinTimeout`] after `timeout`.
    pub async fn wait(&self, timeout: Duration) -> PeermapResult<NetworkSecret> {
        tokio::time::timeout(timeout, self.poll())
            .await
            .map_err(|_| PeermapError::JoinTimeout)?
    }

    async fn poll(&self) -> PeermapResult<NetworkSecret> {
        loop {
            let response: PollResponse = self
                .client
                .get(&self.poll_url)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            if response.granted {
                if let Some(secret) = response.secret {
                    return Ok(secret);
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Map the rendezvous URL (`ws://`/`wss://` or plain http) onto the HTTP
/// origin used by the join endpoints.
fn http_base(server: &Url) -> PeermapResult<String> {
    let scheme = match server.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        other => {
            return Err(PeermapError::InvalidUrl(format!(
                "unsupported rendezvous scheme {other}"
            )))
        }
    };
    let host = server
        .host_str()
        .ok_or_else(|| PeermapError::InvalidUrl("rendezvous URL has no host".into()))?;
    let port = server
        .port()
        .map(|p| format!(":{p}"))
        .unwrap_or_default();
    Ok(format!("{scheme}://{host}{port}"))
}
