//! # uploader
//!
//! Log uploader: ships a local log file to the configured logging server
//! over TLS with HTTP Basic auth. Triggered by a server property command;
//! failures are logged and reported, never fatal.

use std::path::Path;

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use crate::props::{PropertyStore, PROP_LOGGING_PASS, PROP_LOGGING_SERVER, PROP_LOGGING_USER};

pub async fn upload_log(props: Arc<PropertyStore>, log_path: &Path) -> Result<()> {
    let server = props.get_string(PROP_LOGGING_SERVER, "");
    if server.is_empty() {
        bail!("no logging server configured");
    }
    let url = if server.starts_with("http") {
        server
    } else {
        format!("https://{server}")
    };

    let body = tokio::fs::read(log_path)
        .await
        .with_context(|| format!("reading {}", log_path.display()))?;
    info!("uploading {} bytes of logs to {url}", body.len());

    let client = reqwest::Client::builder()
        .use_rustls_tls()
        .build()
        .context("building https client")?;
    let mut req = client.post(&url).body(body);
    let user = props.get_string(PROP_LOGGING_USER, "");
    if !user.is_empty() {
        let pass = props.get_string(PROP_LOGGING_PASS, "");
        req = req.basic_auth(user, (!pass.is_empty()).then_some(pass));
    }
    let response = req.send().await.context("log upload request")?;
    if !response.status().is_success() {
        bail!("log server answered {}", response.status());
    }
    Ok(())
}

/// Fire-and-forget wrapper for the property command path.
pub fn spawn_upload(props: Arc<PropertyStore>, log_path: std::path::PathBuf) {
    tokio::spawn(async move {
        if let Err(e) = upload_log(props, &log_path).await {
            warn!("log upload failed: {e:#}");
        }
    });
}
