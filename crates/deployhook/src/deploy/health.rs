use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use super::record::StepLog;
use super::{HealthProbe, ServiceSupervisor};

const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Healthy when `GET <url>` answers 2xx.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthProbe {
    /// # Errors
    /// Returns an error if the URL is not http(s) or the HTTP client cannot be built.
    pub fn new(url: &str) -> Result<Self> {
        let url = url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            anyhow::bail!("health check URL must be http or https: {url}");
        }

        let client = reqwest::Client::builder()
            .timeout(PROBE_REQUEST_TIMEOUT)
            .build()
            .context("failed to build health check client")?;

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    fn describe(&self) -> String {
        format!("GET {}", self.url)
    }

    async fn check(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => response.status().is_success(),
            Err(error) => {
                debug!(url = %self.url, %error, "health probe failed");
                false
            }
        }
    }
}

/// Falls back to asking the supervisor whether the unit is active.
#[derive(Clone)]
pub struct SupervisorHealthProbe {
    supervisor: Arc<dyn ServiceSupervisor>,
}

impl SupervisorHealthProbe {
    pub fn new(supervisor: Arc<dyn ServiceSupervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl HealthProbe for SupervisorHealthProbe {
    fn describe(&self) -> String {
        "supervisor reports the unit active".to_string()
    }

    async fn check(&self) -> bool {
        let mut scratch = StepLog::new();
        self.supervisor
            .is_active(&mut scratch)
            .await
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_probe_requires_http_scheme() {
        assert!(HttpHealthProbe::new("ftp://localhost/health").is_err());
        let probe = HttpHealthProbe::new(" http://127.0.0.1:5000/health ").expect("valid");
        assert_eq!(probe.describe(), "GET http://127.0.0.1:5000/health");
    }

    #[tokio::test]
    async fn http_probe_reports_unreachable_service_as_unhealthy() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let probe = HttpHealthProbe::new(&format!("http://127.0.0.1:{port}/health")).expect("probe");
        assert!(!probe.check().await);
    }

    #[tokio::test]
    async fn http_probe_accepts_2xx() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let address = listener.local_addr().expect("addr");
        let app = axum::Router::new().route("/health", axum::routing::get(|| async { "ok" }));
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let probe = HttpHealthProbe::new(&format!("http://{address}/health")).expect("probe");
        assert!(probe.check().await);
    }
}
