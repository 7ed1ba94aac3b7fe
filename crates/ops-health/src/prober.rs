//! C1 — bounded HTTP health probing with retry/backoff.

use std::time::Duration;
use tracing::{debug, warn};

/// Retry/backoff configuration for a health probe.
#[derive(Debug, Clone, Copy)]
pub struct HealthCheckConfig {
    /// Total number of attempts (not "extra" retries beyond the first).
    pub retries: u32,
    pub delay_seconds: u64,
    pub timeout_seconds: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            delay_seconds: 10,
            timeout_seconds: 5,
        }
    }
}

/// Issues GET `url`, retrying on non-200 responses or transport errors.
/// Sleeps `delay_seconds` between attempts only — never after the last one.
pub async fn check_service_health(client: &reqwest::Client, url: &str, cfg: HealthCheckConfig) -> bool {
    let timeout = Duration::from_secs(cfg.timeout_seconds);

    for attempt in 1..=cfg.retries.max(1) {
        let outcome = client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map(|resp| resp.status().is_success());

        match outcome {
            Ok(true) => {
                debug!(url, attempt, "health probe succeeded");
                return true;
            }
            Ok(false) => warn!(url, attempt, "health probe returned non-200"),
            Err(e) => warn!(url, attempt, error = %e, "health probe transport error"),
        }

        if attempt < cfg.retries.max(1) {
            tokio::time::sleep(Duration::from_secs(cfg.delay_seconds)).await;
        }
    }

    false
}

/// Checks each URL sequentially, short-circuiting on the first failure.
/// An empty slice trivially succeeds.
pub async fn check_all_services(client: &reqwest::Client, urls: &[String], cfg: HealthCheckConfig) -> bool {
    for url in urls {
        if !check_service_health(client, url, cfg).await {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn succeeds_on_first_200() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let cfg = HealthCheckConfig { retries: 3, delay_seconds: 0, timeout_seconds: 5 };
        assert!(check_service_health(&client, &server.uri(), cfg).await);
    }

    #[tokio::test]
    async fn single_retry_gives_up_after_one_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let cfg = HealthCheckConfig { retries: 1, delay_seconds: 5, timeout_seconds: 1 };
        let start = std::time::Instant::now();
        assert!(!check_service_health(&client, &server.uri(), cfg).await);
        // no sleep should have occurred after the only (losing) attempt
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn check_all_short_circuits_on_first_failure() {
        let good = MockServer::start().await;
        Mock::given(method("GET")).respond_with(ResponseTemplate::new(200)).mount(&good).await;
        let bad = MockServer::start().await;
        Mock::given(method("GET")).respond_with(ResponseTemplate::new(500)).mount(&bad).await;

        let client = reqwest::Client::new();
        let cfg = HealthCheckConfig { retries: 1, delay_seconds: 0, timeout_seconds: 1 };
        let urls = vec![bad.uri(), good.uri()];
        assert!(!check_all_services(&client, &urls, cfg).await);
    }

    #[tokio::test]
    async fn check_all_empty_is_trivially_true() {
        let client = reqwest::Client::new();
        let cfg = HealthCheckConfig::default();
        assert!(check_all_services(&client, &[], cfg).await);
    }
}
