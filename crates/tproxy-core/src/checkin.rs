//! The check-in loop: periodic metrics reporting and tunable pull from the
//! backend, modeled on the teacher's resilient-client plumbing but against a
//! distinct endpoint and response shape.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, warn};

use crate::errors::CheckinError;

/// How often the metrics-snapshot worker should call [`CheckinController::capture_metrics`].
pub const METRICS_SNAPSHOT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);
/// How often the check-in worker should call [`CheckinController::tick`].
pub const CHECKIN_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

#[derive(Debug, Clone, Serialize)]
pub struct CheckinRequest<'a> {
    pub proxy_id: &'a str,
    pub token: &'a str,
    pub hostname: &'a str,
    pub build_version: &'a str,
    pub metrics_ts: Option<i64>,
    pub metrics: Option<Value>,
    pub ephemeral: bool,
}

/// The backend's tunable push, applied to the running proxy immediately.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfiguration {
    #[serde(default)]
    pub shut_off_agents: bool,
    pub current_time: Option<i64>,
    pub rate_limit: Option<f64>,
    pub items_per_batch: Option<usize>,
    pub sampling_probability: Option<f64>,
    #[serde(default)]
    pub feature_disabled: std::collections::BTreeMap<String, bool>,
}

/// Talks to the check-in endpoint. Split from [`crate::backend_client::BackendClient`]
/// because the wire shape (one JSON document in, one tunables document out)
/// has nothing in common with entity submission.
pub trait CheckinClient: Send + Sync {
    fn checkin(
        &self,
        request: CheckinRequest<'_>,
    ) -> impl std::future::Future<Output = Result<AgentConfiguration, CheckinError>> + Send;
}

/// Production client: `POST {base_url}/daemon/{proxy_id}/checkin`.
pub struct ReqwestCheckinClient {
    client: reqwest::Client,
    base_url: Mutex<String>,
}

impl ReqwestCheckinClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: Mutex::new(base_url.into()),
        }
    }

    pub fn base_url(&self) -> String {
        self.base_url.lock().unwrap().clone()
    }

    pub fn set_base_url(&self, url: impl Into<String>) {
        *self.base_url.lock().unwrap() = url.into();
    }
}

impl CheckinClient for ReqwestCheckinClient {
    async fn checkin(&self, request: CheckinRequest<'_>) -> Result<AgentConfiguration, CheckinError> {
        let url = format!(
            "{}/daemon/{}/checkin",
            self.base_url().trim_end_matches('/'),
            request.proxy_id
        );
        let response = self
            .client
            .post(url)
            .bearer_auth(request.token)
            .json(&request)
            .send()
            .await
            .map_err(|e| CheckinError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(CheckinError::HttpError { status });
        }
        response
            .json::<AgentConfiguration>()
            .await
            .map_err(|e| CheckinError::Network(e.to_string()))
    }
}

/// Outcome of one check-in attempt, for the caller to act on: apply tunables,
/// rebase the clock, or shut the process down.
#[derive(Debug)]
pub enum CheckinOutcome {
    Applied(AgentConfiguration),
    ShutOff,
    /// A transient failure (network/unknown-host/timeout, or a retryable
    /// HTTP status): caller should try again on the next tick, the pending
    /// metrics document is preserved untouched.
    Retrying,
    /// First-ever check-in failed 404/405 even after the `/api/` URL
    /// autofix retry: start-up must abort.
    AbortStartup,
}

#[derive(Debug, Clone)]
pub struct CheckinConfig {
    pub proxy_id: String,
    pub token: String,
    pub hostname: String,
    pub build_version: String,
    pub ephemeral: bool,
}

/// Owns the 60s metrics snapshot / 1s check-in cadence. The two intervals are
/// driven by the caller (one `tokio::time::interval` each, per the
/// named-worker-task convention used throughout this crate) — this struct is
/// the shared state and logic those two ticks operate on.
pub struct CheckinController<C> {
    client: C,
    config: CheckinConfig,
    pending_metrics: Mutex<Option<(SystemTime, Value)>>,
    had_successful_checkin: AtomicBool,
    url_autofix_attempted: AtomicBool,
    banner_logged: AtomicBool,
    consecutive_failures: AtomicU32,
}

impl<C: CheckinClient> CheckinController<C> {
    pub fn new(client: C, config: CheckinConfig) -> Self {
        Self {
            client,
            config,
            pending_metrics: Mutex::new(None),
            had_successful_checkin: AtomicBool::new(false),
            url_autofix_attempted: AtomicBool::new(false),
            banner_logged: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn had_successful_checkin(&self) -> bool {
        self.had_successful_checkin.load(Ordering::Relaxed)
    }

    /// Called by the 60s metrics-snapshot worker. Overwrites whatever
    /// snapshot hasn't made it out yet — the spec only guarantees the
    /// *most recent* snapshot is eventually delivered, not every one.
    pub fn capture_metrics(&self, document: Value) {
        *self.pending_metrics.lock().unwrap() = Some((SystemTime::now(), document));
    }

    /// Called by the 1s check-in worker. Sends whatever metrics document is
    /// currently pending (if any) and interprets the response. On failure,
    /// the pending document is left in place so the next tick resends it.
    pub async fn tick(&self) -> CheckinOutcome {
        let metrics = self.pending_metrics.lock().unwrap().clone();
        let request = CheckinRequest {
            proxy_id: &self.config.proxy_id,
            token: &self.config.token,
            hostname: &self.config.hostname,
            build_version: &self.config.build_version,
            metrics_ts: metrics.as_ref().map(|(ts, _)| {
                ts.duration_since(SystemTime::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as i64
            }),
            metrics: metrics.as_ref().map(|(_, doc)| doc.clone()),
            ephemeral: self.config.ephemeral,
        };

        match self.client.checkin(request).await {
            Ok(agent_config) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                self.had_successful_checkin.store(true, Ordering::Relaxed);
                self.pending_metrics.lock().unwrap().take();
                if agent_config.shut_off_agents {
                    return CheckinOutcome::ShutOff;
                }
                CheckinOutcome::Applied(agent_config)
            }
            Err(err) => self.handle_failure(err).await,
        }
    }

    async fn handle_failure(&self, err: CheckinError) -> CheckinOutcome {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        if !self.banner_logged.swap(true, Ordering::Relaxed) {
            error!(error = %err, "check-in failing, will keep retrying");
        } else {
            warn!(error = %err, "check-in failed");
        }

        let should_autofix = matches!(
            err,
            CheckinError::HttpError { status: 404 } | CheckinError::HttpError { status: 405 }
        ) && !self.had_successful_checkin()
            && !self.url_autofix_attempted.swap(true, Ordering::Relaxed);

        if should_autofix {
            warn!("retrying check-in once with /api/ appended to the configured server URL");
            // The URL autofix itself is applied by the caller (it owns the
            // concrete client's base URL, which this trait doesn't expose
            // generically); signal retry-now by returning `Retrying` so the
            // caller's next `tick()` — after fixing the URL — tells us
            // definitively whether start-up should abort.
            return CheckinOutcome::Retrying;
        }

        let first_run_failure_after_autofix = matches!(
            err,
            CheckinError::HttpError { status: 404 } | CheckinError::HttpError { status: 405 }
        ) && !self.had_successful_checkin()
            && self.url_autofix_attempted.load(Ordering::Relaxed);

        if first_run_failure_after_autofix {
            return CheckinOutcome::AbortStartup;
        }

        CheckinOutcome::Retrying
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct ScriptedCheckinClient {
        responses: StdMutex<Vec<Result<AgentConfiguration, CheckinError>>>,
        requests: StdMutex<Vec<Option<Value>>>,
    }

    impl ScriptedCheckinClient {
        fn new(responses: Vec<Result<AgentConfiguration, CheckinError>>) -> Self {
            Self {
                responses: StdMutex::new(responses),
                requests: StdMutex::new(Vec::new()),
            }
        }
    }

    impl CheckinClient for ScriptedCheckinClient {
        async fn checkin(&self, request: CheckinRequest<'_>) -> Result<AgentConfiguration, CheckinError> {
            self.requests.lock().unwrap().push(request.metrics.clone());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(AgentConfiguration::default())
            } else {
                responses.remove(0)
            }
        }
    }

    fn config() -> CheckinConfig {
        CheckinConfig {
            proxy_id: "proxy-1".into(),
            token: "tok".into(),
            hostname: "host-a".into(),
            build_version: "1.0.0".into(),
            ephemeral: false,
        }
    }

    #[tokio::test]
    async fn successful_checkin_clears_pending_metrics_and_flips_flag() {
        let client = ScriptedCheckinClient::new(vec![]);
        let controller = CheckinController::new(client, config());
        controller.capture_metrics(serde_json::json!({"received": 10}));

        let outcome = controller.tick().await;
        assert!(matches!(outcome, CheckinOutcome::Applied(_)));
        assert!(controller.had_successful_checkin());
        assert!(controller.pending_metrics.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn shut_off_response_is_surfaced() {
        let client = ScriptedCheckinClient::new(vec![Ok(AgentConfiguration {
            shut_off_agents: true,
            ..Default::default()
        })]);
        let controller = CheckinController::new(client, config());
        assert!(matches!(controller.tick().await, CheckinOutcome::ShutOff));
    }

    #[tokio::test]
    async fn failed_attempt_preserves_pending_metrics_for_resend() {
        let client = ScriptedCheckinClient::new(vec![Err(CheckinError::Network("reset".into()))]);
        let controller = CheckinController::new(client, config());
        controller.capture_metrics(serde_json::json!({"received": 7}));

        let outcome = controller.tick().await;
        assert!(matches!(outcome, CheckinOutcome::Retrying));
        let pending = controller.pending_metrics.lock().unwrap().clone();
        assert_eq!(pending.unwrap().1, serde_json::json!({"received": 7}));
    }

    #[tokio::test]
    async fn first_run_404_then_retry_then_abort() {
        let client = ScriptedCheckinClient::new(vec![Err(CheckinError::HttpError { status: 404 })]);
        let controller = CheckinController::new(client, config());

        assert!(matches!(controller.tick().await, CheckinOutcome::Retrying));

        // Simulate the caller's URL autofix having happened; the next 404
        // is now post-autofix and must abort start-up.
        let client2 = ScriptedCheckinClient::new(vec![Err(CheckinError::HttpError { status: 404 })]);
        let controller2 = CheckinController::new(client2, config());
        controller2.url_autofix_attempted.store(true, Ordering::Relaxed);
        assert!(matches!(controller2.tick().await, CheckinOutcome::AbortStartup));
    }

    #[tokio::test]
    async fn scenario_4_url_autofix_retry_then_success_reports_healthy_checkin() {
        let client = ScriptedCheckinClient::new(vec![
            Err(CheckinError::HttpError { status: 404 }),
            Ok(AgentConfiguration::default()),
        ]);
        let controller = CheckinController::new(client, config());

        assert!(matches!(controller.tick().await, CheckinOutcome::Retrying));
        assert!(!controller.had_successful_checkin());

        // The caller would append `/api/` to the client's base URL here;
        // the controller's own state is what decides the next tick's
        // outcome, so re-ticking the same controller is enough to exercise
        // the retry-then-succeed path.
        assert!(matches!(controller.tick().await, CheckinOutcome::Applied(_)));
        assert!(controller.had_successful_checkin());
    }
}
