//! Panic recovery and remote alerting
//!
//! Every long running task of the worker is started with [`spawn_guarded`].
//! A panic inside such a task is caught at the task boundary, turned into a
//! [`PanicAlert`] and handed to the configured [`AlertSink`]; the task then
//! ends as if it had returned normally.

use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::config::AlertConfig;

/// Report about a recovered panic
#[derive(Debug, Clone, Serialize)]
pub struct PanicAlert {
    pub service: String,
    /// Session, room or connection the task was working for
    pub context: String,
    /// Task that panicked
    pub scope: String,
    pub message: String,
}

/// Receives reports about recovered panics
pub trait AlertSink: Send + Sync {
    fn report(&self, alert: PanicAlert);

    fn service_name(&self) -> &str;
}

/// Sink that only writes the report to the log
pub struct LogAlertSink {
    service: String,
}

impl LogAlertSink {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl Default for LogAlertSink {
    fn default() -> Self {
        Self::new(AlertConfig::default().service_name)
    }
}

impl AlertSink for LogAlertSink {
    fn report(&self, alert: PanicAlert) {
        error!(
            service = %alert.service,
            context = %alert.context,
            scope = %alert.scope,
            message = %alert.message,
            "Recovered from panic"
        );
    }

    fn service_name(&self) -> &str {
        &self.service
    }
}

/// Sink that logs the report and POSTs it to an alerting webhook
pub struct WebhookAlertSink {
    service: String,
    url: String,
    client: reqwest::Client,
}

impl WebhookAlertSink {
    pub fn new(service: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    alerts: &'a PanicAlert,
    email: &'static str,
}

impl AlertSink for WebhookAlertSink {
    fn report(&self, alert: PanicAlert) {
        LogAlertSink::new(self.service.clone()).report(alert.clone());

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime available, panic alert not delivered");
            return;
        };

        let client = self.client.clone();
        let url = self.url.clone();
        runtime.spawn(async move {
            let body = WebhookBody {
                alerts: &alert,
                email: "panic",
            };
            match client.post(&url).json(&body).send().await {
                Ok(resp) if !resp.status().is_success() => {
                    warn!(status = %resp.status(), "Alert webhook rejected panic report");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to deliver panic alert"),
            }
        });
    }

    fn service_name(&self) -> &str {
        &self.service
    }
}

/// Build the sink described by the configuration
#[must_use]
pub fn from_config(config: &AlertConfig) -> Arc<dyn AlertSink> {
    match &config.webhook_url {
        Some(url) if !url.is_empty() => {
            Arc::new(WebhookAlertSink::new(config.service_name.clone(), url.clone()))
        }
        _ => Arc::new(LogAlertSink::new(config.service_name.clone())),
    }
}

/// Spawn `fut`, recovering and reporting any panic it raises
pub fn spawn_guarded<F>(
    alerts: Arc<dyn AlertSink>,
    context: impl Into<String>,
    scope: &'static str,
    fut: F,
) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let context = context.into();
    tokio::spawn(async move {
        if let Err(payload) = AssertUnwindSafe(fut).catch_unwind().await {
            alerts.report(PanicAlert {
                service: alerts.service_name().to_string(),
                context,
                scope: scope.to_string(),
                message: panic_message(payload.as_ref()),
            });
        }
    })
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
