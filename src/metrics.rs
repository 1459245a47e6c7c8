use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::{event, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    Success,
    Failure,
    Blocked,
}

impl LoginOutcome {
    fn label(&self) -> &'static str {
        match self {
            LoginOutcome::Success => "success",
            LoginOutcome::Failure => "failure",
            LoginOutcome::Blocked => "blocked",
        }
    }
}

pub trait MetricsService: Send + Sync {
    fn registration(&self);
    fn login(&self, outcome: LoginOutcome);
    fn token_refresh(&self);
}

/// Auth counters kept in a registry of their own, rendered at
/// `/metrics/auth` next to the HTTP metrics.
pub struct PrometheusMetricsService {
    registry: Registry,
    registrations: IntCounter,
    logins: IntCounterVec,
    token_refreshes: IntCounter,
}

impl PrometheusMetricsService {
    pub fn new() -> Result<PrometheusMetricsService, prometheus::Error> {
        let registry = Registry::new();

        let registrations = IntCounter::with_opts(Opts::new(
            "accounts_registrations_total",
            "Number of users registered",
        ))?;
        let logins = IntCounterVec::new(
            Opts::new("accounts_logins_total", "Login attempts by outcome"),
            &["outcome"],
        )?;
        let token_refreshes = IntCounter::with_opts(Opts::new(
            "accounts_token_refreshes_total",
            "Number of refresh tokens exchanged",
        ))?;

        registry.register(Box::new(registrations.clone()))?;
        registry.register(Box::new(logins.clone()))?;
        registry.register(Box::new(token_refreshes.clone()))?;

        Ok(PrometheusMetricsService {
            registry,
            registrations,
            logins,
            token_refreshes,
        })
    }

    pub fn render(&self) -> String {
        let mut buffer = vec![];
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            event!(Level::WARN, "Error occurred while encoding auth metrics: {}", e);
            return String::new();
        }

        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl MetricsService for PrometheusMetricsService {
    fn registration(&self) {
        self.registrations.inc();
    }

    fn login(&self, outcome: LoginOutcome) {
        self.logins.with_label_values(&[outcome.label()]).inc();
    }

    fn token_refresh(&self) {
        self.token_refreshes.inc();
    }
}
