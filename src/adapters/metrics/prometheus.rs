//! Prometheus Metrics Registry - Exchange Observability
//!
//! Registers and exposes Prometheus metrics for Grafana dashboards.
//! Covers trade throughput, rejection reasons, trade cost, optimistic
//! concurrency retries, settlement payouts and change-feed health.

use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use prometheus::{
    Counter, Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    Opts, Registry, TextEncoder,
};
use tokio::sync::broadcast;
use tracing::{info, instrument};

/// Centralized Prometheus metrics for the exchange.
///
/// All metrics follow the naming convention `lmsr_exchange_*`.
pub struct ExchangeMetrics {
    /// Prometheus registry.
    registry: Registry,
    /// Committed trades by side.
    pub trades_executed: IntCounterVec,
    /// Rejected trades by error kind.
    pub trades_rejected: IntCounterVec,
    /// Absolute trade cost histogram (tokens).
    pub trade_cost: HistogramVec,
    /// Compare-and-swap conflicts that triggered a retry.
    pub commit_retries: IntCounter,
    /// Markets settled.
    pub settlements: IntCounter,
    /// Tokens paid out at settlement.
    pub payouts: Counter,
    /// Market update events delivered to the hub.
    pub events_propagated: IntCounter,
    /// Change-feed reconnect attempts.
    pub feed_reconnects: IntCounter,
    /// Live broadcast subscribers.
    pub subscribers: IntGauge,
    /// Propagator health (1 = healthy, 0 = unhealthy).
    pub propagator_healthy: Gauge,
}

impl ExchangeMetrics {
    /// Create and register all Prometheus metrics.
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let trades_executed = IntCounterVec::new(
            Opts::new("lmsr_exchange_trades_executed_total", "Committed trades"),
            &["side"],
        )?;

        let trades_rejected = IntCounterVec::new(
            Opts::new("lmsr_exchange_trades_rejected_total", "Rejected trades"),
            &["reason"],
        )?;

        let trade_cost = HistogramVec::new(
            HistogramOpts::new(
                "lmsr_exchange_trade_cost_tokens",
                "Absolute trade cost in tokens",
            )
            .buckets(vec![0.1, 1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0]),
            &["side"],
        )?;

        let commit_retries = IntCounter::new(
            "lmsr_exchange_commit_retries_total",
            "Commits retried after a version conflict",
        )?;

        let settlements = IntCounter::new(
            "lmsr_exchange_settlements_total",
            "Markets settled",
        )?;

        let payouts = Counter::new(
            "lmsr_exchange_payouts_tokens_total",
            "Tokens paid out to winning holders",
        )?;

        let events_propagated = IntCounter::new(
            "lmsr_exchange_events_propagated_total",
            "Market update events broadcast",
        )?;

        let feed_reconnects = IntCounter::new(
            "lmsr_exchange_feed_reconnects_total",
            "Change feed reconnect attempts",
        )?;

        let subscribers = IntGauge::new(
            "lmsr_exchange_subscribers",
            "Live market update subscribers",
        )?;

        let propagator_healthy = Gauge::new(
            "lmsr_exchange_propagator_healthy",
            "Change propagator health (1=healthy, 0=unhealthy)",
        )?;

        // Register all metrics
        registry.register(Box::new(trades_executed.clone()))?;
        registry.register(Box::new(trades_rejected.clone()))?;
        registry.register(Box::new(trade_cost.clone()))?;
        registry.register(Box::new(commit_retries.clone()))?;
        registry.register(Box::new(settlements.clone()))?;
        registry.register(Box::new(payouts.clone()))?;
        registry.register(Box::new(events_propagated.clone()))?;
        registry.register(Box::new(feed_reconnects.clone()))?;
        registry.register(Box::new(subscribers.clone()))?;
        registry.register(Box::new(propagator_healthy.clone()))?;

        Ok(Self {
            registry,
            trades_executed,
            trades_rejected,
            trade_cost,
            commit_retries,
            settlements,
            payouts,
            events_propagated,
            feed_reconnects,
            subscribers,
            propagator_healthy,
        })
    }

    /// Render all metrics in the Prometheus text format.
    pub fn render(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Serve Prometheus metrics on the configured bind address.
    #[instrument(skip(self, shutdown_rx))]
    pub async fn serve(
        self: Arc<Self>,
        bind_address: String,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let metrics = Arc::clone(&self);

        let app = Router::new().route(
            "/metrics",
            get(move || {
                let metrics = Arc::clone(&metrics);
                async move {
                    match metrics.render() {
                        Ok(body) => (StatusCode::OK, body),
                        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                    }
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind(&bind_address).await?;
        info!(address = %bind_address, "Prometheus metrics server started");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_registered_metrics() {
        let metrics = ExchangeMetrics::new().unwrap();
        metrics.trades_executed.with_label_values(&["BUY"]).inc();
        metrics.trades_rejected.with_label_values(&["insufficient_balance"]).inc();
        let text = metrics.render().unwrap();
        assert!(text.contains("lmsr_exchange_trades_executed_total"));
        assert!(text.contains("insufficient_balance"));
    }

    #[test]
    fn test_independent_registries() {
        let a = ExchangeMetrics::new().unwrap();
        let b = ExchangeMetrics::new().unwrap();
        a.commit_retries.inc();
        assert_eq!(a.commit_retries.get(), 1);
        assert_eq!(b.commit_retries.get(), 0);
    }
}
