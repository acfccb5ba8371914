//! Prometheus-kompatible Metriken fuer Ringway
//!
//! Registrierte Metriken:
//! - `ringway_connected_clients` – Gauge: Offene TCP-Verbindungen
//! - `ringway_online_users` – Gauge: Verbindungen mit gebundener Identitaet
//! - `ringway_calls_active` – Gauge: Anrufe in Requesting oder Active
//! - `ringway_calls_started_total` – Counter: Gestartete Anrufe
//! - `ringway_calls_ended_total` – Counter: Beendete Anrufe (Label `grund`)
//! - `ringway_media_frames_total` – Counter: Weitergeleitete Medien-Frames
//! - `ringway_media_bytes_total` – Counter: Weitergeleitete Medien-Bytes
//! - `ringway_auth_failures_total` – Counter: Fehlgeschlagene Logins/Registrierungen
//! - `ringway_protocol_errors_total` – Counter: Protokollfehler (Verbindung geschlossen)

use anyhow::Result;
use axum::{response::IntoResponse, routing::get, Router};
use prometheus::{Counter, Encoder, Gauge, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Alle Ringway-Prometheus-Metriken
///
/// Clone teilt die Registry, alle Handles zeigen auf dieselben Werte.
#[derive(Clone)]
pub struct RingwayMetrics {
    pub registry: Arc<Registry>,

    // Verbindungen
    pub connected_clients: Gauge,
    pub online_users: Gauge,

    // Anrufe
    pub calls_active: Gauge,
    pub calls_started_total: Counter,
    pub calls_ended_total: IntCounterVec,

    // Medien
    pub media_frames_total: Counter,
    pub media_bytes_total: Counter,

    // Fehler
    pub auth_failures_total: Counter,
    pub protocol_errors_total: Counter,
}

impl RingwayMetrics {
    /// Erstellt und registriert alle Metriken in einer neuen Registry
    pub fn neu() -> Result<Self> {
        let registry = Registry::new();

        // --- Verbindungen ---
        let connected_clients = Gauge::with_opts(Opts::new(
            "ringway_connected_clients",
            "Anzahl offener TCP-Verbindungen",
        ))?;
        registry.register(Box::new(connected_clients.clone()))?;

        let online_users = Gauge::with_opts(Opts::new(
            "ringway_online_users",
            "Anzahl Verbindungen mit gebundener Identitaet",
        ))?;
        registry.register(Box::new(online_users.clone()))?;

        // --- Anrufe ---
        let calls_active = Gauge::with_opts(Opts::new(
            "ringway_calls_active",
            "Anzahl laufender oder klingelnder Anrufe",
        ))?;
        registry.register(Box::new(calls_active.clone()))?;

        let calls_started_total = Counter::with_opts(Opts::new(
            "ringway_calls_started_total",
            "Gesamtanzahl gestarteter Anrufe",
        ))?;
        registry.register(Box::new(calls_started_total.clone()))?;

        let calls_ended_total = IntCounterVec::new(
            Opts::new(
                "ringway_calls_ended_total",
                "Gesamtanzahl beendeter Anrufe nach Grund",
            ),
            &["grund"],
        )?;
        registry.register(Box::new(calls_ended_total.clone()))?;

        // --- Medien ---
        let media_frames_total = Counter::with_opts(Opts::new(
            "ringway_media_frames_total",
            "Gesamtanzahl weitergeleiteter Medien-Frames",
        ))?;
        registry.register(Box::new(media_frames_total.clone()))?;

        let media_bytes_total = Counter::with_opts(Opts::new(
            "ringway_media_bytes_total",
            "Gesamtanzahl weitergeleiteter Medien-Bytes",
        ))?;
        registry.register(Box::new(media_bytes_total.clone()))?;

        // --- Fehler ---
        let auth_failures_total = Counter::with_opts(Opts::new(
            "ringway_auth_failures_total",
            "Fehlgeschlagene Login- und Registrierungsversuche",
        ))?;
        registry.register(Box::new(auth_failures_total.clone()))?;

        let protocol_errors_total = Counter::with_opts(Opts::new(
            "ringway_protocol_errors_total",
            "Protokollfehler die zum Schliessen einer Verbindung fuehrten",
        ))?;
        registry.register(Box::new(protocol_errors_total.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            connected_clients,
            online_users,
            calls_active,
            calls_started_total,
            calls_ended_total,
            media_frames_total,
            media_bytes_total,
            auth_failures_total,
            protocol_errors_total,
        })
    }

    /// Zaehlt einen beendeten Anruf
    pub fn anruf_beendet(&self, grund: &str) {
        self.calls_ended_total.with_label_values(&[grund]).inc();
    }

    /// Zaehlt ein weitergeleitetes Medien-Frame
    pub fn medien_weitergeleitet(&self, bytes: usize) {
        self.media_frames_total.inc();
        self.media_bytes_total.inc_by(bytes as f64);
    }

    /// Exportiert alle Metriken im Prometheus-Textformat
    pub fn exportieren(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Axum-Router fuer den `/metrics`-Endpunkt
pub fn metrics_router(metriken: RingwayMetrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metriken)
}

async fn metrics_handler(
    axum::extract::State(metriken): axum::extract::State<RingwayMetrics>,
) -> impl IntoResponse {
    match metriken.exportieren() {
        Ok(text) => (
            axum::http::StatusCode::OK,
            [(
                axum::http::header::CONTENT_TYPE,
                "text/plain; version=0.0.4",
            )],
            text,
        )
            .into_response(),
        Err(err) => {
            tracing::error!("Metriken-Export fehlgeschlagen: {err}");
            axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
