//! Periodische Wartungs-Befehle fuer den Worker
//!
//! Die Zeitgeber fassen keinen Zustand an, sie reihen nur `Befehl`e in die
//! Worker-Queue ein.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::dispatcher::Befehl;
use crate::konfig::SignalingKonfiguration;

/// Pruefintervall fuer unbeantwortete Anrufe
pub const KLINGEL_PRUEFINTERVALL: Duration = Duration::from_secs(1);

/// Startet die konfigurierten Zeitgeber (0 = aus)
pub fn zeitgeber_starten(
    konfig: &SignalingKonfiguration,
    befehle: mpsc::Sender<Befehl>,
    shutdown_rx: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();

    if let Some(intervall) = konfig.token_bereinigung() {
        tasks.push(tokio::spawn(periodisch(
            "token_bereinigung",
            intervall,
            befehle.clone(),
            || Befehl::TokensBereinigen,
            shutdown_rx.clone(),
        )));
    }

    if let Some(timeout) = konfig.klingel_timeout() {
        tasks.push(tokio::spawn(periodisch(
            "klingel_timeout",
            KLINGEL_PRUEFINTERVALL.min(timeout),
            befehle,
            || Befehl::KlingelTimeout,
            shutdown_rx,
        )));
    }

    tasks
}

async fn periodisch(
    name: &'static str,
    intervall: Duration,
    befehle: mpsc::Sender<Befehl>,
    befehl: fn() -> Befehl,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(intervall);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Erster Tick kommt sofort
    ticker.tick().await;

    tracing::debug!(zeitgeber = name, intervall_ms = intervall.as_millis() as u64, "Zeitgeber gestartet");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if befehle.send(befehl()).await.is_err() {
                    break;
                }
            }

            Ok(()) = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    tracing::debug!(zeitgeber = name, "Zeitgeber gestoppt");
}
