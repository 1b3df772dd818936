//! Application entry point: one push-to-talk turn from the command line.
//!
//! # Startup sequence
//!
//! 1. Initialise logging.
//! 2. Load [`PttConfig`] from disk (default on first run) and apply the
//!    `PTT_*` / `SILENCE_THRESHOLD_MS` environment overrides.
//! 3. Create the [`tokio`] runtime (multi-thread, 2 workers).
//! 4. Build the global key source and the microphone backend.
//! 5. Wire Ctrl-C to a [`CancellationToken`].
//! 6. Record one utterance via [`PushToTalk::record_async`]; on failure fall
//!    back to a fixed-duration recording.
//! 7. Log the result and the controller status as JSON.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ptt_voice::{
    audio::{CpalInput, InputBackend, VadDetector},
    config::PttConfig,
    hotkey::RdevKeySource,
    ptt::{record_fixed_duration, record_with_fallback, CancellationToken, LoggingObserver, PushToTalk},
};

/// Length of the non-PTT recording used when push-to-talk is unavailable.
const FALLBACK_DURATION: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    // 1. Logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("ptt-voice starting up");

    // 2. Configuration
    let mut config = PttConfig::load().unwrap_or_else(|e| {
        log::warn!("Failed to load config ({e}); using defaults");
        PttConfig::default()
    });
    config
        .apply_env_overrides()
        .context("invalid PTT environment override")?;

    // 3. Tokio runtime
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    // 4. Backends
    let key_source = Arc::new(RdevKeySource::new());
    let input: Arc<dyn InputBackend> = Arc::new(CpalInput::new());

    rt.block_on(run_turn(config, key_source, input))
}

async fn run_turn(
    config: PttConfig,
    key_source: Arc<RdevKeySource>,
    input: Arc<dyn InputBackend>,
) -> Result<()> {
    // 5. Ctrl-C cancels whatever is recording.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel("interrupted");
            }
        });
    }

    let ptt = PushToTalk::new(config.clone(), key_source, Arc::clone(&input))
        .with_observer(Arc::new(LoggingObserver))
        .with_cancellation(cancel.clone());

    // 6. One push-to-talk turn, with the fixed-duration path as fallback.
    let ptt_result = ptt
        .record_async(config.timeout(), false, config.min_duration(), config.vad_aggressiveness)
        .await;

    let vad = VadDetector::from_aggressiveness(config.vad_aggressiveness);
    let (samples, speech_detected) = tokio::task::spawn_blocking(move || {
        record_with_fallback(
            move || ptt_result,
            move || record_fixed_duration(input, FALLBACK_DURATION, vad, Some(&cancel)),
        )
    })
    .await
    .context("recording task panicked")??;

    // 7. Report
    log::info!(
        "Captured {} samples (speech detected: {speech_detected})",
        samples.len()
    );
    if let Some(status) = ptt.last_status() {
        log::info!("PTT status: {}", serde_json::to_string(&status)?);
    }
    Ok(())
}
