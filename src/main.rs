//! Recitea - pronunciation practice from the terminal
//!
//! Usage: `recitea [lang] [rounds]`
//!
//! Each round fetches a word, records the answer until the learner stops
//! speaking and sends the clip for scoring.

use anyhow::{bail, Context};
use recitea::audio::diagnostics;
use recitea::audio::PlatformQuirks;
use recitea::config::{load_audio_settings, JsonFileStore};
use recitea::practice::{run_round, HttpPronunciationService, RoundOutcome, SilentPlayer};
use recitea::{AppConfig, CaptureController, CaptureEvent, CapturePolicy, CpalPlatform};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LANG: &str = "iw";
const DEFAULT_ROUNDS: usize = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "recitea=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Recitea v{}", env!("CARGO_PKG_VERSION"));

    let mut args = std::env::args().skip(1);
    let lang = args.next().unwrap_or_else(|| DEFAULT_LANG.to_string());
    let rounds = match args.next() {
        Some(n) => n.parse::<usize>().context("rounds must be a number")?,
        None => DEFAULT_ROUNDS,
    };

    let config = AppConfig::from_env();
    let quirks = config
        .user_agent
        .as_deref()
        .map(PlatformQuirks::from_user_agent)
        .unwrap_or_default();
    let platform = CpalPlatform::new(quirks);

    let report = diagnostics::report(&platform).await;
    println!("Recitea {}", env!("CARGO_PKG_VERSION"));
    println!("Input devices:");
    for device in &report.devices {
        println!("  - {} ({})", device.label, device.id);
    }
    println!("Clip format: {:?}", report.selected_mime);
    println!();

    let store = JsonFileStore::open(&config.settings_path);
    let service = HttpPronunciationService::new(config.api_base_url.clone());
    let settings = load_audio_settings(&service, &store).await;
    tracing::info!("Audio settings: {:?}", settings);

    let controller = CaptureController::new(platform, settings, CapturePolicy::default());
    let capability = controller.probe().await;
    if let Some(kind) = capability.last_error {
        bail!("{}", kind.user_message());
    }

    let mut events = controller.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                CaptureEvent::AutoStopTriggered { session, reason } => {
                    tracing::debug!(session = %session, "Auto-stop: {:?}", reason)
                }
                CaptureEvent::Error {
                    session,
                    message,
                    retry_silently: false,
                    ..
                } => eprintln!("[{}] {}", session, message),
                other => {
                    tracing::trace!(session = %other.session(), "Capture event: {:?}", other)
                }
            }
        }
    });

    for round in 1..=rounds {
        println!("Round {}/{}", round, rounds);
        let outcome = run_round(
            &controller,
            &service,
            &SilentPlayer,
            &lang,
            config.device_id.as_deref(),
        )
        .await
        .context("practice round failed")?;

        match outcome {
            RoundOutcome::Scored { word, score } => {
                println!(
                    "  {} -> {:?} ({}, score {})",
                    word,
                    score.transcript,
                    if score.is_correct { "correct" } else { "try again" },
                    score.score
                );
                if !score.is_correct && !score.correct_answer.is_empty() {
                    println!("  expected: {}", score.correct_answer);
                }
            }
            RoundOutcome::RetrySilently { word } => {
                println!("  {}: nothing heard, skipping", word);
            }
            RoundOutcome::Failed { word, kind } => {
                println!("  {}: {}", word, kind.user_message());
                if kind.is_critical() {
                    bail!("microphone unavailable");
                }
            }
            RoundOutcome::Cancelled { word } => println!("  {}: cancelled", word),
        }

        // Next request would be refused while cooling down
        if let Some(remaining) = controller.status().await.cooldown_remaining {
            tokio::time::sleep(remaining).await;
        }
    }

    Ok(())
}
