// src/main.rs

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use log::{info, warn};

use stemdeck::annotations::JsonFileCommentStore;
use stemdeck::{
    AnnotationLayer, AuthorId, DeckController, PlayerConfig, SessionEvent, StreamEngineFactory,
    TrackManifest, TrackSession, VirtualEngineFactory,
};

#[derive(Parser)]
#[command(name = "stemdeck")]
#[command(about = "Play the stems of a track in sync and leave comments on them")]
struct Cli {
    /// A track manifest (.json) or one audio file per stem
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Player settings; defaults are used when the file does not exist
    #[arg(long, default_value = "stemdeck.json")]
    config: PathBuf,

    /// Where comments are kept
    #[arg(long, default_value = "stemdeck-comments.json")]
    comments: PathBuf,

    /// Author name attached to new comments
    #[arg(long, default_value = "local")]
    user: String,

    /// Run the transport against virtual engines and log instead of drawing
    #[arg(long)]
    headless: bool,

    /// Write the ingested stems to this manifest before playing
    #[arg(long)]
    save_manifest: Option<PathBuf>,
}

fn is_manifest(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

fn load_manifest(cli: &Cli, config: &PlayerConfig) -> anyhow::Result<TrackManifest> {
    if let [single] = cli.inputs.as_slice() {
        if is_manifest(single) {
            return TrackManifest::load_from_disk(single);
        }
    }
    if cli.inputs.iter().any(|p| is_manifest(p)) {
        bail!("pass either one manifest or a list of audio files, not both");
    }
    let title = cli
        .inputs
        .first()
        .and_then(|p| p.parent())
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .unwrap_or("untitled");
    Ok(TrackManifest::from_audio_files(title, &cli.inputs, config.peak_count))
}

async fn run_headless(manifest: TrackManifest, config: &PlayerConfig) -> anyhow::Result<()> {
    let factory = Arc::new(VirtualEngineFactory::new());
    let stems = manifest.into_stems();
    let mut pending = stems.len();
    let mut ready = 0usize;
    let (session, mut events) = TrackSession::open(stems, factory, config);
    session.with_deck(|deck| deck.play());

    while let Some(event) = events.recv().await {
        let now = session.state().current_time;
        match event {
            SessionEvent::StemReady { stem, duration } => {
                info!("{stem} ready, {duration:.2}s");
                pending = pending.saturating_sub(1);
                ready += 1;
            }
            SessionEvent::StemFailed { stem, reason } => {
                warn!("{stem} failed: {reason}");
                pending = pending.saturating_sub(1);
                if pending == 0 && ready == 0 {
                    session.close().await;
                    bail!("none of the stems could be loaded");
                }
            }
            SessionEvent::LoopWrapped { to } => info!("loop wrapped to {to:.2}s"),
            SessionEvent::EndOfTrack => {
                info!("end of track after {now:.2}s");
                break;
            }
        }
    }
    session.close().await;
    Ok(())
}

async fn run_interactive(
    manifest: TrackManifest,
    config: &PlayerConfig,
    cli: &Cli,
) -> anyhow::Result<()> {
    let stems = manifest.into_stems();
    let comments = AnnotationLayer::new(JsonFileCommentStore::new(&cli.comments), &stems);
    let factory = Arc::new(StreamEngineFactory::new(config.clone()));
    let (session, events) = TrackSession::open(stems, factory, config);

    let controller = DeckController::new(
        session,
        events,
        comments,
        AuthorId::new(cli.user.clone()),
        config.skip_secs,
    );
    controller.run().await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The terminal UI owns the screen, so only warnings reach stderr there.
    let default_level = if cli.headless { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();

    let config = PlayerConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let manifest = load_manifest(&cli, &config)?;
    if manifest.stems.is_empty() {
        bail!("no playable stems");
    }
    info!("{}: {} stems", manifest.title, manifest.stems.len());

    if let Some(path) = &cli.save_manifest {
        manifest.save_to_disk(path)?;
        info!("manifest written to {}", path.display());
    }

    if cli.headless {
        run_headless(manifest, &config).await
    } else {
        run_interactive(manifest, &config, &cli).await
    }
}
