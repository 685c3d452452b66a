//! # audiotrack-demo
//!
//! Plays files on several tracks at once, loops a sound effect, or passes
//! the microphone straight through to the speakers.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use audiotrack::{
    config, device, AudioFile, InputTrack, OutputTrack, PlayOptions, Repeat, StreamSettings,
    TrackEvent,
};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "audiotrack-demo", version, about)]
struct Cli {
    /// JSON config file to load before starting
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Play each file on its own track, all at the same time
    Play {
        files: Vec<PathBuf>,
        /// Extra passes of every file
        #[arg(long, default_value_t = 0)]
        repeat: u32,
        /// Decode files fully before playing
        #[arg(long)]
        memory: bool,
        /// How long to play before fading out
        #[arg(long, default_value_t = 20)]
        seconds: u64,
    },
    /// Loop a short file until the time is up
    Sfx {
        file: PathBuf,
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
    /// Send the microphone to the speakers
    Loopback {
        #[arg(long, default_value_t = 10)]
        seconds: u64,
        #[arg(long, default_value_t = 1.5)]
        volume: f32,
    },
    /// List audio devices
    Devices,
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audiotrack=debug,audiotrack_demo=debug".into()),
        )
        .init();

    info!("Starting audiotrack-demo v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    if let Some(path) = &cli.config {
        let loaded = config::Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?;
        config::set_config(loaded);
    }

    match cli.command {
        Command::Play {
            files,
            repeat,
            memory,
            seconds,
        } => play(&files, repeat, memory, Duration::from_secs(seconds)),
        Command::Sfx { file, seconds } => sfx(file, Duration::from_secs(seconds)),
        Command::Loopback { seconds, volume } => loopback(Duration::from_secs(seconds), volume),
        Command::Devices => {
            for name in device::list_output_devices()? {
                println!("output: {name}");
            }
            for name in device::list_input_devices()? {
                println!("input:  {name}");
            }
            Ok(())
        }
    }
}

fn track_name(path: &std::path::Path) -> String {
    path.file_stem()
        .map_or_else(|| "track".to_string(), |s| s.to_string_lossy().into_owned())
}

fn play(paths: &[PathBuf], repeat: u32, memory: bool, duration: Duration) -> Result<()> {
    anyhow::ensure!(!paths.is_empty(), "no files given");
    let settings = config::config().stream_settings();

    // Convert up front so every track starts at the same moment
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let mut file = AudioFile::new(path).with_repeat(repeat);
        file.convert_if_invalid(&settings)
            .with_context(|| format!("Cannot play {}", path.display()))?;
        files.push(file);
    }

    let tracks: Vec<Arc<OutputTrack>> = paths
        .iter()
        .map(|path| OutputTrack::new(track_name(path), settings, 1.0).map(Arc::new))
        .collect::<audiotrack::Result<_>>()?;

    let options = PlayOptions::default().load_in_memory(memory).convert(false);
    let starters: Vec<_> = tracks
        .iter()
        .zip(files)
        .map(|(track, file)| {
            let track = track.clone();
            thread::spawn(move || track.play_audio_file(file, options))
        })
        .collect();
    for starter in starters {
        if let Ok(Err(e)) = starter.join() {
            warn!("Failed to start playback: {e}");
        }
    }

    let step = duration / 4;
    thread::sleep(step);

    // Fade the first track out and back in
    let first = &tracks[0];
    first.set_volume_default(0.0)?;
    thread::sleep(step / 2);
    first.set_volume_default(1.0)?;
    thread::sleep(step / 2);

    // Mute everything else for a moment
    for track in &tracks[1..] {
        track.set_gain(0.0)?;
    }
    thread::sleep(step / 2);
    for track in &tracks[1..] {
        track.set_gain(1.0)?;
    }
    thread::sleep(step / 2);

    // Knock the last track off the beat
    let last = &tracks[tracks.len() - 1];
    last.pause();
    thread::sleep(Duration::from_millis(500));
    last.resume();
    thread::sleep(step);

    for track in &tracks {
        track.set_volume(0.0, 0.01)?;
    }
    thread::sleep(Duration::from_millis(50));
    for track in &tracks {
        track.stop();
        while let Some(event) = track.try_recv_event() {
            if let TrackEvent::Error(message) = event {
                warn!("'{}' reported: {message}", track.name());
            }
        }
    }
    Ok(())
}

fn sfx(path: PathBuf, duration: Duration) -> Result<()> {
    let settings = config::config().stream_settings();
    let track = Arc::new(OutputTrack::new("SFX", settings, 1.0)?);

    let file = AudioFile::new(path)
        .with_repeat(1)
        .with_on_end(|_, left: Repeat| {
            info!("Repeat left: {left}");
            Some(left.incremented())
        });

    let stopper = {
        let track = track.clone();
        thread::spawn(move || {
            thread::sleep(duration);
            track.stop();
        })
    };

    track.play_audio_file(file, PlayOptions::default().blocking(true).load_in_memory(true))?;
    let _ = stopper.join();
    Ok(())
}

fn loopback(duration: Duration, volume: f32) -> Result<()> {
    let settings = StreamSettings::new(512, 16000, 1);
    let input = InputTrack::new("Microphone", settings, 512)?;
    let output = OutputTrack::new("Output", settings, volume)?;
    let queue = output.queue();

    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        match input.read() {
            Some(chunk) => {
                queue.push(chunk)?;
            }
            None => thread::sleep(settings.block_duration() / 4),
        }
    }

    info!(
        "Loopback finished, {} chunks dropped by the input queue",
        input.dropped()
    );
    Ok(())
}
