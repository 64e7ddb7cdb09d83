use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pole_overlay_core::{
    api::{ApiClient, ApiError, CancelFlag, ProgressFn, TaskId},
    cache::DetectionCache,
    config::Config,
    detection::{load_detection_set, save_detection_set, BoundingBox, DetectionIndex, DetectionSet},
    history::{FileStorage, Outcome, UploadHistory},
    playback::Session,
    rendering::{PixelSize, RasterSurface, Size},
    timing::{format_timestamp, Fps},
};

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "pole-inspect",
    version,
    about = "Railway pole inspection: upload videos, fetch detections, render overlays",
    long_about = None
)]
struct Cli {
    /// Config file (default: $POLE_OVERLAY_CONFIG or ./pole-overlay.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Backend base URL, overrides the config file
    #[arg(long, global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the backend is reachable.
    Health,

    /// Upload an MP4 and record the attempt in the local history.
    Upload {
        /// Video file (.mp4, at most 100 MB)
        file: PathBuf,

        /// Trigger detection right after a successful upload
        #[arg(long)]
        detect: bool,
    },

    /// Run detection for a task and save the results as JSON.
    Detect {
        task_id: String,

        /// Where to write the detection set
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List tasks known to the backend.
    History,

    /// Show (or clear) the local upload log.
    Uploads {
        #[arg(long)]
        clear: bool,
    },

    /// Download a task's video.
    Video {
        task_id: String,

        #[arg(short, long, default_value = "video.mp4")]
        output: PathBuf,
    },

    /// Render the overlay for one instant to a PNG.
    Snapshot {
        #[command(flatten)]
        view: ViewArgs,

        /// Playback time in seconds
        #[arg(short, long, default_value_t = 0.0)]
        time: f64,

        #[arg(short, long, default_value = "overlay.png")]
        output: PathBuf,
    },

    /// Simulate playback and print the boxes on screen whenever they change.
    Play {
        #[command(flatten)]
        view: ViewArgs,

        /// Start position in seconds
        #[arg(long, default_value_t = 0.0)]
        from: f64,

        /// Stop after this many seconds of playback (default: to the end)
        #[arg(long)]
        seconds: Option<f64>,

        /// Save the final overlay frame as a PNG
        #[arg(long)]
        last_frame: Option<PathBuf>,
    },
}

#[derive(Args)]
struct ViewArgs {
    /// Fetch detections for this task
    #[arg(long, conflicts_with = "detections", required_unless_present = "detections")]
    task: Option<String>,

    /// Read detections from a JSON file instead
    #[arg(long)]
    detections: Option<PathBuf>,

    /// Video frame rate the detections were sampled at
    #[arg(long)]
    fps: f64,

    /// Source video size, WIDTHxHEIGHT
    #[arg(long, value_parser = parse_dims, default_value = "1920x1080")]
    natural: (u32, u32),

    /// Size the video is displayed at, WIDTHxHEIGHT (default: natural size)
    #[arg(long, value_parser = parse_dims)]
    display: Option<(u32, u32)>,

    /// Device pixel ratio
    #[arg(long, default_value_t = 1.0)]
    dpr: f64,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Respect RUST_LOG; default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(base_url) = cli.base_url {
        config.api.base_url = base_url;
        config.validate().context("invalid --base-url")?;
    }

    match cli.command {
        Commands::Health => cmd_health(&config),
        Commands::Upload { file, detect } => cmd_upload(&config, &file, detect),
        Commands::Detect { task_id, output } => cmd_detect(&config, &task_id, output),
        Commands::History => cmd_history(&config),
        Commands::Uploads { clear } => cmd_uploads(&config, clear),
        Commands::Video { task_id, output } => cmd_video(&config, &task_id, &output),
        Commands::Snapshot { view, time, output } => cmd_snapshot(&config, &view, time, &output),
        Commands::Play {
            view,
            from,
            seconds,
            last_frame,
        } => cmd_play(&config, &view, from, seconds, last_frame.as_deref()),
    }
}

// ── Backend commands ──────────────────────────────────────────────────────────

fn client(config: &Config) -> Result<ApiClient> {
    ApiClient::from_config(&config.api).context("failed to build HTTP client")
}

fn cmd_health(config: &Config) -> Result<()> {
    let client = client(config)?;
    let health = client
        .health()
        .with_context(|| format!("backend at {} is not reachable", client.base_url()))?;
    info!(
        url = client.base_url(),
        status = %health.status,
        version = %health.version,
        "backend healthy"
    );
    println!("{} ({}) v{}", health.message, health.status, health.version);
    Ok(())
}

fn cmd_upload(config: &Config, file: &Path, detect: bool) -> Result<()> {
    let client = client(config)?;
    let mut history = UploadHistory::open(
        FileStorage::new(&config.history.path),
        config.history.capacity,
    );

    let file_name = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string());
    let file_size = std::fs::metadata(file).map(|m| m.len()).unwrap_or(0);

    let pb = ProgressBar::new(file_size);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
        )
        .context("invalid progress template")?
        .progress_chars("=> "),
    );
    pb.set_message(format!("Uploading {file_name}"));
    let pb2 = pb.clone();

    let progress: ProgressFn = Box::new(move |sent: u64, _total: u64| pb2.set_position(sent));

    let cancel = CancelFlag::new();
    let result = client.upload(file, Some(progress), &cancel);

    let receipt = match result {
        Ok(receipt) => receipt,
        Err(ApiError::Cancelled) => {
            pb.abandon_with_message("Upload cancelled.");
            history.record_cancelled(&file_name, file_size);
            return Ok(());
        }
        Err(err) => {
            pb.abandon_with_message("Upload failed.");
            history.record_error(&file_name, file_size, &err);
            return Err(err).with_context(|| format!("upload of {} failed", file.display()));
        }
    };
    pb.finish_with_message("Uploaded.");
    history.record_success(&file_name, file_size, &receipt);

    println!("task_id: {}", receipt.task_id);
    if let (Some(fps), Some(duration)) = (receipt.fps, receipt.duration) {
        println!("video:   {fps:.2} fps, {}", format_timestamp(duration));
    }
    if let (Some(width), Some(height)) = (receipt.width, receipt.height) {
        println!("size:    {width}x{height}");
    }

    if detect {
        run_detection(&client, &receipt.task_id, None)?;
    }
    Ok(())
}

fn cmd_detect(config: &Config, task_id: &str, output: Option<PathBuf>) -> Result<()> {
    let task_id = TaskId::parse(task_id)?;
    let client = client(config)?;
    run_detection(&client, &task_id, output)
}

fn run_detection(client: &ApiClient, task_id: &TaskId, output: Option<PathBuf>) -> Result<()> {
    let pb = spinner("Running detection…")?;
    let outcome = client.trigger_detection(task_id);
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => {
            pb.abandon_with_message(err.user_message());
            return Err(err).with_context(|| format!("detection for {task_id} failed"));
        }
    };
    if outcome.already_exists {
        pb.set_message("Detections already exist; fetching…");
    } else {
        pb.set_message("Fetching detections…");
    }

    let set = client
        .detections(task_id)
        .with_context(|| format!("failed to fetch detections for {task_id}"))?;
    pb.finish_with_message("Done.");
    print_summary(&set);

    let output = output.unwrap_or_else(|| PathBuf::from(format!("{task_id}.json")));
    save_detection_set(&output, &set)?;
    info!(path = %output.display(), "detections saved");
    Ok(())
}

fn cmd_history(config: &Config) -> Result<()> {
    let client = client(config)?;
    let entries = client.history().context("failed to load task history")?;
    if entries.is_empty() {
        println!("no tasks");
    }
    for entry in entries {
        let created = entry
            .created_at()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or(entry.created_at.clone());
        println!("{:<16} {created}", entry.task_id);
    }
    Ok(())
}

fn cmd_uploads(config: &Config, clear: bool) -> Result<()> {
    let mut history = UploadHistory::open(
        FileStorage::new(&config.history.path),
        config.history.capacity,
    );
    if clear {
        history.clear().context("failed to clear upload history")?;
        println!("upload history cleared");
        return Ok(());
    }

    for record in history.records() {
        let detail = match record.outcome {
            Outcome::Success => record.task_id.clone().unwrap_or_default(),
            Outcome::Error => format!(
                "{} [{}]",
                record.error.as_deref().unwrap_or("error"),
                record.error_kind.map(|k| k.as_str()).unwrap_or("unknown")
            ),
            Outcome::Cancelled => String::new(),
        };
        println!(
            "{}  {:<9} {:<32} {:>10}  {detail}",
            record.timestamp,
            format!("{:?}", record.outcome).to_lowercase(),
            record.file_name,
            record.file_size
        );
    }
    let stats = history.stats();
    println!(
        "{} uploads: {} ok, {} failed, {} cancelled ({:.0}% success)",
        stats.total, stats.successful, stats.failed, stats.cancelled, stats.success_rate
    );
    Ok(())
}

fn cmd_video(config: &Config, task_id: &str, output: &Path) -> Result<()> {
    let task_id = TaskId::parse(task_id)?;
    let client = client(config)?;
    let pb = spinner("Downloading video…")?;
    let bytes = client
        .download_video(&task_id, output)
        .with_context(|| format!("failed to download video for {task_id}"))?;
    pb.finish_with_message(format!("Saved {bytes} bytes to {}", output.display()));
    Ok(())
}

// ── Overlay commands ──────────────────────────────────────────────────────────

fn load_view(config: &Config, view: &ViewArgs) -> Result<(Arc<DetectionSet>, Fps)> {
    let fps = Fps::new(view.fps).context("invalid --fps")?;
    let set = match (&view.task, &view.detections) {
        (_, Some(path)) => Arc::new(load_detection_set(path)?),
        (Some(task_id), None) => {
            let task_id = TaskId::parse(task_id)?;
            let mut cache = DetectionCache::new(config.cache.capacity);
            client(config)?
                .cached_detections(&mut cache, &task_id)
                .with_context(|| format!("failed to fetch detections for {task_id}"))?
        }
        (None, None) => bail!("either --task or --detections is required"),
    };
    Ok((set, fps))
}

fn session_for(config: &Config, view: &ViewArgs, fps: Fps, duration: f64) -> Result<Session<RasterSurface>> {
    let (nw, nh) = view.natural;
    let (dw, dh) = view.display.unwrap_or(view.natural);
    let mut session = Session::new(
        RasterSurface::new(),
        fps,
        config.overlay_options()?,
        Size::new(dw as f64, dh as f64),
    );
    session.set_device_pixel_ratio(view.dpr);
    session.load_metadata(PixelSize::new(nw, nh), duration);
    Ok(session)
}

/// Length of the detection set in seconds, at least one frame.
fn set_duration(set: &DetectionSet, fps: Fps) -> f64 {
    let last = set.iter().map(|f| f.frame_index).max().unwrap_or(0);
    fps.time_of(last.saturating_add(1))
}

/// How long `play` runs: `--seconds` if given, otherwise to the end.
fn playback_span(from: f64, seconds: Option<f64>, duration: f64) -> Result<Duration> {
    if !from.is_finite() || from < 0.0 {
        bail!("--from must be a non-negative number of seconds, got {from}");
    }
    if from >= duration {
        bail!(
            "--from {from}s is past the end of the detections ({})",
            format_timestamp(duration)
        );
    }
    let span = match seconds {
        Some(s) if !s.is_finite() || s < 0.0 => {
            bail!("--seconds must be a non-negative number of seconds, got {s}")
        }
        Some(s) => s,
        None => duration - from,
    };
    Duration::try_from_secs_f64(span).with_context(|| format!("playback span of {span}s is out of range"))
}

fn cmd_snapshot(config: &Config, view: &ViewArgs, time: f64, output: &Path) -> Result<()> {
    let (set, fps) = load_view(config, view)?;
    let frame_index = fps.frame_index(time).context("invalid --time")?;
    let duration = set_duration(&set, fps).max(time);

    let mut session = session_for(config, view, fps, duration)?;
    let drawn = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&drawn);
    session
        .overlay_mut()
        .on_frame_rendered(move |_, boxes| *sink.borrow_mut() = boxes.to_vec());
    session.set_detections(set);
    session.seek(time);
    session.settle();

    let Some(surface) = session.overlay().surface() else {
        bail!("overlay surface is unavailable");
    };
    surface.save(output)?;

    println!(
        "frame {frame_index} @ {}: {} box(es) -> {}",
        format_timestamp(time),
        drawn.borrow().len(),
        output.display()
    );
    for bbox in drawn.borrow().iter() {
        println!("  {}", describe(bbox));
    }
    Ok(())
}

fn cmd_play(
    config: &Config,
    view: &ViewArgs,
    from: f64,
    seconds: Option<f64>,
    last_frame: Option<&Path>,
) -> Result<()> {
    let (set, fps) = load_view(config, view)?;
    let duration = set_duration(&set, fps);
    let span = playback_span(from, seconds, duration)?;

    let mut session = session_for(config, view, fps, duration)?;
    let changes = Rc::new(RefCell::new(Vec::<(u64, Vec<i64>)>::new()));
    let sink = Rc::clone(&changes);
    session.overlay_mut().on_frame_rendered(move |frame, boxes| {
        let ids: Vec<i64> = boxes.iter().map(|b| b.id).collect();
        let mut changes = sink.borrow_mut();
        if changes.last().map(|(_, last)| last) != Some(&ids) {
            changes.push((frame, ids));
        }
    });
    session.set_detections(Arc::clone(&set));
    session.seek(from);
    session.play();

    let pb = spinner("Playing…")?;
    let step = Duration::from_millis(250);
    let mut remaining = span;
    while !remaining.is_zero() && session.video().is_playing() {
        let slice = remaining.min(step);
        session.run_for(slice);
        remaining -= slice;
        if let Ok(frame) = session.current_frame() {
            pb.set_message(format!("frame {frame}"));
        }
    }
    session.settle();
    pb.finish_and_clear();

    let index = DetectionIndex::build(Arc::clone(&set));
    for (frame, ids) in changes.borrow().iter() {
        let time = fps.time_of(*frame);
        if ids.is_empty() {
            println!("{}  frame {frame:>6}  (no boxes)", format_timestamp(time));
            continue;
        }
        let labels: Vec<String> = index
            .boxes_for(*frame)
            .iter()
            .filter(|b| ids.contains(&b.id))
            .map(describe)
            .collect();
        println!("{}  frame {frame:>6}  {}", format_timestamp(time), labels.join(", "));
    }

    let stats = session.overlay().stats();
    info!(
        paints = stats.paints,
        suppressed = stats.suppressed,
        malformed = stats.malformed,
        "playback finished"
    );
    if stats.malformed > 0 {
        warn!(count = stats.malformed, "some boxes had malformed geometry and were skipped");
    }

    if let Some(path) = last_frame {
        if let Some(surface) = session.overlay().surface() {
            surface.save(path)?;
            info!(path = %path.display(), "last frame saved");
        }
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn describe(bbox: &BoundingBox) -> String {
    match bbox.confidence {
        Some(confidence) => format!("#{} {} ({confidence:.2})", bbox.id, bbox.label),
        None => format!("#{} {}", bbox.id, bbox.label),
    }
}

fn print_summary(set: &DetectionSet) {
    let mut by_label: BTreeMap<String, usize> = BTreeMap::new();
    let mut total = 0usize;
    for frame in set {
        for bbox in &frame.boxes {
            *by_label.entry(bbox.label.to_string()).or_default() += 1;
            total += 1;
        }
    }
    println!("{} frame(s), {total} box(es)", set.len());
    for (label, count) in by_label {
        println!("  {label:<18} {count}");
    }
}

fn parse_dims(raw: &str) -> Result<(u32, u32), String> {
    let (w, h) = raw
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got `{raw}`"))?;
    let parse = |v: &str| {
        v.trim()
            .parse::<u32>()
            .ok()
            .filter(|&n| n > 0)
            .ok_or_else(|| format!("`{v}` is not a positive integer"))
    };
    Ok((parse(w)?, parse(h)?))
}

fn spinner(msg: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed_precise}]")
            .context("invalid spinner template")?
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    Ok(pb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pole_overlay_core::detection::DetectionFrame;

    fn frame(frame_index: u64) -> DetectionFrame {
        DetectionFrame {
            frame_index,
            time: None,
            boxes: Vec::new(),
        }
    }

    #[test]
    fn test_parse_dims() {
        assert_eq!(parse_dims("1920x1080"), Ok((1920, 1080)));
        assert_eq!(parse_dims("640X360"), Ok((640, 360)));
        assert!(parse_dims("1920").is_err());
        assert!(parse_dims("0x1080").is_err());
        assert!(parse_dims("axb").is_err());
    }

    #[test]
    fn test_set_duration_covers_last_frame() {
        let fps = Fps::new(30.0).unwrap();
        assert_eq!(set_duration(&vec![frame(0), frame(59)], fps), 2.0);
        assert_eq!(set_duration(&Vec::new(), fps), fps.time_of(1));
        // The last index saturates instead of overflowing.
        assert!(set_duration(&vec![frame(u64::MAX)], fps).is_finite());
    }

    #[test]
    fn test_playback_span_rejects_unusable_lengths() {
        assert_eq!(playback_span(1.0, None, 3.0).unwrap(), Duration::from_secs(2));
        assert_eq!(playback_span(0.0, Some(0.5), 3.0).unwrap(), Duration::from_millis(500));
        assert!(playback_span(0.0, Some(f64::INFINITY), 3.0).is_err());
        assert!(playback_span(0.0, Some(f64::NAN), 3.0).is_err());
        assert!(playback_span(0.0, Some(-1.0), 3.0).is_err());
        assert!(playback_span(f64::NAN, None, 3.0).is_err());
        assert!(playback_span(3.0, None, 3.0).is_err());
        assert!(playback_span(0.0, None, f64::MAX).is_err());
    }
}
