use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};

use rover_link::command::SpeedDial;
use rover_link::config::{ClientConfig, LinkSettings, DEFAULT_CLIENT_ID, DEFAULT_ROBOT_ID};
use rover_link::endpoints::StreamKind;
use rover_link::live_status::StatusBoard;
use rover_link::surface::FileSurface;
use rover_link::terminal::{self, KeyMapper, RawMode};
use rover_link::transport::TokioTransport;
use rover_link::{InputEvent, LinkEvent, SessionController, Surfaces};

#[derive(Parser, Debug)]
#[command(name = "rover_link")]
#[command(about = "Live video, telemetry and teleop client for a remote robot", long_about = None)]
struct Args {
    /// Server base address (http:// or https://)
    #[arg(long)]
    server: Option<String>,

    /// Robot id
    #[arg(long, default_value = DEFAULT_ROBOT_ID)]
    robot: String,

    /// Client id sent with every command
    #[arg(long, default_value = DEFAULT_CLIENT_ID)]
    client_id: String,

    /// Pull video over HTTP MJPEG instead of the websocket
    #[arg(long)]
    mjpeg: bool,

    /// Pull thermal over HTTP MJPEG instead of the websocket
    #[arg(long)]
    mjpeg_thermal: bool,

    /// Silence (ms) after which the robot counts as offline
    #[arg(long, default_value = "10000")]
    offline_ms: u64,

    /// Liveness check period (ms)
    #[arg(long, default_value = "2000")]
    check_ms: u64,

    /// Initial drive speed (0-255)
    #[arg(long, default_value = "100")]
    speed: u8,

    /// Output directory
    #[arg(long, default_value = "rover_link_sessions")]
    output_dir: String,

    /// Config file (defaults to <output-dir>/client_config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Persist the effective server address to the config file
    #[arg(long)]
    save_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    let output_dir = PathBuf::from(&args.output_dir);
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| output_dir.join("client_config.json"));
    let config = ClientConfig::load(&config_path)?.with_override(args.server.clone());
    if args.save_config {
        config.save(&config_path)?;
        log::info!("[config] saved {}", config_path.display());
    }

    let mut settings = LinkSettings::new(config.server_url.clone());
    settings.robot_id = args.robot.clone();
    settings.client_id = args.client_id.clone();
    settings.video_pull = args.mjpeg;
    settings.thermal_pull = args.mjpeg_thermal;
    settings.silence_threshold = Duration::from_millis(args.offline_ms);
    settings.check_interval = Duration::from_millis(args.check_ms.max(1));

    log::info!("[{}] rover_link starting", ts_now());
    log::info!("  Server: {}", settings.server_url.as_deref().unwrap_or("(none)"));
    log::info!("  Robot: {}", settings.robot_id);
    log::info!("  Output Dir: {}", output_dir.display());

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<LinkEvent>();
    let speed = SpeedDial::new(args.speed);
    let client = reqwest::Client::new();
    let surfaces = Surfaces {
        video: FileSurface::new(StreamKind::Video, &output_dir, client.clone()),
        thermal: FileSurface::new(StreamKind::Thermal, &output_dir, client),
    };

    let mut controller = SessionController::new(
        settings,
        TokioTransport::new(events_tx.clone()),
        StatusBoard::new(),
        surfaces,
        events_tx.clone(),
        speed.clone(),
        output_dir.clone(),
    );

    // Keyboard only when attached to a terminal; otherwise run headless until Ctrl-C
    let _raw_mode = if std::io::stdin().is_terminal() {
        match RawMode::enable() {
            Ok(raw) => {
                if !raw.reports_releases() {
                    log::warn!("[input] terminal does not report key releases; drive keys latch until space");
                }
                let mapper = KeyMapper::new(speed.clone(), raw.reports_releases());
                let input_tx = events_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = terminal::forward_keys(input_tx, mapper).await {
                        log::warn!("[input] keyboard reader stopped: {}", e);
                    }
                });
                log::info!("[input] {}", terminal::HELP);
                Some(raw)
            }
            Err(e) => {
                log::warn!("[input] raw mode unavailable: {}", e);
                None
            }
        }
    } else {
        None
    };

    controller.connect();

    let status_path = output_dir.join("live_status.json");
    let mut status_tick = interval(Duration::from_millis(500));
    status_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            event = events_rx.recv() => match event {
                Some(LinkEvent::Input(InputEvent::Quit)) | None => break,
                Some(event) => controller.handle(event),
            },
            _ = status_tick.tick() => {
                if let Err(e) = controller.presenter_mut().flush(&status_path) {
                    log::warn!("[status] failed to save {}: {}", status_path.display(), e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("[{}] interrupted", ts_now());
                break;
            }
        }
    }

    controller.disconnect();
    if let Err(e) = controller.presenter_mut().flush(&status_path) {
        log::warn!("[status] failed to save {}: {}", status_path.display(), e);
    }
    log::info!("[{}] rover_link stopped", ts_now());
    Ok(())
}

fn init_logging() {
    // Raw mode needs explicit carriage returns
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            write!(
                buf,
                "[{}] {:<5} {}\r\n",
                ts_now(),
                record.level(),
                record.args()
            )
        })
        .init();
}

fn ts_now() -> String {
    Local::now().format("%H:%M:%S").to_string()
}
