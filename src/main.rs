mod api;
mod archive_key;
mod aws;
mod config;
mod credentials;
mod dispatch;
mod error;
mod job_poller;
mod orchestrator;
mod ring_client;
mod s3_querier;
mod s3_uploader;
mod sun;
mod transcode;
mod window;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use log::{error, info};

use crate::config::{non_empty, DispatchConfig, PipelineConfig, R2Config, RingConfig};
use crate::dispatch::DispatchGate;
use crate::error::TimelapseError;
use crate::orchestrator::{KeyScheme, RunRequest};
use crate::s3_querier::S3Querier;
use crate::window::TimeWindow;

/// Archive Ring camera footage to R2 as sped-up timelapses.
#[derive(Debug, Parser)]
#[command(name = "ring-timelapse", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Archive an explicit window (default: the last 30 minutes)
    Run(RunArgs),
    /// Archive the window around the most recent sunset
    Sunset(SunsetArgs),
    /// Serve the archive listing, downloads and workflow dispatch
    Serve(ServeArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Window start, ISO-8601
    #[arg(long, env = "START_ISO")]
    start_iso: Option<String>,
    /// Window end, ISO-8601
    #[arg(long, env = "END_ISO")]
    end_iso: Option<String>,
    /// Playback speed factor [default: 30]
    #[arg(long, env = "SPEED")]
    speed: Option<String>,
    #[arg(long, env = "CAMERA_ID")]
    camera_id: Option<String>,
    /// Display name used in the Ring file name
    #[arg(long, env = "CAMERA_NAME")]
    camera_name: Option<String>,
    /// Archive key to write instead of the derived one
    #[arg(long, env = "OUT_KEY")]
    out_key: Option<String>,
    /// Kind tag in the derived key instead of daily/custom
    #[arg(long, env = "CLIP_TYPE")]
    clip_type: Option<String>,
}

#[derive(Debug, Args)]
struct SunsetArgs {
    /// Playback speed factor [default: 40]
    #[arg(long, env = "SPEED")]
    speed: Option<String>,
    #[arg(long, env = "CAMERA_ID")]
    camera_id: Option<String>,
    #[arg(long, env = "LATITUDE", allow_negative_numbers = true)]
    latitude: f64,
    #[arg(long, env = "LONGITUDE", allow_negative_numbers = true)]
    longitude: f64,
    /// Minutes of footage before sunset
    #[arg(
        long,
        default_value_t = window::DEFAULT_BEFORE_SUNSET.num_minutes(),
        value_parser = clap::value_parser!(i64).range(0..)
    )]
    before_minutes: i64,
    /// Minutes of footage after sunset
    #[arg(
        long,
        default_value_t = window::DEFAULT_AFTER_SUNSET.num_minutes(),
        value_parser = clap::value_parser!(i64).range(0..)
    )]
    after_minutes: i64,
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[arg(long, env = "LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    addr: String,
}

// Empty flags and env values coming from schedulers mean "not set".
fn opt(value: &Option<String>) -> Option<String> {
    non_empty(value.clone())
}

fn run_request(args: &RunArgs) -> Result<RunRequest> {
    let window = TimeWindow::from_iso(
        opt(&args.start_iso).as_deref(),
        opt(&args.end_iso).as_deref(),
        Utc::now(),
    )?;
    let speed = window::parse_speed(opt(&args.speed).as_deref(), window::DEFAULT_SPEED)?;

    Ok(RunRequest {
        window,
        speed,
        camera_id: opt(&args.camera_id),
        camera_name: opt(&args.camera_name),
        key_scheme: KeyScheme::Timelapse {
            clip_type: opt(&args.clip_type),
            key_override: opt(&args.out_key),
        },
    })
}

fn sunset_request(args: &SunsetArgs) -> Result<RunRequest> {
    let window = window::last_sunset_window(
        Utc::now(),
        args.latitude,
        args.longitude,
        chrono::Duration::minutes(args.before_minutes),
        chrono::Duration::minutes(args.after_minutes),
    )?;
    let speed = window::parse_speed(opt(&args.speed).as_deref(), window::DEFAULT_SUNSET_SPEED)?;

    Ok(RunRequest {
        window,
        speed,
        camera_id: opt(&args.camera_id),
        camera_name: None,
        key_scheme: KeyScheme::Sunset,
    })
}

async fn archive(request: RunRequest) -> Result<()> {
    let ring = RingConfig::from_env()?;
    let r2 = R2Config::from_env()?;
    let pipeline = PipelineConfig::from_env()?;

    let report = orchestrator::run(&ring, &r2, &pipeline, &request).await?;
    info!(
        "Timelapse from camera {} (job {}) archived at {} ({} bytes)",
        report.camera.id, report.job_id, report.key, report.bytes
    );
    Ok(())
}

async fn execute(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run(args) => archive(run_request(&args)?).await,
        Commands::Sunset(args) => archive(sunset_request(&args)?).await,
        Commands::Serve(args) => {
            let r2 = R2Config::from_env()?;
            let gate = DispatchGate::from_config(&DispatchConfig::from_env());
            api::run_api_server(Arc::new(S3Querier::new(&r2)), gate, &args.addr).await?;
            Ok(())
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let stage = err
                .downcast_ref::<TimelapseError>()
                .map_or("run", TimelapseError::stage);
            error!("{} failed: {:#}", stage, err);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("ring-timelapse").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn run_flags_build_the_request() {
        let Commands::Run(args) = parse(&[
            "run",
            "--start-iso",
            "2024-06-01T20:00:00Z",
            "--end-iso",
            "2024-06-01T20:30:00Z",
            "--speed",
            "30",
            "--camera-id",
            "",
        ])
        .command
        else {
            panic!("expected run");
        };

        let request = run_request(&args).unwrap();
        assert_eq!(request.camera_id, None);
        assert_eq!(
            request.key_scheme.key(&request.window, request.speed),
            "2024/June/ring-custom-20240601-30x.mp4"
        );
    }

    #[test]
    fn one_sided_window_is_an_input_error() {
        let Commands::Run(args) = parse(&["run", "--start-iso", "2024-06-01T20:00:00Z"]).command
        else {
            panic!("expected run");
        };
        let err = run_request(&args).unwrap_err();
        assert_eq!(
            err.downcast_ref::<TimelapseError>().map(TimelapseError::stage),
            Some("input validation")
        );
    }

    #[test]
    fn sunset_accepts_negative_coordinates() {
        let args = ["sunset", "--latitude", "-33.86", "--longitude", "-70.65"];
        let Commands::Sunset(args) = parse(&args).command else {
            panic!("expected sunset");
        };
        assert_eq!(args.longitude, -70.65);
        assert_eq!(args.before_minutes, 20);
        assert_eq!(args.after_minutes, 10);
    }

    #[test]
    fn negative_sunset_margins_are_refused() {
        let args = ["sunset", "--latitude", "1", "--longitude", "1", "--before-minutes=-5"];
        assert!(Cli::try_parse_from(std::iter::once("ring-timelapse").chain(args)).is_err());
    }
}
