use anyhow::{Context, Result};
use breath_daq::{
    acquisition::{
        open_replay, open_serial, ByteSource, FrameReader, FrameReaderConfig, MockFirmware,
        SyntheticBreath,
    },
    config::Settings,
    data::storage::{CsvWriter, JsonLinesWriter, ReportSink},
    logging,
    pipeline::{forward_reports, spawn_session, Pipeline, SessionEnd, DEFAULT_REPORT_CAPACITY},
};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

const EXIT_FAILURE: u8 = 1;
const EXIT_CONFIG: u8 = 2;

#[derive(Parser)]
#[command(name = "breath_daq", version, about = "Breathing-rate acquisition from a two-sensor belt")]
struct Cli {
    /// TOML configuration file layered over the defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Acquire from the serial port.
    Run {
        #[arg(long)]
        port: Option<String>,
        #[arg(long)]
        baud: Option<u32>,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Process a recorded byte stream.
    Replay {
        file: PathBuf,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Write a synthetic recording that `replay` can read.
    Simulate {
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = 10)]
        frames: usize,
        #[arg(long, default_value_t = 15.0)]
        bpm: f64,
        /// Noise half-width in volts.
        #[arg(long, default_value_t = 0.01)]
        noise: f64,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Print the effective configuration as TOML.
    PrintConfig,
}

#[derive(Args)]
struct OutputArgs {
    /// Write every sample to this CSV file.
    #[arg(long)]
    csv: Option<PathBuf>,
    /// Print one JSON summary per frame on stdout.
    #[arg(long)]
    json: bool,
    /// Stop after this many processed frames.
    #[arg(long)]
    max_frames: Option<u64>,
}

impl OutputArgs {
    fn apply(&self, settings: &mut Settings) {
        if let Some(csv) = &self.csv {
            settings.storage.csv_path = Some(csv.display().to_string());
        }
        if self.max_frames.is_some() {
            settings.session.max_frames = self.max_frames;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut settings = match Settings::new(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match &cli.command {
        Command::Run { port, baud, output } => {
            if let Some(port) = port {
                settings.serial.port = port.clone();
            }
            if let Some(baud) = baud {
                settings.serial.baud_rate = *baud;
            }
            output.apply(&mut settings);
        }
        Command::Replay { output, .. } => output.apply(&mut settings),
        Command::Simulate { .. } | Command::PrintConfig => {}
    }
    if let Err(e) = settings.validate() {
        eprintln!("Configuration error: {}", e);
        return ExitCode::from(EXIT_CONFIG);
    }

    if let Err(e) = logging::init_from_config(&settings) {
        eprintln!("{:#}", e);
        return ExitCode::from(EXIT_CONFIG);
    }

    match execute(cli.command, &settings).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = ?e, "Command failed");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn execute(command: Command, settings: &Settings) -> Result<ExitCode> {
    match command {
        Command::Run { output, .. } => {
            let source = open_serial(&settings.serial)?;
            run_session(settings, source, output.json, false).await
        }
        Command::Replay { file, output } => {
            let source = open_replay(&file).await?;
            run_session(settings, source, output.json, true).await
        }
        Command::Simulate {
            out,
            frames,
            bpm,
            noise,
            seed,
        } => {
            let breath = SyntheticBreath {
                bpm,
                noise_v: noise,
                ..SyntheticBreath::default()
            };
            let bytes = MockFirmware::from_settings(settings, breath, seed).recording(frames)?;
            tokio::fs::write(&out, &bytes)
                .await
                .with_context(|| format!("Failed to write recording to {:?}", out))?;
            info!(path = %out.display(), frames, bytes = bytes.len(), "Recording written");
            Ok(ExitCode::SUCCESS)
        }
        Command::PrintConfig => {
            println!("{}", settings.to_toml()?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_session(
    settings: &Settings,
    source: ByteSource,
    json: bool,
    closed_is_normal: bool,
) -> Result<ExitCode> {
    let pipeline = match Pipeline::from_settings(settings) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!(error = %e, "Invalid pipeline configuration");
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };

    let mut sinks: Vec<Box<dyn ReportSink>> = Vec::new();
    if let Some(path) = &settings.storage.csv_path {
        sinks.push(Box::new(CsvWriter::new(path)));
    }
    if json {
        sinks.push(Box::new(JsonLinesWriter::new(std::io::stdout())));
    }
    for sink in sinks.iter_mut() {
        sink.init().await?;
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let stop_tx = Arc::new(stop_tx);
    let interrupt = Arc::clone(&stop_tx);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping session");
            let _ = interrupt.send(true);
        }
    });

    let reader = FrameReader::new(source, FrameReaderConfig::from_settings(&settings.frame))
        .with_shutdown(stop_rx);
    let (handle, reports) = spawn_session(pipeline, reader, DEFAULT_REPORT_CAPACITY);
    let sinks_ok = forward_reports(reports, &mut sinks, &stop_tx).await;

    let summary = handle.await.context("Session task panicked")?;
    for sink in sinks.iter_mut() {
        sink.shutdown().await?;
    }

    let ok = sinks_ok
        && match &summary.end {
            SessionEnd::Completed | SessionEnd::Cancelled | SessionEnd::ConsumerClosed => true,
            SessionEnd::StreamClosed => closed_is_normal,
            SessionEnd::TimeoutLimit | SessionEnd::Failed(_) => false,
        };
    Ok(if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_FAILURE)
    })
}
