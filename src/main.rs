use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pitch_stabilizer::config::Config;
use pitch_stabilizer::imu::StdDelay;
use pitch_stabilizer::messages::Telemetry;
use pitch_stabilizer::runtime::ControlLoop;
use pitch_stabilizer::sim::{self, Plant};

/// Run the pitch stabilization loop against the simulated rig
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// JSON config file; omitted fields keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stop after this many seconds (runs until Ctrl-C otherwise)
    #[arg(long)]
    duration: Option<f64>,

    /// Starting pitch of the simulated body in degrees
    #[arg(long, default_value_t = 15.0, allow_hyphen_values = true)]
    initial_pitch: f64,

    /// Print one JSON telemetry record per tick on stdout
    #[arg(long)]
    json: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Setup logging (set RUST_LOG=debug for per-tick traces)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Args::parse()).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => {
            info!("Loading config from {}", path.display());
            Config::load(path)?
        }
        None => Config::default(),
    };

    let (bus, pwm, plant) = sim::rig(&config, Plant::new(args.initial_pitch));
    let mut control = ControlLoop::new(config, bus, pwm)?;
    control.start(&mut StdDelay)?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let duration = match args.duration {
        Some(secs) if secs.is_finite() && secs >= 0.0 => Some(Duration::from_secs_f64(secs)),
        Some(secs) => return Err(format!("invalid duration {}", secs).into()),
        None => None,
    };
    tokio::spawn(async move {
        match duration {
            Some(limit) => {
                tokio::select! {
                    _ = tokio::time::sleep(limit) => info!("Run time elapsed"),
                    _ = tokio::signal::ctrl_c() => info!("Interrupted"),
                }
            }
            None => {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    // Dropping the sender would stop the loop
                    warn!("Cannot listen for Ctrl-C: {}", e);
                    std::future::pending::<()>().await;
                }
                info!("Interrupted");
            }
        }
        let _ = stop_tx.send(true);
    });

    let json = args.json;
    let mut last: Option<Telemetry> = None;
    control
        .run(stop_rx, |t| {
            if json {
                match serde_json::to_string(t) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("Failed to encode telemetry: {}", e),
                }
            }
            last = Some(*t);
        })
        .await?;

    if let Some(t) = last {
        info!(
            "Finished after {} ticks: estimate {:.2}°, body {:.2}°, bias {:.3}°/s",
            t.tick,
            t.pitch_estimate,
            plant.borrow().pitch_deg,
            t.gyro_bias
        );
    }
    Ok(())
}
