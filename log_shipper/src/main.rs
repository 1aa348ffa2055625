//! Log Shipper Demo Binary
//!
//! Simulates a small weather forecast API that logs every request through the
//! pipeline until the request budget is spent or Ctrl-C arrives.

use clap::Parser;
use log_shipper::{Config, ExceptionInfo, LogEmitter, Pipeline, Result, ShipperError, arg};
use rand::Rng;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CITIES: &[&str] = &["Victoria", "Vancouver", "Kelowna", "Prince George", "Nanaimo"];
const SUMMARIES: &[&str] = &["Freezing", "Chilly", "Cool", "Mild", "Warm", "Hot"];

#[derive(Debug, Parser)]
#[command(name = "log_shipper", version, about = "Ship structured logs from a simulated web API")]
struct Args {
    /// Simulated requests to serve; 0 runs until Ctrl-C
    #[arg(long, env = "DEMO_REQUESTS", default_value_t = 0)]
    requests: u64,

    /// Delay between simulated requests
    #[arg(long, env = "DEMO_INTERVAL_MS", default_value_t = 500)]
    interval_ms: u64,

    /// Fraction of requests that fail with an exception
    #[arg(long, env = "DEMO_ERROR_RATE", default_value_t = 0.1)]
    error_rate: f64,

    /// How often pipeline metrics are logged
    #[arg(long, env = "STATS_INTERVAL_SECONDS", default_value_t = 60)]
    stats_interval_secs: u64,
}

#[derive(Debug, thiserror::Error)]
#[error("upstream forecast service returned {status} for {city}")]
struct ForecastError {
    status: u16,
    city: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    initialize_tracing()?;
    let args = Args::parse();

    info!("Starting log shipper v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env();
    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    info!(
        "Pipeline configuration - Application: {}, Environment: {}, Minimum level: {}, Sinks: {}",
        config.application,
        config.environment,
        config.minimum_level,
        config
            .sinks
            .iter()
            .map(|sink| sink.name())
            .collect::<Vec<_>>()
            .join(",")
    );

    let pipeline = Pipeline::builder(config).build()?;
    let reporter = pipeline.spawn_stats_reporter(Duration::from_secs(args.stats_interval_secs.max(1)));

    let app = pipeline.for_context("WeatherApi.Program");
    app.information("Application started, serving {Requests} requests", vec![arg("Requests", args.requests)]);

    tokio::select! {
        _ = serve(&pipeline, &args) => {
            info!("Request budget spent");
        }
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|e| ShipperError::Config(format!("Failed to wait for shutdown signal: {}", e)))?;
            info!("Shutdown signal received");
        }
    }

    app.information("Application stopping", Vec::new());
    let report = pipeline.shutdown().await;
    reporter.abort();

    info!(
        "Final pipeline metrics - Accepted: {}, Rejected: {}, Filtered: {}, Completed within grace: {}",
        report.stats.pipeline.events_accepted,
        report.stats.pipeline.events_rejected,
        report.stats.pipeline.events_filtered,
        report.completed_within_grace
    );
    Ok(())
}

/// Emit request logs the way a small forecast controller would.
async fn serve(pipeline: &Pipeline, args: &Args) {
    let controller = pipeline.for_context("WeatherApi.Controllers.WeatherForecastController");
    let routing = pipeline.for_context("Microsoft.AspNetCore.Routing.EndpointMiddleware");
    let mut served = 0u64;

    while args.requests == 0 || served < args.requests {
        served += 1;
        let (city, temperature, elapsed_ms, failed) = {
            let mut rng = rand::rng();
            (
                CITIES[rng.random_range(0..CITIES.len())],
                rng.random_range(-20..45),
                rng.random_range(3..250),
                rng.random_bool(args.error_rate.clamp(0.0, 1.0)),
            )
        };

        routing.debug(
            "Executing endpoint {EndpointName}",
            vec![arg("EndpointName", "WeatherApi.Controllers.WeatherForecastController.Get")],
        );

        if failed {
            let failure = ForecastError {
                status: 503,
                city: city.to_string(),
            };
            let exception = ExceptionInfo::from_error(&failure).with_frame(
                "WeatherForecastController::get",
                Some("src/controllers/weather.rs"),
                Some(42),
            );
            controller.error(
                "Forecast request {RequestId} for {City} failed after {ElapsedMs} ms",
                vec![arg("RequestId", served), arg("City", city), arg("ElapsedMs", elapsed_ms)],
                Some(exception),
            );
        } else {
            let summary = SUMMARIES[((temperature + 20) as usize * SUMMARIES.len()) / 65];
            controller.information(
                "Forecast for {City}: {TemperatureC} C, {Summary} ({ElapsedMs} ms)",
                vec![
                    arg("City", city),
                    arg("TemperatureC", temperature),
                    arg("Summary", summary),
                    arg("ElapsedMs", elapsed_ms),
                ],
            );
            if elapsed_ms > 200 {
                controller.warning(
                    "Slow forecast request {RequestId} took {ElapsedMs} ms",
                    vec![arg("RequestId", served), arg("ElapsedMs", elapsed_ms)],
                );
            }
        }

        tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
    }
}

/// Initialize structured logging for the shipper itself. Output goes to
/// stderr so it never interleaves with the console sink.
fn initialize_tracing() -> Result<()> {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .json();

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&log_level))
        .map_err(|e| ShipperError::Config(format!("Invalid log filter '{}': {}", log_level, e)))?;

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
    Ok(())
}
