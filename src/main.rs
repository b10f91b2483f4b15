use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use flomon_forecast::artifacts::ArtifactStore;
use flomon_forecast::config::ForecastConfig;
use flomon_forecast::context::ForecastContext;
use flomon_forecast::logging::{self, Component};
use flomon_forecast::model::ForecastError;
use flomon_forecast::risk::PredictionEnvelope;
use flomon_forecast::training;

#[derive(Parser)]
#[command(name = "flomon-forecast", author, version, about = "Hybrid flood forecasting", long_about = None)]
struct Cli {
    /// TOML configuration file; overrides FLOMON_FORECAST_CONFIG
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Retrain every model from scratch and save the artifacts
    Train,
    /// Run the hourly simulation and print one alert per line
    Simulate {
        /// Hours to simulate; defaults to simulation.hours
        #[arg(long)]
        hours: Option<usize>,
    },
    /// Score one request, e.g. --fields '{"rainfall": 120, ...}'
    Predict {
        #[arg(long)]
        fields: String,
    },
}

fn load_config(path: Option<PathBuf>) -> Result<ForecastConfig, ForecastError> {
    let config = match path {
        Some(path) => {
            dotenv::dotenv().ok();
            let mut config = ForecastConfig::load(path)?;
            config.apply_env();
            config
        }
        None => ForecastConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), ForecastError> {
    let line = serde_json::to_string(value).map_err(|e| ForecastError::Config(e.to_string()))?;
    println!("{}", line);
    Ok(())
}

fn train(config: &ForecastConfig) -> Result<(), ForecastError> {
    let store = ArtifactStore::new(&config.model.artifact_dir, &config.model.family);
    let (_, report) = training::train_and_persist(config, &store)?;
    training::train_universal(config, &store)?;
    print_json(&report)
}

fn simulate(config: ForecastConfig, hours: Option<usize>) -> Result<(), ForecastError> {
    let hours = hours.unwrap_or(config.simulation.hours);
    let context = ForecastContext::initialize(config)?;
    for alert in context.simulate(hours)? {
        print_json(&alert)?;
    }
    Ok(())
}

fn predict(config: ForecastConfig, fields: &str) -> Result<(), ForecastError> {
    let envelope = match serde_json::from_str::<BTreeMap<String, f64>>(fields) {
        Ok(values) => {
            let context = ForecastContext::initialize(config)?;
            let pairs: Vec<(&str, f64)> = values.iter().map(|(k, v)| (k.as_str(), *v)).collect();
            context.predict(&pairs)
        }
        Err(e) => PredictionEnvelope::from(Err(ForecastError::Config(format!("--fields: {}", e)))),
    };
    print_json(&envelope)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    logging::init_logger(
        config.logging.level,
        config.logging.file.as_deref(),
        config.logging.timestamps,
    );

    let result = match cli.command {
        Commands::Train => train(&config),
        Commands::Simulate { hours } => simulate(config, hours),
        Commands::Predict { fields } => predict(config, &fields),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            logging::error(Component::System, None, &e.to_string());
            ExitCode::FAILURE
        }
    }
}
