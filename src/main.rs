use std::{
    fs::{self, File},
    path::Path,
    process::ExitCode,
    sync::{Arc, Mutex},
};

use anyhow::Context;
use clap::Parser;
use realmload::{
    Executor, Reporter, Scheduler, ScenarioProfile,
    api::HttpIdentityApi,
    campaign::Campaign,
    cli::{Cli, Command},
    clock::WallClock,
    executor::StopSignal,
    report::{ArtifactReporter, RunResult, StdoutReporter},
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    if let Command::List = cli.command {
        print_catalog();
        return Ok(ExitCode::SUCCESS);
    }

    let log_file = match cli.command {
        Command::All { .. } => Some(campaign_log(&cli.global.results_dir)?),
        _ => None,
    };
    init_tracing(cli.global.verbose, log_file);

    let config = cli
        .global
        .engine_config()
        .context("invalid configuration")?;
    let api = HttpIdentityApi::new(config.base_url.clone(), config.request_timeout)
        .context("failed to build http client")?;

    let stop = StopSignal::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, draining virtual users...");
                stop.stop();
            }
        });
    }

    let clock = WallClock::new();
    let scheduler = Scheduler::builder()
        .api(Arc::new(api))
        .config(Arc::new(config))
        .stop(stop.clone())
        .clock(clock)
        .build();
    let artifacts = ArtifactReporter::new(cli.global.results_dir.clone());

    match cli.command {
        Command::Run(args) => {
            let profile = args.profile()?;
            let start = clock.now();
            let (result, code) = match scheduler.exec(&profile).await {
                Ok(result) => (result, ExitCode::SUCCESS),
                Err(e) => {
                    let reason = e.to_string();
                    (
                        RunResult::failed(profile, start, clock.now(), reason),
                        ExitCode::FAILURE,
                    )
                }
            };
            if let Err(e) = (StdoutReporter, artifacts).report(&result).await {
                tracing::warn!("Failed to report results: {e}");
            }
            Ok(code)
        }
        Command::All { cooldown } => {
            let campaign = Campaign::builder()
                .executor(scheduler)
                // summaries reach stdout and the campaign log through tracing
                .reporter(artifacts)
                .stop(stop)
                .clock(clock)
                .build();
            let result = campaign.run(&ScenarioProfile::catalog(), cooldown).await;
            Ok(if result.any_failed() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
        Command::List => Ok(ExitCode::SUCCESS),
    }
}

fn init_tracing(verbose: bool, log_file: Option<File>) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("realmload={default_level},warn")));

    let file_layer = log_file.map(|file| {
        fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();
}

fn campaign_log(dir: &Path) -> anyhow::Result<File> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(format!(
        "campaign_{}.log",
        WallClock::new().now().format("%Y%m%d_%H%M%S")
    ));
    File::create(&path).with_context(|| format!("failed to create {}", path.display()))
}

fn print_catalog() {
    println!(
        "{:<8} {:>6} {:>11} {:>9} {:>8}",
        "name", "users", "spawn rate", "duration", "ramp-up"
    );
    for profile in ScenarioProfile::catalog() {
        println!(
            "{:<8} {:>6} {:>9}/s {:>8}s {:>7}s",
            profile.name(),
            profile.virtual_user_count(),
            profile.spawn_rate(),
            profile.duration().as_secs(),
            profile.ramp_up().as_secs(),
        );
    }
}
