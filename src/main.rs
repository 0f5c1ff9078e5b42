// src/main.rs - bot-host: drive one bot from the command line
use clap::Parser;
use conductor_rs::{Bot, JobDescriptor, JobState, load_config};
use std::path::PathBuf;
use std::time::Duration;

/// Connect a bot, optionally run a job on it, then disconnect.
#[derive(Parser, Debug)]
#[command(name = "bot-host", about = "Drive a 3D printer or CNC bot and stream jobs to it.")]
struct Cli {
    /// Path to the bot's TOML config file
    #[arg(short, long, default_value = "bot.toml")]
    config: PathBuf,

    /// Instruction file to run after connecting
    #[arg(short, long)]
    job: Option<PathBuf>,

    /// trace, debug, info, warn or error
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,

    /// How often to poll status while a job runs
    #[arg(long, default_value_t = 1000)]
    status_interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.log_level).init();

    let config_path = cli.config.display().to_string();
    tracing::info!("Loading configuration from: {}", config_path);
    let config = load_config(&config_path).map_err(|e| {
        tracing::error!("Please ensure the configuration file exists and is properly formatted");
        Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>
    })?;

    let bot = Bot::new(config)?;
    bot.connect().await?;
    bot.update_routine()?;

    if let Some(path) = cli.job {
        let job = bot.start_job(JobDescriptor::from_path(path)).await?;
        tracing::info!("Started job {} ({} lines)", job.id, job.total_lines);

        let mut ticker = tokio::time::interval(Duration::from_millis(cli.status_interval_ms.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("Interrupted, stopping job");
                    bot.stop_job()?;
                    break;
                }
            }
            let status = bot.status();
            let Some(job) = status.job else { break };
            tracing::info!(
                "{} {}: line {}/{} ({}%)",
                status.name,
                status.state,
                job.current_line,
                job.total_lines,
                job.percent_complete
            );
            if matches!(job.state, JobState::Done | JobState::Stopped) {
                tracing::info!("Job {} {:?} after {} ms", job.id, job.state, job.elapsed_ms);
                break;
            }
        }
    }

    bot.disconnect().await?;
    Ok(())
}
