use std::io;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use geoscan_daemon::{App, Cli, Command, TargetCommand, signal};
use geoscan_infra::config::GeoscanConfig;
use geoscan_observability::LogFormat;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = GeoscanConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let format: LogFormat = config.logging.format.parse()?;
    geoscan_observability::init_with_filter(format, &config.logging.filter);

    let app = App::open(config)?;
    let mut out = io::stdout().lock();

    match cli.command {
        Command::Run { workers, once } => {
            let token = CancellationToken::new();
            signal::cancel_on_signal(token.clone())?;
            let stats = app.run(workers, once, &token)?;
            token.cancel();
            for s in &stats {
                tracing::info!(
                    cycles = s.cycles,
                    points = s.points_processed,
                    failed = s.points_failed,
                    high_value = s.high_value_points,
                    jobs_completed = s.jobs_completed,
                    jobs_failed = s.jobs_failed,
                    jobs_paused = s.jobs_paused,
                    "worker summary"
                );
            }
        }
        Command::Target(TargetCommand::Create(args)) => {
            app.create_target(&args, &mut out)?;
        }
        Command::Target(TargetCommand::List) => app.list_targets(&mut out)?,
        Command::Enqueue { target, priority } => app.enqueue(&target, priority, &mut out)?,
        Command::Status => app.status(&mut out)?,
        Command::Reclaim { max_age_secs } => {
            app.reclaim(max_age_secs.map(Duration::from_secs), &mut out)?;
        }
        Command::Jobs { target } => app.jobs(&target, &mut out)?,
    }
    Ok(())
}
