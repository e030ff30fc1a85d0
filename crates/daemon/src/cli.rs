//! Command-line surface.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "geoscan", version, about = "Continuous geospatial site scanner")]
pub struct Cli {
    /// TOML configuration file.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start scan workers and run until interrupted.
    Run {
        /// Worker threads (overrides `worker.count`).
        #[arg(long)]
        workers: Option<usize>,

        /// Process at most one job on a single worker, then exit.
        #[arg(long)]
        once: bool,
    },

    /// Manage scan targets.
    #[command(subcommand)]
    Target(TargetCommand),

    /// Queue a scan job for a target (id or name).
    Enqueue {
        target: String,

        /// Higher runs first.
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        priority: i32,
    },

    /// Queue counts, event statistics and worker heartbeats as JSON.
    Status,

    /// Return jobs stuck in `running` to `pending`.
    Reclaim {
        /// Reclaim jobs started at least this long ago (defaults to
        /// `worker.stale_after_secs`).
        #[arg(long)]
        max_age_secs: Option<u64>,
    },

    /// Job history for a target (id or name), newest first.
    Jobs { target: String },
}

#[derive(Debug, Subcommand)]
pub enum TargetCommand {
    /// Register a square scan area around a center point.
    Create(CreateTarget),

    /// List registered targets.
    List,
}

#[derive(Debug, Args)]
pub struct CreateTarget {
    pub name: String,

    #[arg(long, allow_hyphen_values = true)]
    pub lat: f64,

    #[arg(long, allow_hyphen_values = true)]
    pub lon: f64,

    /// Half-width of the area.
    #[arg(long, default_value_t = 5.0)]
    pub radius_km: f64,

    #[arg(long)]
    pub description: Option<String>,

    #[arg(long)]
    pub points_per_cycle: Option<u32>,

    #[arg(long)]
    pub max_points: Option<u64>,

    /// Pause between cycles.
    #[arg(long)]
    pub interval_secs: Option<u64>,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_flags() {
        let cli = Cli::parse_from(["geoscan", "--config", "scan.toml", "run", "--workers", "4"]);
        assert_eq!(cli.config, Some(PathBuf::from("scan.toml")));
        assert!(matches!(cli.command, Command::Run { workers: Some(4), once: false }));
    }

    #[test]
    fn parses_target_create_with_negative_coordinates() {
        let cli = Cli::parse_from([
            "geoscan", "target", "create", "bay", "--lat", "37.7", "--lon", "-122.4", "--max-points", "200",
        ]);
        let Command::Target(TargetCommand::Create(args)) = cli.command else {
            panic!("expected target create");
        };
        assert_eq!(args.name, "bay");
        assert_eq!(args.lon, -122.4);
        assert_eq!(args.radius_km, 5.0);
        assert_eq!(args.max_points, Some(200));
    }

    #[test]
    fn parses_enqueue_priority() {
        let cli = Cli::parse_from(["geoscan", "enqueue", "bay", "--priority", "-2"]);
        assert!(matches!(cli.command, Command::Enqueue { ref target, priority: -2 } if target == "bay"));
    }
}
