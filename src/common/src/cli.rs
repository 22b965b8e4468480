use clap::Parser;
use std::path::PathBuf;

/// Arguments shared by every reflector-gc entry point
#[derive(Parser, Debug, Clone, Default)]
pub struct CommonArgs {
    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, help = "Enable quiet mode (minimal output)")]
    pub quiet: bool,
}

/// Which stages of a sweep to run.
///
/// Classification always happens: either from the reflector and claim index,
/// or from the local cache when `load_cache` is set.
#[derive(Parser, Debug, Clone)]
pub struct PhaseArgs {
    #[arg(long, help = "Load streams and blobs from the local cache instead of the reflector")]
    pub load_cache: bool,

    #[arg(long, help = "Fetch the blob inventory of invalid streams")]
    pub resolve_blobs: bool,

    #[arg(long, help = "Persist classification and inventory to the local cache")]
    pub save: bool,

    #[arg(long, help = "Delete the blobs of invalid streams from the object store")]
    pub wipe: bool,

    #[arg(long, help = "Re-check spent claims against the chain hub before purging")]
    pub double_check: bool,

    #[arg(long, help = "Remove reflector metadata of streams whose blobs are all deleted")]
    pub prune_metadata: bool,

    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, help = "Treat streams with an expired claim as invalid")]
    pub check_expired: bool,

    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, help = "Treat streams with a spent claim as invalid")]
    pub check_spent: bool,

    #[arg(
        long,
        default_value_t = 50_000_000,
        help = "Approximate upper bound on stream ids to scan (not an exact count)"
    )]
    pub limit: i64,

    #[arg(long, help = "Write all classified streams to a JSON-lines file")]
    pub export_streams: Option<PathBuf>,

    #[arg(long, help = "Read streams from a JSON-lines file instead of the reflector")]
    pub import_streams: Option<PathBuf>,
}

/// Utility functions for CLI operations
pub mod utils {
    use super::*;
    use crate::config::Configuration;
    use anyhow::{Context, Result};
    use tracing_subscriber::EnvFilter;

    /// Initialize logging based on CLI arguments. `RUST_LOG` wins when set.
    pub fn init_logging(args: &CommonArgs) {
        let level = if args.quiet {
            "warn"
        } else if args.verbose {
            "debug"
        } else {
            "info"
        };

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    /// Load configuration with optional override from CLI
    pub fn load_config(config_path: Option<&PathBuf>) -> Result<Configuration> {
        let config = match config_path {
            Some(path) => {
                log::info!("Loading configuration from: {}", path.display());
                Configuration::load_from_path(path).context("Failed to load configuration")?
            }
            None => Configuration::load().context("Failed to load configuration")?,
        };
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    /// Refuse flag combinations that would read and write the same source.
    pub fn validate_phases(phases: &PhaseArgs) -> Result<()> {
        if phases.load_cache && phases.import_streams.is_some() {
            anyhow::bail!("--load-cache and --import-streams are mutually exclusive");
        }
        if phases.limit <= 0 {
            anyhow::bail!("--limit must be positive, got {}", phases.limit);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        phases: PhaseArgs,
    }

    #[test]
    fn test_phase_defaults() {
        let cli = TestCli::parse_from(["reflector-gc"]);
        assert!(cli.phases.check_expired);
        assert!(cli.phases.check_spent);
        assert!(!cli.phases.wipe);
        assert_eq!(cli.phases.limit, 50_000_000);
        assert!(cli.common.config.is_none());
    }

    #[test]
    fn test_check_toggles_accept_false() {
        let cli = TestCli::parse_from([
            "reflector-gc",
            "--check-expired",
            "false",
            "--check-spent=false",
            "--wipe",
            "--limit",
            "1000",
        ]);
        assert!(!cli.phases.check_expired);
        assert!(!cli.phases.check_spent);
        assert!(cli.phases.wipe);
        assert_eq!(cli.phases.limit, 1000);
    }

    #[test]
    fn test_conflicting_sources_rejected() {
        let cli = TestCli::parse_from([
            "reflector-gc",
            "--load-cache",
            "--import-streams",
            "streams.jsonl",
        ]);
        assert!(utils::validate_phases(&cli.phases).is_err());
    }
}
