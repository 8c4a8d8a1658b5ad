use std::path::Path;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use horde_engine::EngineConfig;
use topic_engine::TopicConfig;

use crate::error::BenchError;

#[derive(Parser)]
#[command(name = "horde-bench", about = "Drive join steps with a synthetic population of minions")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Join each minion with one value per source under its key
    InnerJoin(BenchArgs),
    /// Pair each minion with the latest value of every source
    ZipLast(BenchArgs),
}

#[derive(Args, Clone, Debug)]
pub struct BenchArgs {
    /// Path to the TOML engine config
    #[arg(long, default_value = "horde.toml", env = "HORDE_CONFIG")]
    pub config: String,

    /// Number of minions to run
    #[arg(long, default_value_t = 1000)]
    pub minions: usize,

    /// Number of secondary sources feeding the step
    #[arg(long, default_value_t = 2)]
    pub sources: usize,

    /// Minions executing at the same time
    #[arg(long, default_value_t = 64)]
    pub concurrency: usize,

    /// Overrides `join.cache_timeout_ms`
    #[arg(long)]
    pub cache_timeout_ms: Option<u64>,

    /// Overrides `topic.buffer_size`
    #[arg(long)]
    pub buffer_size: Option<usize>,
}

// ═══════════════════════════════════════════════════════════════
//  Effective — merged config
// ═══════════════════════════════════════════════════════════════

/// Settings after merging: config file < env/CLI.
#[derive(Debug, Clone)]
pub struct Effective {
    pub minions: usize,
    pub sources: usize,
    pub concurrency: usize,
    pub topic: TopicConfig,
    pub cache_timeout: Duration,
}

impl Effective {
    pub fn new(args: &BenchArgs) -> Result<Self, BenchError> {
        let config = match EngineConfig::load(&args.config) {
            Ok(config) => config,
            Err(e) => {
                if Path::new(&args.config).exists() {
                    return Err(e.into());
                }
                tracing::debug!(config = %args.config, "no config file, using defaults");
                EngineConfig::default()
            }
        };

        if args.sources == 0 {
            return Err(BenchError::Config("--sources must be at least 1".into()));
        }
        if args.concurrency == 0 {
            return Err(BenchError::Config("--concurrency must be at least 1".into()));
        }

        let mut topic = config.topic;
        if let Some(buffer_size) = args.buffer_size {
            topic.buffer_size = Some(buffer_size);
        }

        Ok(Self {
            minions: args.minions,
            sources: args.sources,
            concurrency: args.concurrency,
            topic,
            cache_timeout: args
                .cache_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(config.join.cache_timeout),
        })
    }
}
