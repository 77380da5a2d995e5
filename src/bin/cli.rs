use clap::{Parser, Subcommand, ValueEnum};
use dedup_bloom::{
    BitStore, BloomFilter, CompressFunction, DigestConfigBuilder, FailSafeFilter,
    FileFilter, Filter, FilterCounter, InMemoryFilter, MemoryBitStore,
    RedbFilter, RedbFilterConfigBuilder, RedisBitStore, RedisKeyConfigBuilder,
    RedisKeyFilter, RedisLink, RedisSetConfigBuilder, RedisSetFilter, SetMode, Settings,
    common::{bytes2hr, shard_footprint},
    hex_to_base64, hex_to_sfb, identity,
};
use std::error::Error;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

type CliResult<T> = Result<T, Box<dyn Error>>;

#[derive(Parser)]
#[command(author, version, about = "Deduplicate lines read from stdin", long_about = None)]
struct Cli {
    /// Backend holding the seen set
    #[arg(short, long, value_enum, default_value = "bloom-memory")]
    backend: Backend,

    /// Directory of the `dup` file (file backend)
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// Database file (redb backend)
    #[arg(long, default_value = "dedup.redb")]
    db_path: PathBuf,

    /// Redis connection url, overrides DEDUP_REDIS_URL
    #[arg(long)]
    redis_url: Option<String>,

    /// Prefix of shard keys, overrides DEDUP_KEY_PREFIX
    #[arg(long)]
    key_prefix: Option<String>,

    /// Bits of address space per shard (1-32)
    #[arg(long)]
    bit_width: Option<u32>,

    /// Offsets per value
    #[arg(long)]
    hash_count: Option<usize>,

    /// Number of shards
    #[arg(long)]
    block_num: Option<usize>,

    /// Enable the saturation reset policy
    #[arg(long)]
    reset: Option<bool>,

    /// Fill ratio that triggers eviction
    #[arg(long)]
    max_fill_rate: Option<f64>,

    /// Seconds a fill-ratio snapshot stays valid
    #[arg(long)]
    check_period: Option<u64>,

    /// Outcome reported when the backend fails
    #[arg(long)]
    default_stat: Option<bool>,

    /// Digest re-encoding before storage
    #[arg(long, value_enum, default_value = "identity")]
    compress: Compress,

    /// Values per backend request
    #[arg(long, default_value = "100")]
    batch_size: usize,

    /// Print the outcome summary as JSON on stderr
    #[arg(long)]
    json_summary: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print lines that were not seen before
    Filter,

    /// Print `seen` or `new` followed by each line
    Check,

    /// Show shard keys, sizes and fill ratios (bloom backends)
    Info,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Backend {
    Memory,
    File,
    BloomMemory,
    BloomRedis,
    RedisSet,
    RedisZset,
    RedisKey,
    Redb,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Compress {
    Identity,
    Base64,
    Sfb,
}

impl Compress {
    fn function(self) -> CompressFunction {
        match self {
            Compress::Identity => identity,
            Compress::Base64 => hex_to_base64,
            Compress::Sfb => hex_to_sfb,
        }
    }
}

impl Cli {
    fn apply(&self, settings: &mut Settings) {
        if let Some(url) = &self.redis_url {
            settings.redis_url = url.clone();
        }
        if let Some(prefix) = &self.key_prefix {
            settings.key_prefix = prefix.clone();
        }
        if let Some(bit_width) = self.bit_width {
            settings.bit_width = bit_width;
        }
        if let Some(hash_count) = self.hash_count {
            settings.hash_count = hash_count;
        }
        if let Some(block_num) = self.block_num {
            settings.block_num = block_num;
        }
        if let Some(reset) = self.reset {
            settings.reset_enabled = reset;
        }
        if let Some(rate) = self.max_fill_rate {
            settings.max_fill_rate = rate;
        }
        if let Some(secs) = self.check_period {
            settings.check_period = Duration::from_secs(secs);
        }
        if let Some(stat) = self.default_stat {
            settings.default_stat = stat;
        }
    }
}

async fn open_bloom(
    cli: &Cli,
    settings: &Settings,
) -> CliResult<BloomFilter<Arc<dyn BitStore>>> {
    let store: Arc<dyn BitStore> = match cli.backend {
        Backend::BloomRedis => {
            Arc::new(RedisBitStore::connect(&settings.redis_config()?).await?)
        }
        _ => Arc::new(MemoryBitStore::new()),
    };
    let mut config = settings.bloom_config()?;
    config.digest.compress_function = cli.compress.function();
    Ok(BloomFilter::new(config, store).await?)
}

async fn open_filter(cli: &Cli, settings: &Settings) -> CliResult<Box<dyn Filter>> {
    let digest = DigestConfigBuilder::default()
        .compress_function(cli.compress.function())
        .build()?;
    let filter: Box<dyn Filter> = match cli.backend {
        Backend::Memory => Box::new(InMemoryFilter::new(digest)),
        Backend::File => Box::new(FileFilter::open(&cli.dir, digest)?),
        Backend::BloomMemory | Backend::BloomRedis => {
            Box::new(open_bloom(cli, settings).await?)
        }
        Backend::RedisSet | Backend::RedisZset => {
            let mode = if cli.backend == Backend::RedisZset {
                SetMode::Scored
            } else {
                SetMode::Plain
            };
            let config = RedisSetConfigBuilder::default()
                .key_prefix(settings.key_prefix.clone())
                .block_num(settings.block_num)
                .mode(mode)
                .digest(digest)
                .build()?;
            let link = RedisLink::connect(&settings.redis_config()?).await?;
            Box::new(RedisSetFilter::new(config, link).await?)
        }
        Backend::RedisKey => {
            let config = RedisKeyConfigBuilder::default()
                .key_prefix(settings.key_prefix.clone())
                .digest(digest)
                .build()?;
            let link = RedisLink::connect(&settings.redis_config()?).await?;
            Box::new(RedisKeyFilter::new(config, link).await?)
        }
        Backend::Redb => {
            let config = RedbFilterConfigBuilder::default()
                .path(cli.db_path.clone())
                .digest(digest)
                .build()?;
            Box::new(RedbFilter::open(config)?)
        }
    };
    Ok(filter)
}

fn emit(command: &Commands, lines: &[String], stats: &[bool]) -> io::Result<()> {
    let mut out = io::stdout().lock();
    for (line, &seen) in lines.iter().zip(stats) {
        match command {
            Commands::Filter if !seen => writeln!(out, "{line}")?,
            Commands::Check => {
                writeln!(out, "{}\t{line}", if seen { "seen" } else { "new" })?
            }
            _ => {}
        }
    }
    out.flush()
}

async fn run_stream(
    filter: &dyn Filter,
    command: &Commands,
    batch_size: usize,
) -> CliResult<FilterCounter> {
    let mut counter = FilterCounter::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut batch: Vec<String> = Vec::with_capacity(batch_size);
    loop {
        let line = lines.next_line().await?;
        let done = line.is_none();
        batch.extend(line);
        if batch.len() >= batch_size || (done && !batch.is_empty()) {
            let values: Vec<&[u8]> = batch.iter().map(|l| l.as_bytes()).collect();
            let stats = filter.exists_and_insert_many(&values).await?;
            emit(command, &batch, &stats)?;
            counter.extend(&stats);
            batch.clear();
        }
        if done {
            return Ok(counter);
        }
    }
}

async fn show_info(cli: &Cli, settings: &Settings) -> CliResult<()> {
    if !matches!(cli.backend, Backend::BloomMemory | Backend::BloomRedis) {
        return Err("info is only available for bloom backends".into());
    }
    let filter = open_bloom(cli, settings).await?;
    let config = filter.config();
    println!("Bloom Filter Configuration:");
    println!("  Key prefix: {}", config.key_prefix);
    println!("  Bit width: {}", config.bit_width);
    println!("  Hash count: {}", config.hash_count);
    println!("  Shards: {}", config.block_num);
    println!(
        "  Shard size: {}",
        bytes2hr(shard_footprint(config.bit_width))
    );
    println!(
        "  Reset: {} (max fill rate {}, check period {:?})",
        config.reset.enabled, config.reset.max_fill_rate, config.reset.check_period
    );
    let ratios = filter.fill_ratios().await?;
    for (key, ratio) in filter.shard_keys().iter().zip(ratios) {
        println!("  {key}: {:.4}% full", ratio * 100.0);
    }
    filter.close().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> CliResult<()> {
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    if cli.batch_size == 0 {
        return Err("batch size must be at least 1".into());
    }
    let mut settings = Settings::from_env()?;
    cli.apply(&mut settings);

    if let Commands::Info = cli.command {
        return show_info(&cli, &settings).await;
    }

    let filter =
        FailSafeFilter::new(open_filter(&cli, &settings).await?, settings.default_stat);
    let counter = run_stream(&filter, &cli.command, cli.batch_size).await?;
    filter.close().await?;

    let summary = counter.summary();
    info!(
        total = summary.total,
        seen = summary.seen,
        unseen = summary.unseen,
        seen_ratio = summary.seen_ratio,
        "dedup finished"
    );
    if cli.json_summary {
        eprintln!("{}", serde_json::to_string(&summary)?);
    }
    Ok(())
}
