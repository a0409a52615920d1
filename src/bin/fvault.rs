/// fvault - command line tool for a framevault data directory
///
/// Usage:
///   fvault status [--json]                         - Show vault stats
///   fvault append -p <partition> --seed <n>        - Append a generated frame
///   fvault append -p <partition> --vector-file <f> - Append a frame from JSON
///   fvault get <id>                                - Show one record
///   fvault similar -p <partition> --seed <n>       - Nearest neighbours
///   fvault range -p <partition> [--from] [--to]    - Records in a time range
///   fvault ghosts -p <partition>                   - Evicted records
///   fvault gc | compact | coherence | maintain     - Run a process once
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use colored::*;
use framevault::{
    FrameBuilder, FrameVault, PartitionId, RecordSummary, Stage, Tier, VaultConfig, VaultError,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};

/// fvault - tiered memory for vector frames
#[derive(Parser)]
#[command(name = "fvault")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data directory (default: ~/.local/share/framevault)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// JSON config file; --data-dir overrides its data_dir
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show partition, tier and process statistics
    Status {
        /// Print the stats as JSON
        #[arg(long)]
        json: bool,
    },

    /// Append a single-field frame
    ///
    /// Examples:
    ///   fvault append -p 1 --seed 7
    ///   fvault append -p 1 --vector-file v.json --confidence 0.9
    Append {
        #[arg(short, long)]
        partition: PartitionId,

        /// JSON array of floats used as field 0, resolution 0
        #[arg(long, conflicts_with = "seed")]
        vector_file: Option<PathBuf>,

        /// Generate a deterministic vector from this seed
        #[arg(long)]
        seed: Option<u64>,

        #[arg(long, default_value_t = 0.5)]
        confidence: f32,
    },

    /// Show one record by id
    Get { id: u64 },

    /// Nearest neighbours of a generated vector
    Similar {
        #[arg(short, long)]
        partition: PartitionId,

        #[arg(long)]
        seed: u64,

        #[arg(short, default_value_t = 5)]
        k: usize,
    },

    /// Records created in a time range (nanoseconds)
    Range {
        #[arg(short, long)]
        partition: PartitionId,

        #[arg(long, default_value_t = 0)]
        from: u64,

        #[arg(long, default_value_t = u64::MAX)]
        to: u64,
    },

    /// Ghosts of evicted records
    Ghosts {
        #[arg(short, long)]
        partition: PartitionId,
    },

    /// Run one garbage collection pass
    Gc,

    /// Compact storage segments and cold archives
    Compact,

    /// Run one coherence scan
    Coherence,

    /// Run every background process once
    Maintain,
}

fn load_config(cli: &Cli) -> Result<VaultConfig> {
    let mut config = match &cli.config {
        Some(path) => VaultConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => VaultConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    Ok(config)
}

fn seeded_vector(seed: u64, dim: usize) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

fn read_vector(path: &Path) -> Result<Vec<f32>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("{} is not a JSON array of numbers", path.display()))
}

fn format_timestamp(nanos: u64) -> String {
    chrono::DateTime::from_timestamp_nanos(nanos.min(i64::MAX as u64) as i64)
        .format("%Y-%m-%d %H:%M:%S%.3f UTC")
        .to_string()
}

fn tier_label(tier: Tier) -> ColoredString {
    match tier {
        Tier::Hot => "hot".red(),
        Tier::Warm => "warm".yellow(),
        Tier::Cold => "cold".cyan(),
    }
}

fn stage_label(stage: Stage) -> ColoredString {
    match stage {
        Stage::Full => "full".green(),
        Stage::Compressed => "compressed".normal(),
        Stage::Gist => "gist".bright_black(),
        Stage::Tombstone => "tombstone".red(),
    }
}

fn print_summary(summary: &RecordSummary) {
    let mut line = format!(
        "  {} {} {} {} {} conf={:.2}",
        "*".cyan(),
        summary.id.to_string().bright_white(),
        tier_label(summary.tier),
        stage_label(summary.stage),
        summary.timestamp.to_string().bright_black(),
        summary.confidence
    );
    if let Some(similarity) = summary.similarity {
        line.push_str(&format!(" sim={:.3}", similarity));
    }
    if let Some(winner) = summary.superseded_by {
        line.push_str(&format!(" {}", format!("superseded by {}", winner).yellow()));
    }
    println!("{}", line);
}

fn run(vault: &FrameVault, command: Commands) -> Result<()> {
    let dim = vault.config().record.vector_dim;
    match command {
        Commands::Status { json } => {
            let stats = vault.stats().context("Failed to collect stats")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
                return Ok(());
            }
            println!("{}", "Vault Status".bold().cyan());
            println!("  {} {}", "Data dir:".bright_white(), vault.config().data_dir.display());
            println!("  {} {}", "Records:".bright_white(), stats.record_count());
            println!("  {} {}", "Live:".bright_white(), stats.live_count());
            println!(
                "  {} {}/{} ({:.0}% hit rate)",
                "Hot:".bright_white(),
                stats.hot.current_size,
                stats.hot.capacity,
                stats.hot.hit_rate() * 100.0
            );
            println!("  {} {}/{}", "Warm:".bright_white(), stats.warm.current_size, stats.warm.capacity);
            println!("  {} {}", "Cold archives:".bright_white(), stats.cold.archives);
            println!("  {} {}/{}", "Ghosts:".bright_white(), stats.ghosts, stats.ghost_capacity);
            if stats.partitions.is_empty() {
                println!("{}", "No partitions".yellow());
            }
            for p in &stats.partitions {
                println!(
                    "  {} p{} records={} live={} segments={} wal={}B",
                    "*".cyan(),
                    p.id.to_string().bright_white(),
                    p.records,
                    p.live,
                    p.segments,
                    p.wal.bytes
                );
            }
        }

        Commands::Append {
            partition,
            vector_file,
            seed,
            confidence,
        } => {
            let vector = match (vector_file, seed) {
                (Some(path), _) => read_vector(&path)?,
                (None, Some(seed)) => seeded_vector(seed, dim),
                (None, None) => bail!("either --vector-file or --seed is required"),
            };
            let frame = FrameBuilder::new(partition)
                .field(0, confidence)
                .level(0, 0, vector)
                .build()
                .context("Invalid frame")?;
            let id = vault.append(frame).context("Failed to append frame")?;
            println!("{}", "OK".green().bold());
            println!("  Appended: {} in p{}", id.to_string().cyan(), partition.to_string().cyan());
        }

        Commands::Get { id } => match vault.get(id)? {
            Some(frame) => {
                println!("{}", "Frame".bold().cyan());
                println!("  {} {}", "Id:".bright_white(), frame.id());
                println!("  {} {}", "Partition:".bright_white(), frame.partition());
                println!(
                    "  {} {} ({})",
                    "Timestamp:".bright_white(),
                    frame.timestamp(),
                    format_timestamp(frame.timestamp()).bright_black()
                );
                println!("  {} {:.3}", "Confidence:".bright_white(), frame.confidence());
                if let Some(parent) = frame.parent_ref() {
                    println!("  {} {}", "Parent:".bright_white(), parent);
                }
                if let Some(summary) = vault.summary(frame.partition(), id) {
                    println!("  {} {}", "Tier:".bright_white(), tier_label(summary.tier));
                    println!("  {} {}", "Stage:".bright_white(), stage_label(summary.stage));
                }
                for (i, field) in frame.fields() {
                    println!(
                        "  {} field {} conf={:.2} levels={}",
                        "*".cyan(),
                        i,
                        field.confidence(),
                        field.levels().count()
                    );
                }
            }
            None => {
                eprintln!("{}", "Error".red().bold());
                eprintln!("  {}", VaultError::NotFound { what: format!("frame {}", id) });
                std::process::exit(1);
            }
        },

        Commands::Similar { partition, seed, k } => {
            let hits = vault.query_similar(partition, &seeded_vector(seed, dim), k)?;
            if hits.is_empty() {
                println!("{}", "No matches".yellow());
            }
            for hit in &hits {
                print_summary(hit);
            }
        }

        Commands::Range { partition, from, to } => {
            let mut count = 0;
            for summary in vault.query_range(partition, from, to) {
                print_summary(&summary);
                count += 1;
            }
            if count == 0 {
                println!("{}", "No records in range".yellow());
            }
        }

        Commands::Ghosts { partition } => {
            let ghosts = vault.ghosts(partition);
            if ghosts.is_empty() {
                println!("{}", "No ghosts".yellow());
            }
            for ghost in ghosts {
                println!(
                    "  {} {} in {} conf={:.2}",
                    "*".cyan(),
                    ghost.id.to_string().bright_white(),
                    tier_label(ghost.location),
                    ghost.confidence
                );
            }
        }

        Commands::Gc => {
            let report = vault.collect_garbage()?;
            println!("{}", "OK".green().bold());
            println!(
                "  Scanned {}, compressed {}, gisted {}, tombstoned {}, exempt {}",
                report.scanned, report.compressed, report.gisted, report.tombstoned, report.exempted
            );
        }

        Commands::Compact => {
            let compacted = vault.compact()?;
            println!("{}", "OK".green().bold());
            println!("  Compacted: {}", compacted);
        }

        Commands::Coherence => {
            let report = vault.coherence_pass()?;
            println!("{}", "OK".green().bold());
            println!(
                "  Scanned {}, contradictions {}, superseded {}",
                report.scanned, report.contradictions, report.superseded
            );
        }

        Commands::Maintain => {
            let report = vault.maintenance_cycle()?;
            println!("{}", "OK".green().bold());
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;
    let vault = FrameVault::open(config).context("Failed to open vault")?;

    // Close even if the command failed
    let result = run(&vault, cli.command);
    vault.close().await.context("Failed to close vault")?;
    result
}
