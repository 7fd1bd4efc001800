//! Ferryman CLI
//!
//! Moves records between databases, files, queues and search clusters.

// CLI tool - relax pedantic lints for ergonomics
#![allow(clippy::pedantic)]

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ferryman::adaptor::config::parse_sample;
use ferryman::adaptor::registry;
use ferryman::pipeline::{SinkSpec, SourceSpec};
use ferryman::{get_adaptor, ConfigMap, ImportConfig, Pipeline, PipelineSpec, PipelineStats};

#[derive(Parser)]
#[command(name = "ferryman")]
#[command(version)]
#[command(about = "Move records between databases, files, queues and search clusters", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a source into a search cluster
    Import(ImportArgs),

    /// Run a pipeline file
    Run {
        /// Pipeline file (YAML)
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Show a progress spinner
        #[arg(long)]
        progress: bool,
    },

    /// Generate a pipeline file from the adaptors' sample configurations
    Init {
        /// Source adaptor
        source: String,

        /// Sink adaptor
        sink: String,

        /// Output file path
        #[arg(short, long, default_value = "pipeline.yaml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Connect to both ends of a pipeline without moving data
    Verify {
        /// Pipeline file (YAML)
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// List registered adaptors
    Adaptors {
        /// Print the sample configuration of one adaptor
        #[arg(long, value_name = "NAME")]
        sample: Option<String>,
    },
}

#[derive(clap::Args)]
struct ImportArgs {
    /// Destination: full URL or index name on the local cluster
    destination: Option<String>,

    /// TOML configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Source adaptor
    #[arg(long = "src.type", value_name = "TYPE")]
    src_type: Option<String>,

    /// Source URI
    #[arg(long = "src.uri", value_name = "URI")]
    src_uri: Option<String>,

    /// Namespace regex
    #[arg(long = "src.filter", value_name = "REGEX")]
    src_filter: Option<String>,

    /// Keep following changes after the initial copy
    #[arg(short, long)]
    tail: bool,

    /// Require TLS on the source connection
    #[arg(long)]
    ssl: bool,

    /// Namespace for file sources
    #[arg(long = "typename", value_name = "NAME")]
    type_name: Option<String>,

    /// Logical replication slot used when tailing
    #[arg(long, value_name = "SLOT")]
    replication_slot: Option<String>,

    /// Source connection timeout
    #[arg(long, value_name = "DURATION")]
    timeout: Option<String>,

    /// YAML list of functions applied to every record
    #[arg(long, value_name = "FILE")]
    transform_file: Option<PathBuf>,

    /// Commit log directory
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Bulk request size limit in bytes
    #[arg(long, value_name = "BYTES")]
    request_size: Option<usize>,

    /// Bulk actions per request
    #[arg(long, value_name = "N")]
    bulk_requests: Option<usize>,

    /// Print the generated pipeline and exit
    #[arg(long)]
    test: bool,

    /// Show a progress spinner
    #[arg(long)]
    progress: bool,
}

impl ImportArgs {
    fn apply(self, config: &mut ImportConfig) {
        if let Some(destination) = self.destination {
            config.dest.uri = destination;
        }
        if let Some(kind) = self.src_type {
            config.src.kind = kind;
        }
        if let Some(uri) = self.src_uri {
            config.src.uri = uri;
        }
        if let Some(filter) = self.src_filter {
            config.src.filter = filter;
        }
        if self.tail {
            config.src.tail = true;
        }
        if self.ssl {
            config.src.ssl = true;
        }
        if let Some(type_name) = self.type_name {
            config.src.type_name = type_name;
        }
        if let Some(slot) = self.replication_slot {
            config.src.replication_slot = slot;
        }
        if let Some(timeout) = self.timeout {
            config.src.timeout = timeout;
        }
        if self.transform_file.is_some() {
            config.src.transform_file = self.transform_file;
        }
        if self.log_dir.is_some() {
            config.src.log_dir = self.log_dir;
        }
        if self.request_size.is_some() {
            config.dest.request_size = self.request_size;
        }
        if self.bulk_requests.is_some() {
            config.dest.bulk_requests = self.bulk_requests;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout sinks stay clean.
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Import(args) => run_import(args).await,
        Commands::Run { file, progress } => {
            let spec = PipelineSpec::from_file(&file)
                .with_context(|| format!("loading {}", file.display()))?;
            run_pipeline(spec, progress).await
        }
        Commands::Init {
            source,
            sink,
            output,
            force,
        } => generate_spec(&source, &sink, &output, force),
        Commands::Verify { file } => verify(&file).await,
        Commands::Adaptors { sample } => list_adaptors(sample.as_deref()),
    }
}

async fn run_import(args: ImportArgs) -> anyhow::Result<()> {
    let mut config = ImportConfig::load(args.config.as_deref())?;
    let test = args.test;
    let progress = args.progress;
    args.apply(&mut config);

    let spec = config.to_pipeline_spec()?;
    if test {
        print!("{}", spec.to_yaml()?);
        return Ok(());
    }
    run_pipeline(spec, progress).await
}

async fn run_pipeline(spec: PipelineSpec, progress: bool) -> anyhow::Result<()> {
    let mut pipeline = Pipeline::new(spec)?.with_progress(progress);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping");
            on_signal.cancel();
        }
    });

    let stats = pipeline.run(cancel).await?;
    print_stats(&stats);
    Ok(())
}

fn print_stats(stats: &PipelineStats) {
    eprintln!("\n✅ Import Complete!");
    eprintln!("   Read:       {}", stats.read);
    eprintln!("   Written:    {}", stats.written);
    eprintln!("   Failed:     {}", stats.failed);
    if stats.logged > 0 || stats.replayed > 0 {
        eprintln!("   Logged:     {}", stats.logged);
        eprintln!("   Replayed:   {}", stats.replayed);
    }
    eprintln!("   Duration:   {:.2}s", stats.duration_secs);
    eprintln!("   Throughput: {:.0} msg/sec", stats.throughput());
}

fn generate_spec(source: &str, sink: &str, output: &Path, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        bail!("{} already exists, use --force to overwrite", output.display());
    }

    let source_adaptor = get_adaptor(source, &ConfigMap::new())?;
    let sink_adaptor = get_adaptor(sink, &ConfigMap::new())?;
    let spec = PipelineSpec {
        source: SourceSpec {
            kind: source.to_string(),
            config: parse_sample(source_adaptor.sample_config())?,
            filter: None,
        },
        sink: SinkSpec {
            kind: sink.to_string(),
            config: parse_sample(sink_adaptor.sample_config())?,
        },
        functions: Vec::new(),
        commit_log: None,
    };

    std::fs::write(output, spec.to_yaml()?)?;
    info!("pipeline written to {}", output.display());
    println!("✅ Generated {}", output.display());
    println!("   Edit the URIs, then run: ferryman run {}", output.display());
    Ok(())
}

async fn verify(file: &Path) -> anyhow::Result<()> {
    let spec = PipelineSpec::from_file(file).with_context(|| format!("loading {}", file.display()))?;
    let pipeline = Pipeline::new(spec)?;

    let mut failed = 0;
    for check in pipeline.verify().await {
        match &check.result {
            Ok(()) => println!("✅ {} {} {}", check.side, check.adaptor, check.role),
            Err(e) => {
                failed += 1;
                println!("❌ {} {} {}: {e}", check.side, check.adaptor, check.role);
            }
        }
    }
    if failed > 0 {
        bail!("{failed} check(s) failed");
    }
    Ok(())
}

fn list_adaptors(sample: Option<&str>) -> anyhow::Result<()> {
    if let Some(name) = sample {
        let adaptor = get_adaptor(name, &ConfigMap::new())?;
        println!("{}", adaptor.sample_config());
        return Ok(());
    }

    for adaptor in registry().defaults() {
        let roles: Vec<String> = adaptor.roles().iter().map(ToString::to_string).collect();
        println!(
            "{:<14} {:<22} {}",
            adaptor.name(),
            roles.join(","),
            adaptor.description()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_dotted_flags() {
        let cli = Cli::try_parse_from([
            "ferryman",
            "import",
            "--src.type",
            "mysql",
            "--src.uri",
            "mysql://root@localhost/shop",
            "-t",
            "shop",
        ])
        .unwrap();
        let Commands::Import(args) = cli.command else {
            panic!("expected import");
        };
        let mut config = ImportConfig::default();
        args.apply(&mut config);
        assert_eq!(config.src.kind, "mysql");
        assert!(config.src.tail);
        assert_eq!(config.dest.uri, "shop");
    }

    #[test]
    fn test_import_flags_override_config() {
        let cli = Cli::try_parse_from([
            "ferryman",
            "import",
            "--bulk-requests",
            "50",
            "--log-dir",
            "/tmp/ferryman",
        ])
        .unwrap();
        let Commands::Import(args) = cli.command else {
            panic!("expected import");
        };
        let mut config = ImportConfig::default();
        config.dest.uri = "from-file".to_string();
        config.dest.bulk_requests = Some(10);
        args.apply(&mut config);
        assert_eq!(config.dest.uri, "from-file");
        assert_eq!(config.dest.bulk_requests, Some(50));
        assert_eq!(config.src.log_dir, Some(PathBuf::from("/tmp/ferryman")));
    }
}
