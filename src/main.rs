use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use daq_nexus::config::Settings;
use daq_nexus::device::DeviceRegistry;
use daq_nexus::experiment::Document;
use daq_nexus::logging;
use daq_nexus::materializer::RunMaterializer;
use daq_nexus::schema::{self, ContractRegistry, SchemaSet};
use daq_nexus::sink::Backend;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

pub type Result<T> = anyhow::Result<T>;

#[derive(Parser)]
#[command(name = "daq_nexus")]
#[command(about = "Schema-driven NeXus writer for run documents", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate device schemas; the file stem names the device.
    Validate {
        #[arg(required = true)]
        schemas: Vec<PathBuf>,
    },
    /// Replay a JSON-lines document file and write one output file per run.
    Replay {
        /// Directory of `<device>.yml` schemas (defaults to `schema.directory`)
        #[arg(long)]
        schemas: Option<PathBuf>,

        /// Documents, one `{"name": ..., "doc": ...}` object per line
        #[arg(long)]
        documents: PathBuf,

        /// Static device definitions (YAML)
        #[arg(long)]
        devices: Option<PathBuf>,

        /// Output directory (overrides `output.directory`)
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        /// Output backend (overrides `output.backend`)
        #[arg(long)]
        backend: Option<Backend>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Settings::load().context("Failed to load configuration")?,
    };
    match cli.log_format {
        LogFormat::Text => logging::init(&settings.application.log_level),
        LogFormat::Json => logging::init_json(&settings.application.log_level),
    }

    match cli.cmd {
        Commands::Validate { schemas } => validate(&schemas),
        Commands::Replay {
            schemas,
            documents,
            devices,
            output,
            backend,
        } => replay(settings, schemas, &documents, devices, output, backend),
    }
}

fn validate(files: &[PathBuf]) -> Result<()> {
    let registry = ContractRegistry::builtin();
    let mut failed = 0;
    for file in files {
        let device = file
            .file_stem()
            .and_then(|stem| stem.to_str())
            .with_context(|| format!("Cannot derive a device name from {}", file.display()))?;
        let text = std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        match schema::load(device, &text, &registry) {
            Ok(model) => println!(
                "{}: ok ({} placeholder(s))",
                file.display(),
                model.placeholders().len()
            ),
            Err(e) => {
                failed += 1;
                println!("{}: {}", file.display(), e);
            }
        }
    }
    if failed > 0 {
        bail!("{} of {} schema(s) failed validation", failed, files.len());
    }
    Ok(())
}

fn replay(
    mut settings: Settings,
    schemas: Option<PathBuf>,
    documents: &Path,
    devices: Option<PathBuf>,
    output: Option<PathBuf>,
    backend: Option<Backend>,
) -> Result<()> {
    if let Some(output) = output {
        settings.output.directory = output;
    }
    if let Some(backend) = backend {
        settings.output.backend = backend;
    }

    let schema_set = match schemas.or_else(|| settings.schema.directory.clone()) {
        Some(dir) => SchemaSet::load_dir(&dir, ContractRegistry::builtin())
            .with_context(|| format!("Failed to load schemas from {}", dir.display()))?,
        None => SchemaSet::default(),
    };
    let device_registry = match devices {
        Some(path) => DeviceRegistry::load_yaml(&path)
            .with_context(|| format!("Failed to load devices from {}", path.display()))?,
        None => DeviceRegistry::new(),
    };

    let mut writer = RunMaterializer::new(
        Arc::new(schema_set),
        device_registry,
        settings.output.backend.create_sink(),
        settings.writer_options(),
    );

    let file = std::fs::File::open(documents)
        .with_context(|| format!("Failed to open {}", documents.display()))?;
    let mut runs = 0;
    let mut incomplete = 0;
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", documents.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let document: Document = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid document", documents.display(), index + 1))?;
        if let Some(report) = writer
            .handle(document)
            .with_context(|| format!("{}:{}: document rejected", documents.display(), index + 1))?
        {
            runs += 1;
            println!(
                "{} -> {} ({} leaves written)",
                report.uid,
                report.output_path.display(),
                report.leaves_written
            );
            if !report.is_complete() {
                incomplete += 1;
                for failure in &report.failures {
                    error!("{}", failure);
                }
            }
        }
    }

    info!(
        "Replayed {} run(s), {} with failed leaves",
        runs, incomplete
    );
    Ok(())
}
