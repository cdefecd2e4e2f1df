//! sftpack CLI - conversion, tokenization and packing of SFT corpora.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use sftpack_core::{EngineConfig, OverflowPolicy, PromptPolicy, TemplateKind};
use sftpack_data::{ConversationTable, Engine, RawDataset, Tokenizer, RUST_EXPLANATION, STARCODER};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "sftpack")]
#[command(author, version, about = "Convert, tokenize and pack SFT datasets", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every command that converts raw records.
#[derive(clap::Args, Debug, Clone)]
struct ConvertArgs {
    /// Input dataset (JSONL, or Parquet when the extension is `.parquet`)
    #[arg(short, long)]
    input: PathBuf,

    /// Engine configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Record layout: alpaca or sharegpt (overrides the config)
    #[arg(long)]
    format_type: Option<String>,

    /// Dataset type tag, e.g. starcoder or rust_explanation (overrides the config)
    #[arg(long)]
    dataset_type: Option<String>,

    /// Per-field token budget (overrides the config)
    #[arg(long)]
    max_tokens: Option<usize>,

    /// Worker threads (defaults to one per core)
    #[arg(long)]
    threads: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert raw records to the conversation table
    Convert {
        #[command(flatten)]
        args: ConvertArgs,

        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        /// Output format
        #[arg(long, value_enum, default_value = "jsonl")]
        output_format: OutputFormat,
    },

    /// Convert, tokenize and pack records into fixed-length blocks (JSONL)
    Pack {
        #[command(flatten)]
        args: ConvertArgs,

        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        /// Path to tokenizer.json (overrides the config)
        #[arg(short, long)]
        tokenizer: Option<PathBuf>,

        /// Block length (overrides the config)
        #[arg(long)]
        block_length: Option<usize>,

        /// Pack contiguous shards of this many examples in parallel
        #[arg(long)]
        shard_size: Option<usize>,

        /// Chat template (overrides the config)
        #[arg(long, value_enum)]
        template: Option<TemplateArg>,

        /// Drop examples longer than a block instead of truncating them
        #[arg(long)]
        skip_overflow: bool,
    },

    /// Show converted rows one page at a time
    Inspect {
        #[command(flatten)]
        args: ConvertArgs,

        /// Page to show (0-based)
        #[arg(long, default_value = "0")]
        page: usize,

        /// Rows per page
        #[arg(long, default_value = "10")]
        page_size: usize,
    },

    /// Encode text to token IDs (one JSON list per text)
    Encode {
        /// Path to tokenizer.json
        #[arg(short, long)]
        tokenizer: PathBuf,

        /// Texts to encode, one output line each
        #[arg(long, required = true, num_args = 1..)]
        text: Vec<String>,
    },

    /// Decode comma-separated token IDs to text
    Decode {
        /// Path to tokenizer.json
        #[arg(short, long)]
        tokenizer: PathBuf,

        /// Token IDs, e.g. "1,2,3"
        #[arg(long)]
        ids: String,
    },

    /// Generate a sample configuration file
    InitConfig {
        /// Output path
        #[arg(short, long, default_value = "sftpack.yaml")]
        output: PathBuf,
    },

    /// List the registered dataset types
    ListTypes,
}

/// Table output format.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// One `{"data", "features"}` document
    Json,
    /// One row object per line
    Jsonl,
    /// Arrow columns in a Parquet file
    Parquet,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TemplateArg {
    Chatml,
    Llama3,
    Alpaca,
}

impl From<TemplateArg> for TemplateKind {
    fn from(arg: TemplateArg) -> Self {
        match arg {
            TemplateArg::Chatml => TemplateKind::ChatMl,
            TemplateArg::Llama3 => TemplateKind::Llama3,
            TemplateArg::Alpaca => TemplateKind::Alpaca,
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Convert {
            args,
            output,
            output_format,
        } => run_convert(&args, &output, output_format),
        Commands::Pack {
            args,
            output,
            tokenizer,
            block_length,
            shard_size,
            template,
            skip_overflow,
        } => {
            let mut config = load_config(&args)?;
            if tokenizer.is_some() {
                config.tokenizer_path = tokenizer;
            }
            if let Some(block_length) = block_length {
                config.packing.block_length = block_length;
            }
            if shard_size.is_some() {
                config.packing.shard_size = shard_size;
            }
            if let Some(template) = template {
                config.template = template.into();
            }
            if skip_overflow {
                config.packing.overflow = OverflowPolicy::Skip;
            }
            run_pack(&args, config, &output)
        }
        Commands::Inspect {
            args,
            page,
            page_size,
        } => run_inspect(&args, page, page_size),
        Commands::Encode { tokenizer, text } => {
            let tokenizer = Tokenizer::from_file(&tokenizer)?;
            let texts: Vec<&str> = text.iter().map(String::as_str).collect();
            for ids in tokenizer.encode_batch(&texts)? {
                println!("{}", serde_json::to_string(&ids)?);
            }
            Ok(())
        }
        Commands::Decode { tokenizer, ids } => {
            let tokenizer = Tokenizer::from_file(&tokenizer)?;
            let ids = parse_ids(&ids)?;
            println!("{}", tokenizer.decode(&ids)?);
            Ok(())
        }
        Commands::InitConfig { output } => generate_sample_config(&output),
        Commands::ListTypes => {
            let engine = Engine::from_config(EngineConfig::default())?;
            for tag in engine.converter().registry().tags() {
                println!("{tag}");
            }
            Ok(())
        }
    }
}

/// Load the configuration file (if any) and apply command-line overrides.
fn load_config(args: &ConvertArgs) -> anyhow::Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(format_type) = &args.format_type {
        config.format_type = format_type.parse()?;
    }
    if let Some(dataset_type) = &args.dataset_type {
        config.dataset_type = dataset_type.clone();
    }
    if let Some(max_tokens) = args.max_tokens {
        config.max_tokens = max_tokens;
    }
    if args.threads.is_some() {
        config.num_threads = args.threads;
    }
    Ok(config)
}

fn load_dataset(path: &Path) -> anyhow::Result<RawDataset> {
    let is_parquet = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("parquet"));
    let dataset = if is_parquet {
        RawDataset::from_parquet(path, None)?
    } else {
        RawDataset::from_jsonl(path)?
    };
    info!(path = %path.display(), records = dataset.len(), "Loaded dataset");
    Ok(dataset)
}

fn convert(engine: &Engine, input: &Path) -> anyhow::Result<ConversationTable> {
    let dataset = load_dataset(input)?;
    let output = engine.convert_batch_default(dataset.records())?;
    if output.stats.malformed > 0 {
        println!(
            "{} malformed rows replaced with empty records",
            output.stats.malformed
        );
    }
    Ok(output.table)
}

fn run_convert(args: &ConvertArgs, output: &Path, format: OutputFormat) -> anyhow::Result<()> {
    let engine = Engine::from_config(load_config(args)?)?;
    let table = convert(&engine, &args.input)?;

    match format {
        OutputFormat::Json => {
            let mut writer = BufWriter::new(create_output(output)?);
            serde_json::to_writer(&mut writer, &table.to_json())?;
            writer.flush()?;
        }
        OutputFormat::Jsonl => {
            let mut writer = BufWriter::new(create_output(output)?);
            for row in table.to_jsonl_rows() {
                serde_json::to_writer(&mut writer, &row)?;
                writeln!(writer)?;
            }
            writer.flush()?;
        }
        OutputFormat::Parquet => table.write_parquet(output)?,
    }

    println!("Wrote {} rows to {}", table.len(), output.display());
    Ok(())
}

fn run_pack(args: &ConvertArgs, config: EngineConfig, output: &Path) -> anyhow::Result<()> {
    if config.tokenizer_path.is_none() {
        bail!("packing needs a tokenizer: pass --tokenizer or set tokenizer_path in the config");
    }
    let shard_size = config.packing.shard_size;
    let engine = Engine::from_config(config)?;

    let table = convert(&engine, &args.input)?;
    let examples = engine.tokenize_table(&table)?;
    info!(examples = examples.len(), "Tokenized records");

    let mut writer = BufWriter::new(create_output(output)?);
    let mut blocks_written = 0usize;
    let mut failed_shards = 0usize;

    let shards = match shard_size {
        Some(size) => engine.pack_sharded(examples, size)?,
        None => vec![engine.pack(examples)],
    };
    for (index, shard) in shards.into_iter().enumerate() {
        match shard {
            Ok((blocks, stats)) => {
                for block in &blocks {
                    serde_json::to_writer(&mut writer, block)?;
                    writeln!(writer)?;
                }
                blocks_written += blocks.len();
                println!("Shard {}: {}", index, stats.summary());
            }
            Err(e) => {
                error!(shard = index, error = %e, "Packing failed");
                failed_shards += 1;
            }
        }
    }
    writer.flush()?;

    let totals = engine.counters().snapshot();
    println!(
        "Wrote {} blocks to {} ({} rows, {} examples)",
        blocks_written,
        output.display(),
        totals.rows_converted,
        totals.examples_packed
    );
    if failed_shards > 0 {
        bail!("{failed_shards} shard(s) failed to pack");
    }
    Ok(())
}

fn run_inspect(args: &ConvertArgs, page: usize, page_size: usize) -> anyhow::Result<()> {
    if page_size == 0 {
        bail!("--page-size must be positive");
    }
    let engine = Engine::from_config(load_config(args)?)?;
    let table = convert(&engine, &args.input)?;
    let num_pages = table.num_pages(page_size);

    println!("========================================");
    println!("  Page {} of {} ({} rows)", page + 1, num_pages.max(1), table.len());
    println!("========================================\n");

    for (offset, row) in table.page(page, page_size).into_iter().enumerate() {
        println!("--- Row {} ---", page * page_size + offset);
        println!("{}", serde_json::to_string_pretty(&row.to_json())?);
    }
    Ok(())
}

fn create_output(path: &Path) -> anyhow::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    File::create(path).with_context(|| format!("Failed to create {}", path.display()))
}

fn parse_ids(ids: &str) -> anyhow::Result<Vec<u32>> {
    ids.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .with_context(|| format!("Invalid token id `{s}`"))
        })
        .collect()
}

fn generate_sample_config(output: &Path) -> anyhow::Result<()> {
    let mut config = EngineConfig {
        tokenizer_path: Some(PathBuf::from("./tokenizer.json")),
        dataset_type: RUST_EXPLANATION.to_string(),
        ..Default::default()
    };
    config.prompts.insert(
        RUST_EXPLANATION.to_string(),
        PromptPolicy::with_instruction("Explain what the following Rust code does."),
    );
    config.prompts.insert(
        STARCODER.to_string(),
        PromptPolicy::with_instruction("Write the following program."),
    );

    let yaml = serde_yaml::to_string(&config)?;
    std::fs::write(output, yaml)?;

    println!("Sample configuration written to: {}", output.display());
    println!("\nYou can edit this file and pack a dataset with:");
    println!(
        "  sftpack pack --config {} --input data.jsonl --output blocks.jsonl",
        output.display()
    );

    Ok(())
}
