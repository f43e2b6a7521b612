//! `sqpack` command-line tool.
//!
//! Thin wrapper around the sqpack-archive library:
//! - `list` prints the entries of an archive
//! - `extract` unpacks one entry or every entry with a known path
//! - `pack` builds a new archive from a directory, optionally on top of an
//!   existing one
//! - `verify` opens an archive strictly and checks every entry's blocks

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use sqpack_archive::{GeneratorConfig, IoMode, ReaderConfig, SqPackReader, VirtualSqPack};
use sqpack_formats::{FileStream, PathSpec, RandomAccessStream, SharedStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum IoArg {
    Mmap,
    Positional,
    Memory,
}

impl From<IoArg> for IoMode {
    fn from(arg: IoArg) -> Self {
        match arg {
            IoArg::Mmap => Self::Mmap,
            IoArg::Positional => Self::Positional,
            IoArg::Memory => Self::Memory,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "sqpack", version, about = "Inspect and build SqPack archives")]
struct Cli {
    /// File access strategy for reading archives
    #[arg(long, value_enum, default_value = "mmap", global = true)]
    io: IoArg,

    /// Verify checksums and table invariants
    #[arg(long, global = true)]
    strict: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List archive entries
    List {
        /// `.index` or `.index2` file
        index: PathBuf,
        /// Only list entries directly inside this directory
        #[arg(long)]
        dir: Option<String>,
    },
    /// Unpack entries
    Extract {
        /// `.index` or `.index2` file
        index: PathBuf,
        /// Entry path; every entry with a known path when omitted
        path: Option<String>,
        /// Output file or directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },
    /// Build an archive from a directory
    Pack {
        /// Directory whose files become entries, keyed by relative path
        input: PathBuf,
        /// Output directory
        output: PathBuf,
        /// Archive file name without extension
        #[arg(long, default_value = "000000.win32")]
        name: String,
        /// Existing archive whose entries are carried over
        #[arg(long)]
        base: Option<PathBuf>,
        /// Generator configuration (JSON)
        #[arg(long, env = "SQPACK_GENERATOR_CONFIG")]
        config: Option<PathBuf>,
        /// Compress every entry before writing instead of on demand
        #[arg(long)]
        eager: bool,
    },
    /// Check every entry of an archive
    Verify {
        /// `.index` or `.index2` file
        index: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let reader_config = ReaderConfig::default()
        .with_strict(cli.strict)
        .with_io_mode(cli.io.into());

    match cli.command {
        Command::List { index, dir } => list(&index, dir.as_deref(), reader_config),
        Command::Extract {
            index,
            path,
            output,
        } => extract(&index, path.as_deref(), &output, reader_config),
        Command::Pack {
            input,
            output,
            name,
            base,
            config,
            eager,
        } => {
            let config = match config {
                Some(path) => GeneratorConfig::from_json_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => GeneratorConfig::default(),
            };
            let strict = cli.strict || config.strict;
            let lazy = config.lazy_encoding && !eager;
            let config = config.with_strict(strict).with_lazy_encoding(lazy);
            pack(&input, &output, &name, base.as_deref(), config, reader_config)
        }
        Command::Verify { index } => verify(&index, reader_config.with_strict(true)),
    }
}

fn open(index: &Path, config: ReaderConfig) -> Result<SqPackReader> {
    SqPackReader::open(index, config).with_context(|| format!("opening {}", index.display()))
}

fn list(index: &Path, dir: Option<&str>, config: ReaderConfig) -> Result<()> {
    let reader = open(index, config)?;
    let entries = match dir {
        Some(dir) => reader.list_folder(dir)?,
        None => reader.entries().to_vec(),
    };
    for entry in &entries {
        println!("{}\t{}", entry.locator, entry.spec);
    }
    tracing::info!("{} entries", entries.len());
    Ok(())
}

fn extract(index: &Path, path: Option<&str>, output: &Path, config: ReaderConfig) -> Result<()> {
    let reader = open(index, config)?;

    if let Some(path) = path {
        let data = reader.read_path(path)?;
        let target = if output.is_dir() {
            let name = PathSpec::new(path).file_name().unwrap_or(path).to_string();
            output.join(name)
        } else {
            output.to_path_buf()
        };
        std::fs::write(&target, data).with_context(|| format!("writing {}", target.display()))?;
        return Ok(());
    }

    let mut written = 0usize;
    for entry in reader.entries() {
        let Some(text) = entry.spec.text() else {
            tracing::debug!("Skipping {} without a known path", entry.spec);
            continue;
        };
        let target = output.join(text);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = reader
            .unpacked_stream(entry.locator)
            .with_context(|| format!("opening {text}"))?
            .read_all()
            .with_context(|| format!("unpacking {text}"))?;
        std::fs::write(&target, data)?;
        written += 1;
    }
    tracing::info!(
        "Extracted {written} of {} entries to {}",
        reader.entries().len(),
        output.display()
    );
    Ok(())
}

fn pack(
    input: &Path,
    output: &Path,
    name: &str,
    base: Option<&Path>,
    config: GeneratorConfig,
    reader_config: ReaderConfig,
) -> Result<()> {
    let mut archive = VirtualSqPack::new(config);

    if let Some(base) = base {
        let reader = open(base, reader_config)?;
        archive.add_from_reader(&reader, false)?;
    }

    for item in WalkDir::new(input).sort_by_file_name() {
        let item = item?;
        if !item.file_type().is_file() {
            continue;
        }
        let relative = item.path().strip_prefix(input)?;
        let Some(relative) = relative.to_str() else {
            bail!("{} is not valid UTF-8", relative.display());
        };
        let stream: SharedStream = Arc::new(FileStream::open(item.path())?);
        archive.add_raw(relative, stream, true)?;
    }

    let frozen = archive.freeze()?;
    let mut cache = frozen.export_cache();
    let written = frozen.export(output, name, &mut cache)?;
    for path in written {
        println!("{}", path.display());
    }
    Ok(())
}

fn verify(index: &Path, config: ReaderConfig) -> Result<()> {
    let reader = open(index, config)?;
    let mut failed = 0usize;
    for entry in reader.entries() {
        if let Err(e) = reader.verify_entry(entry.locator) {
            tracing::error!("{} at {}: {e}", entry.spec, entry.locator);
            failed += 1;
        }
    }
    if failed > 0 {
        bail!("{failed} of {} entries failed verification", reader.entries().len());
    }
    tracing::info!("All {} entries verified", reader.entries().len());
    Ok(())
}
