use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use blockfs::descriptor::{DType, Extent3, VolumeDescriptor, VolumeDescriptorBuilder};
use blockfs::store::{BlockStore, DEFAULT_QUEUE_DEPTH};

#[derive(Parser)]
#[command(name = "blockfs", version = "1.0.0", about = "Concurrent block store for dense 3-D voxel volumes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new store: writes the index file header and JSON metadata.
    Create {
        index: PathBuf,
        #[arg(long)]
        x_extent: u64,
        #[arg(long)]
        y_extent: u64,
        #[arg(long)]
        z_extent: u64,
        #[arg(long, default_value = "64")]
        x_block: u64,
        #[arg(long, default_value = "64")]
        y_block: u64,
        #[arg(long, default_value = "64")]
        z_block: u64,
        #[arg(long, default_value = "uint16")]
        dtype: String,
        #[arg(long, default_value = "1")]
        shards: usize,
        #[arg(long, default_value = "zstd")]
        codec: String,
        #[arg(long, default_value = "3")]
        level: i32,
    },
    /// Print a store's volume descriptor.
    Info { index: PathBuf },
    /// Write one block's raw bytes (from a file, or stdin with `-`) at (x,y,z).
    WriteRaw {
        index: PathBuf,
        #[arg(long)]
        x: u64,
        #[arg(long)]
        y: u64,
        #[arg(long)]
        z: u64,
        /// Path to the raw voxel bytes, or `-` for stdin.
        input: PathBuf,
        #[arg(long, default_value_t = DEFAULT_QUEUE_DEPTH)]
        queue_depth: usize,
    },
    /// Read one block's raw bytes at (x,y,z) to a file, or stdout with `-`.
    ReadRaw {
        index: PathBuf,
        #[arg(long)]
        x: u64,
        #[arg(long)]
        y: u64,
        #[arg(long)]
        z: u64,
        /// Destination path, or `-` for stdout.
        output: PathBuf,
    },
    /// Move the index and shard files to a new directory, rewriting `BlockFilenames`.
    Rebase {
        index: PathBuf,
        new_dir: PathBuf,
    },
    /// Walk the directory table and report entries whose range falls outside their shard file.
    Check { index: PathBuf },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Commands::Create {
            index, x_extent, y_extent, z_extent, x_block, y_block, z_block, dtype, shards, codec, level,
        } => {
            let dtype = parse_dtype(&dtype)?;
            let descriptor = VolumeDescriptorBuilder::new(
                Extent3::new(x_extent, y_extent, z_extent),
                Extent3::new(x_block, y_block, z_block),
                dtype,
                shards,
            )
            .compression(codec, level)
            .build()?;
            let store = BlockStore::create(descriptor, &index)?;
            println!("Created: {}", store.index_path().display());
            print_descriptor(store.descriptor());
        }

        Commands::Info { index } => {
            let store = BlockStore::open(&index)?;
            println!("── BlockFS store ────────────────────────────────────────");
            println!("  Index path    {}", store.index_path().display());
            print_descriptor(store.descriptor());
        }

        Commands::WriteRaw { index, x, y, z, input, queue_depth } => {
            let mut store = BlockStore::open(&index)?;
            let data = read_all(&input)?;
            store.start_workers(queue_depth)?;
            store.write_block(x, y, z, &data)?;
            store.close()?;
            println!("Wrote {} bytes at ({x},{y},{z})", data.len());
        }

        Commands::ReadRaw { index, x, y, z, output } => {
            let store = BlockStore::open(&index)?;
            let data = store.read_block(x, y, z)?;
            write_all(&output, &data)?;
            println!("Read {} bytes from ({x},{y},{z})", data.len());
        }

        Commands::Rebase { index, new_dir } => {
            let mut store = BlockStore::open(&index)?;
            store.rebase(&new_dir)?;
            println!("Rebased to: {}", store.index_path().display());
        }

        Commands::Check { index } => {
            let store = BlockStore::open(&index)?;
            let report = blockfs::check::check(&store)?;
            println!("── Directory check ──────────────────────────────────────");
            println!("  Total entries     {}", report.total_entries);
            println!("  Written entries   {}", report.written_entries);
            println!("  Healthy entries   {}", report.healthy_entries);
            println!("  Out-of-range      {}", report.out_of_range.len());
            for bad in &report.out_of_range {
                println!(
                    "    dir_offset={} shard={} file_offset={} byte_count={} shard_len={}",
                    bad.dir_offset, bad.shard_index, bad.file_offset, bad.byte_count, bad.shard_file_len
                );
            }
            if !report.is_healthy() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn print_descriptor(d: &VolumeDescriptor) {
    println!("  Extent        ({}, {}, {})", d.extent.x, d.extent.y, d.extent.z);
    println!("  Block shape   ({}, {}, {})", d.block_shape.x, d.block_shape.y, d.block_shape.z);
    println!("  DType         {}", d.dtype.name());
    println!("  Stride        ({}, {}, {})", d.stride.x, d.stride.y, d.stride.z);
    println!("  Entry bits    offset={} size={}", d.entry_layout.n_offset_bits, d.entry_layout.n_size_bits);
    println!("  Entry size    {} bytes", d.entry_layout.entry_size());
    println!("  Blocks        {}", d.n_blocks());
    println!("  Shards        {}", d.n_shards());
    println!("  Compression   {} (level {})", d.compression, d.compression_level);
    println!("  Version       {}", d.version);
    if !d.application_metadata.is_empty() {
        println!("  App metadata  {} key(s)", d.application_metadata.len());
    }
}

fn parse_dtype(s: &str) -> Result<DType, Box<dyn std::error::Error>> {
    Ok(match s {
        "uint8" => DType::U8,
        "uint16" => DType::U16,
        "uint32" => DType::U32,
        "uint64" => DType::U64,
        "int8" => DType::I8,
        "int16" => DType::I16,
        "int32" => DType::I32,
        "int64" => DType::I64,
        "float32" => DType::F32,
        "float64" => DType::F64,
        other => return Err(format!("unknown dtype '{other}'").into()),
    })
}

fn read_all(path: &PathBuf) -> io::Result<Vec<u8>> {
    if path.as_os_str() == "-" {
        let mut buf = Vec::new();
        io::stdin().read_to_end(&mut buf)?;
        Ok(buf)
    } else {
        fs::read(path)
    }
}

fn write_all(path: &PathBuf, data: &[u8]) -> io::Result<()> {
    if path.as_os_str() == "-" {
        io::stdout().write_all(data)
    } else {
        fs::write(path, data)
    }
}
