//! sqz CLI - build SquashFS images from a directory tree

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use walkdir::WalkDir;

use sqz::fs::{SourceMetadata, SourceType};
use sqz::{Config, DevKind, Error, ImageWriter, IoResultExt, IpcKind, NodeId};

#[derive(Parser)]
#[command(name = "sqz")]
#[command(about = "SquashFS image builder - deterministic, compressed, deduplicated")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// build an image from a source directory
    Build {
        /// source directory to pack
        source: PathBuf,

        /// image file to create
        image: PathBuf,

        /// TOML config file; flags below override it
        #[arg(long)]
        config: Option<PathBuf>,

        /// base-2 log of the block size (12..=20)
        #[arg(long)]
        block_log: Option<u32>,

        /// compressor: none, zlib, xz, lz4, zstd
        #[arg(short, long)]
        compression: Option<String>,

        /// collapse identical blocks and fragment tails
        #[arg(long)]
        dedup: bool,

        /// compress and write on the calling thread
        #[arg(long)]
        single_threaded: bool,

        /// superblock modification time (seconds since epoch, default 0)
        #[arg(long)]
        mtime: Option<u32>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> sqz::Result<()> {
    match cli.command {
        Commands::Build {
            source,
            image,
            config,
            block_log,
            compression,
            dedup,
            single_threaded,
            mtime,
        } => {
            let mut config = match config {
                Some(path) => Config::load(&path)?,
                None => Config::default(),
            };
            if let Some(block_log) = block_log {
                config.block_log = block_log;
            }
            if let Some(compression) = compression {
                config.compression = compression;
            }
            if dedup {
                config.dedup = true;
            }
            if single_threaded {
                config.single_threaded = true;
            }
            if let Some(mtime) = mtime {
                config.modification_time = mtime;
            }
            config.validate()?;

            let bytes_used = build(&source, &image, config)?;
            println!("wrote {} ({} bytes)", image.display(), bytes_used);
            Ok(())
        }
    }
}

/// walk the source tree and feed every entry into the image
fn build(source: &Path, image: &Path, config: Config) -> sqz::Result<u64> {
    let mut writer = ImageWriter::create(image, config)?;

    let root_meta = SourceMetadata::from_path(source)?;
    let root = writer.root();
    apply_metadata(&mut writer, root, &root_meta);

    // sorted walk keeps images reproducible for identical input
    for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_default();
            Error::Io {
                path,
                source: e.into(),
            }
        })?;

        let rel = entry
            .path()
            .strip_prefix(source)
            .expect("walk stays under source");
        let rel = rel.to_string_lossy();
        let meta = SourceMetadata::from_path(entry.path())?;

        match meta.file_type {
            Some(SourceType::Directory) => {
                let dir = writer.subdir_for_path(&rel)?;
                apply_metadata(&mut writer, dir, &meta);
            }
            Some(SourceType::Regular) => {
                let file = writer.put_regular_for_path(&rel)?;
                apply_metadata(&mut writer, file, &meta);
                stream_file(&mut writer, file, entry.path())?;
                writer.finish_file(file)?;
            }
            Some(SourceType::Symlink) => {
                let target = std::fs::read_link(entry.path()).with_path(entry.path())?;
                let node = writer.put_symlink_for_path(&rel, &target.to_string_lossy())?;
                apply_metadata(&mut writer, node, &meta);
            }
            Some(SourceType::BlockDevice) => {
                let node = writer.put_device_for_path(&rel, DevKind::Block, meta.rdev)?;
                apply_metadata(&mut writer, node, &meta);
            }
            Some(SourceType::CharDevice) => {
                let node = writer.put_device_for_path(&rel, DevKind::Char, meta.rdev)?;
                apply_metadata(&mut writer, node, &meta);
            }
            Some(SourceType::Fifo) => {
                let node = writer.put_ipc_for_path(&rel, IpcKind::Fifo)?;
                apply_metadata(&mut writer, node, &meta);
            }
            Some(SourceType::Socket) => {
                let node = writer.put_ipc_for_path(&rel, IpcKind::Socket)?;
                apply_metadata(&mut writer, node, &meta);
            }
            None => return Err(Error::UnsupportedFileType(entry.path().to_path_buf())),
        }
    }

    writer.finish()
}

fn apply_metadata(writer: &mut ImageWriter, node: impl Into<NodeId>, meta: &SourceMetadata) {
    let node = node.into();
    writer.set_mode(node, meta.mode);
    writer.set_uid(node, meta.uid);
    writer.set_gid(node, meta.gid);
    writer.set_mtime(node, meta.mtime);
}

fn stream_file(writer: &mut ImageWriter, file: sqz::FileId, path: &Path) -> sqz::Result<()> {
    let mut src = File::open(path).with_path(path)?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = src.read(&mut buf).with_path(path)?;
        if n == 0 {
            break;
        }
        writer.write(file, &buf[..n])?;
    }
    Ok(())
}
