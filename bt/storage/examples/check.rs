//! Hashes the files under a directory, and then verifies them through the storage engine.

use std::fs;
use std::io::{self, Error};
use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;

use bt_base::{Bitfield, LayoutBuilder, PieceHashes, PieceIndex};
use bt_storage::{DiskIo, ResumeData, Settings, StorageParams};

#[derive(Debug, Parser)]
struct Check {
    #[arg(long, short = 'v', action = ArgAction::Count, help = "Make tracing output more verbose")]
    verbose: u8,
    #[arg(long, action = ArgAction::Count, help = "Make tracing output less verbose")]
    silent: u8,

    #[arg(long, help = "Load settings from a YAML file")]
    settings: Option<PathBuf>,
    #[arg(long, default_value_t = 256 * 1024)]
    piece_size: u64,

    dir: PathBuf,
}

impl Check {
    fn init_tracing(&self) {
        let level = match i16::from(self.verbose) - i16::from(self.silent) {
            ..=-3 => LevelFilter::OFF,
            -2 => LevelFilter::ERROR,
            -1 => LevelFilter::WARN,
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            2.. => LevelFilter::TRACE,
        };
        let filter = EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env_lossy();
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_writer(io::stderr)
                    .with_filter(filter),
            )
            .init();
    }

    fn load_settings(&self) -> Result<Settings, Error> {
        let Some(path) = &self.settings else {
            return Ok(Settings::default());
        };
        serde_yaml::from_str(&fs::read_to_string(path)?).map_err(Error::other)
    }

    async fn execute(&self) -> Result<(), Error> {
        let mut files = Vec::new();
        walk(&self.dir, &self.dir, &mut files)?;
        files.sort();

        let mut builder = LayoutBuilder::new(self.piece_size);
        for (path, size) in &files {
            builder.add_file(path, *size).map_err(Error::other)?;
        }
        let layout = builder.build().map_err(Error::other)?;
        let num_pieces = layout.num_pieces();

        let disk_io = DiskIo::new(self.load_settings()?);
        let storage = disk_io.new_torrent(StorageParams::new(layout, &self.dir));

        let mut hashes = Vec::with_capacity(usize::try_from(num_pieces).expect("num_pieces"));
        for piece in (0..num_pieces).map(PieceIndex) {
            hashes.push(
                disk_io
                    .async_hash(&storage, piece)
                    .await
                    .map_err(Error::other)?,
            );
        }
        let hashes: PieceHashes = hashes.into_iter().collect();

        let resume = ResumeData {
            have_pieces: Bitfield::repeat(true, hashes.len()),
            file_sizes: files.iter().map(|(_, size)| Some(*size)).collect(),
            fail_if_exist: false,
        };
        let outcome = disk_io.async_check_files(&storage, resume, None).await;
        if let Some(error) = outcome.error {
            return Err(Error::other(error));
        }

        let have = disk_io
            .async_check_pieces(&storage, hashes)
            .await
            .map_err(Error::other)?;
        println!(
            "{}: files={} pieces={}/{} status={:?}",
            self.dir.display(),
            files.len(),
            have.count_ones(),
            num_pieces,
            outcome.status,
        );
        if have.not_any() && num_pieces > 0 {
            return Err(Error::other("no piece verified"));
        }
        Ok(())
    }
}

fn walk(root: &Path, dir: &Path, files: &mut Vec<(String, u64)>) -> Result<(), Error> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            walk(root, &path, files)?;
        } else if metadata.is_file() {
            let relative = path.strip_prefix(root).map_err(Error::other)?;
            let relative = relative
                .to_str()
                .ok_or_else(|| Error::other(format!("non-utf8 path: {}", relative.display())))?;
            files.push((relative.to_string(), metadata.len()));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let check = Check::parse();
    check.init_tracing();
    check.execute().await
}
