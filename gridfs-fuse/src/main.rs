use anyhow::{Context, Result, bail};
use clap::Parser;
use gridfs_fuse::cadapter::client::ObjectClient;
use gridfs_fuse::cadapter::localfs::LocalFsBackend;
use gridfs_fuse::chuck::{ChunkLayout, DEFAULT_CHUNK_SIZE, ObjectChunkStore};
use gridfs_fuse::fuse::mount::mount_vfs_unprivileged;
use gridfs_fuse::vfs::{VFS, VfsConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Mount a GridFS-style chunk store as a flat FUSE filesystem.
#[derive(Parser, Debug)]
#[command(name = "mount_gridfs", version, about)]
struct Cli {
    /// Empty directory to mount on.
    mount_point: PathBuf,

    /// Database name; files live under `<data-dir>/<db>/`.
    #[arg(long, default_value = "test")]
    db: String,

    /// Root of the backing object store. Defaults to the platform data dir.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Chunk size for newly created files, in bytes.
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: u64,

    /// Deadline for a single backing-store call, in seconds.
    #[arg(long, default_value_t = 30)]
    io_timeout_secs: u64,

    /// Flush every write so it is visible to other open handles at once.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    write_through: bool,
}

fn default_data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|d| d.join("gridfs-fuse"))
        .context("no platform data directory; pass --data-dir")
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gridfs_fuse=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    if cli.chunk_size == 0 {
        bail!("--chunk-size must be positive");
    }
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };
    std::fs::create_dir_all(&cli.mount_point)
        .with_context(|| format!("create mount point {}", cli.mount_point.display()))?;

    let client = ObjectClient::new(LocalFsBackend::new(&data_dir));
    let store = ObjectChunkStore::new(client, cli.db.clone());
    let config = VfsConfig::new(ChunkLayout::new(cli.chunk_size))
        .io_timeout(Duration::from_secs(cli.io_timeout_secs))
        .write_through(cli.write_through);
    let fs = VFS::new(config, store)
        .await
        .context("load namespace from store")?;

    info!(
        mount_point = %cli.mount_point.display(),
        data_dir = %data_dir.display(),
        db = %cli.db,
        "mounting"
    );
    let handle = mount_vfs_unprivileged(fs, &cli.mount_point)
        .await
        .context("mount failed; is fusermount3 available?")?;

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("unmounting");
    handle.unmount().await.context("unmount")?;
    Ok(())
}
