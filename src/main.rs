use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use bytesize::ByteSize;
use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use chunkup::{
    ChunkedUploader, FileSource, HttpTransport, Job, MemoryTransport, Segmenter, Transport,
    UploadConfig, UploadError, UploadQueue,
};

/// Uploads files to an object-storage service, one after another, in chunks.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// Base address of the storage service.
    #[arg(long, env = "CHUNKUP_ENDPOINT", default_value = "http://localhost:3000")]
    endpoint: String,

    /// Size of each uploaded chunk.
    #[arg(long, default_value = "2MiB")]
    chunk_size: ByteSize,

    /// How much of a file is read into memory at once.
    #[arg(long, default_value = "32MiB")]
    read_window: ByteSize,

    /// Extension of the stored objects, instead of the one of each file.
    #[arg(long)]
    extension: Option<String>,

    /// Upload into process memory instead of the storage service.
    #[arg(long)]
    dry_run: bool,

    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = UploadConfig::default()
        .with_chunk_size(cli.chunk_size.as_u64())
        .with_read_window(cli.read_window.as_u64());

    let transport: Arc<dyn Transport> = if cli.dry_run {
        info!("dry run, uploading into memory");
        Arc::new(MemoryTransport::new())
    } else {
        info!(endpoint = %cli.endpoint, "uploading to storage service");
        Arc::new(HttpTransport::new(&cli.endpoint))
    };
    let segmenter = Segmenter::new(ChunkedUploader::new(transport), config)
        .context("invalid upload configuration")?;
    let queue = UploadQueue::new(segmenter);

    let failures = Arc::new(AtomicUsize::new(0));
    let mut ids = Vec::with_capacity(cli.files.len());

    for path in &cli.files {
        let source = FileSource::open(path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        let extension = cli
            .extension
            .clone()
            .or_else(|| {
                path.extension()
                    .map(|extension| extension.to_string_lossy().into_owned())
            })
            .unwrap_or_default();
        let name = path.display().to_string();

        let job = Job::new(source, extension)
            .on_progress({
                let name = name.clone();
                move |fraction| debug!(file = %name, "{:.1}%", fraction * 100.0)
            })
            .on_success({
                let name = name.clone();
                move |object| {
                    println!(
                        "{name}: {} ({}, sha1 {})",
                        object.object_id,
                        ByteSize::b(object.size),
                        object.file_hash
                    )
                }
            })
            .on_failure({
                let name = name.clone();
                let failures = Arc::clone(&failures);
                move |error| {
                    failures.fetch_add(1, Ordering::Relaxed);
                    error!(file = %name, %error, "upload failed");
                }
            });

        let id = queue.add_job(job);
        info!(job_id = %id, file = %name, "queued");
        ids.push(id);
    }

    tokio::select! {
        () = queue.wait_idle() => {}
        interrupted = tokio::signal::ctrl_c() => {
            interrupted.context("failed to listen for ctrl-c")?;
            warn!("interrupted, cancelling remaining uploads");

            // newest first, so the worker does not pick up a job we are about to cancel
            for id in ids.iter().rev() {
                match queue.cancel_job(*id).await {
                    Ok(()) | Err(UploadError::JobNotFound(_)) => {}
                    Err(error) => warn!(job_id = %id, %error, "failed to cancel job"),
                }
            }
            queue.wait_idle().await;
        }
    }

    let failed = failures.load(Ordering::Relaxed);
    if failed > 0 {
        anyhow::bail!("{failed} of {} uploads failed", cli.files.len());
    }
    Ok(())
}
