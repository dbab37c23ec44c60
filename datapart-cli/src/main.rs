use clap::{Parser, Subcommand};
use color_eyre::eyre::{bail, eyre, WrapErr};
use datapart::{
    Config, DownloadTaskPoller, FileSessionStore, FileSource, HttpClient, SessionStore,
    UploadOptions, UploadOutcome, UploadSource, Uploader,
};
use itertools::Itertools;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

mod progress;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("VERGEN_CARGO_TARGET_TRIPLE"),
    ", opt-level ",
    env!("VERGEN_CARGO_OPT_LEVEL"),
    ")"
);

/// Upload large dataset files to the marketplace in resumable, concurrently transferred parts
#[derive(Parser, Debug)]
#[clap(author, version, long_version = LONG_VERSION, about, long_about = None)]
struct Args {
    /// Operation to perform
    #[clap(subcommand)]
    command: Command,

    #[clap(flatten)]
    globals: Globals,

    #[clap(flatten)]
    config: Config,
}

/// Arguments that apply regardless of command
#[derive(Parser, Debug)]
struct Globals {
    /// Enable verbose log output
    #[clap(short = 'v', long, conflicts_with = "quiet", global = true)]
    verbose: bool,

    /// Be quiet, suppress almost all output (except errors)
    #[clap(short = 'q', long, conflicts_with = "verbose", global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file, resuming an earlier interrupted upload of it if there is one.
    ///
    /// Press Ctrl-C to stop.  Parts already uploaded stay recorded, so running the same command
    /// again picks up where this one left off.
    Upload {
        /// The file to upload
        #[clap(value_parser, value_name = "FILE")]
        file: PathBuf,

        /// Object name to upload to.  Defaults to the file name.
        #[clap(short = 'n', long)]
        object_name: Option<String>,

        /// Maximum number of parts in flight at once.  Overrides `--max-concurrent-requests`.
        #[clap(short = 'c', long)]
        concurrency: Option<usize>,

        /// Number of bytes to start the byte counter at.
        ///
        /// Defaults to the bytes an interrupted upload of this file already transferred.
        #[clap(long, value_name = "BYTES")]
        initial_bytes: Option<u64>,

        /// Ignore any interrupted upload of this file and start over
        #[clap(long)]
        restart: bool,
    },

    /// Abort an unfinished upload, discarding the parts object storage has for it
    Cancel {
        object_name: String,

        /// The upload to abort.  Defaults to the one recorded in the session for `OBJECT_NAME`.
        #[clap(long)]
        upload_id: Option<String>,

        /// Leave the persisted session in place
        #[clap(long)]
        keep_session: bool,
    },

    /// List interrupted uploads that can be resumed, most recently active first
    Sessions,

    /// Delete a dataset record together with its stored file
    Rollback {
        dataset_id: u64,

        object_name: String,
    },

    /// Wait for a paid dataset to be prepared for download, then print its download URL
    Download { dataset_id: u64 },
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    init_logging(&args.globals);

    debug!(version = LONG_VERSION, "Starting");

    match args.command {
        Command::Upload {
            file,
            object_name,
            concurrency,
            initial_bytes,
            restart,
        } => {
            upload(
                &args.globals,
                args.config,
                file,
                object_name,
                concurrency,
                initial_bytes,
                restart,
            )
            .await
        }
        Command::Cancel {
            object_name,
            upload_id,
            keep_session,
        } => cancel(&args.globals, args.config, object_name, upload_id, keep_session).await,
        Command::Sessions => sessions(args.config).await,
        Command::Rollback {
            dataset_id,
            object_name,
        } => rollback(&args.globals, args.config, dataset_id, object_name).await,
        Command::Download { dataset_id } => download(&args.globals, args.config, dataset_id).await,
    }
}

/// Log to stderr, honoring `RUST_LOG` if it's set
fn init_logging(globals: &Globals) {
    let default_filter = if globals.verbose {
        "datapart=debug,datapart_cli=debug,info"
    } else if globals.quiet {
        "error"
    } else {
        "warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn upload(
    globals: &Globals,
    config: Config,
    file: PathBuf,
    object_name: Option<String>,
    concurrency: Option<usize>,
    initial_bytes: Option<u64>,
    restart: bool,
) -> color_eyre::Result<()> {
    let source = FileSource::open(&file)
        .await
        .wrap_err_with(|| format!("Unable to upload {}", file.display()))?;
    let object_name = object_name.unwrap_or_else(|| source.name().to_string());
    let uploader = Uploader::with_http(config)?;

    if restart {
        uploader.discard_session(&object_name).await?;
    }

    let mut options = UploadOptions {
        concurrency,
        ..Default::default()
    };

    // Only a session the job will actually resume counts towards the starting byte count
    options.initial_uploaded_bytes = match initial_bytes {
        Some(bytes) => bytes,
        None => uploader
            .resumable_session(&source, &object_name, &options)
            .await?
            .map(|session| session.recorded_bytes())
            .unwrap_or_default(),
    };
    let initial_uploaded_bytes = options.initial_uploaded_bytes;

    let job = uploader.begin(
        Arc::new(source),
        object_name,
        options,
        progress::UploadProgressReport::new(progress::hide_progress(globals), initial_uploaded_bytes),
    );

    // The progress channel closes when the job finishes
    let mut progress = job.progress();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; stopping the upload");
            job.cancel_all();
        }
        _ = async { while progress.changed().await.is_ok() {} } => {}
    }

    match job.wait().await? {
        UploadOutcome::Completed {
            object_name,
            total_bytes,
            parts,
            ..
        } => {
            if !globals.quiet {
                println!(
                    "Uploaded {} as {object_name} ({}, {parts} parts)",
                    file.display(),
                    indicatif::BinaryBytes(total_bytes)
                );
            }
        }
        UploadOutcome::Stopped {
            object_name,
            upload_id,
            remaining_parts,
        } => {
            if !globals.quiet {
                println!(
                    "Upload {upload_id} of {object_name} stopped with {} parts left.  Run the same command again to resume it, or `datapart cancel {object_name}` to abandon it.",
                    remaining_parts.len()
                );
            }
        }
    }

    Ok(())
}

async fn cancel(
    globals: &Globals,
    config: Config,
    object_name: String,
    upload_id: Option<String>,
    keep_session: bool,
) -> color_eyre::Result<()> {
    let uploader = Uploader::with_http(config)?;

    let upload_id = match upload_id {
        Some(upload_id) => upload_id,
        None => uploader
            .session(&object_name)
            .await?
            .map(|session| session.upload_id)
            .ok_or_else(|| {
                eyre!("There is no unfinished upload of {object_name}; specify --upload-id")
            })?,
    };

    let message = progress::with_spinner(
        globals,
        format!("Aborting upload {upload_id}"),
        uploader.cancel(&object_name, &upload_id),
    )
    .await?;

    if !keep_session {
        uploader.discard_session(&object_name).await?;
    }

    if !globals.quiet {
        println!("{message}");
    }

    Ok(())
}

/// Lists what's persisted locally, so this works without a backend to talk to
async fn sessions(config: Config) -> color_eyre::Result<()> {
    let store = FileSessionStore::new(config.session_dir());
    let default_chunk_size = config.chunk_size();

    for session in store
        .list()
        .await?
        .into_iter()
        .sorted_by(|a, b| b.updated_at.cmp(&a.updated_at))
    {
        let chunk_size = session.chunk_size.unwrap_or(default_chunk_size).max(1);
        let total_parts = session.file_size.div_ceil(chunk_size).max(1);
        let updated_at = session
            .updated_at
            .map(|updated_at| updated_at.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{updated_at}  {}  {}/{total_parts} parts  {}/{}  {} ({})",
            session.upload_id,
            session.parts.len(),
            indicatif::BinaryBytes(session.recorded_bytes()),
            indicatif::BinaryBytes(session.file_size),
            session.object_name,
            session.file_name,
        );
    }

    Ok(())
}

async fn rollback(
    globals: &Globals,
    config: Config,
    dataset_id: u64,
    object_name: String,
) -> color_eyre::Result<()> {
    let client = HttpClient::new(&config)?;

    let deleted = progress::with_spinner(
        globals,
        format!("Deleting dataset {dataset_id}"),
        datapart::rollback_dataset(&client, dataset_id, &object_name),
    )
    .await;

    if !deleted {
        bail!("Dataset {dataset_id} could not be deleted; {object_name} may still be stored");
    }

    Ok(())
}

async fn download(globals: &Globals, config: Config, dataset_id: u64) -> color_eyre::Result<()> {
    let poller = DownloadTaskPoller::with_config(HttpClient::new(&config)?, &config);

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; no longer waiting for the download");
                cancel.cancel();
            }
        })
    };

    let report = progress::DownloadProgressReport::new(progress::hide_progress(globals));
    let result = poller.run(dataset_id, cancel, &report).await;
    ctrl_c.abort();
    drop(report);

    match result? {
        Some(url) => {
            println!("{url}");
            Ok(())
        }
        None => bail!("Stopped waiting for dataset {dataset_id} to be prepared"),
    }
}
