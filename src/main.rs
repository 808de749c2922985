//! drive_sync CLI - Keep a local folder and a Google Drive folder in sync.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use glob::glob;

use drive_sync::batch::Instructions;
use drive_sync::transfer::{create_folder, download_item, list_items, render_tree, upload_path};
use drive_sync::{
    extract_id, logging, Authenticator, ConflictPolicy, DriveClient, FolderRef, Resolution,
    StateStore, SyncConfig, SyncEngine,
};

/// Two-way sync between a local folder and a Google Drive folder.
#[derive(Parser)]
#[command(name = "drive_sync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a service account key or authorized-user token JSON file.
    #[arg(long, global = true, env = "GOOGLE_APPLICATION_CREDENTIALS")]
    credentials: Option<PathBuf>,

    /// Shared Drive ID (can also be set via SHARED_DRIVE_ID env var).
    #[arg(long, global = true, env = "SHARED_DRIVE_ID")]
    drive_id: Option<String>,

    /// Config file (defaults to the platform config dir).
    #[arg(long, global = true, env = "DRIVE_SYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Debug-level logging for this tool.
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Also write logs to this file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Target {
    /// Local folder (falls back to `localRoot` from the config file).
    #[arg(long, short = 'l')]
    local: Option<PathBuf>,

    /// Remote folder URL or ID (falls back to `remoteFolder`).
    #[arg(long, short = 'r')]
    remote: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync a local folder with a Drive folder.
    Sync {
        #[command(flatten)]
        target: Target,

        /// Print the plan without changing anything.
        #[arg(long)]
        dry_run: bool,

        /// How to handle files changed on both sides.
        #[arg(long, value_enum)]
        policy: Option<ConflictPolicy>,

        /// Maximum number of transfers running at once.
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Delete remote files permanently instead of moving them to the trash.
        #[arg(long)]
        permanent_delete: bool,

        /// Glob of relative paths to leave out (repeatable).
        #[arg(long, short = 'x')]
        exclude: Vec<String>,
    },

    /// Show what a sync would do.
    Plan {
        #[command(flatten)]
        target: Target,
    },

    /// List conflicts recorded by previous syncs.
    Conflicts {
        /// Local folder (falls back to `localRoot` from the config file).
        #[arg(long, short = 'l')]
        local: Option<PathBuf>,
    },

    /// Decide which side wins a recorded conflict; the next sync applies it.
    Resolve {
        /// Conflicting path, relative to the local folder.
        path: String,

        #[arg(long, value_enum)]
        keep: Keep,

        #[arg(long, short = 'l')]
        local: Option<PathBuf>,
    },

    /// Display the folder tree under a Drive folder.
    Tree {
        /// Folder URL or ID.
        #[arg(default_value = "root")]
        folder: String,
    },

    /// List folders and files in a Drive folder.
    List {
        /// Folder URL or ID.
        #[arg(default_value = "root")]
        folder: String,
    },

    /// Create a folder.
    Mkdir {
        name: String,

        /// Parent folder URL or ID.
        #[arg(long, short = 'p', default_value = "root")]
        parent: String,
    },

    /// Upload files or folders (folders recursively).
    Upload {
        /// Paths or glob patterns. A folder path ending in `/` uploads its contents only.
        #[arg(required = true)]
        patterns: Vec<String>,

        /// Destination folder URL or ID.
        #[arg(long, short = 't')]
        to: String,
    },

    /// Download a file or folder to the local filesystem.
    Download {
        /// File or folder URL or ID.
        item: String,

        /// Local destination directory.
        #[arg(long, short = 't', default_value = ".")]
        to: PathBuf,
    },

    /// Run the uploads and downloads listed in an instruction file.
    Batch {
        file: PathBuf,

        /// Write an example instruction file instead of running one.
        #[arg(long)]
        init: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Keep {
    Local,
    Remote,
}

impl From<Keep> for Resolution {
    fn from(keep: Keep) -> Self {
        match keep {
            Keep::Local => Resolution::KeepLocal,
            Keep::Remote => Resolution::KeepRemote,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let _log_guard = logging::init(cli.verbose, cli.log_file.as_deref())
        .context("Failed to initialize logging")?;

    let mut config = match cli.config.clone().or_else(SyncConfig::default_path) {
        Some(path) => SyncConfig::load(&path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => SyncConfig::default(),
    };
    if cli.credentials.is_some() {
        config.credentials = cli.credentials.clone();
    }
    if cli.drive_id.is_some() {
        config.drive_id = cli.drive_id.clone();
    }

    match cli.command {
        Commands::Sync {
            target,
            dry_run,
            policy,
            max_concurrent,
            permanent_delete,
            exclude,
        } => {
            if let Some(policy) = policy {
                config.conflict_policy = policy;
            }
            if let Some(n) = max_concurrent {
                config.max_concurrent = n;
            }
            if permanent_delete {
                config.trash = false;
            }
            config.exclude.extend(exclude);

            let engine = build_engine(&config, target)?;
            if dry_run {
                return print_plan(&engine).await;
            }

            let cancel = engine.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("Cancelling; waiting for running transfers...");
                    cancel.cancel();
                }
            });

            let report = engine.run().await.context("Sync failed")?;
            print!("{}", report);
            if !report.is_clean() {
                return Ok(ExitCode::FAILURE);
            }
        }

        Commands::Plan { target } => {
            let engine = build_engine(&config, target)?;
            return print_plan(&engine).await;
        }

        Commands::Conflicts { local } => {
            let root = local_root(&config, local)?;
            let store = open_state(&config, &root)?;
            let conflicts = &store.state().conflicts;

            if conflicts.is_empty() {
                println!("No conflicts.");
            } else {
                println!("{:<50} {:<36} {:<12} {}", "PATH", "KIND", "RESOLUTION", "DETECTED");
                println!("{}", "-".repeat(120));
                for (path, record) in conflicts {
                    let resolution = match record.resolution {
                        Some(Resolution::KeepLocal) => "keep-local",
                        Some(Resolution::KeepRemote) => "keep-remote",
                        None => "-",
                    };
                    println!(
                        "{:<50} {:<36} {:<12} {}",
                        path,
                        record.kind.to_string(),
                        resolution,
                        record.detected_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
        }

        Commands::Resolve { path, keep, local } => {
            let root = local_root(&config, local)?;
            let mut store = open_state(&config, &root)?;
            store
                .resolve_conflict(&path, keep.into())
                .with_context(|| format!("Failed to resolve conflict at {}", path))?;
            println!("Recorded; the next sync will apply it.");
        }

        Commands::Tree { folder } => {
            let client = build_client(&config)?;
            let folder = FolderRef::parse(&folder)
                .with_context(|| format!("Invalid folder URL or ID: {}", folder))?;
            let tree = render_tree(&client, folder.id())
                .await
                .with_context(|| format!("Failed to read folder tree: {}", folder))?;

            if tree.is_empty() {
                println!("Folder is empty.");
            } else {
                print!("{}", tree);
            }
        }

        Commands::List { folder } => {
            let client = build_client(&config)?;
            let folder = FolderRef::parse(&folder)
                .with_context(|| format!("Invalid folder URL or ID: {}", folder))?;
            let listing = list_items(&client, folder.id())
                .await
                .with_context(|| format!("Failed to list files in folder: {}", folder))?;
            print!("{}", listing);
        }

        Commands::Mkdir { name, parent } => {
            let client = build_client(&config)?;
            let parent = FolderRef::parse(&parent)
                .with_context(|| format!("Invalid folder URL or ID: {}", parent))?;
            let folder = create_folder(&client, &name, parent.id())
                .await
                .with_context(|| format!("Failed to create folder: {}", name))?;
            println!("Created folder '{}' ({})", folder.name, folder.id);
        }

        Commands::Upload { patterns, to } => {
            let client = build_client(&config)?;
            let folder = FolderRef::parse(&to)
                .with_context(|| format!("Invalid folder URL or ID: {}", to))?;

            let sources = expand_patterns(&patterns)?;
            if sources.is_empty() {
                bail!("Nothing to upload");
            }

            println!("Uploading {} item(s) to {}...", sources.len(), folder);
            let mut failed = 0;
            for (idx, source) in sources.iter().enumerate() {
                print!("[{}/{}] Uploading {}... ", idx + 1, sources.len(), source);
                match upload_path(&client, source, folder.id()).await {
                    Ok((id, summary)) => println!(
                        "OK ({}; {} uploaded, {} already present)",
                        id, summary.transferred, summary.existing
                    ),
                    Err(e) => {
                        println!("FAILED");
                        eprintln!("  Error: {}", e);
                        failed += 1;
                    }
                }
            }

            println!("Done.");
            if failed > 0 {
                return Ok(ExitCode::FAILURE);
            }
        }

        Commands::Download { item, to } => {
            let client = build_client(&config)?;
            let id = extract_id(&item)
                .with_context(|| format!("Invalid file URL or ID: {}", item))?;

            print!("Downloading {}... ", id);
            let summary = download_item(&client, &id, &to)
                .await
                .with_context(|| format!("Failed to download: {}", id))?;
            println!("OK");
            println!(
                "Saved to {:?}: {} file(s), {} skipped",
                to, summary.transferred, summary.skipped
            );
        }

        Commands::Batch { file, init } => {
            if init {
                if Instructions::write_template(&file)
                    .with_context(|| format!("Failed to write template to {:?}", file))?
                {
                    println!("Template written to {:?}", file);
                } else {
                    println!("{:?} already exists, left untouched.", file);
                }
                return Ok(ExitCode::SUCCESS);
            }

            let instructions = Instructions::load(&file)
                .with_context(|| format!("Failed to read instructions from {:?}", file))?;
            if instructions.is_empty() {
                println!("No tasks in {:?}.", file);
                return Ok(ExitCode::SUCCESS);
            }

            let client = build_client(&config)?;
            println!("Running {} task(s)...", instructions.len());
            let report = instructions.run(&client).await;

            println!(
                "Done: {} task(s) completed, {} transferred, {} already present, {} skipped.",
                report.completed,
                report.totals.transferred,
                report.totals.existing,
                report.totals.skipped
            );
            for (task, error) in &report.failures {
                eprintln!("  FAILED {} -> {}: {}", task.source, task.destination, error);
            }
            if !report.failures.is_empty() {
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn build_client(config: &SyncConfig) -> Result<DriveClient> {
    let Some(credentials) = config.credentials.as_ref() else {
        bail!("No credentials given; use --credentials or GOOGLE_APPLICATION_CREDENTIALS");
    };
    let auth = Authenticator::from_file(credentials)
        .with_context(|| format!("Failed to load credentials from {:?}", credentials))?;

    let mut client = DriveClient::new(auth).with_trash(config.trash);
    if let Some(drive_id) = &config.drive_id {
        client = client.with_shared_drive(drive_id.clone());
    }
    Ok(client)
}

fn build_engine(config: &SyncConfig, target: Target) -> Result<SyncEngine> {
    let client = build_client(config)?;
    let local = local_root(config, target.local)?;
    let Some(remote) = target.remote.or_else(|| config.remote_folder.clone()) else {
        bail!("No remote folder given; use --remote or set remoteFolder in the config file");
    };
    let remote = FolderRef::parse(&remote)
        .with_context(|| format!("Invalid folder URL or ID: {}", remote))?;

    Ok(SyncEngine::new(Arc::new(client), local, remote, config.clone()))
}

fn local_root(config: &SyncConfig, local: Option<PathBuf>) -> Result<PathBuf> {
    match local.or_else(|| config.local_root.clone()) {
        Some(root) => Ok(root),
        None => bail!("No local folder given; use --local or set localRoot in the config file"),
    }
}

fn open_state(config: &SyncConfig, root: &Path) -> Result<StateStore> {
    let path = config.state_path_for(root);
    StateStore::open(&path).with_context(|| format!("Failed to open sync state {:?}", path))
}

async fn print_plan(engine: &SyncEngine) -> Result<ExitCode> {
    let plan = engine.plan().await.context("Failed to compute sync plan")?;

    if plan.is_empty() {
        println!("Everything is in sync.");
    } else {
        for action in &plan.actions {
            println!("{}", action);
        }
    }
    if !plan.adopt.is_empty() {
        println!("{} identical file(s) will be recorded as synced.", plan.adopt.len());
    }
    println!("Plan: {}", plan.summary());
    Ok(ExitCode::SUCCESS)
}

/// Resolve upload arguments: glob patterns expand to matching paths, other
/// arguments are taken literally so a trailing `/` survives.
fn expand_patterns(patterns: &[String]) -> Result<Vec<String>> {
    let mut sources = Vec::new();

    for pattern in patterns {
        if glob::Pattern::escape(pattern) == *pattern {
            if Path::new(pattern).exists() {
                sources.push(pattern.clone());
            } else {
                eprintln!("Warning: No such file or folder: {}", pattern);
            }
            continue;
        }

        let matches: Vec<String> = glob(pattern)
            .with_context(|| format!("Invalid glob pattern: {}", pattern))?
            .filter_map(|r| r.ok())
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        if matches.is_empty() {
            eprintln!("Warning: No files matched pattern: {}", pattern);
        }
        sources.extend(matches);
    }

    sources.sort();
    sources.dedup();
    Ok(sources)
}
