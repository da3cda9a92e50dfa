//! geoedit command-line tools.
//!
//! Every subcommand works on JSON `DataSetSnapshot` files:
//! - `check`: verify referential integrity and summarize a snapshot
//! - `merge`: merge downloaded primitives into a snapshot
//! - `plan-upload`: print the changeset an upload would send
//! - `upload`: upload against a server snapshot held in memory (dry run)
//!
//! Session settings come from `GEOEDIT_*` environment variables, as read by
//! `SessionConfig::from_env`.

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use serde::Serialize;

use geoedit_command::{merge_remote, CommandRecord, MergeReport, UploadError, UploadSet};
use geoedit_core::{DataSet, DataSetSnapshot, Primitive, PrimitiveKind, Tags};
use geoedit_session::{CancelToken, EditSession, MemoryRemote, SessionConfig, SessionError};

/// Geographic data editing tools.
#[derive(Parser)]
#[command(name = "geoedit", about = "Geographic data editing tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Verify a snapshot and print a summary.
    Check {
        /// Path to the snapshot file.
        #[arg(short, long)]
        snapshot: PathBuf,
    },

    /// Merge downloaded primitives into a snapshot.
    Merge {
        #[arg(short, long)]
        snapshot: PathBuf,

        /// JSON array of primitives as downloaded.
        #[arg(short, long)]
        remote: PathBuf,

        /// Where to write the merged snapshot (default: not written).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the changeset an upload of this snapshot would send.
    PlanUpload {
        #[arg(short, long)]
        snapshot: PathBuf,

        /// Changeset comment.
        #[arg(short, long)]
        comment: Option<String>,
    },

    /// Upload to a server simulated from a snapshot file.
    Upload {
        #[arg(short, long)]
        snapshot: PathBuf,

        /// Snapshot of the server's current data.
        #[arg(long)]
        server: PathBuf,

        #[arg(short, long)]
        comment: Option<String>,

        /// Where to write the local snapshot after the upload.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Why a subcommand failed. Each maps to one exit code.
#[derive(Debug)]
enum Failure {
    /// An edit or upload was refused (exit 1).
    Rejected(String),
    /// The snapshot violates referential integrity (exit 2).
    Integrity(String),
    /// A file could not be read, parsed or written (exit 3).
    Io(String),
}

impl Failure {
    fn exit_code(&self) -> i32 {
        match self {
            Failure::Rejected(_) => 1,
            Failure::Integrity(_) => 2,
            Failure::Io(_) => 3,
        }
    }

    fn message(&self) -> &str {
        match self {
            Failure::Rejected(m) | Failure::Integrity(m) | Failure::Io(m) => m,
        }
    }
}

impl From<SessionError> for Failure {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Config(_) => Failure::Io(err.to_string()),
            other => Failure::Rejected(other.to_string()),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Commands::Check { snapshot } => run_check(&snapshot),
        Commands::Merge {
            snapshot,
            remote,
            output,
        } => run_merge(&snapshot, &remote, output.as_deref()),
        Commands::PlanUpload { snapshot, comment } => run_plan_upload(&snapshot, comment),
        Commands::Upload {
            snapshot,
            server,
            comment,
            output,
        } => run_upload(&snapshot, &server, comment, output.as_deref()).await,
    };

    if let Err(failure) = outcome {
        eprintln!("Error: {}", failure.message());
        process::exit(failure.exit_code());
    }
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

#[derive(Debug, Default, PartialEq, Eq, Serialize)]
struct Summary {
    points: usize,
    lines: usize,
    relations: usize,
    deleted: usize,
    modified: usize,
    new: usize,
    incomplete: usize,
    conflicts: usize,
    selected: usize,
}

fn summarize(ds: &DataSet) -> Summary {
    let mut summary = Summary {
        conflicts: ds.conflicts().len(),
        selected: ds.selected().len(),
        ..Summary::default()
    };
    for p in ds.all_primitives() {
        match p.kind() {
            PrimitiveKind::Point => summary.points += 1,
            PrimitiveKind::Line => summary.lines += 1,
            PrimitiveKind::Relation => summary.relations += 1,
        }
        summary.deleted += usize::from(p.is_deleted());
        summary.modified += usize::from(p.is_modified());
        summary.new += usize::from(p.is_new());
        summary.incomplete += usize::from(p.is_incomplete());
    }
    summary
}

fn run_check(path: &Path) -> Result<(), Failure> {
    let ds = load_dataset(path)?;
    ds.verify_integrity()
        .map_err(|e| Failure::Integrity(e.to_string()))?;
    print_json(&summarize(&ds))
}

#[derive(Serialize)]
struct MergeOutput {
    report: MergeReport,
    summary: Summary,
}

fn run_merge(path: &Path, remote: &Path, output: Option<&Path>) -> Result<(), Failure> {
    let mut ds = load_dataset(path)?;
    let downloaded: Vec<Primitive> = read_json(remote)?;
    let plan = merge_remote(&ds, downloaded);
    if let Some(command) = plan.command {
        CommandRecord::new(command)
            .execute(&mut ds)
            .map_err(|e| Failure::Rejected(e.to_string()))?;
    }
    if let Some(out) = output {
        write_json(out, &ds.snapshot())?;
    }
    print_json(&MergeOutput {
        report: plan.report,
        summary: summarize(&ds),
    })
}

fn run_plan_upload(path: &Path, comment: Option<String>) -> Result<(), Failure> {
    let ds = load_dataset(path)?;
    let set = UploadSet::from_dataset(&ds).map_err(|e| match e {
        UploadError::CyclicDependency { .. } | UploadError::InvalidResult { .. } => {
            Failure::Rejected(e.to_string())
        }
        UploadError::DataSet(inner) => Failure::Integrity(inner.to_string()),
    })?;
    let conflicted = set.participates_in_conflict(ds.conflicts());
    if !conflicted.is_empty() {
        return Err(SessionError::UnresolvedConflicts { ids: conflicted }.into());
    }
    print_json(&set.to_changeset(changeset_tags(comment)))
}

async fn run_upload(
    path: &Path,
    server: &Path,
    comment: Option<String>,
    output: Option<&Path>,
) -> Result<(), Failure> {
    let config = SessionConfig::from_env()?;
    let local = load_dataset(path)?;
    let server_ds = load_dataset(server)?;
    let remote = MemoryRemote::with_primitives(server_ds.all_primitives().cloned()).await;

    let session = EditSession::with_dataset(config, local);
    let result = session
        .upload(&remote, changeset_tags(comment), &CancelToken::new())
        .await?;
    if let Some(out) = output {
        let snapshot = session.read(DataSet::snapshot).await?;
        write_json(out, &snapshot)?;
    }
    print_json(&result)
}

fn changeset_tags(comment: Option<String>) -> Tags {
    let mut tags = Tags::new();
    tags.insert("created_by", concat!("geoedit ", env!("CARGO_PKG_VERSION")));
    if let Some(comment) = comment {
        tags.insert("comment", comment);
    }
    tags
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

fn load_dataset(path: &Path) -> Result<DataSet, Failure> {
    let snapshot: DataSetSnapshot = read_json(path)?;
    let ds = DataSet::from_snapshot(snapshot)
        .map_err(|e| Failure::Integrity(format!("{}: {e}", path.display())))?;
    tracing::debug!(path = %path.display(), primitives = ds.len(), "loaded snapshot");
    Ok(ds)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, Failure> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Failure::Io(format!("failed to read '{}': {e}", path.display())))?;
    serde_json::from_str(&text)
        .map_err(|e| Failure::Io(format!("failed to parse '{}': {e}", path.display())))
}

fn write_json(path: &Path, value: &impl Serialize) -> Result<(), Failure> {
    let text = serde_json::to_string_pretty(value).map_err(|e| Failure::Io(e.to_string()))?;
    std::fs::write(path, text)
        .map_err(|e| Failure::Io(format!("failed to write '{}': {e}", path.display())))
}

fn print_json(value: &impl Serialize) -> Result<(), Failure> {
    let text = serde_json::to_string_pretty(value).map_err(|e| Failure::Io(e.to_string()))?;
    println!("{text}");
    Ok(())
}
