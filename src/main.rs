//! treesync CLI - compare and sync file trees on a git-hosted repository

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use treesync::{
    compute_blob_hash, export_file_name, ArchiveFormat, BlobCache, CommitOutcome, CompareOptions, Config, Credential,
    DiffEntry, DiffOptions, DiffStatus, DiffSummary, Error, ExportSide, FileNode, GitHubStore, IoResultExt,
    PathFilter, PlanOptions, RepoId, Session, SessionSource, SyncEngine, TextComparison,
};

#[derive(Parser)]
#[command(name = "treesync")]
#[command(about = "compare and sync file trees between branches and local archives")]
#[command(version)]
struct Cli {
    /// config file
    #[arg(short, long, default_value = "treesync.toml")]
    config: PathBuf,

    /// repository as owner/name (overrides the config file)
    #[arg(short, long)]
    repo: Option<String>,

    /// access token for the remote
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// list branches of the repository
    Branches,

    /// compare a branch or an archive against a target branch
    Compare {
        /// target branch (may not exist yet)
        target: String,

        /// source branch
        #[arg(short, long, required_unless_present = "archive", conflicts_with = "archive")]
        source: Option<String>,

        /// source archive (zip, tar, tar.gz) or directory
        #[arg(short, long)]
        archive: Option<PathBuf>,

        /// also report files that exist only in the target
        #[arg(long)]
        include_removed: bool,

        /// fetch modified files right away to settle formatting-only changes
        #[arg(long)]
        inspect: bool,

        /// print entries as json
        #[arg(long)]
        json: bool,
    },

    /// fetch contents of entries from the last comparison
    Inspect {
        /// glob patterns selecting entries (default: all changed)
        patterns: Vec<String>,
    },

    /// show the line diff of one file from the last comparison
    Show {
        path: String,
    },

    /// commit selected entries of the last comparison to its target
    Sync {
        /// commit message
        #[arg(short, long)]
        message: String,

        /// glob patterns selecting entries
        #[arg(short, long = "path", required_unless_present = "all")]
        paths: Vec<String>,

        /// select every changed entry
        #[arg(long)]
        all: bool,

        /// also write files that only differ by formatting noise
        #[arg(long)]
        keep_normalized: bool,
    },

    /// export selected files of the last comparison as an archive
    Export {
        /// output file (default: export_<repo>_<source>_vs_<target>.<ext>)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// archive format
        #[arg(long, value_enum, default_value = "zip")]
        format: Format,

        /// glob patterns selecting entries (default: all changed)
        #[arg(short, long = "path")]
        paths: Vec<String>,

        /// side to read contents from
        #[arg(long, value_enum, default_value = "source")]
        from: Side,
    },

    /// create a branch at the tip of another
    CreateBranch {
        name: String,

        #[arg(long)]
        from: String,
    },

    /// paths the remote reports as changed between two refs (advisory)
    Changes {
        base: String,
        head: String,
    },

    /// print the content address of a local file
    HashObject {
        file: PathBuf,
    },

    /// print the last comparison as a tree
    Tree,
}

#[derive(Clone, Copy, ValueEnum)]
enum Side {
    Source,
    Target,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Zip,
    TarGz,
}

impl From<Format> for ArchiveFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Zip => ArchiveFormat::Zip,
            Format::TarGz => ArchiveFormat::TarGz,
        }
    }
}

impl From<Side> for ExportSide {
    fn from(side: Side) -> Self {
        match side {
            Side::Source => ExportSide::Source,
            Side::Target => ExportSide::Target,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("TREESYNC_LOG").unwrap_or_else(|_| EnvFilter::new("treesync=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("error: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn run(cli: Cli) -> treesync::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .with_path("<tokio runtime>")?;
    runtime.block_on(run_command(cli))
}

async fn run_command(cli: Cli) -> treesync::Result<()> {
    let mut config = Config::load_or_default(&cli.config)?;
    if let Some(repo) = &cli.repo {
        config.repository = Some(repo.clone());
    }

    match &cli.command {
        Commands::Branches => {
            let engine = open_engine(&cli, &config)?;
            for branch in engine.list_branches().await? {
                println!("{} {}", branch.tip.short(), branch.name);
            }
        }

        Commands::Compare {
            target,
            source,
            archive,
            include_removed,
            inspect,
            json,
        } => {
            let engine = open_engine(&cli, &config)?;
            let session_source = match (source, archive) {
                (_, Some(path)) => SessionSource::Archive(path.clone()),
                (Some(name), None) => SessionSource::Ref(name.clone()),
                (None, None) => return Err(Error::InvalidRef("pass --source or --archive".to_string())),
            };
            let source = session_source.open(engine.filter())?;

            let options = CompareOptions {
                diff: DiffOptions {
                    include_removed: *include_removed,
                },
                inspect_modified: *inspect,
            };
            let entries = engine.compare(&source, target, &options).await?;

            if *json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                print_entries(&entries);
            }

            let session = Session::new(
                repository_name(&config)?,
                session_source,
                target.clone(),
                *include_removed,
                entries,
            )
            .with_target_state(engine.target_state(target).await?);
            session.save(&config.cache_dir)?;
        }

        Commands::Inspect { patterns } => {
            let engine = open_engine(&cli, &config)?;
            let mut session = Session::load(&config.cache_dir)?;
            let source = session.source.open(engine.filter())?;
            let selector = selection(patterns)?;

            let report = engine
                .inspect(&source, &session.target, &mut session.entries, |e| selector.matches(&e.path))
                .await?;
            print_entries(&session.entries);
            println!(
                "fetched {}, identical after normalization {}, failed {}",
                report.fetched, report.downgraded, report.failed
            );
            session.save(&config.cache_dir)?;
        }

        Commands::Show { path } => {
            let engine = open_engine(&cli, &config)?;
            let session = Session::load(&config.cache_dir)?;
            let source = session.source.open(engine.filter())?;
            let key = treesync::PathKey::new(path)?;
            let entry = session
                .entries
                .iter()
                .find(|e| e.path == key)
                .ok_or_else(|| Error::PathNotFound(format!("{} is not in the last comparison", key)))?;

            let detail = engine.detail(&source, &session.target, entry).await?;
            match (detail.comparison, &detail.unified) {
                (_, Some(unified)) => print!("{}", unified),
                (TextComparison::Identical, None) => println!("{}: identical", key),
                (TextComparison::EqualAfterNormalization, None) => println!(
                    "{}: identical after normalization (raw bytes still differ)",
                    key
                ),
                (_, None) => println!("{}: binary content differs", key),
            }
        }

        Commands::Sync {
            message,
            paths,
            all,
            keep_normalized,
        } => {
            let engine = open_engine(&cli, &config)?;
            let session = Session::load(&config.cache_dir)?;
            let source = session.source.open(engine.filter())?;

            let selector = selection(paths)?;
            let selected: Vec<DiffEntry> = session
                .entries
                .iter()
                .filter(|e| {
                    let wanted = *all || selector.matches(&e.path);
                    wanted && (e.is_change() || (*keep_normalized && e.is_identical_after_normalization()))
                })
                .cloned()
                .collect();

            let options = PlanOptions {
                skip_identical_after_normalization: !*keep_normalized,
                expected_target: session.target_state,
                cancel: None,
            };
            match engine
                .commit(&session.target, &source, &selected, message, &options)
                .await?
            {
                CommitOutcome::NoOp { skipped } => {
                    println!("nothing to commit ({} selected entries already in {})", skipped, session.target)
                }
                CommitOutcome::Committed(result) => {
                    let verb = if result.created_ref { "created" } else { "updated" };
                    println!("{} {} at {}", verb, result.updated_ref, result.commit);
                    println!(
                        "{} reused, {} uploaded, {} deleted",
                        result.reused, result.blobs_uploaded, result.tombstones
                    );
                    println!("run compare again before the next sync");
                }
            }
        }

        Commands::Export {
            output,
            format,
            paths,
            from,
        } => {
            let format = ArchiveFormat::from(*format);
            let engine = open_engine(&cli, &config)?;
            let session = Session::load(&config.cache_dir)?;
            let source = session.source.open(engine.filter())?;

            let selector = selection(paths)?;
            let selected: Vec<DiffEntry> = session
                .entries
                .iter()
                .filter(|e| selector.matches(&e.path) && e.status != DiffStatus::Same)
                .cloned()
                .collect();

            let data = engine
                .export((*from).into(), &source, &session.target, &selected, format)
                .await?;
            let output = output.clone().unwrap_or_else(|| {
                PathBuf::from(export_file_name(
                    &session.repository,
                    &session.source.label(),
                    &session.target,
                    format,
                ))
            });
            std::fs::write(&output, data).with_path(&output)?;
            println!("wrote {}", output.display());
        }

        Commands::CreateBranch { name, from } => {
            let engine = open_engine(&cli, &config)?;
            let tip = engine.create_branch(name, from).await?;
            println!("created {} at {}", name, tip);
        }

        Commands::Changes { base, head } => {
            let engine = open_engine(&cli, &config)?;
            for change in engine.changed_paths_hint(base, head).await? {
                println!("{} {}", change.status, change.path);
            }
        }

        Commands::HashObject { file } => {
            let content = std::fs::read(file).with_path(file)?;
            println!("{}", compute_blob_hash(&content));
        }

        Commands::Tree => {
            let session = Session::load(&config.cache_dir)?;
            println!("{} vs {}", session.source.label(), session.target);
            print!("{}", FileNode::build(&session.entries).render());
            println!("{}", DiffSummary::from_entries(&session.entries, |_| false));
        }
    }

    Ok(())
}

fn repository_name(config: &Config) -> treesync::Result<String> {
    config
        .repo_id()?
        .map(|r| r.full_name())
        .ok_or_else(|| Error::InvalidRef("no repository configured; pass --repo owner/name".to_string()))
}

fn open_engine(cli: &Cli, config: &Config) -> treesync::Result<SyncEngine> {
    let repo = RepoId::parse(&repository_name(config)?)?;
    let token = cli
        .token
        .clone()
        .ok_or_else(|| Error::MissingCredential(format!("{} (pass --token or set GITHUB_TOKEN)", repo)))?;

    let store = GitHubStore::new(
        &config.api_url,
        repo,
        Credential::new(token),
        config.request_timeout(),
        &config.user_agent,
    )?;
    let cache = BlobCache::open(blob_dir(&config.cache_dir))?;
    SyncEngine::with_blob_cache(Arc::new(store), config.clone(), cache)
}

fn blob_dir(cache_dir: &Path) -> PathBuf {
    cache_dir.join("blobs")
}

/// entries matching any of `patterns`; no patterns selects everything
fn selection(patterns: &[String]) -> treesync::Result<PathFilter> {
    PathFilter::new(Vec::<String>::new()).with_patterns(patterns)
}

fn print_entries(entries: &[DiffEntry]) {
    for entry in entries {
        println!("{}", entry);
    }
    println!("{}", DiffSummary::from_entries(entries, |_| false));
}
