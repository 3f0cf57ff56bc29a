use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use facegroup::config::Config;
use facegroup::{
    logging, ClusterQuery, DirectorySource, FaceDetector, FaceProcessor, IngestStatus, Library,
    SidecarDetector,
};

enum Command {
    Ingest { root: PathBuf, full: bool },
    Recluster {
        epsilon: Option<f32>,
        min_points: Option<usize>,
        timeout_secs: Option<u64>,
    },
    Stats,
    Clusters(ClusterQuery),
    Cluster { id: i64 },
    ByName { name: String },
    Photo { id: i64 },
    Face { id: i64 },
    Rename { cluster_id: i64, name: String },
    Representative { cluster_id: i64, face_id: i64 },
    Exclude { face_id: i64 },
    Assign { face_id: i64, name: String },
    Uncorrect { face_id: i64 },
    Corrections,
    Failures,
    Reset { confirmed: bool },
}

struct Args {
    config_path: Option<PathBuf>,
    command: Command,
}

fn parse_args() -> Result<Args> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config_path = None;
    let mut i = 0;

    while i < args.len() && args[i].starts_with('-') {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("facegroup {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                config_path = Some(PathBuf::from(value_of::<String>(&args, &mut i, "--config")?));
            }
            other => bail!("unknown option: {}", other),
        }
        i += 1;
    }

    let Some(name) = args.get(i) else {
        bail!("missing command");
    };
    let rest = &args[i + 1..];
    let command = parse_command(name, rest)?;

    Ok(Args {
        config_path,
        command,
    })
}

fn parse_command(name: &str, rest: &[String]) -> Result<Command> {
    let command = match name {
        "ingest" => {
            let mut root = None;
            let mut full = false;
            for arg in rest {
                match arg.as_str() {
                    "--full" => full = true,
                    path if root.is_none() && !path.starts_with('-') => root = Some(PathBuf::from(path)),
                    other => bail!("unexpected argument to ingest: {}", other),
                }
            }
            let Some(root) = root else {
                bail!("ingest requires a directory");
            };
            Command::Ingest { root, full }
        }
        "recluster" => {
            let (mut epsilon, mut min_points, mut timeout_secs) = (None, None, None);
            let mut i = 0;
            while i < rest.len() {
                match rest[i].as_str() {
                    "--epsilon" => epsilon = Some(value_of(rest, &mut i, "--epsilon")?),
                    "--min-points" => min_points = Some(value_of(rest, &mut i, "--min-points")?),
                    "--timeout" => timeout_secs = Some(value_of(rest, &mut i, "--timeout")?),
                    other => bail!("unexpected argument to recluster: {}", other),
                }
                i += 1;
            }
            Command::Recluster {
                epsilon,
                min_points,
                timeout_secs,
            }
        }
        "clusters" => {
            let mut query = ClusterQuery::default();
            let mut i = 0;
            while i < rest.len() {
                match rest[i].as_str() {
                    "--min-members" => query.min_members = value_of(rest, &mut i, "--min-members")?,
                    "--offset" => query.offset = value_of(rest, &mut i, "--offset")?,
                    "--limit" => query.limit = value_of(rest, &mut i, "--limit")?,
                    other => bail!("unexpected argument to clusters: {}", other),
                }
                i += 1;
            }
            Command::Clusters(query)
        }
        "stats" => Command::Stats,
        "corrections" => Command::Corrections,
        "failures" => Command::Failures,
        "cluster" => Command::Cluster { id: positional(rest, 0, "cluster id")? },
        "by-name" => Command::ByName { name: positional(rest, 0, "name")? },
        "photo" => Command::Photo { id: positional(rest, 0, "photo id")? },
        "face" => Command::Face { id: positional(rest, 0, "face id")? },
        "rename" => Command::Rename {
            cluster_id: positional(rest, 0, "cluster id")?,
            name: positional(rest, 1, "name")?,
        },
        "representative" => Command::Representative {
            cluster_id: positional(rest, 0, "cluster id")?,
            face_id: positional(rest, 1, "face id")?,
        },
        "exclude" => Command::Exclude { face_id: positional(rest, 0, "face id")? },
        "assign" => Command::Assign {
            face_id: positional(rest, 0, "face id")?,
            name: positional(rest, 1, "person name")?,
        },
        "uncorrect" => Command::Uncorrect { face_id: positional(rest, 0, "face id")? },
        "reset" => Command::Reset {
            confirmed: rest.iter().any(|a| a == "--yes"),
        },
        other => bail!("unknown command: {}", other),
    };
    Ok(command)
}

/// Parse the value following the flag at `args[*i]` and advance past it.
fn value_of<T: FromStr>(args: &[String], i: &mut usize, flag: &str) -> Result<T> {
    let Some(raw) = args.get(*i + 1) else {
        bail!("{} requires a value", flag);
    };
    *i += 1;
    raw.parse()
        .map_err(|_| anyhow::anyhow!("invalid value for {}: {}", flag, raw))
}

fn positional<T: FromStr>(rest: &[String], index: usize, what: &str) -> Result<T> {
    let Some(raw) = rest.get(index) else {
        bail!("missing {}", what);
    };
    raw.parse()
        .map_err(|_| anyhow::anyhow!("invalid {}: {}", what, raw))
}

fn print_help() {
    println!(
        r#"facegroup - group the faces in a photo library by person

USAGE:
    facegroup [OPTIONS] <COMMAND> [ARGS]

COMMANDS:
    ingest <DIR> [--full]               Detect faces in new photos (--full rescans everything)
    recluster [--epsilon E] [--min-points N] [--timeout SECS]
    stats                               Library statistics
    clusters [--min-members N] [--offset N] [--limit N]
    cluster <ID>                        Cluster with all member faces
    by-name <NAME>                      Clusters carrying a name
    photo <ID>                          Photo and its faces
    face <ID>                           One face and its correction
    rename <CLUSTER> <NAME>
    representative <CLUSTER> <FACE>
    exclude <FACE>                      Never cluster this face
    assign <FACE> <NAME>                Force this face into the cluster named NAME
    uncorrect <FACE>                    Remove the correction on a face
    corrections                         List all corrections
    failures                            Photos whose last ingestion failed
    reset --yes                         Delete everything

OPTIONS:
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    FACEGROUP_CONFIG    Path to config file (overrides default location)
    FACEGROUP_LOG       Log filter (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/facegroup/config.toml
Detections are read from <photo>.faces.json sidecars (scanner.sidecar_suffix)."#
    );
}

fn run(config: Config, command: Command, cancel: Arc<AtomicBool>) -> Result<Value> {
    let library = Library::open(&config.db_path)
        .with_context(|| format!("opening library {}", config.db_path.display()))?;
    if let Some(dim) = config.embedding_dim {
        library.pin_embedding_dim(dim)?;
    }

    let value = match command {
        Command::Ingest { root, full } => {
            let source = DirectorySource::new(root, config.scanner.clone());
            let detector: Arc<dyn FaceDetector> =
                Arc::new(SidecarDetector::new(config.scanner.sidecar_suffix.clone()));
            let (tx, rx) = mpsc::channel();
            let processor = FaceProcessor::new(detector, config.ingest.options(!full))
                .with_cancel_flag(cancel)
                .with_status_sender(tx);

            let progress = std::thread::spawn(move || {
                for status in rx {
                    match status {
                        IngestStatus::Starting { total_photos, pending } => {
                            eprintln!("{} photos, {} to examine", total_photos, pending)
                        }
                        IngestStatus::Processing { current, total, .. }
                            if current % 100 == 0 || current == total =>
                        {
                            eprintln!("{}/{}", current, total)
                        }
                        IngestStatus::Failed { path, error } => eprintln!("failed: {}: {}", path, error),
                        _ => {}
                    }
                }
            });

            let report = library.ingest_with(&processor, &source);
            // Closes the status channel so the progress thread ends.
            drop(processor);
            let _ = progress.join();
            serde_json::to_value(report?)?
        }
        Command::Recluster {
            epsilon,
            min_points,
            timeout_secs,
        } => {
            let mut clustering = config.clustering.clone();
            if let Some(epsilon) = epsilon {
                clustering.epsilon = epsilon;
            }
            if let Some(min_points) = min_points {
                clustering.min_points = min_points;
            }
            if let Some(timeout_secs) = timeout_secs {
                clustering.timeout_secs = timeout_secs;
            }
            serde_json::to_value(library.recluster(&clustering.params())?)?
        }
        Command::Stats => serde_json::to_value(library.stats()?)?,
        Command::Clusters(query) => serde_json::to_value(library.list_clusters(&query)?)?,
        Command::Cluster { id } => serde_json::to_value(library.get_cluster(id)?)?,
        Command::ByName { name } => serde_json::to_value(library.clusters_by_name(&name)?)?,
        Command::Photo { id } => serde_json::json!({
            "photo": library.get_photo(id)?,
            "faces": library.faces_for_photo(id)?,
        }),
        Command::Face { id } => serde_json::json!({
            "face": library.get_face(id)?,
            "correction": library.get_correction(id)?,
        }),
        Command::Rename { cluster_id, name } => {
            serde_json::to_value(library.rename_cluster(cluster_id, &name)?)?
        }
        Command::Representative {
            cluster_id,
            face_id,
        } => serde_json::to_value(library.set_representative(cluster_id, face_id)?)?,
        Command::Exclude { face_id } => serde_json::to_value(library.record_exclude(face_id)?)?,
        Command::Assign { face_id, name } => {
            serde_json::to_value(library.record_forced_assign(face_id, &name)?)?
        }
        Command::Uncorrect { face_id } => {
            serde_json::to_value(library.remove_correction(face_id)?)?
        }
        Command::Corrections => serde_json::to_value(library.list_corrections()?)?,
        Command::Failures => serde_json::to_value(library.ingest_failures()?)?,
        Command::Reset { confirmed } => {
            if !confirmed {
                bail!("reset deletes every photo, face, cluster and correction; pass --yes");
            }
            library.reset()?;
            serde_json::json!({ "reset": true })
        }
    };

    Ok(value)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Run `facegroup --help` for usage.");
            std::process::exit(2);
        }
    };

    // Initialize logging (uses journald on Linux, file fallback otherwise)
    let _ = logging::init(None);

    let config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after the photos in flight");
            flag.store(true, Ordering::Relaxed);
        }
    });

    let command = args.command;
    let output = tokio::task::spawn_blocking(move || run(config, command, cancel))
        .await
        .context("command task failed")??;

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
