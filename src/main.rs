use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;

use facedex::config::Config;
use facedex::db::{FaceStore, IngestOutcome, NewFaceRecord};
use facedex::extract::{EmbeddingExtractor, PixelEmbedder};
use facedex::library::{hashing, DirSource, LibraryLoader, LoadProgress};
use facedex::logging;

enum Command {
    Load,
    Reload,
    Add { image: PathBuf, name: Option<String> },
    Similar { id: i64, limit: Option<usize> },
    Duplicates,
    Dedup,
    List,
    Stats,
}

struct Cli {
    config_path: Option<PathBuf>,
    command: Command,
}

fn parse_args() -> Cli {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut command = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("facedex {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "load" => command = Some(Command::Load),
            "reload" => command = Some(Command::Reload),
            "add" => {
                if i + 1 >= args.len() {
                    eprintln!("Error: add requires an image path");
                    std::process::exit(1);
                }
                let image = PathBuf::from(&args[i + 1]);
                i += 1;
                let mut name = None;
                if i + 2 < args.len() && args[i + 1] == "--name" {
                    name = Some(args[i + 2].clone());
                    i += 2;
                }
                command = Some(Command::Add { image, name });
            }
            "similar" => {
                if i + 1 >= args.len() {
                    eprintln!("Error: similar requires a face id");
                    std::process::exit(1);
                }
                let id = match args[i + 1].parse::<i64>() {
                    Ok(id) => id,
                    Err(_) => {
                        eprintln!("Error: invalid face id: {}", args[i + 1]);
                        std::process::exit(1);
                    }
                };
                i += 1;
                let mut limit = None;
                if i + 2 < args.len() && args[i + 1] == "--limit" {
                    match args[i + 2].parse::<usize>() {
                        Ok(k) => limit = Some(k),
                        Err(_) => {
                            eprintln!("Error: invalid limit: {}", args[i + 2]);
                            std::process::exit(1);
                        }
                    }
                    i += 2;
                }
                command = Some(Command::Similar { id, limit });
            }
            "duplicates" => command = Some(Command::Duplicates),
            "dedup" => command = Some(Command::Dedup),
            "list" => command = Some(Command::List),
            "stats" => command = Some(Command::Stats),
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    match command {
        Some(command) => Cli {
            config_path,
            command,
        },
        None => {
            print_help();
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        r#"facedex - face-embedding similarity index

USAGE:
    facedex [OPTIONS] <COMMAND>

COMMANDS:
    load                    Ingest new images from the configured library
    reload                  Clear the store and rebuild it from the library
                            (user-added records are preserved)
    add PATH [--name NAME]  Index a single image file
    similar ID [--limit K]  Show stored faces most similar to record ID
    duplicates              List records that look like duplicates
    dedup                   Remove duplicate records, keeping the newest
    list                    List every stored record
    stats                   Show store statistics

OPTIONS:
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    FACEDEX_LOG         Log level (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/facedex/config.toml"#
    );
}

fn main() -> Result<()> {
    let cli = parse_args();

    // Initialize logging (uses journald on Linux, file fallback otherwise)
    let _ = logging::init(None);

    // Load configuration
    let config = match cli.config_path {
        Some(ref path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let store = Arc::new(FaceStore::open(&config.db_path)?);

    match cli.command {
        Command::Load => run_load(store, &config, false),
        Command::Reload => run_load(store, &config, true),
        Command::Add { image, name } => run_add(&store, &config, &image, name),
        Command::Similar { id, limit } => {
            run_similar(&store, id, limit.unwrap_or(config.dedup.search_limit))
        }
        Command::Duplicates => run_duplicates(&store, config.dedup.duplicate_threshold),
        Command::Dedup => run_dedup(&store, config.dedup.duplicate_threshold),
        Command::List => run_list(&store),
        Command::Stats => run_stats(&store),
    }
}

fn run_load(store: Arc<FaceStore>, config: &Config, reset: bool) -> Result<()> {
    let source = DirSource::new(
        config.library.root.clone(),
        &config.library.image_extensions,
    );
    let loader = LibraryLoader::new(
        Arc::new(source),
        Arc::new(PixelEmbedder),
        config.dedup.duplicate_threshold,
    );
    let library = config.library.name.clone();

    let (tx, rx) = mpsc::channel();
    let handle = std::thread::spawn(move || {
        if reset {
            loader.reset_and_reload(&store, &library, Some(tx))
        } else {
            loader.load_library(&store, &library, Some(tx))
        }
    });

    for progress in rx {
        match progress {
            LoadProgress::Started { total } => println!("Loading {total} image(s)"),
            LoadProgress::Processed {
                current,
                total,
                path,
            } => println!("[{current}/{total}] {path}"),
            LoadProgress::Error { message } => eprintln!("error: {message}"),
            LoadProgress::Cancelled { processed, total } => {
                println!("Cancelled after {processed}/{total}")
            }
            LoadProgress::Completed { report } => println!(
                "Done: {} face(s) inserted, {} already indexed, {} duplicate(s), {} without faces, {} failed",
                report.inserted,
                report.skipped_existing,
                report.skipped_duplicate,
                report.no_faces,
                report.failed
            ),
        }
    }

    match handle.join() {
        Ok(result) => {
            result?;
            Ok(())
        }
        Err(_) => bail!("load worker panicked"),
    }
}

fn run_add(store: &FaceStore, config: &Config, image: &Path, name: Option<String>) -> Result<()> {
    let bytes = std::fs::read(image)
        .with_context(|| format!("failed to read {}", image.display()))?;
    let name = name.unwrap_or_else(|| {
        image
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    });

    let hash = hashing::perceptual_hash(&bytes)?;
    let faces = PixelEmbedder.extract(&bytes)?;
    if faces.is_empty() {
        println!("No faces found in {}", image.display());
        return Ok(());
    }

    let image_path = image.to_string_lossy().to_string();
    let mut inserted = 0;
    for face in &faces {
        let record = NewFaceRecord::new(name.clone(), image_path.clone(), face.embedding.clone())
            .with_hash(hash.clone());
        match store.insert_unless_duplicate(&record, config.dedup.duplicate_threshold)? {
            IngestOutcome::Inserted(id) => {
                inserted += 1;
                println!("Stored face #{id} as \"{name}\"");
            }
            IngestOutcome::DuplicatePath => {
                println!("Skipped: this image is already indexed");
            }
            IngestOutcome::DuplicateHash => {
                println!("Skipped: a visually identical image is already indexed");
            }
            IngestOutcome::DuplicateEmbedding { similarity } => {
                println!(
                    "Skipped: matches an existing face ({:.1}% similar)",
                    similarity * 100.0
                );
            }
        }
    }

    if inserted > 0 {
        let total = store.count_by_name(&name)?;
        println!("{total} record(s) now stored for \"{name}\"");
    }
    Ok(())
}

fn run_similar(store: &FaceStore, id: i64, limit: usize) -> Result<()> {
    let target = match store.get_by_id(id)? {
        Some(target) => target,
        None => bail!("no face with id {id}"),
    };

    let results = store.find_similar(&target, limit)?;
    if results.is_empty() {
        println!("No other faces stored");
        return Ok(());
    }

    println!("Faces similar to #{} \"{}\":", target.id, target.name);
    for (record, similarity) in results {
        println!(
            "  #{:<6} {:<24} {:>6.1}%  {}",
            record.id,
            record.name,
            similarity * 100.0,
            record.image_path
        );
    }
    Ok(())
}

fn run_duplicates(store: &FaceStore, threshold: f32) -> Result<()> {
    let pairs = store.find_duplicate_pairs(threshold)?;
    if pairs.is_empty() {
        println!("No duplicates found");
        return Ok(());
    }

    println!("{} duplicate pair(s):", pairs.len());
    for pair in pairs {
        println!(
            "  #{} \"{}\" ~ #{} \"{}\"  {:.1}%",
            pair.first.id,
            pair.first.name,
            pair.second.id,
            pair.second.name,
            pair.similarity * 100.0
        );
    }
    Ok(())
}

fn run_dedup(store: &FaceStore, threshold: f32) -> Result<()> {
    let removed = store.remove_duplicates(threshold)?;
    println!("Removed {removed} duplicate record(s)");
    Ok(())
}

fn run_list(store: &FaceStore) -> Result<()> {
    let all = store.list_all()?;
    if all.is_empty() {
        println!("Store is empty");
        return Ok(());
    }

    for record in all {
        let when = chrono::DateTime::from_timestamp_millis(record.timestamp)
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "#{:<6} {:<24} {:<17} dims={:<6} {}",
            record.id,
            record.name,
            when,
            record.embedding.len(),
            record.image_path
        );
    }
    Ok(())
}

fn run_stats(store: &FaceStore) -> Result<()> {
    let all = store.list_all()?;
    println!("{} face record(s)", all.len());

    let mut by_name: BTreeMap<&str, usize> = BTreeMap::new();
    for record in &all {
        *by_name.entry(record.name.as_str()).or_default() += 1;
    }
    for (name, count) in by_name {
        println!("  {name}: {count}");
    }

    let hashed = all.iter().filter(|r| !r.image_hash.is_empty()).count();
    println!("{hashed} with perceptual hash");
    Ok(())
}
