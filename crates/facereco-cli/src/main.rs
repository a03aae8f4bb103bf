use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facereco_core::{lbp, Store, DEFAULT_DISTANCE_THRESHOLD};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.facereco.Recognizer1",
    default_service = "org.facereco.Recognizer1",
    default_path = "/org/facereco/Recognizer1"
)]
trait Recognizer {
    async fn identify(&self, paths: Vec<String>) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn list_persons(&self) -> zbus::Result<String>;
    async fn merge_persons(&self, first: u32, second: u32) -> zbus::Result<u32>;
    async fn rename_person(&self, id: u32, name: &str) -> zbus::Result<()>;
    async fn set_distance_threshold(&self, threshold: f64) -> zbus::Result<()>;
    async fn save(&self) -> zbus::Result<()>;
    async fn save_as(&self, path: String) -> zbus::Result<()>;
    async fn load_database(&self, path: String) -> zbus::Result<()>;
    async fn clear(&self) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "facereco", about = "facereco face recognition CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify one track of aligned face images (and learn it, in learn mode)
    Identify {
        /// Image files, one per frame
        #[arg(required = true)]
        frames: Vec<PathBuf>,
    },
    /// Show daemon status
    Status,
    /// List stored persons
    List,
    /// Merge the second person into the first
    Merge { first: u32, second: u32 },
    /// Name a person
    Rename { id: u32, name: String },
    /// Change the match distance threshold
    Threshold { value: f64 },
    /// Write the daemon's database to disk
    Save {
        /// Write to this file instead of the configured database path
        path: Option<PathBuf>,
    },
    /// Replace the daemon's database with a database file
    Load { db: PathBuf },
    /// Remove every stored person
    Clear,
    /// Summarise a database file without the daemon
    Inspect { db: PathBuf },
    /// Print the descriptor distance between two aligned face images
    Distance {
        a: PathBuf,
        b: PathBuf,
        #[arg(long, default_value_t = DEFAULT_DISTANCE_THRESHOLD)]
        threshold: f32,
    },
}

async fn proxy() -> Result<RecognizerProxy<'static>> {
    let connection = zbus::Connection::session()
        .await
        .context("cannot connect to the session bus")?;
    Ok(RecognizerProxy::new(&connection).await?)
}

fn print_persons(persons: &[serde_json::Value]) {
    if persons.is_empty() {
        println!("No persons stored");
        return;
    }
    println!("{:>4}  {:<20} {:>6} {:>11}", "ID", "NAME", "TRACKS", "DESCRIPTORS");
    for p in persons {
        println!(
            "{:>4}  {:<20} {:>6} {:>11}",
            p["id"], p["name"].as_str().unwrap_or(""), p["tracks"], p["descriptors"]
        );
    }
}

fn inspect(db: &Path) -> Result<()> {
    let store = Store::new();
    store
        .load(db)
        .with_context(|| format!("cannot read {}", db.display()))?;

    let persons = serde_json::to_value(store.summaries())?;
    print_persons(persons.as_array().map(Vec::as_slice).unwrap_or(&[]));
    println!(
        "{} persons, {} tracks, {} descriptors, {} bytes",
        store.person_count(),
        store.total_tracks(),
        store.total_descriptors(),
        store.size_bytes()
    );
    Ok(())
}

fn distance(a: &Path, b: &Path, threshold: f32) -> Result<()> {
    let encode = |path: &Path| -> Result<_> {
        let img = image::open(path)
            .with_context(|| format!("cannot open {}", path.display()))?
            .to_luma8();
        Ok(lbp::encode(&img)?)
    };
    let d = encode(a)?.distance(&encode(b)?);
    let verdict = if d < threshold { "same person" } else { "different persons" };
    println!("{d:.4} ({verdict} at threshold {threshold})");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Identify { frames } => {
            // The daemon resolves paths relative to its own working directory.
            let paths = frames
                .iter()
                .map(|p| {
                    std::fs::canonicalize(p)
                        .map(|p| p.to_string_lossy().into_owned())
                        .with_context(|| format!("cannot find {}", p.display()))
                })
                .collect::<Result<Vec<_>>>()?;
            tracing::debug!(frames = paths.len(), "sending identify request");
            let report: serde_json::Value = serde_json::from_str(&proxy().await?.identify(paths).await?)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Status => {
            let status: serde_json::Value = serde_json::from_str(&proxy().await?.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::List => {
            let persons: Vec<serde_json::Value> = serde_json::from_str(&proxy().await?.list_persons().await?)?;
            print_persons(&persons);
        }
        Commands::Merge { first, second } => {
            let merged = proxy().await?.merge_persons(first, second).await?;
            println!("Merged person {second} into {first}; merged person is now {merged}");
        }
        Commands::Rename { id, name } => {
            proxy().await?.rename_person(id, &name).await?;
            println!("Person {id} renamed to {name}");
        }
        Commands::Threshold { value } => {
            proxy().await?.set_distance_threshold(value).await?;
            println!("Distance threshold set to {value}");
        }
        Commands::Save { path: None } => {
            proxy().await?.save().await?;
            println!("Database saved");
        }
        Commands::Save { path: Some(path) } => {
            let path = std::env::current_dir()?.join(path);
            proxy().await?.save_as(path.to_string_lossy().into_owned()).await?;
            println!("Database saved to {}", path.display());
        }
        Commands::Load { db } => {
            let db = std::fs::canonicalize(&db).with_context(|| format!("cannot find {}", db.display()))?;
            proxy().await?.load_database(db.to_string_lossy().into_owned()).await?;
            println!("Database loaded from {}", db.display());
        }
        Commands::Clear => {
            proxy().await?.clear().await?;
            println!("Database cleared");
        }
        Commands::Inspect { db } => inspect(&db)?,
        Commands::Distance { a, b, threshold } => distance(&a, &b, threshold)?,
    }

    Ok(())
}
