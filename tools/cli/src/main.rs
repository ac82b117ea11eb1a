//! Groundsync CLI - Command line interface for the offline sync engine.
//!
//! This tool inspects and drives a local groundsync database: registering
//! offline tiles and areas, downloading tiles, and delivering pending edits.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use url::Url;

use groundsync_common::{generate_id, Bounds, OfflineArea, Point, Tile, TileId};
use groundsync_storage::{HttpRemoteStore, LocalStore, SqliteLocalStore};
use groundsync_sync::{run_with_backoff, HttpTileSource, JobOutcome, SyncConfig, SyncContext};

#[derive(Parser)]
#[command(name = "groundsync")]
#[command(about = "Groundsync - Offline-first field data sync")]
#[command(version)]
struct Cli {
    /// Local database file.
    #[arg(long, default_value = "groundsync.db", global = true)]
    db: PathBuf,

    /// JSON configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage offline tiles.
    Tile {
        #[command(subcommand)]
        command: TileCommands,
    },

    /// Manage offline areas.
    Area {
        #[command(subcommand)]
        command: AreaCommands,
    },

    /// Show pending mutations for a feature or observation.
    Pending {
        /// Feature or observation id.
        entity: String,

        /// Print mutations as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Deliver pending mutations of a feature to a remote server.
    Deliver {
        /// Owning feature id.
        feature: String,

        /// Base URL of the remote server.
        #[arg(short, long)]
        remote: Url,
    },
}

#[derive(Subcommand)]
enum TileCommands {
    /// Register a tile for download.
    Add {
        /// Tile coordinate as "(x, y, z)" or "x,y,z".
        id: TileId,

        /// Source URL.
        #[arg(short, long)]
        url: String,
    },

    /// List tiles and their state.
    List,

    /// Download every pending tile.
    Download,
}

#[derive(Subcommand)]
enum AreaCommands {
    /// Register an area and every tile covering it at one zoom level.
    Add {
        #[arg(long, allow_hyphen_values = true)]
        south: f64,
        #[arg(long, allow_hyphen_values = true)]
        west: f64,
        #[arg(long, allow_hyphen_values = true)]
        north: f64,
        #[arg(long, allow_hyphen_values = true)]
        east: f64,

        #[arg(short, long)]
        zoom: u32,

        /// Tile URL template with {z}, {x} and {y} placeholders.
        #[arg(short, long)]
        url_template: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG overrides the verbosity flag.
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &cli.config {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SyncConfig::default(),
    };
    let store = Arc::new(open_store(&cli.db)?);

    match cli.command {
        Commands::Tile { command } => match command {
            TileCommands::Add { id, url } => cmd_tile_add(store.as_ref(), id, &url).await,
            TileCommands::List => cmd_tile_list(store.as_ref()).await,
            TileCommands::Download => cmd_tile_download(store, config).await,
        },

        Commands::Area { command } => match command {
            AreaCommands::Add {
                south,
                west,
                north,
                east,
                zoom,
                url_template,
            } => {
                let bounds = Bounds::new(Point::new(south, west)?, Point::new(north, east)?)
                    .context("Invalid area bounds")?;
                cmd_area_add(store.as_ref(), bounds, zoom, &url_template).await
            }
        },

        Commands::Pending { entity, json } => cmd_pending(store.as_ref(), &entity, json).await,

        Commands::Deliver { feature, remote } => cmd_deliver(store, config, &feature, remote).await,
    }
}

fn open_store(path: &Path) -> Result<SqliteLocalStore> {
    SqliteLocalStore::open(path)
        .with_context(|| format!("Failed to open database {}", path.display()))
}

/// Fill a `{z}/{x}/{y}` URL template.
fn expand_template(template: &str, id: &TileId) -> String {
    template
        .replace("{z}", &id.z.to_string())
        .replace("{x}", &id.x.to_string())
        .replace("{y}", &id.y.to_string())
}

/// Register one tile.
async fn cmd_tile_add(store: &dyn LocalStore, id: TileId, url: &str) -> Result<()> {
    if let Some(existing) = store.get_tile(&id).await? {
        anyhow::bail!("Tile {} already registered ({})", id, existing.state);
    }

    let tile = Tile::new(id, url);
    store
        .insert_or_update_tile(&tile)
        .await
        .context("Failed to register tile")?;

    println!("Tile {} registered as {}", tile.id, tile.path);
    Ok(())
}

/// List all tiles.
async fn cmd_tile_list(store: &dyn LocalStore) -> Result<()> {
    let tiles = store.get_tiles().await.context("Failed to list tiles")?;

    if tiles.is_empty() {
        println!("No tiles registered.");
    } else {
        for tile in tiles {
            println!("  {:<16} {:<12} {}", tile.id.to_string(), tile.state, tile.url);
        }
    }

    Ok(())
}

/// Download pending tiles, re-running failed passes with backoff.
async fn cmd_tile_download(store: Arc<SqliteLocalStore>, config: SyncConfig) -> Result<()> {
    let source = Arc::new(HttpTileSource::new().context("Failed to create tile client")?);
    let manager = groundsync_sync::TileDownloadManager::new(store, source, &config);
    let mut progress = manager.subscribe_progress();
    let cancel = CancellationToken::new();

    let printer = tokio::spawn(async move {
        while let Ok(event) = progress.recv().await {
            println!(
                "  [{}/{}] {} {}",
                event.completed, event.total, event.tile, event.state
            );
        }
    });

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping after the current tile");
            ctrl_c.cancel();
        }
    });

    let outcome = run_with_backoff(&config.retry, &cancel, || manager.run(&cancel)).await;
    drop(manager);
    let _ = printer.await;

    match outcome {
        JobOutcome::Success => {
            println!("All tiles downloaded.");
            Ok(())
        }
        JobOutcome::Failure => anyhow::bail!("Some tiles could not be downloaded"),
    }
}

/// Register an offline area and its tiles.
async fn cmd_area_add(
    store: &dyn LocalStore,
    bounds: Bounds,
    zoom: u32,
    url_template: &str,
) -> Result<()> {
    let ids = bounds.tile_ids(zoom).context("Invalid zoom level")?;
    let mut added = 0;

    for id in &ids {
        if store.get_tile(id).await?.is_some() {
            continue;
        }
        store
            .insert_or_update_tile(&Tile::new(*id, expand_template(url_template, id)))
            .await?;
        added += 1;
    }

    let area = OfflineArea::new(generate_id(), bounds);
    store
        .insert_or_update_offline_area(&area)
        .await
        .context("Failed to register area")?;

    println!("Area {} registered", area.id);
    println!("  Tiles: {} ({} new)", ids.len(), added);
    Ok(())
}

/// Show the pending queue for an entity.
async fn cmd_pending(store: &dyn LocalStore, entity: &str, json: bool) -> Result<()> {
    let pending = store
        .get_pending_mutations(entity)
        .await
        .context("Failed to read pending mutations")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&pending)?);
    } else if pending.is_empty() {
        println!("No pending mutations for {}.", entity);
    } else {
        for mutation in pending {
            println!(
                "  #{:<6} {:<7} {} {}",
                mutation.id.unwrap_or_default(),
                mutation.mutation_type,
                mutation.entity_id(),
                mutation.client_timestamp.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }

    Ok(())
}

/// Deliver a feature's backlog and wait for the outcome.
async fn cmd_deliver(
    store: Arc<SqliteLocalStore>,
    config: SyncConfig,
    feature: &str,
    remote: Url,
) -> Result<()> {
    let remote = Arc::new(HttpRemoteStore::new(remote).context("Invalid remote")?);
    let (context, handle) = SyncContext::new(store, remote, config);
    let mut reports = context.delivery().subscribe();
    let worker = tokio::spawn(handle.run());

    let backlog = context.local().get_pending_mutations(feature).await?.len();
    info!("Delivering {} pending mutations for {}", backlog, feature);

    context.delivery().enqueue_delivery(feature)?;
    let outcome = loop {
        let report = reports.recv().await.context("Delivery worker stopped")?;
        if report.key == feature {
            break report.outcome;
        }
    };

    context.shutdown();
    let _ = worker.await;

    let remaining = context.local().get_pending_mutations(feature).await?.len();
    println!(
        "Delivery {}: {} delivered, {} still pending",
        outcome,
        backlog.saturating_sub(remaining),
        remaining
    );

    match outcome {
        JobOutcome::Success => Ok(()),
        JobOutcome::Failure => anyhow::bail!("Delivery for {} did not complete", feature),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_template() {
        let id = TileId::new(5, 6, 7);
        assert_eq!(
            expand_template("https://tiles.example.com/{z}/{x}/{y}.mbtiles", &id),
            "https://tiles.example.com/7/5/6.mbtiles"
        );
    }

    #[test]
    fn test_parse_tile_command() {
        let cli = Cli::try_parse_from([
            "groundsync",
            "--db",
            "test.db",
            "tile",
            "add",
            "(1, 2, 3)",
            "--url",
            "http://tiles/1",
        ])
        .unwrap();

        match cli.command {
            Commands::Tile {
                command: TileCommands::Add { id, url },
            } => {
                assert_eq!(id, TileId::new(1, 2, 3));
                assert_eq!(url, "http://tiles/1");
            }
            _ => panic!("unexpected command"),
        }
        assert_eq!(cli.db, PathBuf::from("test.db"));
    }

    #[test]
    fn test_parse_area_with_negative_coordinates() {
        let cli = Cli::try_parse_from([
            "groundsync",
            "area",
            "add",
            "--south",
            "-1.5",
            "--west",
            "-0.5",
            "--north",
            "1.0",
            "--east",
            "0.5",
            "--zoom",
            "10",
            "--url-template",
            "http://t/{z}/{x}/{y}",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Area { .. }));
    }

    #[test]
    fn test_parse_bare_tile_id() {
        let cli = Cli::try_parse_from(["groundsync", "tile", "add", "4,5,6", "--url", "http://t"])
            .unwrap();
        match cli.command {
            Commands::Tile {
                command: TileCommands::Add { id, .. },
            } => assert_eq!(id, TileId::new(4, 5, 6)),
            _ => panic!("unexpected command"),
        }
    }

    #[tokio::test]
    async fn test_area_add_registers_tiles() {
        let store = SqliteLocalStore::in_memory().unwrap();
        let bounds = Bounds::new(Point::new(0.0, 0.0).unwrap(), Point::new(0.1, 0.1).unwrap())
            .unwrap();

        cmd_area_add(&store, bounds, 10, "http://t/{z}/{x}/{y}")
            .await
            .unwrap();

        let tiles = store.get_tiles().await.unwrap();
        assert!(!tiles.is_empty());
        assert!(tiles.iter().all(|t| t.url.starts_with("http://t/10/")));
        assert_eq!(store.get_pending_tiles().await.unwrap().len(), tiles.len());
    }
}
