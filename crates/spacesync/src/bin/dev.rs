use clap::Parser;
use serde::{Deserialize, Serialize};
use spacesync::{
    Config, DataService, DataServiceHost, DocHandle, Feed, FeedId, Pipeline, Repo, SpaceId,
    SqliteFeedStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run several in-process peers sharing one space", long_about = None)]
struct Args {
    /// Number of peers to start
    #[arg(short, long, default_value = "3")]
    peers: u16,

    /// Number of edits the first peer makes
    #[arg(short, long, default_value = "5")]
    edits: u32,

    /// Directory for the feed database (temporary if omitted)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Optional config file
    #[arg(short, long)]
    config: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct Note {
    text: String,
    edits: u32,
}

struct Peer {
    name: String,
    service: Arc<DataService>,
    host: Arc<DataServiceHost>,
    repo: Repo,
}

async fn start_peer(
    index: u16,
    peers: u16,
    space_id: SpaceId,
    store: &Arc<SqliteFeedStore>,
    config: &Config,
) -> spacesync::Result<Peer> {
    let pipeline = Arc::new(Pipeline::new(config.pipeline.clone()));

    let own: Arc<dyn Feed> = Arc::new(store.open_feed(FeedId::from_u64(index as u64), true)?);
    pipeline.set_writable_feed(own).await;

    // Stand-in for replication: read every other peer's feed directly.
    for other in 1..=peers {
        if other != index {
            let feed: Arc<dyn Feed> =
                Arc::new(store.open_feed(FeedId::from_u64(other as u64), false)?);
            pipeline.add_feed(feed).await;
        }
    }

    let host = DataServiceHost::open(space_id, pipeline);
    let service = Arc::new(DataService::new());
    service.register(host.clone()).await;
    let repo = Repo::open(service.clone(), space_id, &config.repo).await?;

    Ok(Peer {
        name: format!("peer-{}", index),
        service,
        host,
        repo,
    })
}

async fn run(args: Args, config: Config, db_path: PathBuf) -> spacesync::Result<()> {
    let store = SqliteFeedStore::open(&db_path, &config.storage)?;
    let space_id = SpaceId::random();

    let mut peers = Vec::new();
    for index in 1..=args.peers {
        peers.push(start_peer(index, args.peers, space_id, &store, &config).await?);
    }
    info!("started {} peers in space {}", peers.len(), space_id);

    let author = &peers[0];
    let doc: DocHandle<Note> = author.repo.create(Some(&Note::default()))?;
    for edit in 1..=args.edits {
        doc.change(|note| {
            note.text = format!("edit {} from {}", edit, author.name);
            note.edits = edit;
        })?;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    author.repo.flush().await;
    let expected = doc.value()?;
    info!("{} wrote {:?}", author.name, expected);

    for peer in &peers[1..] {
        let handle: DocHandle<Note> = peer.repo.find(doc.id()).await?;
        let mut changes = handle.subscribe();
        while !(handle.is_ready() && handle.value()? == expected) {
            if changes.changed().await.is_err() {
                break;
            }
        }
        info!(
            "{} converged on {:?} at {}",
            peer.name,
            handle.value()?,
            peer.host.pipeline().timeframe()
        );
    }

    for peer in &peers {
        peer.repo.close().await;
        peer.host.close().await;
        peer.service.unregister(space_id).await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    if args.peers == 0 {
        eprintln!("Error: Number of peers must be at least 1");
        std::process::exit(1);
    }

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    // Keep the temp dir alive until the run finishes
    let (db_path, _temp_dir) = match &args.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            (dir.join("feeds.db"), None)
        }
        None => {
            let temp_dir = TempDir::new()?;
            (temp_dir.path().join("feeds.db"), Some(temp_dir))
        }
    };

    info!("Starting {} peers, feeds in {}", args.peers, db_path.display());

    tokio::select! {
        result = run(args, config, db_path) => {
            if let Err(e) = result {
                error!("run failed: {}", e);
                return Err(e.into());
            }
            info!("all peers converged");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    Ok(())
}
