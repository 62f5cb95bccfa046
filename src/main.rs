//! posterkit - render poster layouts to PNG
//!
//! Opens the persistent cache store, then either renders a layout file or
//! purges expired cache entries.

use std::fs;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use posterkit::assets::AssetCache;
use posterkit::cache::TtlStore;
use posterkit::cli::{resolve_store_path, Cli, Command, RenderArgs, RenderSettings};
use posterkit::remote::RemoteFetcher;
use posterkit::render::{Layout, Renderer};

/// Installs a stderr log subscriber filtered by `RUST_LOG`
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("posterkit=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Renders the layout named in `args` and writes the PNG
async fn run_render(store: TtlStore, args: &RenderArgs) -> Result<(), Box<dyn std::error::Error>> {
    let settings = RenderSettings::from_args(args)?;
    let layout = Layout::from_json(&fs::read_to_string(&args.layout)?)?;

    let fetcher = RemoteFetcher::new(store, &settings.fetch)?;
    let renderer = Renderer::new(fetcher, Arc::new(AssetCache::new()), settings.render);

    let output = match &settings.key {
        Some(key) => renderer.render_cached(key, &layout).await?,
        None => renderer.render(&layout).await?,
    };

    fs::write(&args.output, &output)?;
    info!(path = %args.output.display(), bytes = output.len(), "wrote poster");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    // Without a store there is no caching; treat it as fatal
    let store_path = resolve_store_path(cli.store.as_deref())?;
    let store = TtlStore::open(&store_path)?;

    match &cli.command {
        Command::Render(args) => run_render(store, args).await?,
        Command::Purge => {
            let purged = store.sweep()?;
            println!("Purged {} expired entries from {}", purged, store.path().display());
        }
    }

    Ok(())
}
