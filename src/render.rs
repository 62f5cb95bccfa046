//! Layout documents and the renderer that turns them into PNG bytes
//!
//! A render resolves the background and every image layer concurrently with
//! `run_parallel`, composites them in layer order, draws lines and text on
//! top, and encodes the result.

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::assets::{AssetCache, AssetError};
use crate::canvas::{transform, Canvas, CanvasError, TextConfig};
use crate::parallel::{job, run_parallel, Job, JobContext, ParallelError, Slot};
use crate::remote::{FetchError, RemoteFetcher};

/// Prefix for rendered output keys in the store
pub const RENDER_KEY_PREFIX: &str = "render:";

/// Errors from resolving a single image source
#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Asset(#[from] AssetError),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Errors that can occur during a render
#[derive(Debug, Error)]
pub enum RenderError {
    /// Loading sources failed or timed out
    #[error("Failed to load image sources: {0}")]
    Sources(#[from] ParallelError<SourceError>),

    /// Drawing or encoding failed
    #[error(transparent)]
    Canvas(#[from] CanvasError),

    /// A source job finished without producing its image
    #[error("Image source {index} produced no image")]
    Unresolved { index: usize },

    /// The layout document could not be parsed
    #[error("Invalid layout: {0}")]
    Layout(#[from] serde_json::Error),
}

/// Where an image comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageSource {
    /// A file on disk, memoized for the process lifetime
    Local { path: PathBuf },
    /// A URL, cached raw in the store
    Remote {
        url: String,
        /// Target width; 0 derives it from the height
        #[serde(default)]
        width: u32,
        /// Target height; 0 derives it from the width
        #[serde(default)]
        height: u32,
        /// Overrides the renderer's default remote TTL
        #[serde(default)]
        ttl_secs: Option<u64>,
    },
}

/// An image drawn at an offset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageLayer {
    pub source: ImageSource,
    #[serde(default)]
    pub x: i64,
    #[serde(default)]
    pub y: i64,
    /// Crop the image into a circle before drawing
    #[serde(default)]
    pub round: bool,
}

/// A horizontal rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineLayer {
    pub x: f32,
    pub y: f32,
    pub length: f32,
    #[serde(default = "default_line_color")]
    pub color: [u8; 4],
}

fn default_line_color() -> [u8; 4] {
    [0, 0, 0, 255]
}

/// A complete poster description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layout {
    pub background: ImageSource,
    #[serde(default)]
    pub images: Vec<ImageLayer>,
    #[serde(default)]
    pub lines: Vec<LineLayer>,
    #[serde(default)]
    pub texts: Vec<TextConfig>,
}

impl Layout {
    /// Parses a layout from JSON
    pub fn from_json(json: &str) -> Result<Self, RenderError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Renderer settings
#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Deadline for resolving all image sources
    pub timeout: Duration,
    /// How long rendered output stays cached
    pub output_ttl: Duration,
    /// Default TTL for downloaded remote sources
    pub remote_ttl: Duration,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            output_ttl: Duration::from_secs(2 * 24 * 3600), // 2 days
            remote_ttl: Duration::from_secs(5 * 24 * 3600), // 5 days
        }
    }
}

/// Composes layouts into PNG bytes
#[derive(Debug, Clone)]
pub struct Renderer {
    fetcher: RemoteFetcher,
    assets: Arc<AssetCache>,
    config: RenderConfig,
}

impl Renderer {
    pub fn new(fetcher: RemoteFetcher, assets: Arc<AssetCache>, config: RenderConfig) -> Self {
        Self {
            fetcher,
            assets,
            config,
        }
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    /// Store key for rendered output named `key`
    pub fn output_key(key: &str) -> String {
        format!("{RENDER_KEY_PREFIX}{key}")
    }

    /// Returns cached output for `key`, rendering and caching it on a miss
    ///
    /// A failure to cache the fresh render is logged and does not fail the call.
    pub async fn render_cached(&self, key: &str, layout: &Layout) -> Result<Vec<u8>, RenderError> {
        let store_key = Self::output_key(key);
        let store = self.fetcher.store();

        if let Some(cached) = store.get_async(&store_key).await {
            debug!(key, "render served from cache");
            return Ok(cached);
        }

        let output = self.render(layout).await?;
        if let Err(e) = store
            .put_async(&store_key, output.clone(), self.config.output_ttl)
            .await
        {
            warn!(key, error = %e, "failed to cache render output");
        }
        Ok(output)
    }

    /// Renders `layout` into PNG bytes
    pub async fn render(&self, layout: &Layout) -> Result<Vec<u8>, RenderError> {
        let ctx = JobContext::with_timeout(self.config.timeout);
        let background = Slot::new();
        let layers: Vec<Slot<Arc<DynamicImage>>> =
            layout.images.iter().map(|_| Slot::new()).collect();

        let mut jobs = Vec::with_capacity(layers.len() + 1);
        jobs.push(self.resolve_job(&ctx, layout.background.clone(), false, background.clone()));
        for (layer, slot) in layout.images.iter().zip(&layers) {
            jobs.push(self.resolve_job(&ctx, layer.source.clone(), layer.round, slot.clone()));
        }

        let outcome = run_parallel(&ctx, jobs).await;
        // Abandoned sources stop at their next await point
        ctx.cancel();
        outcome?;

        let background = background.take().ok_or(RenderError::Unresolved { index: 0 })?;
        let mut canvas = Canvas::new(&background);

        for (index, (layer, slot)) in layout.images.iter().zip(&layers).enumerate() {
            let img = slot
                .take()
                .ok_or(RenderError::Unresolved { index: index + 1 })?;
            canvas.draw_image(&img, layer.x, layer.y);
        }
        for line in &layout.lines {
            canvas.draw_line(line.color, line.x, line.y, line.length);
        }
        for text in &layout.texts {
            canvas.draw_text(&self.assets, text)?;
        }

        let output = canvas.encode_png()?;
        info!(
            width = canvas.width(),
            height = canvas.height(),
            layers = layout.images.len(),
            bytes = output.len(),
            "rendered layout"
        );
        Ok(output)
    }

    /// Builds the job that resolves `source` into `slot`
    ///
    /// The job gives up quietly once `ctx` is canceled; by then the group
    /// outcome is already decided.
    fn resolve_job(
        &self,
        ctx: &JobContext,
        source: ImageSource,
        round: bool,
        slot: Slot<Arc<DynamicImage>>,
    ) -> Job<SourceError> {
        let fetcher = self.fetcher.clone();
        let assets = Arc::clone(&self.assets);
        let default_ttl = self.config.remote_ttl;
        let token = ctx.token().clone();

        job(async move {
            let resolve = async {
                let img = match source {
                    ImageSource::Local { path } => assets.load_image(&path)?,
                    ImageSource::Remote {
                        url,
                        width,
                        height,
                        ttl_secs,
                    } => {
                        let ttl = ttl_secs.map(Duration::from_secs).unwrap_or(default_ttl);
                        Arc::new(fetcher.fetch(&url, width, height, ttl).await?)
                    }
                };
                slot.set(if round {
                    Arc::new(transform::round(&img))
                } else {
                    img
                });
                Ok::<(), SourceError>(())
            };

            tokio::select! {
                _ = token.cancelled() => Ok(()),
                result = resolve => result,
            }
        })
    }
}
