use std::sync::Arc;

use futures_util::StreamExt;
use postfeed_core::{
    spawn_refresher, AppConfig, CacheThenFresh, FeedError, JsonPageCache, PostFeed, RefreshEvent,
    RefreshSchedule, SiteClient, WpRestSource,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        error!(error = %err, "postfeed-watch stopped");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

async fn run() -> Result<(), FeedError> {
    let config = AppConfig::load();
    let site = SiteClient::new(&config.site)?;
    let source = WpRestSource::new(site, config.site.retry_policy());
    let cache_dir = config.cache.resolve_dir();
    let cache = JsonPageCache::open(&cache_dir).await?;
    info!(site = %config.site.base_url, cache = %cache_dir.display(), "starting");

    let stream = Arc::new(CacheThenFresh::new(source, cache));
    let feed = Arc::new(PostFeed::with_options(stream, config.stream));
    let schedule = RefreshSchedule::from(config.refresh);

    for scope in &schedule.scopes {
        let mut subscription = feed.subscribe(scope);
        let scope = scope.clone();
        tokio::spawn(async move {
            while let Some(posts) = subscription.next().await {
                info!(scope = %scope, posts = posts.len(), "snapshot updated");
            }
        });
    }

    let (events_tx, mut events_rx) = mpsc::channel(16);
    let refresher = spawn_refresher(feed.clone(), schedule, Some(events_tx));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
            event = events_rx.recv() => match event {
                Some(RefreshEvent::Refreshed { scope, posts }) => {
                    info!(scope = %scope, posts, "refresh complete");
                }
                Some(RefreshEvent::Failed { scope, error }) => {
                    warn!(scope = %scope, error = %error, "refresh failed, will retry next tick");
                }
                None => break,
            }
        }
    }

    refresher.stop().await
}
