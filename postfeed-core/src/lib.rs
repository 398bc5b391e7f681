pub mod cache;
pub mod config;
pub mod editor;
pub mod error;
pub mod feed;
pub mod post;
pub mod refresher;
pub mod site;
pub mod source;
pub mod staging;
pub mod storage;
pub mod stream;

pub use cache::{MemoryPageCache, PageCache};
pub use config::{AppConfig, CacheConfig, RefreshConfig, SiteConfig};
pub use editor::{check_before_update, parse_modified, update_checked, PostEditor, WpEditor};
pub use error::{ConfigError, ErrorKind, FeedError};
pub use feed::{PostFeed, SnapshotItems, Subscription, SubscriptionHandle};
pub use post::{CachePage, EditResult, FetchedPage, PostSummary, StreamOptions, StreamProgress};
pub use refresher::{refresh_once, spawn_refresher, RefreshEvent, RefreshSchedule, RefresherHandle};
pub use site::SiteClient;
pub use source::{FetchOutcome, PageSource, RetryPolicy, WpRestSource};
pub use staging::{EditingService, ForkResult, PublishResult, SaveData, SaveResult};
pub use storage::JsonPageCache;
pub use stream::{BatchStream, CacheThenFresh, ContentStream, ProgressSender};
