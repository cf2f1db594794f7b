use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;

use rss_aggregator::config::Config;
use rss_aggregator::feed::{parse, Fetcher};
use rss_aggregator::storage::{ArticleFilter, Database, DatabaseError, NewFeed};
use rss_aggregator::sync::{spawn_scheduler, RefreshError, SyncEngine};
use rss_aggregator::util::validate_feed_url;

/// Get the config directory path (~/.config/rss-aggregator/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    let config_dir = PathBuf::from(home).join(".config").join("rss-aggregator");
    Ok(config_dir)
}

#[derive(Parser, Debug)]
#[command(
    name = "rss-aggregator",
    about = "Refresh RSS/Atom feeds and store new articles"
)]
struct Args {
    /// Config file (default: ~/.config/rss-aggregator/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage collections
    #[command(subcommand)]
    Collection(CollectionCommand),

    /// Manage feeds
    #[command(subcommand)]
    Feed(FeedCommand),

    /// Refresh one feed now
    Refresh { feed_id: i64 },

    /// Refresh every active feed
    RefreshAll,

    /// Refresh due feeds periodically until interrupted (Ctrl+C)
    Run,

    /// List articles, newest first
    Articles {
        #[arg(long)]
        collection: Option<i64>,
        #[arg(long)]
        feed: Option<i64>,
        /// Whose read/favorite flags to show and filter on
        #[arg(long, default_value_t = 0)]
        user: i64,
        /// Only read (true) or unread (false) articles
        #[arg(long)]
        read: Option<bool>,
        /// Only favorites (true) or non-favorites (false)
        #[arg(long)]
        favorite: Option<bool>,
        /// Match title, description, content, author or feed title
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        limit: Option<i64>,
        #[arg(long)]
        offset: Option<i64>,
    },

    /// Search every collection the user owns or that is shared
    Search {
        term: String,
        #[arg(long, default_value_t = 0)]
        user: i64,
        #[arg(long)]
        limit: Option<i64>,
        #[arg(long)]
        offset: Option<i64>,
    },

    /// Mark an article read (or unread with --unread)
    Read {
        article_id: i64,
        #[arg(long, default_value_t = 0)]
        user: i64,
        #[arg(long)]
        unread: bool,
    },

    /// Toggle an article's favorite flag
    Favorite {
        article_id: i64,
        #[arg(long, default_value_t = 0)]
        user: i64,
    },
}

#[derive(Subcommand, Debug)]
enum CollectionCommand {
    Add {
        name: String,
        #[arg(long)]
        owner: i64,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        shared: bool,
    },
    List {
        #[arg(long)]
        owner: i64,
    },
    Delete { collection_id: i64 },
}

#[derive(Subcommand, Debug)]
enum FeedCommand {
    /// Subscribe a collection to a feed URL
    Add {
        collection_id: i64,
        url: String,
        /// Defaults to the feed's own title
        #[arg(long)]
        title: Option<String>,
        /// Minutes between scheduled refreshes
        #[arg(long, default_value_t = NewFeed::DEFAULT_UPDATE_FREQUENCY)]
        frequency: i64,
        #[arg(long)]
        user: Option<i64>,
    },
    List { collection_id: i64 },
    Remove { feed_id: i64 },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{json}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize tracing; RUST_LOG controls verbosity
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    // Set up config directory
    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        tracing::info!(path = %config_dir.display(), "Created config directory");
    }

    // User-only access to the directory holding the database
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(&config_dir) {
            Ok(metadata) => {
                let mut perms = metadata.permissions();
                perms.set_mode(0o700);
                if let Err(e) = std::fs::set_permissions(&config_dir, perms) {
                    tracing::warn!(
                        path = %config_dir.display(),
                        error = %e,
                        "Failed to set config directory permissions to 0700"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %config_dir.display(),
                    error = %e,
                    "Failed to read config directory metadata"
                );
            }
        }
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db_path = config.database_path_in(&config_dir);
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::Locked) => {
            eprintln!("Error: The database is locked by another process. Please try again.");
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => {
            return Err(anyhow::anyhow!("Failed to open database: {}", e));
        }
    };

    let outcome = run_command(args.command, &config, db.clone()).await;
    db.close().await;
    outcome
}

/// Exit status when another process holds the feed's sync claim
const EXIT_IN_PROGRESS: u8 = 2;

async fn run_command(command: Command, config: &Config, db: Database) -> Result<ExitCode> {
    let outcome: Result<()> = match command {
        Command::Collection(CollectionCommand::Add {
            name,
            owner,
            description,
            shared,
        }) => {
            let id = db
                .create_collection(&name, description.as_deref(), owner, shared)
                .await?;
            let collection = db
                .get_collection(id)
                .await?
                .context("Collection vanished after insert")?;
            print_json(&collection)
        }
        Command::Collection(CollectionCommand::List { owner }) => {
            print_json(&db.list_collections(owner).await?)
        }
        Command::Collection(CollectionCommand::Delete { collection_id }) => {
            if !db.delete_collection(collection_id).await? {
                anyhow::bail!("Collection {collection_id} not found");
            }
            Ok(())
        }
        Command::Feed(FeedCommand::Add {
            collection_id,
            url,
            title,
            frequency,
            user,
        }) => {
            let url = validate_feed_url(&url, config.allow_private_hosts)
                .with_context(|| format!("Rejected feed URL {url}"))?;
            let title = match title {
                Some(title) => title,
                None => discover_title(config, url.as_str()).await,
            };

            let mut new_feed = NewFeed::new(collection_id, url.as_str(), title);
            new_feed.update_frequency = frequency;
            new_feed.added_by_user_id = user;
            let id = db.insert_feed(&new_feed).await?;
            let feed = db
                .get_feed(id)
                .await?
                .context("Feed vanished after insert")?;
            print_json(&feed)
        }
        Command::Feed(FeedCommand::List { collection_id }) => {
            print_json(&db.list_feeds(collection_id).await?)
        }
        Command::Feed(FeedCommand::Remove { feed_id }) => {
            if !db.delete_feed(feed_id).await? {
                anyhow::bail!("Feed {feed_id} not found");
            }
            Ok(())
        }
        Command::Refresh { feed_id } => {
            let engine = SyncEngine::new(db, config.sync_settings())?;
            match engine.refresh_feed(feed_id).await {
                Ok(result) => print_json(&result),
                Err(RefreshError::InProgress(_)) => {
                    eprintln!("Feed {feed_id} is already being refreshed by another process.");
                    return Ok(ExitCode::from(EXIT_IN_PROGRESS));
                }
                Err(e) => Err(e.into()),
            }
        }
        Command::RefreshAll => {
            let engine = SyncEngine::new(db, config.sync_settings())?;
            let summary = engine
                .refresh_all()
                .await
                .context("Failed to load feeds")?;
            print_json(&summary)
        }
        Command::Run => {
            let engine = SyncEngine::new(db, config.sync_settings())?;
            let handle = spawn_scheduler(engine, config.scheduler_interval());
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl+C")?;
            tracing::info!("Shutdown requested");
            handle.stop().await.context("Scheduler task failed")?;
            Ok(())
        }
        Command::Articles {
            collection,
            feed,
            user,
            read,
            favorite,
            search,
            limit,
            offset,
        } => {
            if let Some(feed_id) = feed {
                if db.get_feed(feed_id).await?.is_none() {
                    anyhow::bail!("Feed {feed_id} not found");
                }
            }
            let filter = ArticleFilter {
                collection_id: collection,
                feed_id: feed,
                is_read: read,
                is_favorite: favorite,
                search,
                limit,
                offset,
            };
            print_json(&db.query_articles(user, &filter).await?)
        }
        Command::Search {
            term,
            user,
            limit,
            offset,
        } => print_json(&db.search_articles(user, &term, limit, offset).await?),
        Command::Read {
            article_id,
            user,
            unread,
        } => db
            .set_article_read(user, article_id, !unread)
            .await
            .map_err(Into::into),
        Command::Favorite { article_id, user } => {
            let favorite = db.toggle_article_favorite(user, article_id).await?;
            print_json(&serde_json::json!({ "article_id": article_id, "is_favorite": favorite }))
        }
    };
    outcome.map(|()| ExitCode::SUCCESS)
}

/// Fetch the feed once to read its title; falls back to the URL.
async fn discover_title(config: &Config, url: &str) -> String {
    let settings = config.sync_settings();
    let fetcher = match Fetcher::new(
        &settings.user_agent,
        settings.max_body_bytes,
        settings.allow_private_hosts,
    ) {
        Ok(fetcher) => fetcher,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to build HTTP client");
            return url.to_string();
        }
    };

    let title = match fetcher.fetch(url, settings.request_timeout).await {
        Ok(doc) => match parse(&doc) {
            Ok(parsed) => parsed.meta.title,
            Err(e) => {
                tracing::warn!(url = url, error = %e, "Could not parse feed for its title");
                None
            }
        },
        Err(e) => {
            tracing::warn!(url = url, error = %e, "Could not fetch feed for its title");
            None
        }
    };

    title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| url.to_string())
}
