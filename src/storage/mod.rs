//! SQLite persistence for collections, feeds, articles, per-user flags and
//! cross-process sync claims. All queries hang off [`Database`], split by
//! entity across the submodules.

mod articles;
mod collections;
mod feeds;
mod schema;
mod types;

pub use schema::Database;
pub use types::{
    Article, ArticleFilter, Collection, DatabaseError, Feed, FeedDetails, FeedSettings, FetchStatus, NewArticle,
    NewFeed,
};
