//! Integration tests for the subscription lifecycle: collection, feeds,
//! articles, per-user flags, deletion.
//!
//! Each test creates its own in-memory SQLite database for isolation.

use rss_aggregator::storage::{
    Database, DatabaseError, FeedDetails, FeedSettings, FetchStatus, NewArticle, NewFeed,
};

async fn test_db() -> Database {
    Database::open(":memory:").await.unwrap()
}

fn test_article(n: u32, published: i64) -> NewArticle {
    NewArticle {
        dedup_key: format!("https://example.com/{n}"),
        link: format!("https://example.com/{n}"),
        title: format!("Article {n}"),
        description: "Test summary".to_string(),
        content: Some("Body".to_string()),
        author: None,
        published: Some(published),
        image_url: None,
    }
}

#[tokio::test]
async fn test_full_lifecycle() {
    let db = test_db().await;

    let cid = db
        .create_collection("Reading list", Some("weekday"), 10, true)
        .await
        .unwrap();
    let fid = db
        .insert_feed(&NewFeed::new(cid, "https://example.com/feed.xml", "Example"))
        .await
        .unwrap();
    assert_eq!(db.list_feeds(cid).await.unwrap().len(), 1);

    let inserted = db
        .commit_refresh(
            fid,
            &[test_article(1, 100), test_article(2, 200)],
            300,
            &FeedDetails::default(),
        )
        .await
        .unwrap();
    assert_eq!(inserted, 2);

    let articles = db.recent_articles(Some(cid), 10, None).await.unwrap();
    assert_eq!(articles.len(), 2);
    assert_eq!(articles[0].title, "Article 2");

    db.set_article_read(10, articles[0].id, true).await.unwrap();
    assert!(db.toggle_article_favorite(10, articles[1].id).await.unwrap());

    let articles = db.get_articles_for_feed(fid, 10, None).await.unwrap();
    assert!(articles[0].is_read);
    assert!(!articles[0].is_favorite);
    assert!(!articles[1].is_read);
    assert!(articles[1].is_favorite);

    assert!(db.delete_feed(fid).await.unwrap());
    assert!(db.get_feed(fid).await.unwrap().is_none());
    assert!(db.recent_articles(Some(cid), 10, None).await.unwrap().is_empty());
    assert!(db.get_collection(cid).await.unwrap().is_some());
}

#[tokio::test]
async fn test_duplicate_feed_url_across_collections_rejected() {
    let db = test_db().await;
    let first = db.create_collection("One", None, 1, false).await.unwrap();
    let second = db.create_collection("Two", None, 2, false).await.unwrap();

    db.insert_feed(&NewFeed::new(first, "https://example.com/feed.xml", "A"))
        .await
        .unwrap();
    let err = db
        .insert_feed(&NewFeed::new(second, "https://example.com/feed.xml", "B"))
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::DuplicateFeedUrl(url) if url == "https://example.com/feed.xml"));
}

#[tokio::test]
async fn test_paused_feed_is_never_due() {
    let db = test_db().await;
    let cid = db.create_collection("C", None, 1, false).await.unwrap();
    let fid = db
        .insert_feed(&NewFeed::new(cid, "https://example.com/feed.xml", "A"))
        .await
        .unwrap();
    assert_eq!(db.due_feeds(0).await.unwrap().len(), 1);

    db.update_feed_settings(
        fid,
        &FeedSettings {
            is_active: Some(false),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert!(db.due_feeds(i64::MAX / 2).await.unwrap().is_empty());
    assert!(db.active_feeds().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_error_then_success_status_history() {
    let db = test_db().await;
    let cid = db.create_collection("C", None, 1, false).await.unwrap();
    let fid = db
        .insert_feed(&NewFeed::new(cid, "https://example.com/feed.xml", "A"))
        .await
        .unwrap();

    db.update_feed_status(fid, FetchStatus::Error, Some("Request timed out"), 100)
        .await
        .unwrap();
    // Due again only after update_frequency minutes
    assert!(db.due_feeds(100 + 60 * 60 - 1).await.unwrap().is_empty());
    assert_eq!(db.due_feeds(100 + 60 * 60).await.unwrap().len(), 1);

    db.commit_refresh(fid, &[test_article(1, 50)], 200, &FeedDetails::default())
        .await
        .unwrap();
    let feed = db.get_feed(fid).await.unwrap().unwrap();
    assert_eq!(feed.last_fetch_status, FetchStatus::Success);
    assert_eq!(feed.error_message, None);
    assert_eq!(feed.last_fetched_at, Some(200));
}

#[tokio::test]
async fn test_deleting_collection_removes_everything_below_it() {
    let db = test_db().await;
    let cid = db.create_collection("C", None, 1, false).await.unwrap();
    let fid = db
        .insert_feed(&NewFeed::new(cid, "https://example.com/feed.xml", "A"))
        .await
        .unwrap();
    db.insert_articles(fid, &[test_article(1, 1)], 1).await.unwrap();

    assert!(db.delete_collection(cid).await.unwrap());
    assert!(db.list_feeds(cid).await.unwrap().is_empty());
    assert!(db.recent_articles(None, 1, None).await.unwrap().is_empty());
}
