//! End-to-end ingestion: HTTP retrieval through parsing, normalization and storage.
//!
//! Each test serves its feed from a wiremock server and stores into its own
//! in-memory SQLite database.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use feedmill::feed::{FetchError, FetchSettings, Fetcher, HttpRetriever, RetrieveSettings};
use feedmill::registry::Registry;
use feedmill::storage::{Database, FetchStatus, ItemStore, NewSource, Source, SourceStore};
use pretty_assertions::assert_eq;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DAY: i64 = 24 * 60 * 60;

fn pub_date(age_secs: i64) -> String {
    let ts = Utc::now().timestamp() - age_secs;
    chrono::DateTime::from_timestamp(ts, 0)
        .unwrap()
        .to_rfc2822()
}

fn rss(items: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"
     xmlns:media="http://search.yahoo.com/mrss/"
     xmlns:content="http://purl.org/rss/1.0/modules/content/">
  <channel>
    <title>Example Blog</title>
    <link>https://example.com/</link>
    <description>Posts</description>
    {}
  </channel>
</rss>"#,
        items
    )
}

fn item(slug: &str, title: &str, age_secs: i64) -> String {
    format!(
        r#"<item>
      <title>{title}</title>
      <link>https://example.com/{slug}</link>
      <guid>https://example.com/{slug}</guid>
      <pubDate>{date}</pubDate>
      <description>Summary of {title}</description>
    </item>"#,
        title = title,
        slug = slug,
        date = pub_date(age_secs)
    )
}

struct Harness {
    db: Database,
    fetcher: Fetcher,
    source: Source,
}

async fn harness(server: &MockServer) -> Harness {
    let db = Database::open(":memory:").await.unwrap();
    let registry = Registry::new(db.clone(), true);
    let source = registry
        .create_source(NewSource::new(format!("{}/feed.xml", server.uri()), "Example"))
        .await
        .unwrap();

    let retriever = HttpRetriever::new(RetrieveSettings {
        max_retries: 0,
        retry_base_delay: Duration::from_millis(5),
        timeout: Duration::from_secs(5),
        ..Default::default()
    })
    .unwrap();
    let store = Arc::new(db.clone());
    let fetcher = Fetcher::new(
        store.clone() as Arc<dyn SourceStore>,
        store as Arc<dyn ItemStore>,
        Arc::new(retriever),
        FetchSettings::default(),
    );

    Harness { db, fetcher, source }
}

async fn serve(server: &MockServer, body: String) {
    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/rss+xml")
                .set_body_string(body),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_old_entries_are_not_imported() {
    let server = MockServer::start().await;
    serve(
        &server,
        rss(&[
            item("fresh", "Fresh", 60),
            item("yesterday", "Yesterday", DAY),
            item("stale", "Stale", 10 * DAY),
        ]
        .concat()),
    )
    .await;
    let h = harness(&server).await;

    let outcome = h.fetcher.fetch(h.source.id).await.unwrap();
    assert_eq!(outcome.inserted, 2);
    assert_eq!(outcome.skipped_old, 1);

    let items = h.db.list_items_for_source(h.source.id).await.unwrap();
    let mut titles: Vec<_> = items.iter().map(|i| i.title.as_str()).collect();
    titles.sort_unstable();
    assert_eq!(titles, vec!["Fresh", "Yesterday"]);
}

#[tokio::test]
async fn test_refetch_is_idempotent_and_first_write_wins() {
    let server = MockServer::start().await;
    serve(&server, rss(&[item("a", "Original", 60), item("b", "B", 120)].concat())).await;
    let h = harness(&server).await;

    assert_eq!(h.fetcher.fetch(h.source.id).await.unwrap().inserted, 2);

    // Same permalink, edited title
    serve(&server, rss(&[item("a", "Edited", 60), item("b", "B", 120)].concat())).await;
    let second = h.fetcher.fetch(h.source.id).await.unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.skipped_existing, 2);

    let items = h.db.list_items_for_source(h.source.id).await.unwrap();
    assert_eq!(items.len(), 2);
    let a = items
        .iter()
        .find(|i| i.permalink == "https://example.com/a")
        .unwrap();
    assert_eq!(a.title, "Original");
}

#[tokio::test]
async fn test_media_thumbnail_beats_inline_image() {
    let server = MockServer::start().await;
    let entry = format!(
        r#"<item>
      <title>With media</title>
      <link>https://example.com/media</link>
      <pubDate>{}</pubDate>
      <media:thumbnail url="https://cdn.example.com/thumb.jpg" width="120" height="80"/>
      <content:encoded><![CDATA[<p><img src="https://example.com/inline.jpg"> Body</p>]]></content:encoded>
    </item>
    <item>
      <title>Inline only</title>
      <link>https://example.com/inline</link>
      <pubDate>{}</pubDate>
      <content:encoded><![CDATA[<p><img src="/images/relative.png"> Body</p>]]></content:encoded>
    </item>"#,
        pub_date(60),
        pub_date(120)
    );
    serve(&server, rss(&entry)).await;
    let h = harness(&server).await;

    h.fetcher.fetch(h.source.id).await.unwrap();
    let items = h.db.list_items_for_source(h.source.id).await.unwrap();

    let with_media = items.iter().find(|i| i.title == "With media").unwrap();
    assert_eq!(
        with_media.thumbnail_url.as_deref(),
        Some("https://cdn.example.com/thumb.jpg")
    );

    let inline = items.iter().find(|i| i.title == "Inline only").unwrap();
    assert_eq!(
        inline.thumbnail_url.as_deref(),
        Some("https://example.com/images/relative.png")
    );
}

#[tokio::test]
async fn test_success_records_site_url_and_status() {
    let server = MockServer::start().await;
    serve(&server, rss(&item("a", "A", 60))).await;
    let h = harness(&server).await;

    h.fetcher.fetch(h.source.id).await.unwrap();

    let source = h.db.get_source(h.source.id).await.unwrap().unwrap();
    assert_eq!(source.fetch_status, FetchStatus::Ok);
    assert_eq!(source.last_error, "");
    assert!(source.last_fetched > 0);
    assert_eq!(source.site_url.as_deref(), Some("https://example.com/"));
}

#[tokio::test]
async fn test_failure_is_recorded_on_source() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let h = harness(&server).await;

    let err = h.fetcher.fetch(h.source.id).await.unwrap_err();
    assert!(matches!(err, FetchError::FetchFailed(_)));

    let source = h.db.get_source(h.source.id).await.unwrap().unwrap();
    assert_eq!(source.fetch_status, FetchStatus::Error);
    assert!(source.last_error.contains("503"), "got {:?}", source.last_error);
    assert!(source.last_fetched > 0);
    assert_eq!(h.db.count_items().await.unwrap(), 0);
}

#[tokio::test]
async fn test_malformed_feed_is_a_fetch_failure() {
    let server = MockServer::start().await;
    serve(&server, "<not valid xml".to_string()).await;
    let h = harness(&server).await;

    assert!(matches!(
        h.fetcher.fetch(h.source.id).await,
        Err(FetchError::FetchFailed(_))
    ));
}

#[tokio::test]
async fn test_source_without_url_only_records_error() {
    let server = MockServer::start().await;
    let h = harness(&server).await;
    let id = h
        .db
        .insert_source(&NewSource::new("", "No URL"))
        .await
        .unwrap();

    assert!(matches!(h.fetcher.fetch(id).await, Err(FetchError::NoUrl)));

    let source = h.db.get_source(id).await.unwrap().unwrap();
    assert!(!source.last_error.is_empty());
    assert_eq!(source.last_fetched, 0);
    assert_eq!(source.fetch_status, FetchStatus::Pending);
}

#[tokio::test]
async fn test_missing_source_is_not_found() {
    let server = MockServer::start().await;
    let h = harness(&server).await;

    assert!(matches!(
        h.fetcher.fetch(h.source.id + 100).await,
        Err(FetchError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_fetch_all_discards_individual_failures() {
    let server = MockServer::start().await;
    serve(&server, rss(&item("a", "A", 60))).await;
    let h = harness(&server).await;
    h.db.insert_source(&NewSource::new("", "No URL")).await.unwrap();
    h.db
        .insert_source(&NewSource::new(format!("{}/feed.xml?off", server.uri()), "Off").inactive())
        .await
        .unwrap();

    let outcomes = h.fetcher.fetch_all().await;

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].inserted, 1);
    assert_eq!(h.db.count_items().await.unwrap(), 1);
}
