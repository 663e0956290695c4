use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pricewatch_lib::pricewatch_http::{Error, Fetch, FetchRequest, HttpResponse};
use pricewatch_lib::sink::{BackoffPolicy, CellValue};
use pricewatch_lib::{
    BlockCode, Catalog, Engine, FetchStatus, HintOrigin, PipelineError, Product, ProductId,
    RecordBatch, Sink, SinkError, SinkWriter, SourceId,
};
use tokio_util::sync::CancellationToken;

/// Routes by URL substring; the first matching route wins, anything else
/// is a 404.
#[derive(Default)]
struct RouteFetcher {
    routes: Vec<(String, u16, String)>,
    calls: Mutex<Vec<String>>,
    cancel_on_fetch: Option<CancellationToken>,
}

impl RouteFetcher {
    fn route(mut self, needle: &str, status: u16, body: &str) -> Self {
        self.routes
            .push((needle.to_string(), status, body.to_string()));
        self
    }

    fn calls_matching(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|url| url.contains(needle))
            .count()
    }
}

impl Fetch for RouteFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<HttpResponse, Error> {
        self.calls.lock().unwrap().push(request.url.clone());
        if let Some(token) = &self.cancel_on_fetch {
            token.cancel();
        }
        let hit = self
            .routes
            .iter()
            .find(|(needle, _, _)| request.url.contains(needle.as_str()));
        Ok(match hit {
            Some((_, status, body)) => HttpResponse::new(*status, body.clone()),
            None => HttpResponse::new(404, ""),
        })
    }
}

/// Keyed table; `fail_first` transient failures before accepting writes.
#[derive(Default)]
struct MemorySink {
    fail_first: Mutex<u32>,
    writes: Mutex<u32>,
    table: Mutex<BTreeMap<ProductId, Vec<CellValue>>>,
}

impl Sink for MemorySink {
    async fn write_batch(&self, batch: &RecordBatch) -> Result<(), SinkError> {
        {
            let mut fail = self.fail_first.lock().unwrap();
            if *fail > 0 {
                *fail -= 1;
                return Err(SinkError::Retryable("backend busy".into()));
            }
        }
        *self.writes.lock().unwrap() += 1;
        let mut table = self.table.lock().unwrap();
        for row in &batch.rows {
            table.insert(row.key.clone(), row.cells.clone());
        }
        Ok(())
    }
}

const TWO_SHOPS: &str = r#"
    [[source]]
    name = "s1"
    pacing = "none"
    [source.lookup]
    mode = "id"
    urls = ["https://s1.test/p/{id}"]
    [source.extractor]
    kind = "pattern"
    name = '<h2>(.*?)</h2>'
    price = '<i>(.*?)</i>'

    [[source]]
    name = "s2"
    pacing = "none"
    [source.lookup]
    mode = "id"
    urls = ["https://s2.test/p/{id}"]
    [source.extractor]
    kind = "pattern"
    name = '<h2>(.*?)</h2>'
    price = '<i>(.*?)</i>'
"#;

fn two_shops() -> RouteFetcher {
    RouteFetcher::default()
        .route("s1.test/p/A", 200, "<h2>Alpha</h2><i>10,00 €</i>")
        .route("s2.test/p/A", 200, "<h2>Alpha</h2><i>20,00 €</i>")
        .route("s2.test/p/B", 200, "<h2>Beta</h2><i>30,00 €</i>")
}

fn engine(toml: &str, fetcher: RouteFetcher) -> (Engine<RouteFetcher>, Arc<RouteFetcher>) {
    let fetcher = Arc::new(fetcher);
    let catalog = Catalog::from_toml_str(toml).unwrap();
    (Engine::new(catalog, Arc::clone(&fetcher)).unwrap(), fetcher)
}

fn products(ids: &[&str]) -> Vec<Product> {
    ids.iter().map(|id| Product::new(*id)).collect()
}

#[tokio::test]
async fn two_sources_merge_into_one_record_per_product() {
    let (engine, _) = engine(TWO_SHOPS, two_shops());
    let writer = SinkWriter::new(MemorySink::default());

    let input = vec![
        Product::new("A").with_name("Alpha gel").with_base_price(12.0),
        Product::new("B"),
    ];
    let report = engine.run(input, &writer).await.unwrap();

    assert_eq!(report.records.len(), 2);
    let a = &report.records[0];
    assert_eq!(a.product_id.as_str(), "A");
    assert_eq!(a.name.as_deref(), Some("Alpha gel"));
    assert_eq!(a.base_price, Some(12.0));
    assert_eq!(a.prices[&SourceId::new("s1")], 10.0);
    assert_eq!(a.prices[&SourceId::new("s2")], 20.0);
    assert_eq!(a.mean, Some(15.0));
    assert_eq!(a.min, Some(10.0));

    let b = &report.records[1];
    assert!(!b.prices.contains_key(&SourceId::new("s1")));
    assert_eq!(b.mean, Some(30.0));
    assert_eq!(b.min, Some(30.0));

    let s1 = &report.summaries[0];
    assert_eq!((s1.found, s1.not_found, s1.blocked), (1, 1, 0));

    assert_eq!(report.write.rows, 2);
    assert_eq!(*writer.sink().writes.lock().unwrap(), 1);
    let table = writer.sink().table.lock().unwrap();
    assert_eq!(table.len(), 2);
    let row_a = &table[&ProductId::new("A")];
    assert_eq!(row_a[0], CellValue::Text("Alpha gel".into()));
    assert_eq!(row_a[1], CellValue::Number(12.0));
    let row_b = &table[&ProductId::new("B")];
    assert_eq!(row_b[..3], [CellValue::Empty, CellValue::Empty, CellValue::Empty]);
    assert_eq!(row_b[3], CellValue::Number(30.0));
}

#[tokio::test]
async fn duplicate_ids_are_fetched_once_per_source() {
    let (engine, fetcher) = engine(TWO_SHOPS, two_shops());

    let collection = engine.collect(products(&["A", "A", "B"])).await.unwrap();

    assert_eq!(collection.duplicates, 1);
    assert_eq!(collection.products.len(), 2);
    assert_eq!(fetcher.calls_matching("s1.test/p/A"), 1);
    assert_eq!(fetcher.calls_matching("s2.test/p/A"), 1);
    assert_eq!(collection.results.len(), 4);
}

#[tokio::test]
async fn empty_input_is_rejected() {
    let (engine, _) = engine(TWO_SHOPS, two_shops());
    let err = engine.collect(Vec::new()).await.unwrap_err();
    assert!(matches!(err, PipelineError::NoProducts));
}

const ALWAYS_LIMITED: &str = r#"
    blocking_threshold = 3

    [[source]]
    name = "busy"
    pacing = "none"
    [source.lookup]
    mode = "id"
    urls = ["https://busy.test/p/{id}"]
    [source.extractor]
    kind = "pattern"
    price = '<i>(.*?)</i>'
    [source.retry]
    max_retries_429 = 3
    cooldown_429 = { min = 0.0, max = 0.0 }
"#;

#[tokio::test]
async fn persistent_rate_limiting_ends_blocked() {
    let fetcher = RouteFetcher::default().route("busy.test", 429, "");
    let (engine, fetcher) = engine(ALWAYS_LIMITED, fetcher);

    let collection = engine.collect(products(&["X"])).await.unwrap();

    assert_eq!(fetcher.calls_matching("busy.test/p/X"), 4);
    assert_eq!(collection.results.len(), 1);
    assert_eq!(collection.results[0].status, FetchStatus::Blocked);

    let busy = &collection.blocking[0];
    assert_eq!(busy.source, SourceId::new("busy"));
    assert_eq!(busy.code, BlockCode::RateLimited);
    assert_eq!(busy.count, 4);
    assert_eq!(collection.summaries[0].rate_limited_count, 4);
}

#[tokio::test(start_paused = true)]
async fn transient_sink_failure_still_writes_once() {
    let (engine, _) = engine(TWO_SHOPS, two_shops());
    let sink = MemorySink {
        fail_first: Mutex::new(1),
        ..MemorySink::default()
    };
    let writer = SinkWriter::new(sink).with_backoff(BackoffPolicy {
        initial: Duration::from_secs(2),
        multiplier: 2,
        max_retries: 2,
    });

    let report = engine.run(products(&["A", "B"]), &writer).await.unwrap();

    assert_eq!(report.write.attempts, 2);
    assert_eq!(*writer.sink().writes.lock().unwrap(), 1);
    assert_eq!(writer.sink().table.lock().unwrap().len(), 2);
}

const PROVIDER_AND_SEARCH: &str = r#"
    [[source]]
    name = "catalog-shop"
    pacing = "none"
    [source.lookup]
    mode = "id"
    urls = ["https://cat.test/p/{id}"]
    [source.extractor]
    kind = "pattern"
    name = '<h2>(.*?)</h2>'
    price = '<i>(.*?)</i>'

    [[source]]
    name = "search-shop"
    pacing = "none"
    min_match_score = 60.0
    [source.lookup]
    mode = "name"
    url = "https://search.test/q?text={query}"
    hints_from = "catalog-shop"
    [source.extractor]
    kind = "pattern"
    item = '(?s)<li>.*?</li>'
    name = '<b>(.*?)</b>'
    price = '<i>(.*?)</i>'
"#;

#[tokio::test]
async fn provider_names_feed_name_search() {
    let fetcher = RouteFetcher::default()
        .route("cat.test/p/42", 200, "<h2>Arnica Gel 100ml</h2><i>8,50</i>")
        .route(
            "search.test/q?text=Arnica+Gel+100ml",
            200,
            "<ul><li><b>Arnica Gel 100ml</b><i>7,90</i></li><li><b>Arnica Tabs</b><i>5,00</i></li></ul>",
        );
    let (engine, fetcher) = engine(PROVIDER_AND_SEARCH, fetcher);
    assert_eq!(engine.stages().len(), 2);

    let collection = engine.collect(products(&["42"])).await.unwrap();

    let search = collection
        .results
        .iter()
        .find(|r| r.source.as_str() == "search-shop")
        .unwrap();
    assert_eq!(search.status, FetchStatus::Found);
    assert_eq!(search.price, Some(7.9));
    assert_eq!(search.match_score, Some(100.0));
    assert_eq!(
        search.match_source,
        Some(HintOrigin::Source(SourceId::new("catalog-shop")))
    );
    assert_eq!(fetcher.calls_matching("search.test"), 1);
}

#[tokio::test]
async fn name_search_without_names_makes_no_request() {
    let (engine, fetcher) = engine(PROVIDER_AND_SEARCH, RouteFetcher::default());

    let collection = engine.collect(products(&["42"])).await.unwrap();

    assert!(collection
        .results
        .iter()
        .all(|r| r.status == FetchStatus::NotFound));
    assert_eq!(fetcher.calls_matching("search.test"), 0);
}

const SINGLE_WORKER: &str = r#"
    [[source]]
    name = "slow"
    pacing = "none"
    [source.lookup]
    mode = "id"
    urls = ["https://slow.test/p/{id}"]
    [source.extractor]
    kind = "pattern"
    price = '<i>(.*?)</i>'
    [source.pool]
    kind = "fixed"
    workers = 1
"#;

#[tokio::test]
async fn cancellation_stops_the_run_without_writing() {
    let cancel = CancellationToken::new();
    let fetcher = RouteFetcher {
        cancel_on_fetch: Some(cancel.clone()),
        ..RouteFetcher::default()
    }
    .route("slow.test", 200, "<i>1,00</i>");
    let (engine, fetcher) = engine(SINGLE_WORKER, fetcher);
    let engine = engine.with_cancel(cancel);
    let writer = SinkWriter::new(MemorySink::default());

    let err = engine
        .run(products(&["A", "B", "C", "D"]), &writer)
        .await
        .unwrap_err();

    match err {
        PipelineError::Cancelled { completed } => assert_eq!(completed, 1),
        other => panic!("expected cancellation, got {}", other),
    }
    assert_eq!(fetcher.calls_matching("slow.test"), 1);
    assert_eq!(*writer.sink().writes.lock().unwrap(), 0);
}

#[test]
fn hint_cycles_are_rejected_up_front() {
    let toml = PROVIDER_AND_SEARCH.replace(
        "mode = \"id\"\n    urls = [\"https://cat.test/p/{id}\"]",
        "mode = \"name\"\n    url = \"https://cat.test/q?{query}\"\n    hints_from = \"search-shop\"",
    );
    let catalog = Catalog::from_toml_str(&toml).unwrap();
    let err = Engine::new(catalog, Arc::new(RouteFetcher::default()))
        .err()
        .unwrap();
    assert!(matches!(
        err,
        PipelineError::Catalog(pricewatch_lib::CatalogError::HintCycle(_))
    ));
}
