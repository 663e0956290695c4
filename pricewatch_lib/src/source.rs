//! Fetch-and-extract job for one (product, source) pair.

use std::sync::Arc;

use pricewatch_http::template::{encode_query, fill_template};
use pricewatch_http::{Fetch, FetchRequest};

use crate::blocking::BlockingDetector;
use crate::catalog::{LookupConfig, SourceConfig};
use crate::extract::{Candidate, Extractor};
use crate::lookup_cache::LookupCache;
use crate::matcher::{normalize_name, MatchResolver};
use crate::model::{FetchResult, ProductHint, SourceId};
use crate::progress::ProgressSink;
use crate::rate::Pacer;
use crate::retry::{fetch_with_retry, AttemptOutcome, RetryContext};
use crate::scheduler::WorkItem;

/// Everything one source needs to turn a product into a [`FetchResult`].
///
/// Shared by all workers of the source's pool.
pub struct SourceRunner<F> {
    config: SourceConfig,
    fetcher: Arc<F>,
    extractor: Arc<dyn Extractor>,
    pacer: Pacer,
    detector: Arc<BlockingDetector>,
    lookup_cache: Option<LookupCache>,
    resolver: MatchResolver,
}

impl<F: Fetch> SourceRunner<F> {
    pub fn new(
        config: SourceConfig,
        fetcher: Arc<F>,
        extractor: Arc<dyn Extractor>,
        pacer: Pacer,
        detector: Arc<BlockingDetector>,
    ) -> Self {
        let lookup_cache = match &config.lookup {
            LookupConfig::Category { prefix_len, .. } => Some(LookupCache::new(*prefix_len)),
            _ => None,
        };
        Self {
            config,
            fetcher,
            extractor,
            pacer,
            detector,
            lookup_cache,
            resolver: MatchResolver,
        }
    }

    pub fn source(&self) -> &SourceId {
        &self.config.name
    }

    pub fn pacer(&self) -> &Pacer {
        &self.pacer
    }

    fn request(&self, url: String) -> FetchRequest {
        let request = FetchRequest::new(url).with_timeout(self.config.timeout());
        match &self.config.referer {
            Some(referer) => request.with_header("referer", referer.as_str()),
            None => request,
        }
    }

    async fn attempt(&self, url: String, progress: &dyn ProgressSink) -> AttemptOutcome {
        let ctx = RetryContext {
            source: &self.config.name,
            policy: &self.config.retry,
            pacer: &self.pacer,
            detector: &self.detector,
            progress,
        };
        fetch_with_retry(self.fetcher.as_ref(), self.request(url), &ctx).await
    }

    /// Looks one product up. Never fails: every outcome is a status.
    /// Blocking alerts raised along the way go to `progress`.
    pub async fn fetch_product(&self, item: &WorkItem, progress: &dyn ProgressSink) -> FetchResult {
        let result = match &self.config.lookup {
            LookupConfig::Id { urls } => self.by_id(item, urls, progress).await,
            LookupConfig::Category {
                url,
                categories,
                max_probes,
                ..
            } => self.by_category(item, url, categories, *max_probes, progress).await,
            LookupConfig::Name {
                url,
                search_each_hint,
                ..
            } => self.by_name(item, url, *search_each_hint, progress).await,
        };
        tracing::debug!(
            "{} [{}] {} {}",
            self.config.name,
            item.product.id,
            result.status,
            result
                .price
                .map(|p| format!("{:.2}", p))
                .unwrap_or_default()
        );
        result
    }

    fn first_priced(&self, body: &str, item: &WorkItem) -> Option<Candidate> {
        self.extractor
            .extract(body, &item.product.id)
            .into_iter()
            .find(|c| c.price.is_some())
    }

    async fn by_id(
        &self,
        item: &WorkItem,
        urls: &[String],
        progress: &dyn ProgressSink,
    ) -> FetchResult {
        let id = &item.product.id;
        let mut blocked = false;

        for template in urls {
            let encoded = encode_query(id.as_str());
            let url = fill_template(template, &[("id", encoded.as_str())]);
            match self.attempt(url, progress).await {
                AttemptOutcome::Success(response) => {
                    if let Some(Candidate {
                        name,
                        price: Some(price),
                    }) = self.first_priced(&response.body, item)
                    {
                        return FetchResult::found(id.clone(), self.config.name.clone(), price, name);
                    }
                }
                AttemptOutcome::Absent { .. } => {}
                AttemptOutcome::Blocked(_) => blocked = true,
            }
        }

        if blocked {
            FetchResult::blocked(id.clone(), self.config.name.clone())
        } else {
            FetchResult::not_found(id.clone(), self.config.name.clone())
        }
    }

    async fn by_category(
        &self,
        item: &WorkItem,
        template: &str,
        categories: &[String],
        max_probes: usize,
        progress: &dyn ProgressSink,
    ) -> FetchResult {
        let id = &item.product.id;
        let order = match &self.lookup_cache {
            Some(cache) => cache.search_order(item.index, id, categories),
            None => categories.to_vec(),
        };

        let encoded = encode_query(id.as_str());
        for category in order.iter().take(max_probes) {
            let url = fill_template(
                template,
                &[("category", category.as_str()), ("id", encoded.as_str())],
            );
            match self.attempt(url, progress).await {
                AttemptOutcome::Success(response) => {
                    if let Some(Candidate {
                        name,
                        price: Some(price),
                    }) = self.first_priced(&response.body, item)
                    {
                        if let Some(cache) = &self.lookup_cache {
                            cache.record_hit(item.index, id, category);
                        }
                        return FetchResult::found(id.clone(), self.config.name.clone(), price, name);
                    }
                }
                AttemptOutcome::Absent { .. } => {}
                AttemptOutcome::Blocked(_) => {
                    return FetchResult::blocked(id.clone(), self.config.name.clone());
                }
            }
        }
        FetchResult::not_found(id.clone(), self.config.name.clone())
    }

    async fn by_name(
        &self,
        item: &WorkItem,
        template: &str,
        search_each_hint: bool,
        progress: &dyn ProgressSink,
    ) -> FetchResult {
        let id = &item.product.id;
        let hints = distinct_hints(item.product.usable_hints());
        if hints.is_empty() {
            tracing::debug!("{} [{}] no usable name to search", self.config.name, id);
            return FetchResult::not_found(id.clone(), self.config.name.clone());
        }

        let queries = if search_each_hint { &hints[..] } else { &hints[..1] };
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut blocked = false;

        for hint in queries {
            let query = encode_query(&hint.name);
            let url = fill_template(template, &[("query", query.as_str())]);
            match self.attempt(url, progress).await {
                AttemptOutcome::Success(response) => {
                    candidates.extend(self.extractor.extract(&response.body, id));
                    if self.resolver.resolve(&hints, &candidates).is_near_perfect() {
                        break;
                    }
                }
                AttemptOutcome::Absent { .. } => {}
                AttemptOutcome::Blocked(_) => blocked = true,
            }
        }

        let outcome = self.resolver.resolve(&hints, &candidates);
        match outcome.best {
            Some(best) if best.score >= self.config.min_match_score => {
                FetchResult::found(id.clone(), self.config.name.clone(), best.price, Some(best.name))
                    .with_match(best.score, best.origin)
            }
            Some(best) => {
                tracing::debug!(
                    "{} [{}] best match {:?} scored {:.0}, below {:.0}",
                    self.config.name,
                    id,
                    best.name,
                    best.score,
                    self.config.min_match_score
                );
                if blocked {
                    FetchResult::blocked(id.clone(), self.config.name.clone())
                } else {
                    FetchResult::not_found(id.clone(), self.config.name.clone())
                }
            }
            None if blocked => FetchResult::blocked(id.clone(), self.config.name.clone()),
            None => FetchResult::not_found(id.clone(), self.config.name.clone()),
        }
    }
}

/// Usable hints with case- and spacing-insensitive duplicates removed,
/// keeping the first occurrence.
fn distinct_hints<'a>(hints: impl Iterator<Item = &'a ProductHint>) -> Vec<ProductHint> {
    let mut seen = std::collections::HashSet::new();
    hints
        .filter(|h| seen.insert(normalize_name(&h.name)))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use pricewatch_http::{Error, HttpResponse};

    use crate::extract::{ExtractorConfig, PatternConfig};
    use crate::model::{FetchStatus, HintOrigin, Product};
    use crate::progress::NoProgress;

    /// Serves fixed pages by URL; anything else is a 404.
    #[derive(Default)]
    struct MapFetcher {
        pages: HashMap<String, (u16, String)>,
        calls: Mutex<Vec<String>>,
    }

    impl MapFetcher {
        fn page(mut self, url: &str, status: u16, body: &str) -> Self {
            self.pages.insert(url.to_string(), (status, body.to_string()));
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Fetch for MapFetcher {
        async fn fetch(&self, request: FetchRequest) -> Result<HttpResponse, Error> {
            self.calls.lock().unwrap().push(request.url.clone());
            Ok(match self.pages.get(&request.url) {
                Some((status, body)) => HttpResponse::new(*status, body.clone()),
                None => HttpResponse::new(404, ""),
            })
        }
    }

    fn config(toml: &str) -> SourceConfig {
        let mut catalog = crate::Catalog::from_toml_str(toml).unwrap();
        catalog.sources.remove(0)
    }

    fn runner(cfg: SourceConfig, fetcher: MapFetcher) -> (SourceRunner<MapFetcher>, Arc<MapFetcher>) {
        let fetcher = Arc::new(fetcher);
        let extractor = cfg.extractor.build(cfg.name.as_str()).unwrap();
        let runner = SourceRunner::new(
            cfg,
            Arc::clone(&fetcher),
            extractor,
            Pacer::Off,
            Arc::new(BlockingDetector::default()),
        );
        (runner, fetcher)
    }

    fn item(index: usize, product: Product) -> WorkItem {
        WorkItem { index, product }
    }

    const ID_SOURCE: &str = r#"
        [[source]]
        name = "medi"
        [source.lookup]
        mode = "id"
        urls = ["https://a.test/{id}", "https://b.test/{id}"]
        [source.extractor]
        kind = "pattern"
        name = '<h2>(.*?)</h2>'
        price = '<i>(.*?)</i>'
    "#;

    #[tokio::test]
    async fn id_lookup_falls_back_to_second_url() {
        let fetcher = MapFetcher::default().page("https://b.test/42", 200, "<h2>Gel</h2><i>3,20 €</i>");
        let (runner, fetcher) = runner(config(ID_SOURCE), fetcher);
        let result = runner.fetch_product(&item(0, Product::new("42")), &NoProgress).await;

        assert_eq!(result.status, FetchStatus::Found);
        assert_eq!(result.price, Some(3.2));
        assert_eq!(result.matched_name.as_deref(), Some("Gel"));
        assert_eq!(result.match_score, None);
        assert_eq!(fetcher.calls(), vec!["https://a.test/42", "https://b.test/42"]);
    }

    #[tokio::test]
    async fn id_lookup_reports_blocking() {
        let fetcher = MapFetcher::default().page("https://a.test/42", 403, "");
        let (runner, _) = runner(config(ID_SOURCE), fetcher);
        let result = runner.fetch_product(&item(0, Product::new("42")), &NoProgress).await;
        assert_eq!(result.status, FetchStatus::Blocked);
    }

    #[tokio::test]
    async fn id_lookup_not_found() {
        let (runner, _) = runner(config(ID_SOURCE), MapFetcher::default());
        let result = runner.fetch_product(&item(0, Product::new("42")), &NoProgress).await;
        assert_eq!(result.status, FetchStatus::NotFound);
    }

    const CATEGORY_SOURCE: &str = r#"
        [[source]]
        name = "farma"
        [source.lookup]
        mode = "category"
        url = "https://c.test/{category}/BE0{id}/"
        categories = ["visage", "bebe", "sante"]
        max_probes = 2
        [source.extractor]
        kind = "pattern"
        require_id = "BE0{id}"
        price = '<i>(.*?)</i>'
    "#;

    #[tokio::test]
    async fn category_probing_uses_cache() {
        let fetcher = MapFetcher::default()
            .page("https://c.test/sante/BE0301/", 200, "BE0301 <i>5,00</i>")
            .page("https://c.test/visage/BE0302/", 200, "BE0302 <i>6,00</i>")
            .page("https://c.test/sante/BE0303/", 200, "BE0303 <i>7,00</i>");
        let (runner, fetcher) = runner(config(CATEGORY_SOURCE), fetcher);

        let first = runner.fetch_product(&item(0, Product::new("301")), &NoProgress).await;
        assert_eq!(first.price, Some(5.0));
        assert_eq!(
            fetcher.calls(),
            vec!["https://c.test/bebe/BE0301/", "https://c.test/sante/BE0301/"]
        );

        // Previous row matched "sante", so it is probed first.
        let third = runner.fetch_product(&item(1, Product::new("303")), &NoProgress).await;
        assert_eq!(third.price, Some(7.0));
        assert_eq!(fetcher.calls().len(), 3);

        // Probing is capped: "visage" comes third for this row and is never tried.
        let second = runner.fetch_product(&item(5, Product::new("302")), &NoProgress).await;
        assert_eq!(second.status, FetchStatus::NotFound);
        assert_eq!(fetcher.calls().len(), 5);
    }

    const NAME_SOURCE: &str = r#"
        [[source]]
        name = "multi"
        [source.lookup]
        mode = "name"
        url = "https://m.test/search?q={query}"
        search_each_hint = true
        [source.extractor]
        kind = "pattern"
        item = '(?s)<li>.*?</li>'
        name = '<a>(.*?)</a>'
        price = '<i>(.*?)</i>'
    "#;

    #[tokio::test]
    async fn name_lookup_without_hint_sends_nothing() {
        let (runner, fetcher) = runner(config(NAME_SOURCE), MapFetcher::default());
        let result = runner
            .fetch_product(&item(0, Product::new("1").with_name("NA")), &NoProgress)
            .await;
        assert_eq!(result.status, FetchStatus::NotFound);
        assert!(fetcher.calls().is_empty());
    }

    #[tokio::test]
    async fn name_lookup_searches_each_hint_and_keeps_provenance() {
        let medi = SourceId::new("medi");
        let fetcher = MapFetcher::default()
            .page(
                "https://m.test/search?q=creme+mains",
                200,
                "<li><a>Creme pieds</a><i>4,00</i></li>",
            )
            .page(
                "https://m.test/search?q=Neutrogena+Creme+Mains+50ml",
                200,
                "<li><a>Neutrogena Creme Mains 50 ml</a><i>6,20</i></li>",
            );
        let (runner, fetcher) = runner(config(NAME_SOURCE), fetcher);
        let product = Product::new("1")
            .with_name("creme mains")
            .with_hint(ProductHint::from_source("Neutrogena Creme Mains 50ml", &medi));
        let result = runner.fetch_product(&item(0, product), &NoProgress).await;

        assert_eq!(fetcher.calls().len(), 2);
        assert_eq!(result.status, FetchStatus::Found);
        assert_eq!(result.price, Some(6.2));
        assert_eq!(result.match_source, Some(HintOrigin::Source(medi)));
        assert!(result.match_score.unwrap() > 90.0);
    }

    #[tokio::test]
    async fn near_perfect_match_skips_remaining_searches() {
        let medi = SourceId::new("medi");
        let fetcher = MapFetcher::default().page(
            "https://m.test/search?q=Eau+Thermale",
            200,
            "<li><a>Eau Thermale</a><i>4,00</i></li>",
        );
        let (runner, fetcher) = runner(config(NAME_SOURCE), fetcher);
        let product = Product::new("1")
            .with_name("Eau Thermale")
            .with_hint(ProductHint::from_source("Avene Eau Thermale 300ml", &medi));
        let result = runner.fetch_product(&item(0, product), &NoProgress).await;

        assert_eq!(fetcher.calls().len(), 1);
        assert_eq!(result.match_score, Some(100.0));
        assert_eq!(result.match_source, Some(HintOrigin::Input));
    }

    #[tokio::test]
    async fn duplicate_hints_searched_once() {
        let medi = SourceId::new("medi");
        let (runner, fetcher) = runner(config(NAME_SOURCE), MapFetcher::default());
        let product = Product::new("1")
            .with_name("Eau Thermale")
            .with_hint(ProductHint::from_source("eau  thermale", &medi));
        runner.fetch_product(&item(0, product), &NoProgress).await;
        assert_eq!(fetcher.calls().len(), 1);
    }

    #[tokio::test]
    async fn weak_match_below_minimum_is_not_found() {
        let mut cfg = config(NAME_SOURCE);
        cfg.min_match_score = 80.0;
        let fetcher = MapFetcher::default().page(
            "https://m.test/search?q=Eau+Thermale",
            200,
            "<li><a>Shampooing doux</a><i>4,00</i></li>",
        );
        let (runner, _) = runner(cfg, fetcher);
        let result = runner
            .fetch_product(&item(0, Product::new("1").with_name("Eau Thermale")), &NoProgress)
            .await;
        assert_eq!(result.status, FetchStatus::NotFound);
        assert_eq!(result.price, None);
    }

    #[tokio::test]
    async fn blocked_search_outranks_weak_match() {
        let medi = SourceId::new("medi");
        let mut cfg = config(NAME_SOURCE);
        cfg.min_match_score = 80.0;
        let fetcher = MapFetcher::default()
            .page(
                "https://m.test/search?q=Eau+Thermale",
                200,
                "<li><a>Shampooing doux</a><i>4,00</i></li>",
            )
            .page("https://m.test/search?q=Avene+Eau+Thermale+300ml", 403, "");
        let (runner, fetcher) = runner(cfg, fetcher);
        let product = Product::new("1")
            .with_name("Eau Thermale")
            .with_hint(ProductHint::from_source("Avene Eau Thermale 300ml", &medi));
        let result = runner.fetch_product(&item(0, product), &NoProgress).await;

        assert_eq!(fetcher.calls().len(), 2);
        assert_eq!(result.status, FetchStatus::Blocked);
        assert_eq!(result.price, None);
    }

    #[tokio::test]
    async fn referer_and_timeout_are_applied() {
        let mut cfg = config(ID_SOURCE);
        cfg.referer = Some("https://a.test/".into());
        cfg.timeout_secs = 3.0;
        let (runner, _) = runner(cfg, MapFetcher::default());
        let request = runner.request("https://a.test/1".into());
        assert_eq!(
            request.headers,
            vec![("referer".to_string(), "https://a.test/".to_string())]
        );
        assert_eq!(request.timeout, std::time::Duration::from_secs(3));
    }

    #[test]
    fn extractor_config_shape() {
        let cfg = config(ID_SOURCE);
        assert!(matches!(
            cfg.extractor,
            ExtractorConfig::Pattern(PatternConfig { require_id: None, .. })
        ));
    }
}
