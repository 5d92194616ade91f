//! Attribute filtering through the product attributes lookup table
//!
//! Compiles chosen attribute filters ("Color = Red AND Size = Large") into
//! a restriction for the main product listing query, and computes the
//! per-term product counts shown by layered navigation.
//!
//! Semantics per taxonomy:
//! - `or`: the product has any of the terms.
//! - `and`: the product has all of the terms as direct attributes, OR any
//!   one of its variations has any of the terms. The second half means
//!   separate variations can satisfy separate terms.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::cache::TransientCache;
use crate::config::FilterSettings;
use crate::lookup::{PRODUCTS_TABLE, TERMS_TABLE, TERM_RELATIONSHIPS_TABLE};
use crate::sql::SqlFragment;

pub type TermId = i64;

/// term id → product count. Terms without products are absent.
pub type TermCounts = BTreeMap<TermId, u64>;

/// Value of a per-taxonomy counts transient: query hash → counts
pub type CountsByQuery = HashMap<String, TermCounts>;

pub const COUNTS_TRANSIENT_PREFIX: &str = "wc_layered_nav_counts_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    And,
    Or,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("query type must be \"and\" or \"or\", got '{0}'")]
pub struct InvalidQueryType(pub String);

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::And => "and",
            Self::Or => "or",
        }
    }
}

impl FromStr for QueryType {
    type Err = InvalidQueryType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "and" => Ok(Self::And),
            "or" => Ok(Self::Or),
            other => Err(InvalidQueryType(other.to_string())),
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeFilter {
    /// Term slugs
    pub terms: Vec<String>,
    pub query_type: QueryType,
}

/// Chosen attribute filters keyed by taxonomy. Sorted, so the SQL built
/// from it (and therefore the count cache key) is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeFilterRequest {
    filters: BTreeMap<String, AttributeFilter>,
}

impl AttributeFilterRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, taxonomy: &str, terms: &[&str], query_type: QueryType) -> Self {
        self.insert(taxonomy, terms.iter().map(|t| t.to_string()).collect(), query_type);
        self
    }

    pub fn insert(&mut self, taxonomy: &str, terms: Vec<String>, query_type: QueryType) {
        self.filters
            .insert(taxonomy.to_string(), AttributeFilter { terms, query_type });
    }

    pub fn get(&self, taxonomy: &str) -> Option<&AttributeFilter> {
        self.filters.get(taxonomy)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttributeFilter)> {
        self.filters.iter()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// The same request minus one taxonomy
    pub fn without(&self, taxonomy: &str) -> Self {
        let mut filters = self.filters.clone();
        filters.remove(taxonomy);
        Self { filters }
    }

    /// Build from storefront query arguments: `filter_<name>=a,b` chooses
    /// terms of `pa_<name>`, and `query_type_<name>=or` switches that
    /// attribute to OR (anything else means AND).
    pub fn from_query_args<'a>(args: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let args: Vec<(&str, &str)> = args.into_iter().collect();
        let mut request = Self::new();

        for (key, value) in &args {
            let Some(name) = key.strip_prefix("filter_") else {
                continue;
            };
            let name = sanitize_title(name);
            if name.is_empty() {
                continue;
            }
            let terms: Vec<String> = value
                .split(',')
                .map(|t| sanitize_title(t.trim()))
                .filter(|t| !t.is_empty())
                .collect();
            if terms.is_empty() {
                continue;
            }

            let type_key = format!("query_type_{}", name);
            let query_type = args
                .iter()
                .find(|(k, _)| *k == type_key)
                .and_then(|(_, v)| v.parse().ok())
                .unwrap_or(QueryType::And);

            request.insert(&format!("pa_{}", name), terms, query_type);
        }
        request
    }

    /// `filter_color=red,blue&query_type_color=or`
    pub fn from_query_string(query: &str) -> Self {
        Self::from_query_args(
            query
                .trim_start_matches('?')
                .split('&')
                .filter_map(|pair| pair.split_once('=')),
        )
    }
}

/// Lowercase, spaces to dashes, drop anything outside `[a-z0-9_-]`
pub fn sanitize_title(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.trim().chars() {
        match ch {
            'a'..='z' | '0'..='9' | '_' | '-' => out.push(ch),
            'A'..='Z' => out.push(ch.to_ascii_lowercase()),
            ' ' | '\t' => out.push('-'),
            _ => {}
        }
    }
    out
}

/// Transient holding cached counts for one taxonomy
pub fn counts_transient_name(taxonomy: &str) -> String {
    format!("{}{}", COUNTS_TRANSIENT_PREFIX, sanitize_title(taxonomy))
}

/// md5 hex of the rendered count query, the key inside a counts transient
fn hash_query(sql: &str) -> String {
    format!("{:x}", md5::compute(sql.as_bytes()))
}

/// Clause set of a product listing query. `where_clause` holds zero or
/// more ` AND ...` conditions appended after the base conditions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClauseSet {
    pub join: SqlFragment,
    pub where_clause: SqlFragment,
    pub orderby: String,
}

/// The query being restricted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryContext {
    /// Only the primary product listing query is filtered
    pub is_main_query: bool,
}

impl QueryContext {
    pub fn main() -> Self {
        Self { is_main_query: true }
    }

    pub fn secondary() -> Self {
        Self { is_main_query: false }
    }
}

/// State of the main listing query that counts are scoped to
#[derive(Debug, Clone, Default)]
pub struct MainQuery {
    pub chosen_attributes: AttributeFilterRequest,
    /// Free-text search on product titles
    pub search: Option<String>,
}

pub trait TermResolver {
    /// Ids of the terms in `taxonomy` whose slug is in `slugs`. Unknown
    /// slugs are left out.
    fn term_ids_for_slugs(&self, taxonomy: &str, slugs: &[String]) -> Result<Vec<TermId>>;
}

pub trait QueryExecutor {
    /// Run a count query yielding `term_count_id` and `term_count` columns.
    fn term_counts(&self, query: &SqlFragment) -> Result<Vec<(TermId, i64)>>;
}

pub struct Filterer<'a> {
    settings: FilterSettings,
    terms: &'a dyn TermResolver,
    executor: &'a dyn QueryExecutor,
    cache: &'a dyn TransientCache<CountsByQuery>,
}

impl<'a> Filterer<'a> {
    pub fn new(
        settings: FilterSettings,
        terms: &'a dyn TermResolver,
        executor: &'a dyn QueryExecutor,
        cache: &'a dyn TransientCache<CountsByQuery>,
    ) -> Self {
        Self {
            settings,
            terms,
            executor,
            cache,
        }
    }

    pub fn settings(&self) -> &FilterSettings {
        &self.settings
    }

    pub fn filtering_via_lookup_table_is_active(&self) -> bool {
        self.settings.use_lookup_table
    }

    /// Restrict the main product query to products matching `attributes`.
    ///
    /// Returns `clauses` untouched for any other query or when lookup
    /// table filtering is off. A filter that resolves to no terms makes
    /// the query match nothing.
    pub fn filter_by_attribute_post_clauses(
        &self,
        clauses: ClauseSet,
        query: &QueryContext,
        attributes: &AttributeFilterRequest,
    ) -> ClauseSet {
        if !query.is_main_query || !self.filtering_via_lookup_table_is_active() {
            return clauses;
        }

        let column = format!("{}.id", PRODUCTS_TABLE);
        let Some(restriction) = self.restriction(attributes, |ids, query_type| {
            self.lookup_table_restriction(&column, ids, query_type)
        }) else {
            return clauses;
        };

        let mut clauses = clauses;
        clauses
            .where_clause
            .push_sql(" AND (")
            .append(restriction)
            .push_sql(")");
        clauses
    }

    /// Product counts per term of `taxonomy` within the current main query.
    ///
    /// With `query_type == Or` the filter on `taxonomy` itself is ignored,
    /// so each count tells how many products adding that term would show.
    pub fn get_filtered_term_product_counts(
        &self,
        main_query: &MainQuery,
        term_ids: &[TermId],
        taxonomy: &str,
        query_type: QueryType,
    ) -> TermCounts {
        if term_ids.is_empty() {
            return TermCounts::new();
        }

        let other_filters = match query_type {
            QueryType::Or => main_query.chosen_attributes.without(taxonomy),
            QueryType::And => main_query.chosen_attributes.clone(),
        };

        let query = if self.filtering_via_lookup_table_is_active() {
            self.counts_query_using_lookup_table(&other_filters, main_query, taxonomy, term_ids)
        } else {
            self.counts_query_using_term_relationships(&other_filters, main_query, taxonomy, term_ids)
        };

        let query_hash = hash_query(&query.render());
        let transient = counts_transient_name(taxonomy);
        let mut cached = if self.settings.cache_counts {
            self.cache.get(&transient).unwrap_or_default()
        } else {
            CountsByQuery::new()
        };

        if let Some(counts) = cached.get(&query_hash) {
            tracing::debug!("Layered nav counts for {} served from {}", taxonomy, transient);
            return counts.clone();
        }

        let rows = match self.executor.term_counts(&query) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!("Term count query for {} failed: {:#}", taxonomy, e);
                return TermCounts::new();
            }
        };

        let counts: TermCounts = rows
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .map(|(term_id, count)| (term_id, count as u64))
            .collect();

        if self.settings.cache_counts {
            cached.insert(query_hash, counts.clone());
            self.cache
                .set(&transient, cached, self.settings.count_cache_ttl());
        }
        counts
    }

    /// Drop every cached count for `taxonomy`.
    pub fn clear_cached_counts(&self, taxonomy: &str) {
        self.cache.delete(&counts_transient_name(taxonomy));
    }

    fn resolve_term_ids(&self, taxonomy: &str, slugs: &[String]) -> Vec<TermId> {
        let mut ids = match self.terms.term_ids_for_slugs(taxonomy, slugs) {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!("Failed to resolve terms of {}: {:#}", taxonomy, e);
                Vec::new()
            }
        };
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// AND of one condition per filtered taxonomy. Taxonomies whose slugs
    /// resolve to no terms add no condition; if none is left the result is
    /// `1=0`. `None` for an empty request.
    fn restriction(
        &self,
        attributes: &AttributeFilterRequest,
        build: impl Fn(&[TermId], QueryType) -> SqlFragment,
    ) -> Option<SqlFragment> {
        if attributes.is_empty() {
            return None;
        }

        let mut conditions = Vec::with_capacity(attributes.len());
        for (taxonomy, filter) in attributes.iter() {
            let ids = self.resolve_term_ids(taxonomy, &filter.terms);
            if ids.is_empty() {
                tracing::debug!("No terms of {} match {:?}, skipped", taxonomy, filter.terms);
                continue;
            }
            conditions.push(build(&ids, filter.query_type));
        }

        if conditions.is_empty() {
            tracing::debug!("No filter resolved to any term, query matches nothing");
            return Some(SqlFragment::new("1=0"));
        }
        Some(SqlFragment::join(conditions, " AND "))
    }

    fn in_stock_clause(&self, column: &str) -> String {
        if self.settings.hide_out_of_stock {
            format!(" AND {} = 1", column)
        } else {
            String::new()
        }
    }

    /// `<column> IN (...)` over the lookup table for one taxonomy.
    /// The derived table keeps the UNION evaluated once.
    fn lookup_table_restriction(&self, column: &str, ids: &[TermId], query_type: QueryType) -> SqlFragment {
        let table = &self.settings.lookup_table;
        let in_stock = self.in_stock_clause("lt.in_stock");

        let mut q = SqlFragment::new(format!(
            "{} IN (SELECT product_or_parent_id FROM (",
            column
        ));
        match query_type {
            QueryType::And => {
                q.push_sql(&format!(
                    "SELECT product_or_parent_id FROM {} lt WHERE is_variation_attribute = 0{} AND term_id IN ",
                    table, in_stock
                ))
                .push_id_list(ids)
                .push_sql(" GROUP BY product_id HAVING COUNT(DISTINCT term_id) = ")
                .push_param(ids.len())
                .push_sql(&format!(
                    " UNION SELECT product_or_parent_id FROM {} lt WHERE is_variation_attribute = 1{} AND term_id IN ",
                    table, in_stock
                ))
                .push_id_list(ids);
            }
            QueryType::Or => {
                q.push_sql(&format!(
                    "SELECT product_or_parent_id FROM {} lt WHERE term_id IN ",
                    table
                ))
                .push_id_list(ids)
                .push_sql(&in_stock);
            }
        }
        q.push_sql(") temp)");
        q
    }

    fn relationships_restriction(&self, ids: &[TermId], query_type: QueryType) -> SqlFragment {
        let mut q = SqlFragment::new(format!(
            "{}.id IN (SELECT object_id FROM {} WHERE term_id IN ",
            PRODUCTS_TABLE, TERM_RELATIONSHIPS_TABLE
        ));
        q.push_id_list(ids);
        if query_type == QueryType::And {
            q.push_sql(" GROUP BY object_id HAVING COUNT(DISTINCT term_id) = ")
                .push_param(ids.len());
        }
        q.push_sql(")");
        q
    }

    fn search_clause(&self, search: Option<&str>) -> SqlFragment {
        let mut q = SqlFragment::default();
        let words = search.map(str::split_whitespace).into_iter().flatten();
        for word in words {
            let escaped = word
                .replace('\\', "\\\\")
                .replace('%', "\\%")
                .replace('_', "\\_");
            q.push_sql(&format!(" AND {}.title LIKE ", PRODUCTS_TABLE))
                .push_param(format!("%{}%", escaped))
                .push_sql(" ESCAPE '\\'");
        }
        q
    }

    fn counts_query_using_lookup_table(
        &self,
        other_filters: &AttributeFilterRequest,
        main_query: &MainQuery,
        taxonomy: &str,
        term_ids: &[TermId],
    ) -> SqlFragment {
        let t = &self.settings.lookup_table;
        let p = PRODUCTS_TABLE;

        let mut q = SqlFragment::new(format!(
            "SELECT COUNT(DISTINCT {t}.product_or_parent_id) AS term_count, {t}.term_id AS term_count_id \
             FROM {t} INNER JOIN {p} ON {p}.id = {t}.product_or_parent_id \
             WHERE {p}.product_type <> 'variation' AND {p}.status = 'publish' AND {t}.taxonomy = ",
        ));
        q.push_param(taxonomy)
            .push_sql(&format!(" AND {}.term_id IN ", t))
            .push_id_list(term_ids)
            .push_sql(&self.in_stock_clause(&format!("{}.in_stock", t)));

        let column = format!("{}.product_or_parent_id", t);
        if let Some(restriction) = self.restriction(other_filters, |ids, query_type| {
            self.lookup_table_restriction(&column, ids, query_type)
        }) {
            q.push_sql(" AND ").append(restriction);
        }

        q.append(self.search_clause(main_query.search.as_deref()));
        q.push_sql(&format!(" GROUP BY {}.term_id", t));
        q
    }

    fn counts_query_using_term_relationships(
        &self,
        other_filters: &AttributeFilterRequest,
        main_query: &MainQuery,
        taxonomy: &str,
        term_ids: &[TermId],
    ) -> SqlFragment {
        let p = PRODUCTS_TABLE;

        let mut q = SqlFragment::new(format!(
            "SELECT COUNT(DISTINCT {p}.id) AS term_count, tr.term_id AS term_count_id \
             FROM {p} INNER JOIN {rel} AS tr ON {p}.id = tr.object_id \
             INNER JOIN {terms} AS terms ON terms.term_id = tr.term_id \
             WHERE {p}.product_type <> 'variation' AND {p}.status = 'publish' AND terms.taxonomy = ",
            rel = TERM_RELATIONSHIPS_TABLE,
            terms = TERMS_TABLE,
        ));
        q.push_param(taxonomy)
            .push_sql(" AND tr.term_id IN ")
            .push_id_list(term_ids)
            .push_sql(&self.in_stock_clause(&format!("{}.in_stock", p)));

        if let Some(restriction) = self.restriction(other_filters, |ids, query_type| {
            self.relationships_restriction(ids, query_type)
        }) {
            q.push_sql(" AND ").append(restriction);
        }

        q.append(self.search_clause(main_query.search.as_deref()));
        q.push_sql(" GROUP BY tr.term_id");
        q
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::lookup::{LookupStore, ProductAttribute, ProductRecord, VariationRecord};
    use crate::sql::SqlValue;
    use std::cell::Cell;

    const TABLE: &str = "wc_product_attributes_lookup";

    fn attr(taxonomy: &str, terms: &[&str], used_for_variations: bool) -> ProductAttribute {
        ProductAttribute {
            taxonomy: taxonomy.to_string(),
            terms: terms.iter().map(|s| s.to_string()).collect(),
            used_for_variations,
        }
    }

    fn simple(id: i64, title: &str, in_stock: bool, attributes: Vec<ProductAttribute>) -> ProductRecord {
        ProductRecord {
            id,
            title: title.to_string(),
            status: "publish".to_string(),
            in_stock,
            attributes,
            variations: vec![],
        }
    }

    fn variation(id: i64, color: &str) -> VariationRecord {
        VariationRecord {
            id,
            in_stock: true,
            attributes: BTreeMap::from([("pa_color".to_string(), Some(color.to_string()))]),
        }
    }

    /// 1: red+large, 2: red, 3: red+blue, 4: variations red / blue,
    /// 5: red+large out of stock, 6: green, 7: single red variation,
    /// 8: red+blue draft
    fn fixture() -> LookupStore {
        let mut store = LookupStore::open_in_memory(TABLE).unwrap();
        for slug in ["red", "blue", "green"] {
            store.insert_term("pa_color", slug, None).unwrap();
        }
        for slug in ["small", "large"] {
            store.insert_term("pa_size", slug, None).unwrap();
        }

        let products = vec![
            simple(1, "Red large tee", true, vec![attr("pa_color", &["red"], false), attr("pa_size", &["large"], false)]),
            simple(2, "Red mug", true, vec![attr("pa_color", &["red"], false)]),
            simple(3, "Striped scarf", true, vec![attr("pa_color", &["red", "blue"], false)]),
            ProductRecord {
                id: 4,
                title: "Hoodie".to_string(),
                status: "publish".to_string(),
                in_stock: true,
                attributes: vec![attr("pa_color", &["red", "blue"], true)],
                variations: vec![variation(41, "red"), variation(42, "blue")],
            },
            simple(5, "Red large sweater", false, vec![attr("pa_color", &["red"], false), attr("pa_size", &["large"], false)]),
            simple(6, "Green cap", true, vec![attr("pa_color", &["green"], false)]),
            ProductRecord {
                id: 7,
                title: "Beanie".to_string(),
                status: "publish".to_string(),
                in_stock: true,
                attributes: vec![attr("pa_color", &["red"], true)],
                variations: vec![variation(71, "red")],
            },
            ProductRecord {
                status: "draft".to_string(),
                ..simple(8, "Draft scarf", true, vec![attr("pa_color", &["red", "blue"], false)])
            },
        ];
        for product in &products {
            store.save_product(product).unwrap();
        }
        store
    }

    fn term(store: &LookupStore, taxonomy: &str, slug: &str) -> TermId {
        store.term_id(taxonomy, slug).unwrap().unwrap()
    }

    fn settings(hide_out_of_stock: bool) -> FilterSettings {
        FilterSettings {
            hide_out_of_stock,
            ..FilterSettings::default()
        }
    }

    fn filtered(store: &LookupStore, settings: FilterSettings, request: &AttributeFilterRequest) -> Vec<i64> {
        let cache: MemoryCache<CountsByQuery> = MemoryCache::new();
        let filterer = Filterer::new(settings, store, store, &cache);
        let clauses = filterer.filter_by_attribute_post_clauses(ClauseSet::default(), &QueryContext::main(), request);
        store.matching_products(&clauses).unwrap()
    }

    struct CountingExecutor<'a> {
        inner: &'a LookupStore,
        calls: Cell<usize>,
    }

    impl QueryExecutor for CountingExecutor<'_> {
        fn term_counts(&self, query: &SqlFragment) -> Result<Vec<(TermId, i64)>> {
            self.calls.set(self.calls.get() + 1);
            self.inner.term_counts(query)
        }
    }

    struct FailingExecutor;

    impl QueryExecutor for FailingExecutor {
        fn term_counts(&self, _query: &SqlFragment) -> Result<Vec<(TermId, i64)>> {
            anyhow::bail!("database is locked")
        }
    }

    #[test]
    fn test_and_across_taxonomies() {
        let store = fixture();
        let request = AttributeFilterRequest::new()
            .with("pa_color", &["red"], QueryType::And)
            .with("pa_size", &["large"], QueryType::And);
        assert_eq!(filtered(&store, settings(false), &request), vec![1, 5]);

        let request = AttributeFilterRequest::new()
            .with("pa_color", &["red"], QueryType::And)
            .with("pa_size", &["small"], QueryType::And);
        assert!(filtered(&store, settings(false), &request).is_empty());

        // A term that does not exist in the second taxonomy drops that
        // taxonomy; the color filter still applies
        let request = AttributeFilterRequest::new()
            .with("pa_color", &["red"], QueryType::And)
            .with("pa_size", &["blue"], QueryType::And);
        assert_eq!(filtered(&store, settings(false), &request), vec![1, 2, 3, 4, 5, 7]);

        // Nothing resolves at all
        let request = AttributeFilterRequest::new()
            .with("pa_color", &["purple"], QueryType::And)
            .with("pa_size", &["blue"], QueryType::And);
        assert!(filtered(&store, settings(false), &request).is_empty());
    }

    #[test]
    fn test_and_within_taxonomy_direct_attributes() {
        let store = fixture();
        let request = AttributeFilterRequest::new().with("pa_color", &["red", "blue"], QueryType::And);
        let ids = filtered(&store, settings(false), &request);

        assert!(ids.contains(&3));
        assert!(!ids.contains(&1));
        assert!(!ids.contains(&2));
        // Drafts are never listed
        assert!(!ids.contains(&8));
    }

    #[test]
    fn test_and_within_taxonomy_across_variations() {
        let store = fixture();
        let request = AttributeFilterRequest::new().with("pa_color", &["red", "blue"], QueryType::And);
        let ids = filtered(&store, settings(false), &request);

        // No single variation of 4 is both red and blue
        assert!(ids.contains(&4));
        // One matching variation is enough for the parent
        assert!(ids.contains(&7));
        assert_eq!(ids, vec![3, 4, 7]);
    }

    #[test]
    fn test_or_semantics() {
        let store = fixture();
        let request = AttributeFilterRequest::new().with("pa_color", &["blue", "green"], QueryType::Or);
        assert_eq!(filtered(&store, settings(false), &request), vec![3, 4, 6]);

        let request = AttributeFilterRequest::new().with("pa_size", &["small"], QueryType::Or);
        assert!(filtered(&store, settings(false), &request).is_empty());
    }

    #[test]
    fn test_unresolvable_terms_fail_closed() {
        let store = fixture();
        let request = AttributeFilterRequest::new().with("pa_color", &["purple"], QueryType::And);
        assert!(filtered(&store, settings(false), &request).is_empty());

        let request = AttributeFilterRequest::new().with("pa_material", &["wool"], QueryType::Or);
        assert!(filtered(&store, settings(false), &request).is_empty());

        let cache: MemoryCache<CountsByQuery> = MemoryCache::new();
        let filterer = Filterer::new(settings(false), &store, &store, &cache);
        let clauses = filterer.filter_by_attribute_post_clauses(ClauseSet::default(), &QueryContext::main(), &request);
        assert_eq!(clauses.where_clause.sql(), " AND (1=0)");
    }

    #[test]
    fn test_hide_out_of_stock() {
        let store = fixture();
        let request = AttributeFilterRequest::new()
            .with("pa_color", &["red"], QueryType::And)
            .with("pa_size", &["large"], QueryType::And);
        assert_eq!(filtered(&store, settings(true), &request), vec![1]);
        assert_eq!(filtered(&store, settings(false), &request), vec![1, 5]);

        let request = AttributeFilterRequest::new().with("pa_color", &["red"], QueryType::Or);
        assert_eq!(filtered(&store, settings(true), &request), vec![1, 2, 3, 4, 7]);
    }

    #[test]
    fn test_guard_leaves_clauses_untouched() {
        let store = fixture();
        let cache: MemoryCache<CountsByQuery> = MemoryCache::new();
        let request = AttributeFilterRequest::new().with("pa_color", &["red"], QueryType::And);
        let mut original = ClauseSet::default();
        original.where_clause.push_sql(" AND products.id > ").push_param(0i64);

        let filterer = Filterer::new(settings(false), &store, &store, &cache);
        let out = filterer.filter_by_attribute_post_clauses(original.clone(), &QueryContext::secondary(), &request);
        assert_eq!(out, original);

        let disabled = FilterSettings {
            use_lookup_table: false,
            ..FilterSettings::default()
        };
        let filterer = Filterer::new(disabled, &store, &store, &cache);
        let out = filterer.filter_by_attribute_post_clauses(original.clone(), &QueryContext::main(), &request);
        assert_eq!(out, original);

        let filterer = Filterer::new(settings(false), &store, &store, &cache);
        let out = filterer.filter_by_attribute_post_clauses(
            original.clone(),
            &QueryContext::main(),
            &AttributeFilterRequest::new(),
        );
        assert_eq!(out, original);
    }

    #[test]
    fn test_existing_where_is_extended() {
        let store = fixture();
        let cache: MemoryCache<CountsByQuery> = MemoryCache::new();
        let filterer = Filterer::new(settings(false), &store, &store, &cache);
        let mut clauses = ClauseSet::default();
        clauses.where_clause.push_sql(" AND products.id <> ").push_param(3i64);

        let request = AttributeFilterRequest::new().with("pa_color", &["blue"], QueryType::Or);
        let clauses = filterer.filter_by_attribute_post_clauses(clauses, &QueryContext::main(), &request);
        assert!(clauses.where_clause.sql().starts_with(" AND products.id <> ? AND ("));
        assert_eq!(store.matching_products(&clauses).unwrap(), vec![4]);
    }

    #[test]
    fn test_term_ids_are_bound_not_spliced() {
        let store = fixture();
        let cache: MemoryCache<CountsByQuery> = MemoryCache::new();
        let filterer = Filterer::new(settings(true), &store, &store, &cache);
        let request = AttributeFilterRequest::new().with("pa_color", &["red", "blue"], QueryType::And);
        let clauses = filterer.filter_by_attribute_post_clauses(ClauseSet::default(), &QueryContext::main(), &request);

        let red = term(&store, "pa_color", "red");
        let sql = clauses.where_clause.sql();
        assert!(sql.contains("term_id IN (?, ?) GROUP BY product_id HAVING COUNT(DISTINCT term_id) = ?"));
        assert!(sql.contains("UNION"));
        assert!(clauses.where_clause.params().contains(&SqlValue::Integer(red)));
        assert!(clauses.where_clause.sql().contains("lt.in_stock = 1"));
        // two id lists of two plus the HAVING count
        assert_eq!(clauses.where_clause.params().len(), 5);
    }

    fn counts_for(
        store: &LookupStore,
        settings: FilterSettings,
        main_query: &MainQuery,
        taxonomy: &str,
        query_type: QueryType,
    ) -> TermCounts {
        let cache: MemoryCache<CountsByQuery> = MemoryCache::new();
        let filterer = Filterer::new(settings, store, store, &cache);
        let ids: Vec<TermId> = ["red", "blue", "green", "small", "large"]
            .iter()
            .filter_map(|slug| store.term_id(taxonomy, slug).unwrap())
            .collect();
        filterer.get_filtered_term_product_counts(main_query, &ids, taxonomy, query_type)
    }

    #[test]
    fn test_counts_without_filters() {
        let store = fixture();
        let (red, blue, green) = (
            term(&store, "pa_color", "red"),
            term(&store, "pa_color", "blue"),
            term(&store, "pa_color", "green"),
        );

        for use_lookup_table in [true, false] {
            let s = FilterSettings {
                use_lookup_table,
                ..FilterSettings::default()
            };
            let counts = counts_for(&store, s, &MainQuery::default(), "pa_color", QueryType::Or);
            assert_eq!(counts.get(&red), Some(&6), "lookup table: {}", use_lookup_table);
            assert_eq!(counts.get(&blue), Some(&2), "lookup table: {}", use_lookup_table);
            assert_eq!(counts.get(&green), Some(&1), "lookup table: {}", use_lookup_table);
        }
    }

    #[test]
    fn test_counts_scoped_to_other_filters() {
        let store = fixture();
        let red = term(&store, "pa_color", "red");
        let main_query = MainQuery {
            chosen_attributes: AttributeFilterRequest::new().with("pa_size", &["large"], QueryType::And),
            search: None,
        };

        for use_lookup_table in [true, false] {
            let s = FilterSettings {
                use_lookup_table,
                ..FilterSettings::default()
            };
            let counts = counts_for(&store, s, &main_query, "pa_color", QueryType::Or);
            // Zero-count terms are absent
            assert_eq!(counts, TermCounts::from([(red, 2)]), "lookup table: {}", use_lookup_table);
        }
    }

    #[test]
    fn test_or_counts_ignore_own_taxonomy() {
        let store = fixture();
        let (red, green) = (term(&store, "pa_color", "red"), term(&store, "pa_color", "green"));
        let main_query = MainQuery {
            chosen_attributes: AttributeFilterRequest::new().with("pa_color", &["green"], QueryType::Or),
            search: None,
        };

        let or_counts = counts_for(&store, settings(false), &main_query, "pa_color", QueryType::Or);
        assert_eq!(or_counts.get(&red), Some(&6));

        let and_counts = counts_for(&store, settings(false), &main_query, "pa_color", QueryType::And);
        assert_eq!(and_counts, TermCounts::from([(green, 1)]));
    }

    #[test]
    fn test_counts_hide_out_of_stock_and_search() {
        let store = fixture();
        let red = term(&store, "pa_color", "red");

        let counts = counts_for(&store, settings(true), &MainQuery::default(), "pa_color", QueryType::Or);
        assert_eq!(counts.get(&red), Some(&5));

        let main_query = MainQuery {
            chosen_attributes: AttributeFilterRequest::new(),
            search: Some("red LARGE".to_string()),
        };
        let counts = counts_for(&store, settings(false), &main_query, "pa_color", QueryType::Or);
        assert_eq!(counts, TermCounts::from([(red, 2)]));
    }

    #[test]
    fn test_counts_fail_closed_on_unknown_filter_terms() {
        let store = fixture();
        let main_query = MainQuery {
            chosen_attributes: AttributeFilterRequest::new().with("pa_size", &["huge"], QueryType::And),
            search: None,
        };
        assert!(counts_for(&store, settings(false), &main_query, "pa_color", QueryType::Or).is_empty());
    }

    #[test]
    fn test_counts_skip_unresolvable_filter_taxonomy() {
        let store = fixture();
        let red = term(&store, "pa_color", "red");
        let main_query = MainQuery {
            chosen_attributes: AttributeFilterRequest::new()
                .with("pa_size", &["large"], QueryType::And)
                .with("pa_material", &["wool"], QueryType::And),
            search: None,
        };

        for use_lookup_table in [true, false] {
            let s = FilterSettings {
                use_lookup_table,
                ..FilterSettings::default()
            };
            let counts = counts_for(&store, s, &main_query, "pa_color", QueryType::Or);
            assert_eq!(counts, TermCounts::from([(red, 2)]), "lookup table: {}", use_lookup_table);
        }
    }

    #[test]
    fn test_counts_cache_hit_skips_query() {
        let store = fixture();
        let spy = CountingExecutor {
            inner: &store,
            calls: Cell::new(0),
        };
        let cache: MemoryCache<CountsByQuery> = MemoryCache::new();
        let filterer = Filterer::new(settings(false), &store, &spy, &cache);
        let red = term(&store, "pa_color", "red");
        let blue = term(&store, "pa_color", "blue");

        let first = filterer.get_filtered_term_product_counts(&MainQuery::default(), &[red, blue], "pa_color", QueryType::Or);
        let second = filterer.get_filtered_term_product_counts(&MainQuery::default(), &[red, blue], "pa_color", QueryType::Or);
        assert_eq!(first, second);
        assert_eq!(spy.calls.get(), 1);
        assert!(cache.get(&counts_transient_name("pa_color")).is_some());

        // Different query, same transient, new entry
        filterer.get_filtered_term_product_counts(&MainQuery::default(), &[red], "pa_color", QueryType::Or);
        assert_eq!(spy.calls.get(), 2);
        assert_eq!(cache.get(&counts_transient_name("pa_color")).unwrap().len(), 2);

        filterer.clear_cached_counts("pa_color");
        filterer.get_filtered_term_product_counts(&MainQuery::default(), &[red, blue], "pa_color", QueryType::Or);
        assert_eq!(spy.calls.get(), 3);
    }

    #[test]
    fn test_counts_cache_disabled() {
        let store = fixture();
        let spy = CountingExecutor {
            inner: &store,
            calls: Cell::new(0),
        };
        let cache: MemoryCache<CountsByQuery> = MemoryCache::new();
        let s = FilterSettings {
            cache_counts: false,
            ..FilterSettings::default()
        };
        let filterer = Filterer::new(s, &store, &spy, &cache);
        let red = term(&store, "pa_color", "red");

        filterer.get_filtered_term_product_counts(&MainQuery::default(), &[red], "pa_color", QueryType::Or);
        filterer.get_filtered_term_product_counts(&MainQuery::default(), &[red], "pa_color", QueryType::Or);
        assert_eq!(spy.calls.get(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_counts_query_failure_is_not_cached() {
        let store = fixture();
        let cache: MemoryCache<CountsByQuery> = MemoryCache::new();
        let filterer = Filterer::new(settings(false), &store, &FailingExecutor, &cache);
        let red = term(&store, "pa_color", "red");

        let counts = filterer.get_filtered_term_product_counts(&MainQuery::default(), &[red], "pa_color", QueryType::Or);
        assert!(counts.is_empty());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_counts_empty_term_list_runs_nothing() {
        let store = fixture();
        let spy = CountingExecutor {
            inner: &store,
            calls: Cell::new(0),
        };
        let cache: MemoryCache<CountsByQuery> = MemoryCache::new();
        let filterer = Filterer::new(settings(false), &store, &spy, &cache);
        assert!(filterer
            .get_filtered_term_product_counts(&MainQuery::default(), &[], "pa_color", QueryType::And)
            .is_empty());
        assert_eq!(spy.calls.get(), 0);
    }

    #[test]
    fn test_query_type_parsing() {
        assert_eq!("and".parse::<QueryType>(), Ok(QueryType::And));
        assert_eq!("or".parse::<QueryType>(), Ok(QueryType::Or));
        assert!("OR".parse::<QueryType>().is_err());
        assert!("".parse::<QueryType>().is_err());
    }

    #[test]
    fn test_from_query_string() {
        let request = AttributeFilterRequest::from_query_string(
            "?filter_color=red,Blue,&query_type_color=or&filter_size=large&query_type_size=xor&orderby=price&filter_=x",
        );
        assert_eq!(request.len(), 2);

        let color = request.get("pa_color").unwrap();
        assert_eq!(color.terms, vec!["red", "blue"]);
        assert_eq!(color.query_type, QueryType::Or);

        let size = request.get("pa_size").unwrap();
        assert_eq!(size.terms, vec!["large"]);
        assert_eq!(size.query_type, QueryType::And);
    }

    #[test]
    fn test_query_hash_is_md5_hex() {
        assert_eq!(hash_query(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(hash_query("abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_transient_name() {
        assert_eq!(counts_transient_name("pa_color"), "wc_layered_nav_counts_pa_color");
        assert_eq!(counts_transient_name("PA Size!"), "wc_layered_nav_counts_pa-size");
    }
}
