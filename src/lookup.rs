//! SQLite-backed product attribute lookup table
//!
//! Holds the product, term and term relationship tables alongside the
//! denormalized lookup table, and regenerates a product's lookup rows
//! whenever the product is saved. Also serves as the term resolver and
//! count query executor for the [`Filterer`](crate::filterer::Filterer).

use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::config::validate_table_name;
use crate::filterer::{ClauseSet, QueryExecutor, TermId, TermResolver};
use crate::sql::SqlFragment;

pub const PRODUCTS_TABLE: &str = "products";
pub const TERMS_TABLE: &str = "terms";
pub const TERM_RELATIONSHIPS_TABLE: &str = "term_relationships";

/// One row per product (or variation), taxonomy and term
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupRow {
    pub product_id: i64,
    pub product_or_parent_id: i64,
    pub taxonomy: String,
    pub term_id: TermId,
    pub is_variation_attribute: bool,
    pub in_stock: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TermRecord {
    pub taxonomy: String,
    pub slug: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductAttribute {
    pub taxonomy: String,
    /// Term slugs
    pub terms: Vec<String>,
    #[serde(default)]
    pub used_for_variations: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariationRecord {
    pub id: i64,
    #[serde(default = "default_true")]
    pub in_stock: bool,
    /// taxonomy → term slug; a missing or empty value means "any"
    #[serde(default)]
    pub attributes: BTreeMap<String, Option<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default = "default_true")]
    pub in_stock: bool,
    #[serde(default)]
    pub attributes: Vec<ProductAttribute>,
    #[serde(default)]
    pub variations: Vec<VariationRecord>,
}

/// Import payload: terms first, then the products using them
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub terms: Vec<TermRecord>,
    #[serde(default)]
    pub products: Vec<ProductRecord>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct StoreStats {
    pub products: usize,
    pub variations: usize,
    pub terms: usize,
    pub lookup_rows: usize,
}

fn default_true() -> bool {
    true
}

fn default_status() -> String {
    "publish".to_string()
}

pub struct LookupStore {
    conn: Connection,
    lookup_table: String,
}

impl LookupStore {
    /// Open (or create) the store database.
    pub fn open(path: &Path, lookup_table: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open lookup DB at {:?}", path))?;
        Self::init(conn, lookup_table)
    }

    pub fn open_in_memory(lookup_table: &str) -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory DB")?;
        Self::init(conn, lookup_table)
    }

    fn init(conn: Connection, lookup_table: &str) -> Result<Self> {
        validate_table_name(lookup_table)?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {products} (
                id           INTEGER PRIMARY KEY,
                parent_id    INTEGER NOT NULL DEFAULT 0,
                title        TEXT NOT NULL DEFAULT '',
                product_type TEXT NOT NULL,
                status       TEXT NOT NULL,
                in_stock     INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_products_parent ON {products} (parent_id);
            CREATE TABLE IF NOT EXISTS {terms} (
                term_id  INTEGER PRIMARY KEY AUTOINCREMENT,
                taxonomy TEXT NOT NULL,
                slug     TEXT NOT NULL,
                name     TEXT NOT NULL,
                UNIQUE (taxonomy, slug)
            );
            CREATE TABLE IF NOT EXISTS {relationships} (
                object_id INTEGER NOT NULL,
                term_id   INTEGER NOT NULL,
                PRIMARY KEY (object_id, term_id)
            );
            CREATE TABLE IF NOT EXISTS {lookup} (
                product_id             INTEGER NOT NULL,
                product_or_parent_id   INTEGER NOT NULL,
                taxonomy               TEXT NOT NULL,
                term_id                INTEGER NOT NULL,
                is_variation_attribute INTEGER NOT NULL,
                in_stock               INTEGER NOT NULL,
                PRIMARY KEY (product_or_parent_id, term_id, product_id, taxonomy)
            );
            CREATE INDEX IF NOT EXISTS idx_{lookup}_variation ON {lookup} (is_variation_attribute, term_id);",
            products = PRODUCTS_TABLE,
            terms = TERMS_TABLE,
            relationships = TERM_RELATIONSHIPS_TABLE,
            lookup = lookup_table,
        ))
        .context("Failed to create lookup schema")?;

        Ok(Self {
            conn,
            lookup_table: lookup_table.to_string(),
        })
    }

    pub fn lookup_table(&self) -> &str {
        &self.lookup_table
    }

    /// Insert a term if missing and return its id.
    pub fn insert_term(&self, taxonomy: &str, slug: &str, name: Option<&str>) -> Result<TermId> {
        self.conn
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO {} (taxonomy, slug, name) VALUES (?1, ?2, ?3)",
                    TERMS_TABLE
                ),
                params![taxonomy, slug, name.unwrap_or(slug)],
            )
            .with_context(|| format!("Failed to insert term {}:{}", taxonomy, slug))?;
        self.term_id(taxonomy, slug)?
            .with_context(|| format!("Term {}:{} vanished after insert", taxonomy, slug))
    }

    pub fn term_id(&self, taxonomy: &str, slug: &str) -> Result<Option<TermId>> {
        find_term_id(&self.conn, taxonomy, slug)
    }

    /// Every term of a taxonomy as (id, slug), by id
    pub fn terms_in_taxonomy(&self, taxonomy: &str) -> Result<Vec<(TermId, String)>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT term_id, slug FROM {} WHERE taxonomy = ?1 ORDER BY term_id",
            TERMS_TABLE
        ))?;
        let rows = stmt.query_map(params![taxonomy], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Write a product, its variations, its term relationships and its
    /// lookup rows, replacing whatever was stored for it before. Returns
    /// the number of lookup rows written.
    pub fn save_product(&mut self, product: &ProductRecord) -> Result<usize> {
        let tx = self.conn.transaction()?;
        delete_product_rows(&tx, &self.lookup_table, product.id)?;

        let product_type = if product.variations.is_empty() {
            "simple"
        } else {
            "variable"
        };
        tx.execute(
            &format!(
                "INSERT INTO {} (id, parent_id, title, product_type, status, in_stock)
                 VALUES (?1, 0, ?2, ?3, ?4, ?5)",
                PRODUCTS_TABLE
            ),
            params![product.id, product.title, product_type, product.status, product.in_stock],
        )
        .with_context(|| format!("Failed to insert product {}", product.id))?;

        let insert_row = format!(
            "INSERT OR IGNORE INTO {} (product_id, product_or_parent_id, taxonomy, term_id, is_variation_attribute, in_stock)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            self.lookup_table
        );
        let insert_relationship = format!(
            "INSERT OR IGNORE INTO {} (object_id, term_id) VALUES (?1, ?2)",
            TERM_RELATIONSHIPS_TABLE
        );

        let mut written = 0;
        let has_variations = !product.variations.is_empty();
        let mut variation_terms: BTreeMap<&str, Vec<(String, TermId)>> = BTreeMap::new();

        for attribute in &product.attributes {
            let mut terms = Vec::new();
            for slug in &attribute.terms {
                match find_term_id(&tx, &attribute.taxonomy, slug)? {
                    Some(id) => terms.push((slug.clone(), id)),
                    None => tracing::warn!(
                        "Product {}: unknown term {}:{}, skipped",
                        product.id,
                        attribute.taxonomy,
                        slug
                    ),
                }
            }

            for (_, term_id) in &terms {
                tx.execute(&insert_relationship, params![product.id, term_id])?;
            }

            if attribute.used_for_variations && has_variations {
                variation_terms.insert(attribute.taxonomy.as_str(), terms);
                continue;
            }

            for (_, term_id) in &terms {
                written += tx.execute(
                    &insert_row,
                    params![product.id, product.id, attribute.taxonomy, term_id, false, product.in_stock],
                )?;
            }
        }

        for variation in &product.variations {
            tx.execute(
                &format!(
                    "INSERT INTO {} (id, parent_id, title, product_type, status, in_stock)
                     VALUES (?1, ?2, ?3, 'variation', ?4, ?5)",
                    PRODUCTS_TABLE
                ),
                params![variation.id, product.id, product.title, product.status, variation.in_stock],
            )
            .with_context(|| format!("Failed to insert variation {}", variation.id))?;

            for (taxonomy, terms) in &variation_terms {
                let chosen = variation
                    .attributes
                    .get(*taxonomy)
                    .and_then(|v| v.as_deref())
                    .filter(|v| !v.is_empty());

                for (slug, term_id) in terms {
                    if chosen.is_some_and(|c| c != slug.as_str()) {
                        continue;
                    }
                    written += tx.execute(
                        &insert_row,
                        params![variation.id, product.id, taxonomy, term_id, true, variation.in_stock],
                    )?;
                }
            }
        }

        tx.commit()?;
        tracing::debug!("Product {}: {} lookup rows written", product.id, written);
        Ok(written)
    }

    /// Remove a product with its variations, relationships and lookup rows.
    pub fn delete_product(&mut self, product_id: i64) -> Result<()> {
        let tx = self.conn.transaction()?;
        delete_product_rows(&tx, &self.lookup_table, product_id)?;
        tx.commit()?;
        Ok(())
    }

    /// Lookup rows attributed to a product (its own and its variations').
    pub fn lookup_rows(&self, product_or_parent_id: i64) -> Result<Vec<LookupRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT product_id, product_or_parent_id, taxonomy, term_id, is_variation_attribute, in_stock
             FROM {} WHERE product_or_parent_id = ?1
             ORDER BY is_variation_attribute, product_id, taxonomy, term_id",
            self.lookup_table
        ))?;
        let rows = stmt.query_map(params![product_or_parent_id], |row| {
            Ok(LookupRow {
                product_id: row.get(0)?,
                product_or_parent_id: row.get(1)?,
                taxonomy: row.get(2)?,
                term_id: row.get(3)?,
                is_variation_attribute: row.get(4)?,
                in_stock: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Run the main product listing query (published parent products)
    /// restricted by `clauses`.
    pub fn matching_products(&self, clauses: &ClauseSet) -> Result<Vec<i64>> {
        let orderby = if clauses.orderby.trim().is_empty() {
            format!("{}.id ASC", PRODUCTS_TABLE)
        } else {
            clauses.orderby.clone()
        };
        let sql = format!(
            "SELECT DISTINCT {p}.id FROM {p} {join}
             WHERE {p}.product_type <> 'variation' AND {p}.status = 'publish'{where_clause}
             ORDER BY {orderby}",
            p = PRODUCTS_TABLE,
            join = clauses.join.sql(),
            where_clause = clauses.where_clause.sql(),
            orderby = orderby,
        );
        let params = clauses
            .join
            .params()
            .iter()
            .chain(clauses.where_clause.params().iter());

        let mut stmt = self
            .conn
            .prepare(&sql)
            .with_context(|| format!("Failed to prepare product query: {}", sql))?;
        let rows = stmt.query_map(params_from_iter(params), |row| row.get::<_, i64>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Load a catalog: terms first, then every product.
    pub fn import_catalog(&mut self, catalog: &Catalog) -> Result<StoreStats> {
        for term in &catalog.terms {
            self.insert_term(&term.taxonomy, &term.slug, term.name.as_deref())?;
        }
        for product in &catalog.products {
            self.save_product(product)?;
        }
        tracing::info!(
            "Imported {} terms and {} products",
            catalog.terms.len(),
            catalog.products.len()
        );
        self.stats()
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let count = |sql: String| -> Result<usize> {
            let n: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
            Ok(n as usize)
        };
        Ok(StoreStats {
            products: count(format!(
                "SELECT COUNT(*) FROM {} WHERE product_type <> 'variation'",
                PRODUCTS_TABLE
            ))?,
            variations: count(format!(
                "SELECT COUNT(*) FROM {} WHERE product_type = 'variation'",
                PRODUCTS_TABLE
            ))?,
            terms: count(format!("SELECT COUNT(*) FROM {}", TERMS_TABLE))?,
            lookup_rows: count(format!("SELECT COUNT(*) FROM {}", self.lookup_table))?,
        })
    }
}

fn find_term_id(conn: &Connection, taxonomy: &str, slug: &str) -> Result<Option<TermId>> {
    let id = conn
        .query_row(
            &format!(
                "SELECT term_id FROM {} WHERE taxonomy = ?1 AND slug = ?2",
                TERMS_TABLE
            ),
            params![taxonomy, slug],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

fn delete_product_rows(conn: &Connection, lookup_table: &str, product_id: i64) -> Result<()> {
    conn.execute(
        &format!(
            "DELETE FROM {} WHERE object_id = ?1 OR object_id IN (SELECT id FROM {} WHERE parent_id = ?1)",
            TERM_RELATIONSHIPS_TABLE, PRODUCTS_TABLE
        ),
        params![product_id],
    )?;
    conn.execute(
        &format!("DELETE FROM {} WHERE id = ?1 OR parent_id = ?1", PRODUCTS_TABLE),
        params![product_id],
    )?;
    conn.execute(
        &format!("DELETE FROM {} WHERE product_or_parent_id = ?1", lookup_table),
        params![product_id],
    )
    .with_context(|| format!("Failed to clear lookup rows for product {}", product_id))?;
    Ok(())
}

impl TermResolver for LookupStore {
    fn term_ids_for_slugs(&self, taxonomy: &str, slugs: &[String]) -> Result<Vec<TermId>> {
        if slugs.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = SqlFragment::new(format!("SELECT term_id FROM {} WHERE taxonomy = ", TERMS_TABLE));
        query.push_param(taxonomy).push_sql(" AND slug IN (");
        for (i, slug) in slugs.iter().enumerate() {
            if i > 0 {
                query.push_sql(", ");
            }
            query.push_param(slug.as_str());
        }
        query.push_sql(") ORDER BY term_id");

        let mut stmt = self.conn.prepare(query.sql())?;
        let rows = stmt.query_map(params_from_iter(query.params().iter()), |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }
}

impl QueryExecutor for LookupStore {
    fn term_counts(&self, query: &SqlFragment) -> Result<Vec<(TermId, i64)>> {
        let mut stmt = self
            .conn
            .prepare(query.sql())
            .with_context(|| format!("Failed to prepare count query: {}", query.render()))?;
        let rows = stmt.query_map(params_from_iter(query.params().iter()), |row| {
            Ok((
                row.get::<_, TermId>("term_count_id")?,
                row.get::<_, i64>("term_count")?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
