//! attrlookup CLI - lookup table filtering, layered nav counts and URL tools

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};

use attrlookup_core::filterer::counts_transient_name;
use attrlookup_core::{
    AttributeFilterRequest, Catalog, ClauseSet, CountsByQuery, FilterSettings, Filterer,
    LookupStore, MainQuery, QueryContext, QueryType, SqliteTransientStore, TermResolver, Url,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "attrlookup")]
#[command(about = "Product attribute lookup filtering and layered navigation counts")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Options shared by every command that touches the store
#[derive(Args)]
struct StoreArgs {
    /// Path to the store database
    #[arg(short, long, default_value = "./attrlookup.db")]
    database: PathBuf,

    /// Settings file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Hide out of stock products (overrides the settings file)
    #[arg(long)]
    hide_out_of_stock: bool,

    /// Count through term relationships instead of the lookup table
    #[arg(long)]
    no_lookup_table: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Load terms and products from a JSON catalog and rebuild their lookup rows
    Import {
        /// Catalog file
        catalog: PathBuf,

        #[command(flatten)]
        store: StoreArgs,
    },

    /// List the products matching storefront attribute filters
    Filter {
        /// Filter query string, e.g. "filter_color=red,blue&query_type_color=or"
        #[arg(short, long, default_value = "")]
        query: String,

        #[command(flatten)]
        store: StoreArgs,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Count products per term of a taxonomy under the current filters
    Counts {
        /// Taxonomy to count, e.g. pa_color
        taxonomy: String,

        /// Term slugs to count (default: every term of the taxonomy)
        #[arg(short, long, value_delimiter = ',')]
        terms: Vec<String>,

        /// How the taxonomy's own filter combines: and, or
        #[arg(long, default_value = "and")]
        query_type: String,

        /// Active filters as a query string
        #[arg(short, long, default_value = "")]
        query: String,

        /// Title search phrase
        #[arg(short, long)]
        search: Option<String>,

        #[command(flatten)]
        store: StoreArgs,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Normalize a URL or filesystem path
    Url {
        input: String,

        /// Also list every parent URL
        #[arg(short, long)]
        parents: bool,

        /// Print only the parent this many levels up
        #[arg(short, long)]
        level: Option<usize>,
    },

    /// Show store statistics
    Stats {
        #[command(flatten)]
        store: StoreArgs,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Import { catalog, store } => run_import(&catalog, &store)?,

        Commands::Filter {
            query,
            store,
            format,
        } => run_filter(&query, &store, &format)?,

        Commands::Counts {
            taxonomy,
            terms,
            query_type,
            query,
            search,
            store,
            format,
        } => {
            let query_type: QueryType = query_type.parse()?;
            let main_query = MainQuery {
                chosen_attributes: AttributeFilterRequest::from_query_string(&query),
                search,
            };
            run_counts(&taxonomy, &terms, query_type, &main_query, &store, &format)?;
        }

        Commands::Url {
            input,
            parents,
            level,
        } => {
            let url: Url = input.parse()?;
            match level {
                Some(level) => match url.parent_url(level) {
                    Some(parent) => println!("{}", parent),
                    None => anyhow::bail!("{} has no parent {} levels up", url, level),
                },
                None => {
                    println!("{}", url);
                    println!("  path:     {}", url.path());
                    println!("  absolute: {}", url.is_absolute());
                    if parents {
                        for parent in url.all_parent_urls() {
                            println!("  parent:   {}", parent);
                        }
                    }
                }
            }
        }

        Commands::Stats { store } => {
            let settings = load_settings(&store)?;
            let db = LookupStore::open(&store.database, &settings.lookup_table)?;
            let stats = db.stats()?;

            println!("\n=== Store Statistics ===");
            println!("Products:     {}", stats.products);
            println!("Variations:   {}", stats.variations);
            println!("Terms:        {}", stats.terms);
            println!("Lookup rows:  {}", stats.lookup_rows);
            println!("Lookup table: {}", db.lookup_table());
        }
    }

    Ok(())
}

fn load_settings(args: &StoreArgs) -> Result<FilterSettings> {
    let mut settings = FilterSettings::load_or_default(args.config.as_deref())?;
    if args.hide_out_of_stock {
        settings.hide_out_of_stock = true;
    }
    if args.no_lookup_table {
        settings.use_lookup_table = false;
    }
    Ok(settings)
}

fn run_import(catalog_path: &Path, args: &StoreArgs) -> Result<()> {
    let settings = load_settings(args)?;
    let raw = fs::read_to_string(catalog_path)
        .with_context(|| format!("Failed to read catalog {:?}", catalog_path))?;
    let catalog: Catalog = serde_json::from_str(&raw).context("Failed to parse catalog")?;

    tracing::info!("Importing catalog into {:?}...", args.database);
    let mut db = LookupStore::open(&args.database, &settings.lookup_table)?;
    let stats = db.import_catalog(&catalog)?;

    // Cached counts no longer describe the catalog
    let transients: SqliteTransientStore<CountsByQuery> =
        SqliteTransientStore::open(&args.database)?;
    let filterer = Filterer::new(settings, &db, &db, &transients);
    let mut taxonomies: Vec<&str> = catalog.terms.iter().map(|t| t.taxonomy.as_str()).collect();
    taxonomies.sort_unstable();
    taxonomies.dedup();
    for taxonomy in taxonomies {
        tracing::debug!("Clearing {}", counts_transient_name(taxonomy));
        filterer.clear_cached_counts(taxonomy);
    }
    let purged = transients.purge_expired()?;
    if purged > 0 {
        tracing::info!("Purged {} expired transients", purged);
    }

    println!("Products:     {}", stats.products);
    println!("Variations:   {}", stats.variations);
    println!("Terms:        {}", stats.terms);
    println!("Lookup rows:  {}", stats.lookup_rows);

    Ok(())
}

fn run_filter(query: &str, args: &StoreArgs, format: &str) -> Result<()> {
    let settings = load_settings(args)?;
    let db = LookupStore::open(&args.database, &settings.lookup_table)?;
    let transients: SqliteTransientStore<CountsByQuery> =
        SqliteTransientStore::open(&args.database)?;
    let filterer = Filterer::new(settings, &db, &db, &transients);

    let request = AttributeFilterRequest::from_query_string(query);
    let clauses = filterer.filter_by_attribute_post_clauses(
        ClauseSet::default(),
        &QueryContext::main(),
        &request,
    );
    let ids = db.matching_products(&clauses)?;

    if format == "json" {
        let out = serde_json::json!({
            "filters": request,
            "where": clauses.where_clause.render(),
            "products": ids,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        tracing::debug!("WHERE{}", clauses.where_clause.render());
        println!("\n=== {} matching products ===\n", ids.len());
        for id in &ids {
            println!("  {}", id);
        }
    }

    Ok(())
}

fn run_counts(
    taxonomy: &str,
    slugs: &[String],
    query_type: QueryType,
    main_query: &MainQuery,
    args: &StoreArgs,
    format: &str,
) -> Result<()> {
    let settings = load_settings(args)?;
    let db = LookupStore::open(&args.database, &settings.lookup_table)?;
    let transients: SqliteTransientStore<CountsByQuery> =
        SqliteTransientStore::open(&args.database)?;
    let filterer = Filterer::new(settings, &db, &db, &transients);

    let all_terms = db.terms_in_taxonomy(taxonomy)?;
    let term_ids = if slugs.is_empty() {
        all_terms.iter().map(|(id, _)| *id).collect()
    } else {
        db.term_ids_for_slugs(taxonomy, slugs)?
    };

    let counts =
        filterer.get_filtered_term_product_counts(main_query, &term_ids, taxonomy, query_type);

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&counts)?);
    } else {
        println!("\n=== Product counts for {} ({}) ===\n", taxonomy, query_type);
        for (id, slug) in all_terms.iter().filter(|(id, _)| term_ids.contains(id)) {
            println!("  {:<20} {}", slug, counts.get(id).copied().unwrap_or(0));
        }
    }

    Ok(())
}
