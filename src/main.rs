mod aggregate;
mod api;
mod config;
mod coordinator;
mod fetcher;
mod hierarchy;
mod record;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use crate::aggregate::AggregatedCounts;
use crate::api::{DatasetSource, RisClient};
use crate::config::Settings;
use crate::coordinator::{Coordinator, HierarchyScope, Phase, SubmitOutcome};
use crate::hierarchy::{extract_with_markers, Hierarchy};

#[derive(Parser)]
#[command(
    name = "household_stats",
    about = "Household counts by type and gender from the RIS open-data API"
)]
struct Cli {
    /// Max dataset pages fetched at once (overrides HOUSEHOLD_CONCURRENCY)
    #[arg(short, long, global = true)]
    concurrency: Option<usize>,
    /// Year whose full dataset provides the county/town list
    #[arg(long, global = true)]
    default_year: Option<String>,
    /// Where the county/town list comes from
    #[arg(long, global = true, value_enum)]
    scope: Option<HierarchyScope>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List dataset years, most recent first
    Years,
    /// Fetch every page of a year and print its counties and towns
    Towns {
        /// Dataset year (default: the configured default year)
        #[arg(short, long)]
        year: Option<String>,
    },
    /// Aggregate household counts for one year, county and town
    Query {
        year: String,
        county: String,
        town: String,
        /// Print the four totals as JSON instead of tables
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let mut settings = Settings::load()?;
    if let Some(c) = cli.concurrency {
        settings.concurrency = c;
    }
    if let Some(y) = cli.default_year {
        settings.default_year = y;
    }
    if let Some(s) = cli.scope {
        settings.hierarchy_scope = s;
    }

    let client = RisClient::new(&settings).context("Failed to build HTTP client")?;
    let source: Arc<dyn DatasetSource> = Arc::new(client);

    let result = match cli.command {
        Commands::Years => {
            let years = source.fetch_years().await?;
            if years.is_empty() {
                println!("No years listed by the API.");
                return Ok(());
            }
            for y in &years {
                println!("{}", y);
            }
            Ok(())
        }
        Commands::Towns { year } => {
            let year = year.unwrap_or_else(|| settings.default_year.clone());
            let records = fetcher::fetch_all(Arc::clone(&source), &year, settings.concurrency)
                .await
                .with_context(|| format!("Failed to fetch dataset for {}", year))?;
            let hierarchy = extract_with_markers(
                records.iter().map(|r| r.site_id.as_str()),
                &settings.unit_markers,
            );
            print_hierarchy(&year, &hierarchy, records.len());
            Ok(())
        }
        Commands::Query {
            year,
            county,
            town,
            json,
        } => run_query(&settings, source, &year, &county, &town, json).await,
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {:.1}s", elapsed.as_secs_f64());
    }

    result
}

/// Drive the coordinator through a full selection and submit.
async fn run_query(
    settings: &Settings,
    source: Arc<dyn DatasetSource>,
    year: &str,
    county: &str,
    town: &str,
    json: bool,
) -> anyhow::Result<()> {
    let splitter = hierarchy::MarkerSplitter::new(settings.unit_markers.iter().cloned());
    let mut coord = Coordinator::with_splitter(
        settings.hierarchy_scope,
        &settings.default_year,
        Box::new(splitter),
    );

    // A failed year list only disables year validation.
    let _ = coord.load_years(&*source).await;

    coord.select_year(year)?;
    if coord.needs_hierarchy() {
        let load_year = coord.hierarchy_year().to_string();
        let stats = coord
            .load_hierarchy(Arc::clone(&source), settings.concurrency)
            .await
            .with_context(|| format!("Failed to load counties for {}", load_year))?;
        println!(
            "Loaded {} rows from {}/{} pages ({}).",
            coord.records().len(),
            stats.fetched_pages,
            stats.total_pages,
            load_year
        );
    }

    if let Err(e) = coord.select_county(county) {
        let counties: Vec<&str> = coord.hierarchy().counties().collect();
        eprintln!("Counties: {}", counties.join(" "));
        return Err(e.into());
    }
    if let Err(e) = coord.select_town(town) {
        eprintln!("Towns in {}: {}", county, coord.town_options().join(" "));
        return Err(e.into());
    }

    if coord.submit(&*source).await? == SubmitOutcome::Stale {
        bail!("Selection changed while the query was running");
    }

    match (coord.phase(), coord.counts()) {
        (Phase::Ready, Some(counts)) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&counts)?);
            } else {
                let sel = coord.selection();
                println!(
                    "\n{} {} {}",
                    sel.year().unwrap_or(year),
                    sel.county().unwrap_or(county),
                    sel.town().unwrap_or(town)
                );
                print_counts(&counts);
            }
            Ok(())
        }
        _ => bail!(
            "{}",
            coord.notice().unwrap_or(coordinator::NO_DATA_NOTICE)
        ),
    }
}

fn print_hierarchy(year: &str, hierarchy: &Hierarchy, rows: usize) {
    if hierarchy.is_empty() {
        println!("No counties found for {}.", year);
        return;
    }
    for entry in hierarchy.entries() {
        println!("{} ({})", entry.county, entry.towns.len());
        println!("  {}", entry.towns.join(" "));
    }
    println!(
        "\n{} counties | {} rows | year {}",
        hierarchy.entries().len(),
        rows,
        year
    );
}

fn print_counts(c: &AggregatedCounts) {
    // Column chart: gender × household type
    println!("\n{:<10} | {:>12} | {:>12}", "", "共同生活", "獨立生活");
    println!("{}", "-".repeat(42));
    let [om, sm] = c.male_series();
    let [of, sf] = c.female_series();
    println!("{:<10} | {:>12} | {:>12}", "男性", om, sm);
    println!("{:<10} | {:>12} | {:>12}", "女性", of, sf);

    // Pie chart: share of households by type
    println!("\n{:<10} | {:>12} | {:>8}", "戶別", "戶數", "%");
    println!("{}", "-".repeat(38));
    match c.living_shares() {
        Some((ordinary, single)) => {
            println!("{:<10} | {:>12} | {:>7.1}%", "共同生活", c.ordinary_total(), ordinary);
            println!("{:<10} | {:>12} | {:>7.1}%", "獨立生活", c.single_total(), single);
        }
        None => println!("No households recorded."),
    }
}
