//! rfm-churn: RFM segmentation and product churn analysis CLI
//!
//! Loads a sales CSV, runs the requested analysis and writes the result
//! records as CSV or JSON.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use rfm_churn::cli::{CatalogArgs, ChurnArgs, Command, OutputFormat, RfmArgs};
use rfm_churn::export::RetentionRow;
use rfm_churn::{
    analyze_product, compute_rfm, export, load_transactions, summarize_segments, AnalysisConfig,
    Args, ChurnReport, RfmOptions,
};
use serde::Serialize;
use tracing::{info, Level};

/// JSON layout of a churn report
#[derive(Serialize)]
struct ChurnJson<'a> {
    product: &'a str,
    retention: Vec<RetentionRow>,
    churn: &'a ChurnReport,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let config = args.load_config().context("Failed to load configuration")?;

    match &args.command {
        Command::Rfm(rfm) => run_rfm(rfm, &config),
        Command::Churn(churn) => run_churn(churn, &config),
        Command::Catalog(catalog) => run_catalog(catalog, &config),
    }
}

/// Run RFM scoring and write one row per customer-group key
fn run_rfm(args: &RfmArgs, config: &AnalysisConfig) -> Result<()> {
    let start_time = Instant::now();

    let table = load_transactions(&args.input, config)
        .with_context(|| format!("Failed to load '{}'", args.input))?;

    let options = RfmOptions {
        group_by: args.parse_group_by()?,
        as_of: args.parse_as_of(config.as_of)?,
        filter: args.filter(),
    };
    let records = compute_rfm(&table, &options)?;

    let writer = open_output(args.output.as_deref())?;
    match args.format {
        OutputFormat::Csv => {
            export::write_rfm_csv(writer, &records, &options.group_by, &config.columns)?
        }
        OutputFormat::Json => export::write_json(writer, &records)?,
    }

    if args.summary {
        let summary = summarize_segments(&records);
        eprintln!("\n=== Segment Summary ===");
        for s in &summary {
            eprintln!(
                "{:<16} {:>6} customers ({:>5.1}%)  R={:.1}d F={:.1} M={:.2}",
                s.segment.label(),
                s.customers,
                s.share * 100.0,
                s.mean_recency_days,
                s.mean_frequency,
                s.mean_monetary
            );
        }
    }

    info!(
        customers = records.len(),
        elapsed_ms = start_time.elapsed().as_millis() as u64,
        "RFM analysis written"
    );
    Ok(())
}

/// Run cohort and churn analysis for one product and write the report files
fn run_churn(args: &ChurnArgs, config: &AnalysisConfig) -> Result<()> {
    let start_time = Instant::now();

    let table = load_transactions(&args.input, config)
        .with_context(|| format!("Failed to load '{}'", args.input))?;

    let threshold = args.threshold.unwrap_or(config.churn_threshold_months);
    let analysis = analyze_product(&table, &args.product, threshold)?;

    let churn = &analysis.churn;
    eprintln!("Total customers:   {}", churn.total_customers());
    eprintln!(
        "Churned customers: {} ({:.1}%)",
        churn.churned_count(),
        churn.churned_share() * 100.0
    );

    fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("Failed to create '{}'", args.output_dir))?;
    let stem = format!("churn_{}", args.product.replace(' ', "_"));
    let path = |name: &str| {
        Path::new(&args.output_dir).join(format!("{stem}_{name}.{}", args.format.extension()))
    };

    match args.format {
        OutputFormat::Json => {
            let report = ChurnJson {
                product: &analysis.product,
                retention: export::retention_rows(&analysis.cohorts),
                churn,
            };
            export::write_json(create(&path("report"))?, &report)?;
        }
        OutputFormat::Csv => {
            export::write_retention_csv(create(&path("retention"))?, &analysis.cohorts)?;
            export::write_churn_flags_csv(create(&path("customers"))?, churn)?;
            export::write_monthly_churn_csv(create(&path("monthly"))?, churn)?;

            let product_rows = table.for_product(&args.product)?;
            let churned = churn.churned_transactions(&product_rows);
            export::write_transactions_csv(create(&path("churned_details"))?, &churned)?;
        }
    }

    info!(
        product = %args.product,
        output_dir = %args.output_dir,
        elapsed_ms = start_time.elapsed().as_millis() as u64,
        "Churn report written"
    );
    Ok(())
}

/// Print the categories and products available for filtering
fn run_catalog(args: &CatalogArgs, config: &AnalysisConfig) -> Result<()> {
    let table = load_transactions(&args.input, config)
        .with_context(|| format!("Failed to load '{}'", args.input))?;

    let stdout = io::stdout();
    let mut out = stdout.lock();

    if args.category.is_none() {
        writeln!(out, "Categories:")?;
        for category in table.categories() {
            writeln!(out, "  {category}")?;
        }
    }

    writeln!(out, "Products:")?;
    for product in table.products(args.category.as_deref()) {
        writeln!(out, "  {product}")?;
    }
    Ok(())
}

fn open_output(path: Option<&str>) -> Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => Box::new(create(Path::new(path))?),
        None => Box::new(io::stdout().lock()),
    })
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    let file =
        File::create(path).with_context(|| format!("Failed to create '{}'", path.display()))?;
    Ok(BufWriter::new(file))
}
