//! CLI binary for receipt2json.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ExtractionConfig`, runs the batch and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use receipt2json::{
    BatchProgressCallback, CancellationToken, ExtractionConfig, Extractor, Metrics,
    PipelineResult, ProgressCallback, ReceiptOutcome, StageMetrics, Usage,
};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const SPINNER: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar plus one log line per finished image. Images finish
/// out of order when `--concurrency` > 1.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} images  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(SPINNER);
        bar.set_style(style);
        bar.set_prefix("Extracting");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
        })
    }

    fn elapsed_secs(&self, index: usize) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(&index))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl BatchProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Extracting {total} image(s)…"))
        ));
    }

    fn on_image_start(&self, index: usize, _total: usize, image_ref: &str) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(index, Instant::now());
        }
        self.bar.set_message(file_name(image_ref));
    }

    fn on_image_complete(&self, index: usize, _total: usize, image_ref: &str, is_receipt: bool) {
        let secs = self.elapsed_secs(index);
        let (mark, label) = if is_receipt {
            (green("✓"), "receipt")
        } else {
            (yellow("○"), "not a receipt")
        };
        self.bar.println(format!(
            "  {mark} {:<32}  {:<14}  {}",
            file_name(image_ref),
            dim(label),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_image_error(&self, index: usize, _total: usize, image_ref: &str, error: &str) {
        let secs = self.elapsed_secs(index);
        self.bar.println(format!(
            "  {} {:<32}  {}  {}",
            red("✗"),
            file_name(image_ref),
            red(&truncate(error, 80)),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, total: usize, success_count: usize) {
        let failed = total.saturating_sub(success_count);
        self.bar.finish_and_clear();
        if failed == 0 {
            eprintln!(
                "{} {} image(s) extracted successfully",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} image(s) extracted  ({} failed)",
                if failed == total { red("✘") } else { cyan("⚠") },
                bold(&success_count.to_string()),
                total,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # One receipt, compact JSON on stdout
  receipt2json receipt.jpg

  # Several receipts, pretty JSON, saved as out/<name>_result.json
  receipt2json --pretty -o out/ Dataset/FR*.jpg

  # Reject non-receipts cheaply before full extraction
  receipt2json --two-step photo.png

  # Full pipeline result (usage, metrics, errors) as JSON
  receipt2json --json receipt.jpg > result.json

  # Pin a model and upstream provider
  receipt2json --model meta-llama/llama-4-scout --provider groq receipt.jpg

ENVIRONMENT VARIABLES:
  OPENROUTER_API_KEY    OpenRouter API key (required)
  OPENROUTER_MODEL      Override the model from the config file
  OPENROUTER_PROVIDER   Upstream provider to pin (e.g. groq)
  RECEIPT2JSON_CONFIG   Path to a JSON config file (default: ./config.json if present)
  RUST_LOG              Tracing filter, e.g. receipt2json=debug
"#;

/// Extract structured receipt data from images using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "receipt2json",
    version,
    about = "Extract structured receipt data from images using Vision LLMs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Receipt image files (.jpg, .jpeg, .png, .webp).
    #[arg(required = true)]
    images: Vec<String>,

    /// Validate first, then extract (skips extraction for non-receipts).
    #[arg(long)]
    two_step: bool,

    /// Send the image without JPEG re-encoding (PNG stays PNG).
    #[arg(long)]
    no_optimize: bool,

    /// Indent JSON output.
    #[arg(long)]
    pretty: bool,

    /// Save each extracted record to <DIR>/<image stem>_result.json.
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Print the full pipeline result (success, usage, metrics, error) as JSON.
    #[arg(long)]
    json: bool,

    /// Number of images processed concurrently.
    #[arg(short, long, env = "RECEIPT2JSON_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// JSON configuration file.
    #[arg(long, env = "RECEIPT2JSON_CONFIG")]
    config: Option<PathBuf>,

    /// Model ID (e.g. meta-llama/llama-4-scout).
    #[arg(long, env = "OPENROUTER_MODEL")]
    model: Option<String>,

    /// Upstream provider to pin (OpenRouter provider order).
    #[arg(long, env = "OPENROUTER_PROVIDER")]
    provider: Option<String>,

    /// OpenRouter API key.
    #[arg(long, env = "OPENROUTER_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Disable progress bar.
    #[arg(long)]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all output except errors and data.
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO-level library logs.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build extractor ──────────────────────────────────────────────────
    let config = build_config(&cli)?;
    let api_key = cli
        .api_key
        .clone()
        .context("OpenRouter API key is missing. Set OPENROUTER_API_KEY or pass --api-key.")?;

    let mut extractor =
        Extractor::from_config(config, api_key).context("Failed to initialise extractor")?;
    if show_progress {
        extractor = extractor.with_progress(CliProgressCallback::new() as ProgressCallback);
    }

    // ── Ctrl-C → cancel in-flight pipelines ──────────────────────────────
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("{} interrupted, cancelling…", yellow("⚠"));
                cancel.cancel();
            }
        });
    }

    // ── Run ──────────────────────────────────────────────────────────────
    let results = extractor
        .extract_batch(
            &cli.images,
            !cli.no_optimize,
            cli.two_step,
            cli.concurrency,
            &cancel,
        )
        .await;

    if cli.json {
        print_json(&results, cli.pretty)?;
    } else {
        for (image_ref, result) in &results {
            print_human(image_ref, result, &cli)?;
        }
    }

    if let Some(dir) = &cli.output {
        save_results(dir, &results, cli.quiet).await?;
    }

    // Err from main exits with status 1 after normal teardown.
    check_all_succeeded(&results)
}

fn check_all_succeeded(results: &[(String, PipelineResult)]) -> Result<()> {
    let failed = results.iter().filter(|(_, r)| !r.is_success()).count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} image(s) failed", results.len());
    }
    Ok(())
}

/// Config file (if any), then CLI/env overrides.
fn build_config(cli: &Cli) -> Result<ExtractionConfig> {
    let mut config =
        ExtractionConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(model) = &cli.model {
        config.api.model = model.clone();
    }
    if let Some(provider) = &cli.provider {
        config.api.provider = Some(provider.clone());
    }
    Ok(config)
}

fn to_json<T: serde::Serialize>(value: &T, pretty: bool) -> Result<String> {
    let s = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    s.context("Failed to serialise output")
}

fn print_json(results: &[(String, PipelineResult)], pretty: bool) -> Result<()> {
    let mut values = Vec::with_capacity(results.len());
    for (image_ref, result) in results {
        let mut v = serde_json::to_value(result).context("Failed to serialise result")?;
        v["image"] = serde_json::Value::String(image_ref.clone());
        values.push(v);
    }
    let out = match values.as_slice() {
        [single] => to_json(single, pretty)?,
        _ => to_json(&values, pretty)?,
    };
    println!("{out}");
    Ok(())
}

/// Summary on stderr, extracted data on stdout.
fn print_human(image_ref: &str, result: &PipelineResult, cli: &Cli) -> Result<()> {
    let extraction = match result {
        PipelineResult::Failure(f) => {
            eprintln!("{} {}: {}", red("✗"), bold(image_ref), red(&f.to_string()));
            if let Some(raw) = &f.raw_response {
                eprintln!("{}", dim("raw response:"));
                eprintln!("{raw}");
            }
            return Ok(());
        }
        PipelineResult::Success(e) => e,
    };

    if !cli.quiet {
        eprintln!("\n{} {}", cyan("◆"), bold(image_ref));
        match &extraction.outcome {
            ReceiptOutcome::NotAReceipt(n) => {
                eprintln!("  {} not a receipt: {}", yellow("○"), n.reason);
            }
            ReceiptOutcome::Receipt(r) => {
                let merchant = r
                    .merchant
                    .as_ref()
                    .and_then(|m| m.name.as_deref())
                    .unwrap_or("unknown merchant");
                let category = r
                    .category
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "uncategorised".into());
                eprintln!("  {} {merchant}  {}", green("✓"), dim(&category));
                if let Some(t) = &r.totals {
                    let currency = r
                        .transaction
                        .as_ref()
                        .and_then(|t| t.currency.as_deref())
                        .unwrap_or("");
                    if let Some(total) = t.total {
                        eprintln!("  total        {total:.2} {currency}");
                    }
                    if t.total_matches == Some(false) {
                        eprintln!(
                            "  {} items sum to {:.2}, receipt says {:.2}",
                            yellow("⚠"),
                            t.total_calculated.unwrap_or(0.0),
                            t.total.unwrap_or(0.0)
                        );
                    }
                }
            }
        }
        print_usage(&extraction.usage);
        print_metrics(&extraction.metrics);
    }

    if extraction.outcome.is_receipt() {
        println!("{}", to_json(&extraction.outcome, cli.pretty)?);
    }
    Ok(())
}

fn print_usage(usage: &Usage) {
    match usage {
        Usage::Single(None) => {}
        Usage::Single(Some(u)) => eprintln!("  tokens       {}", u.total_tokens),
        Usage::Combined {
            validation,
            extraction,
            total_tokens,
        } => {
            let n = |u: &Option<receipt2json::StageUsage>| u.map(|u| u.total_tokens).unwrap_or(0);
            eprintln!(
                "  tokens       {total_tokens} {}",
                dim(&format!(
                    "(validation {}, extraction {})",
                    n(validation),
                    n(extraction)
                ))
            );
        }
    }
}

fn print_metrics(metrics: &Metrics) {
    let m: &StageMetrics = metrics.primary();
    if let Some(ms) = m.first_token_latency_ms {
        eprintln!("  first token  {:.3}s", ms as f64 / 1000.0);
    }
    if let Some(ms) = m.generation_time_ms {
        eprintln!("  generation   {:.3}s", ms as f64 / 1000.0);
    }
    if let Some(tps) = m.throughput {
        eprintln!("  throughput   {tps:.1} tokens/s");
    }
    if let Some(cost) = m.cost {
        eprintln!("  cost         ${cost:.6}");
    }
}

/// Write each successful receipt to `<dir>/<stem>_result.json`.
async fn save_results(dir: &Path, results: &[(String, PipelineResult)], quiet: bool) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create output directory {}", dir.display()))?;

    for (image_ref, result) in results {
        let Some(extraction) = result.extraction() else {
            continue;
        };
        let stem = Path::new(image_ref)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "receipt".into());
        let path = dir.join(format!("{stem}_result.json"));
        let json = to_json(&extraction.outcome, true)?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        if !quiet {
            eprintln!("  {} saved {}", green("↳"), path.display());
        }
    }
    Ok(())
}

fn file_name(image_ref: &str) -> String {
    Path::new(image_ref)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| image_ref.to_string())
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars.saturating_sub(1)) {
        Some((i, _)) if s.chars().count() > max_chars => format!("{}\u{2026}", &s[..i]),
        _ => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use receipt2json::{Extraction, Failure, ImageError, NotAReceipt};

    fn ok() -> PipelineResult {
        PipelineResult::Success(Extraction {
            outcome: ReceiptOutcome::NotAReceipt(NotAReceipt {
                reason: "blank".into(),
            }),
            usage: Usage::Single(None),
            metrics: Metrics::Single(StageMetrics::default()),
            raw_response: String::new(),
        })
    }

    fn failed() -> PipelineResult {
        PipelineResult::Failure(Failure::image(ImageError::NotFound {
            path: PathBuf::from("gone.jpg"),
        }))
    }

    #[test]
    fn all_successes_exit_cleanly() {
        let results = vec![("a.jpg".to_string(), ok()), ("b.jpg".to_string(), ok())];
        assert!(check_all_succeeded(&results).is_ok());
    }

    #[test]
    fn any_failure_is_an_error() {
        let results = vec![("a.jpg".to_string(), ok()), ("gone.jpg".to_string(), failed())];
        let err = check_all_succeeded(&results).unwrap_err();
        assert_eq!(err.to_string(), "1 of 2 image(s) failed");
    }

    #[test]
    fn truncate_keeps_short_text() {
        assert_eq!(truncate("short", 80), "short");
        assert_eq!(truncate("abcdef", 4), "abc\u{2026}");
    }
}
