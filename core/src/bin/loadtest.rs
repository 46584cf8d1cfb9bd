/// Load test for the credential endpoint and home page
use chatku_core::loadtest::{self, ScenarioReport};
use colored::*;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

struct Options {
    base_url: String,
    scale: f64,
    summary: Option<PathBuf>,
}

fn parse_args(args: &[String]) -> anyhow::Result<Options> {
    let mut options = Options {
        base_url: std::env::var("BASE_URL").unwrap_or_else(|_| "http://127.0.0.1:3000".to_string()),
        scale: 1.0,
        summary: None,
    };

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match args[i].as_str() {
            "--base-url" => {
                options.base_url = value.cloned().ok_or_else(|| anyhow::anyhow!("--base-url requires an argument"))?;
                i += 2;
            }
            "--scale" => {
                options.scale = value
                    .and_then(|v| v.parse::<f64>().ok())
                    .filter(|s| *s > 0.0)
                    .ok_or_else(|| anyhow::anyhow!("--scale requires a positive number"))?;
                i += 2;
            }
            "--summary" => {
                options.summary = Some(PathBuf::from(
                    value.ok_or_else(|| anyhow::anyhow!("--summary requires a path"))?,
                ));
                i += 2;
            }
            other => anyhow::bail!("Unknown argument: {} (expected --base-url, --scale, --summary)", other),
        }
    }
    Ok(options)
}

fn print_report(report: &ScenarioReport) {
    let verdict = if report.passed() { "✓".green().bold() } else { "✗".red().bold() };
    println!(
        "{} {:<10} requests={} failed={} dropped={} p95={:?} p99={:?}",
        verdict,
        report.name.cyan(),
        report.requests,
        report.failures,
        report.dropped,
        report.p95,
        report.p99
    );
    for violation in &report.violations {
        println!("    {}", violation.red());
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args)?;

    let scenarios = loadtest::default_scenarios()
        .into_iter()
        .map(|s| s.scaled(options.scale))
        .collect();
    let reports = loadtest::run(&options.base_url, scenarios).await?;

    for report in &reports {
        print_report(report);
    }
    if let Some(path) = &options.summary {
        std::fs::write(path, serde_json::to_string_pretty(&reports)?)?;
        println!("Summary written to {}", path.display());
    }

    if reports.iter().any(|r| !r.passed()) {
        anyhow::bail!("load test thresholds failed");
    }
    Ok(())
}
