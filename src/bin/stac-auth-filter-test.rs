//! Filter rule test runner
//!
//! Builds a filter factory exactly as the proxy would, feeds it the contexts
//! from a test file and checks the resulting expression against sample
//! records.
//!
//! ```json
//! {"test_cases": [
//!   {"name": "anonymous", "context": {"req": {...}, "payload": null},
//!    "tests": [[{"id": "a", "properties": {"private": false}}, true]]}
//! ]}
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use serde_json::Value;
use stac_auth_proxy::config::FilterConfig;
use stac_auth_proxy::{FilterFactory, FilterRegistry, RequestContext};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "stac-auth-filter-test")]
#[command(about = "Check a filter configuration against expected record matches")]
#[command(version)]
struct Cli {
    /// Filter class (template, opa, lookup)
    #[arg(long)]
    filter_class: String,

    /// JSON array of positional arguments
    #[arg(long)]
    filter_args: Option<String>,

    /// JSON object of keyword arguments
    #[arg(long)]
    filter_kwargs: Option<String>,

    /// JSON file with test cases
    #[arg(long)]
    test_file: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[derive(Debug, Deserialize)]
struct TestFile {
    #[serde(default)]
    test_cases: Vec<TestCase>,
}

#[derive(Debug, Deserialize)]
struct TestCase {
    name: Option<String>,
    #[serde(default)]
    context: RequestContext,
    tests: Vec<(Value, bool)>,
}

/// Outcome of one test case: `Ok(n)` items checked, or failure lines
async fn run_case(factory: &dyn FilterFactory, case: &TestCase) -> Result<usize, Vec<String>> {
    let expression = match factory.generate(&case.context).await {
        Ok(expression) => expression,
        Err(e) => return Err(vec![format!("failed to generate filter: {}", e)]),
    };
    if let Err(e) = expression.validate() {
        return Err(vec![format!("generated filter {} is invalid: {}", expression, e)]);
    }

    let failures: Vec<String> = case
        .tests
        .iter()
        .enumerate()
        .filter_map(|(idx, (record, expected))| {
            let actual = expression.matches(record);
            (actual != *expected).then(|| {
                let id = record
                    .get("id")
                    .and_then(Value::as_str)
                    .map_or_else(|| format!("#{}", idx), str::to_string);
                format!(
                    "item {}: expected {}, got {} (filter: {})",
                    id, expected, actual, expression
                )
            })
        })
        .collect();

    if failures.is_empty() {
        Ok(case.tests.len())
    } else {
        Err(failures)
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let config = FilterConfig::from_parts(
        &cli.filter_class,
        cli.filter_args.as_deref(),
        cli.filter_kwargs.as_deref(),
    )?;
    let factory = FilterRegistry::builtin()
        .build(&config)
        .with_context(|| format!("Failed to build filter {}", cli.filter_class))?;

    let raw = std::fs::read_to_string(&cli.test_file)
        .with_context(|| format!("Failed to read {}", cli.test_file.display()))?;
    let file: TestFile = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse {}", cli.test_file.display()))?;

    if file.test_cases.is_empty() {
        println!("No test cases found in {}", cli.test_file.display());
        return Ok(false);
    }

    let total = file.test_cases.len();
    let mut failed = 0;
    for (idx, case) in file.test_cases.iter().enumerate() {
        let name = case
            .name
            .clone()
            .unwrap_or_else(|| format!("Test case #{}", idx + 1));
        match run_case(factory.as_ref(), case).await {
            Ok(count) => println!("[{}/{}] PASS {} ({} items)", idx + 1, total, name, count),
            Err(failures) => {
                failed += 1;
                println!("[{}/{}] FAIL {}", idx + 1, total, name);
                for failure in failures {
                    println!("    {}", failure);
                }
            }
        }
    }

    println!();
    println!("{} passed, {} failed", total - failed, failed);
    Ok(failed == 0)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::new(&cli.log_level))
        .init();

    Ok(if run(cli).await? {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
