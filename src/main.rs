mod analyzer;
mod config;
mod gateway;
mod models;
mod pool;
mod prompts;
mod report;
mod runner;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Backend, Config};
use gateway::{ApiGateway, CliGateway, LlmGateway, ModelParams};
use models::TestSet;
use pool::TaskPool;
use report::{HtmlReport, ReportMeta};
use runner::{EvalEvent, EvaluationRunner};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Re-run a prompt test set against a candidate configuration and grade
/// the drift from the frozen baseline outputs.
#[derive(Parser)]
#[command(name = "promptlab-eval", version)]
struct Args {
    /// Path to the JSON test set
    test_set: PathBuf,

    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "promptlab.toml")]
    config: PathBuf,

    /// Candidate system prompt; defaults to the test set's baseline prompt
    #[arg(short, long)]
    system_prompt: Option<String>,

    /// Candidate model, overriding the configuration
    #[arg(short, long)]
    model: Option<String>,

    /// Write an HTML report to this path
    #[arg(short, long)]
    report: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = Config::from_file(&args.config)?;
    let test_set = TestSet::from_file(&args.test_set)?;

    let gateway: Arc<dyn LlmGateway> = match config.backend {
        Backend::Cli => Arc::new(CliGateway::new()),
        Backend::Api => Arc::new(ApiGateway::new(
            config.api_endpoint.clone(),
            config.env_var_api_key.clone(),
        )),
    };

    let workers = config.workers.unwrap_or_else(pool::default_workers);
    let pool = Arc::new(TaskPool::new(workers));

    let params = ModelParams {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens),
        top_p: config.top_p,
    };
    let model_id = args.model.unwrap_or_else(|| config.model.clone());
    let candidate_prompt = args
        .system_prompt
        .unwrap_or_else(|| test_set.system_prompt.clone());

    let mut runner = EvaluationRunner::new(
        Arc::clone(&gateway),
        Arc::clone(&pool),
        config.embed_model.clone(),
        config.grading_model.clone(),
        params,
    );

    // Ctrl-C raises the cooperative cancel flags; in-flight calls finish
    // but nothing new starts and their results are discarded.
    let cancel = runner.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancelling run...");
            cancel.cancel();
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                EvalEvent::Progress { completed, total } => {
                    println!("[{completed}/{total}] cases done");
                }
                EvalEvent::Row(result) => {
                    println!(
                        "  similarity {:.2}, grade: {}",
                        result.similarity_score, result.llm_grade
                    );
                }
                EvalEvent::CaseFailed { title, message } => {
                    eprintln!("  {title} failed: {message}");
                }
                EvalEvent::Finished => println!("Run finished."),
                EvalEvent::Cancelled => println!("Run cancelled."),
            }
        }
    });

    runner
        .run_evaluation(&test_set, &candidate_prompt, &model_id, &tx)
        .await?;
    drop(tx);
    let _ = printer.await;

    for index in 0..runner.results().len() {
        if args.verbose {
            println!("\n=== Case {} ===\n{}", index + 1, runner.analysis_text(index));
        } else {
            println!("\nCase {}: {}", index + 1, runner.feedback_text(index));
        }
    }

    if let Some(report_path) = &args.report {
        let meta = ReportMeta {
            test_set_name: test_set.name.clone(),
            baseline_system_prompt: test_set.system_prompt.clone(),
            candidate_system_prompt: candidate_prompt,
            model_id,
        };
        let html = HtmlReport::generate(runner.results(), &meta);
        std::fs::write(report_path, html)
            .with_context(|| format!("Failed to write report: {}", report_path.display()))?;
        println!("Report written to {}", report_path.display());
    }

    pool.shutdown().await;
    Ok(())
}
