mod config;

use std::fs;
use std::io::{self, BufRead, Write};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::Parser;
use config::Config;
use dotenvy::dotenv;
use hdrhistogram::Histogram;
use llmodel::{sampler, Model, Outcome, PromptContext};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Serialize)]
struct TurnSummary {
    outcome: Outcome,
    tokens: usize,
    n_past: usize,
    elapsed_ms: u128,
    p50_token_us: u64,
    p95_token_us: u64,
    p99_token_us: u64,
}

fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let cfg = Config::parse();

    // logs go to stderr, stdout carries the generated text
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_writer(io::stderr).init();

    let metrics = if cfg.metrics {
        Some(PrometheusBuilder::new().install_recorder().context("install metrics recorder")?)
    } else {
        None
    };

    if let Some(seed) = cfg.seed {
        sampler::reseed_shared(seed);
    }

    let mut model = Model::create(&cfg.variant)?;
    if let Some(n) = cfg.threads {
        model.set_thread_count(n);
    }
    if !model.load(&cfg.model_path) {
        bail!("failed to load {} model from {}", model.variant(), cfg.model_path.display());
    }
    tracing::info!(variant = %model.variant(), threads = model.thread_count(), "model ready");

    let mut ctx = cfg.prompt_context();
    let single = match (&cfg.prompt, &cfg.prompt_file) {
        (Some(prompt), _) => Some(prompt.clone()),
        (None, Some(path)) => Some(
            fs::read_to_string(path).with_context(|| format!("read prompt file {:?}", path))?,
        ),
        (None, None) => None,
    };

    match single {
        Some(prompt) => run_turn(&mut model, &mut ctx, &prompt, &cfg)?,
        None => {
            // one line per turn, all sharing the same context
            for line in io::stdin().lock().lines() {
                let line = line.context("read stdin")?;
                if line.trim().is_empty() {
                    continue;
                }
                run_turn(&mut model, &mut ctx, &line, &cfg)?;
            }
        }
    }

    if let Some(handle) = metrics {
        eprintln!("{}", handle.render());
    }
    Ok(())
}

fn run_turn(model: &mut Model, ctx: &mut PromptContext, prompt: &str, cfg: &Config) -> anyhow::Result<()> {
    let deadline = cfg
        .max_seconds
        .and_then(|s| Duration::try_from_secs_f64(s).ok())
        .map(|d| Instant::now() + d);
    let in_time = || deadline.map_or(true, |d| Instant::now() < d);

    let mut hist = Histogram::<u64>::new(3)?;
    let mut stdout = io::stdout().lock();
    let mut produced = 0usize;
    let started = Instant::now();
    let mut last = started;

    let outcome = model.prompt(
        prompt,
        ctx,
        |_, text| {
            hist.record(last.elapsed().as_micros() as u64).ok();
            last = Instant::now();
            produced += 1;
            if write!(stdout, "{text}").and_then(|_| stdout.flush()).is_err() {
                return false;
            }
            in_time()
        },
        |recalculating| {
            if recalculating {
                tracing::info!("context window full, recalculating");
            }
            in_time()
        },
    )?;
    writeln!(stdout)?;

    if cfg.json {
        let summary = TurnSummary {
            outcome,
            tokens: produced,
            n_past: ctx.n_past(),
            elapsed_ms: started.elapsed().as_millis(),
            p50_token_us: hist.value_at_quantile(0.50),
            p95_token_us: hist.value_at_quantile(0.95),
            p99_token_us: hist.value_at_quantile(0.99),
        };
        eprintln!("{}", serde_json::to_string(&summary)?);
    } else {
        tracing::info!(?outcome, tokens = produced, n_past = ctx.n_past(), "turn finished");
    }
    Ok(())
}
