use std::path::PathBuf;

use clap::Parser;
use llmodel::PromptContext;

/// Chat with a local model. Every flag can also be set through the environment (or `.env`).
#[derive(Parser, Debug, Clone)]
#[command(name = "llmodel", version)]
pub struct Config {
    #[arg(long = "MODEL_PATH", env = "MODEL_PATH")]
    pub model_path: PathBuf,
    /// Model family: gptj or llama.
    #[arg(long, env, default_value = "llama")]
    pub variant: String,
    /// Compute threads; defaults to the number of CPUs.
    #[arg(long, env)]
    pub threads: Option<usize>,
    #[arg(long, env, default_value_t = 1024)]
    pub n_ctx: usize,
    #[arg(long, env, default_value_t = 128)]
    pub n_predict: usize,
    #[arg(long, env, default_value_t = 40)]
    pub top_k: usize,
    #[arg(long, env, default_value_t = 0.9)]
    pub top_p: f32,
    #[arg(long, env, default_value_t = 0.1)]
    pub temp: f32,
    #[arg(long, env, default_value_t = 8)]
    pub n_batch: usize,
    #[arg(long, env, default_value_t = 1.2)]
    pub repeat_penalty: f32,
    #[arg(long, env, default_value_t = 10)]
    pub repeat_last_n: usize,
    #[arg(long, env, default_value_t = 0.5)]
    pub context_erase: f32,
    /// Seed for the sampler; random when unset.
    #[arg(long, env)]
    pub seed: Option<u64>,
    /// Run a single prompt instead of reading turns from stdin.
    #[arg(long, env, conflicts_with = "prompt_file")]
    pub prompt: Option<String>,
    #[arg(long, env)]
    pub prompt_file: Option<PathBuf>,
    /// Stop a turn once it has run this long.
    #[arg(long, env)]
    pub max_seconds: Option<f64>,
    /// Print a JSON summary line per turn on stderr.
    #[arg(long, env)]
    pub json: bool,
    /// Print Prometheus metrics on exit.
    #[arg(long, env)]
    pub metrics: bool,
}

impl Config {
    pub fn prompt_context(&self) -> PromptContext {
        let mut ctx = PromptContext::new(self.n_ctx);
        ctx.n_predict = self.n_predict;
        ctx.top_k = self.top_k;
        ctx.top_p = self.top_p;
        ctx.temp = self.temp;
        ctx.n_batch = self.n_batch;
        ctx.repeat_penalty = self.repeat_penalty;
        ctx.repeat_last_n = self.repeat_last_n;
        ctx.context_erase = self.context_erase;
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_reach_the_prompt_context() {
        let cfg = Config::try_parse_from([
            "llmodel",
            "--MODEL_PATH",
            "m.gguf",
            "--n-ctx",
            "64",
            "--top-k",
            "5",
            "--context-erase",
            "0.25",
        ])
        .unwrap();
        let ctx = cfg.prompt_context();
        assert_eq!(ctx.n_ctx, 64);
        assert_eq!(ctx.top_k, 5);
        assert_eq!(ctx.context_erase, 0.25);
        assert_eq!(ctx.n_batch, 8);
        assert!(ctx.validate().is_ok());
    }
}
