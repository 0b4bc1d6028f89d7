//! Integration test for real llama.cpp inference.
//! Requires MODEL_PATH pointing to a local LLaMA GGUF, or one under ./models.
#![cfg(feature = "llama")]

use std::{env, fs, path::PathBuf};

use llmodel::{Model, Outcome, PromptContext, Variant};
use walkdir::WalkDir;

fn find_model() -> Option<PathBuf> {
    env::var("MODEL_PATH")
        .ok()
        .map(PathBuf::from)
        .filter(|p| fs::metadata(p).is_ok())
        .or_else(|| {
            WalkDir::new("./models")
                .into_iter()
                .filter_map(Result::ok)
                .map(|entry| entry.into_path())
                .find(|p| p.extension().and_then(|s| s.to_str()) == Some("gguf"))
        })
}

#[test]
fn real_inference_streams_tokens_across_turns() -> anyhow::Result<()> {
    let Some(model_path) = find_model() else {
        eprintln!("no model found, set MODEL_PATH or place a .gguf under ./models");
        return Ok(());
    };

    let mut model = Model::new(Variant::Llama);
    model.set_thread_count(4);
    assert!(model.load(&model_path), "failed to load {}", model_path.display());

    // small window so the second turn has to erase
    let mut ctx = PromptContext::new(64);
    ctx.n_predict = 48;
    ctx.n_batch = 16;
    ctx.temp = 0.0;

    let mut texts = String::new();
    let outcome = model.prompt(
        "The capital of France is",
        &mut ctx,
        |_, text| {
            texts.push_str(text);
            true
        },
        |_| true,
    )?;
    assert!(matches!(outcome, Outcome::Done(_)));
    assert!(!texts.is_empty(), "no text generated");
    assert!(ctx.n_past() <= ctx.n_ctx);

    let second = model.prompt_to_string(" And the capital of Italy is", &mut ctx)?;
    assert!(ctx.n_past() <= ctx.n_ctx);
    assert_eq!(ctx.tokens().len(), ctx.logits().len());
    let _ = second;

    Ok(())
}
