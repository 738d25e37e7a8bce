use std::fs;
use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use tch::Device;
use tracing::info;

use crate::config::Config;
use crate::dataset::{Dataset, WholeFileDataset};
use crate::generate::{Generator, Sampler};
use crate::loader::{DataLoader, LoaderOptions};
use crate::model::Gpt;
use crate::tokenizer::TextCodec;

/// Continues every file under `datasets/<dataset>/<predict_dir>`.
///
/// Each result lands at `<result_dir>/<relative path>` holding the prompt text
/// followed by the generated continuation, which is also streamed to `out`.
pub fn predict(
    config: &Config,
    model: &Gpt,
    device: Device,
    tokenizer: &dyn TextCodec,
    seed: u64,
    mut out: impl Write,
) -> Result<usize> {
    let dataset = WholeFileDataset::new(&config.dataset_dir(&config.predict.predict_dir), tokenizer)?;
    info!(files = dataset.len(), "loaded prompts");
    let mut loader = DataLoader::new(
        &dataset,
        LoaderOptions {
            batch_size: 1,
            num_workers: config.data.num_workers,
            pin_memory: config.data.pin_memory,
            ..LoaderOptions::default()
        },
    )?;
    let mut generator = Generator::new(
        model,
        device,
        model.sequence(),
        config.data.endoftext,
        Sampler::new(&config.sampling, seed)?,
    );

    let mut written = 0;
    while let Some(batch) = loader.next_batch()? {
        let prompt = Vec::<i64>::try_from(&batch.tokens.get(0))?;
        let relative = &batch.paths[0];
        let path = config.predict.result_dir.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;

        let text = tokenizer.decode(&prompt)?;
        writeln!(out, "<{}>", relative.display())?;
        write!(out, "{}", text)?;
        write!(file, "{}", text)?;
        if prompt.is_empty() {
            info!(path = %relative.display(), "empty prompt, skipped");
        } else {
            generator.stream(tokenizer, &prompt, config.predict.tokens, |piece| {
                write!(out, "{}", piece)?;
                out.flush()?;
                write!(file, "{}", piece)?;
                Ok(())
            })?;
        }
        writeln!(out)?;
        written += 1;
    }
    info!(files = written, dir = %config.predict.result_dir.display(), "predictions written");
    Ok(written)
}

/// Answers one prompt per non-blank input line until the input ends.
///
/// The exchange goes to `out` and to `<result_dir>/conversation.txt`.
pub fn question(
    config: &Config,
    model: &Gpt,
    device: Device,
    tokenizer: &dyn TextCodec,
    seed: u64,
    input: impl BufRead,
    mut out: impl Write,
) -> Result<usize> {
    let mut generator = Generator::new(
        model,
        device,
        model.sequence(),
        config.data.endoftext,
        Sampler::new(&config.sampling, seed)?,
    );
    fs::create_dir_all(&config.question.result_dir)?;
    let path = config.question.result_dir.join("conversation.txt");
    let mut transcript =
        fs::File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;

    let mut answered = 0;
    write!(out, "Question: ")?;
    out.flush()?;
    for line in input.lines() {
        let line = line?;
        let prompt_text = line.trim_end();
        if prompt_text.trim().is_empty() {
            write!(out, "Question: ")?;
            out.flush()?;
            continue;
        }
        writeln!(transcript, "Question: {}", prompt_text)?;
        write!(out, "Answer: ")?;
        write!(transcript, "Answer: ")?;
        let prompt = tokenizer.encode(prompt_text)?;
        generator.stream(tokenizer, &prompt, config.question.tokens, |piece| {
            write!(out, "{}", piece)?;
            out.flush()?;
            write!(transcript, "{}", piece)?;
            Ok(())
        })?;
        writeln!(out, "\n")?;
        writeln!(transcript, "\n")?;
        answered += 1;
        write!(out, "Question: ")?;
        out.flush()?;
    }
    writeln!(out)?;
    Ok(answered)
}
