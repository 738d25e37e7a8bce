use anyhow::{Result, anyhow, ensure};
use rand::{SeedableRng, distributions::Distribution, distributions::WeightedIndex, rngs::StdRng};
use tch::{Device, IndexOp, Kind::Float, Tensor, nn::ModuleT};

use crate::{config::SamplingConfig, tokenizer::TextCodec};

/// Temperature + top-k categorical sampling with its own seeded generator.
#[derive(Debug)]
pub struct Sampler {
    temperature: f64,
    topk: i64,
    rng: StdRng,
}

impl Sampler {
    pub fn new(config: &SamplingConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        Ok(Sampler {
            temperature: config.temperature,
            topk: config.topk,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Softmax over the `min(topk, vocab)` highest scaled logits; every other
    /// entry is exactly zero.
    pub fn probabilities(&self, logits: &Tensor) -> Tensor {
        let logits = logits / self.temperature;
        let vocab = logits.size().last().copied().unwrap_or(0);
        let (top_logits, top_indices) = logits.topk(self.topk.min(vocab), -1, true, true);
        logits
            .full_like(f64::NEG_INFINITY)
            .scatter(-1, &top_indices, &top_logits)
            .softmax(-1, Float)
    }

    /// Draws one token id from last-position `logits` of shape `[vocab]`.
    pub fn sample(&mut self, logits: &Tensor) -> Result<i64> {
        let probs = self.probabilities(logits).to_device(Device::Cpu);
        let probs = Vec::<f32>::try_from(&probs)?;
        let dist = WeightedIndex::new(&probs).map_err(|err| anyhow!(err.to_string()))?;
        Ok(dist.sample(&mut self.rng) as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfText,
    Budget,
    Failed,
}

/// Drives a model autoregressively with a sliding context window.
pub struct Generator<'m, M: ModuleT> {
    model: &'m M,
    device: Device,
    sequence: i64,
    endoftext: i64,
    sampler: Sampler,
}

impl<'m, M: ModuleT> Generator<'m, M> {
    pub fn new(model: &'m M, device: Device, sequence: i64, endoftext: i64, sampler: Sampler) -> Self {
        Generator {
            model,
            device,
            sequence,
            endoftext,
            sampler,
        }
    }

    /// Starts a generation seeded with `prompt`, stopping at end-of-text or
    /// after `budget` sampled tokens.
    pub fn generate(&mut self, prompt: &[i64], budget: usize) -> Result<Generation<'_, M>> {
        ensure!(!prompt.is_empty(), "prompt must contain at least one token");
        // Turn the tokens into [1, seq_len]
        let context = Tensor::from_slice(prompt).to_device(self.device).unsqueeze(0);
        Ok(Generation {
            // Disable gradient tracking since we're not training now.
            _no_grad_guard: tch::no_grad_guard(),
            model: self.model,
            sampler: &mut self.sampler,
            context,
            sequence: self.sequence,
            endoftext: self.endoftext,
            budget,
            steps: 0,
            stop: None,
        })
    }

    /// Generates from `prompt`, handing each token's decoded text to `emit`
    /// as soon as it is sampled. Returns the sampled ids.
    pub fn stream(
        &mut self,
        tokenizer: &dyn TextCodec,
        prompt: &[i64],
        budget: usize,
        mut emit: impl FnMut(&str) -> Result<()>,
    ) -> Result<Vec<i64>> {
        let mut sampled = Vec::new();
        for id in self.generate(prompt, budget)? {
            let id = id?;
            emit(&tokenizer.decode(&[id])?)?;
            sampled.push(id);
        }
        Ok(sampled)
    }
}

/// One prompt's worth of decoding; yields sampled ids until it stops.
pub struct Generation<'a, M: ModuleT> {
    _no_grad_guard: tch::NoGradGuard,
    model: &'a M,
    sampler: &'a mut Sampler,
    context: Tensor,
    sequence: i64,
    endoftext: i64,
    budget: usize,
    steps: usize,
    stop: Option<StopReason>,
}

impl<M: ModuleT> Generation<'_, M> {
    /// Samples the next token; `None` when it is end-of-text.
    fn step(&mut self) -> Result<Option<i64>> {
        // Keep only the trailing window the model accepts
        let len = self.context.size()[1];
        if len > self.sequence {
            self.context = self.context.narrow(1, len - self.sequence, self.sequence);
        }
        // [1, seq_len, vocab] -> [vocab] for the last position
        let logits = self.model.forward_t(&self.context, false);
        let id = self.sampler.sample(&logits.i((0, -1, ..)))?;
        if id == self.endoftext {
            return Ok(None);
        }
        let next = Tensor::from_slice(&[id]).to_device(self.context.device()).unsqueeze(0);
        self.context = Tensor::cat(&[&self.context, &next], 1);
        Ok(Some(id))
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Current context `[1, len]`, including sampled tokens.
    pub fn context(&self) -> &Tensor {
        &self.context
    }
}

impl<M: ModuleT> Iterator for Generation<'_, M> {
    type Item = Result<i64>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stop.is_some() {
            return None;
        }
        if self.steps >= self.budget {
            self.stop = Some(StopReason::Budget);
            return None;
        }
        self.steps += 1;
        match self.step() {
            Ok(Some(id)) => Some(Ok(id)),
            Ok(None) => {
                self.stop = Some(StopReason::EndOfText);
                None
            }
            Err(err) => {
                self.stop = Some(StopReason::Failed);
                Some(Err(err))
            }
        }
    }
}
