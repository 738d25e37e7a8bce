use anyhow::Result;
use tch::{
    Device, Tensor,
    nn::{Adam, ModuleT, Optimizer, OptimizerConfig, VarStore},
};
use tracing::{info, warn};

use crate::checkpoint::{Checkpoints, append_line};
use crate::config::Config;
use crate::dataset::{Dataset, WindowedDataset};
use crate::evaluate::{criterion, mean_loss};
use crate::loader::{DataLoader, LoaderOptions};
use crate::loss::CrossEntropy;
use crate::model::Gpt;
use crate::runtime::load_model;
use crate::tokenizer::TextCodec;

pub struct Trainer<'c> {
    config: &'c Config,
    device: Device,
    var_store: VarStore,
    model: Gpt,
    optimizer: Optimizer,
    criterion: CrossEntropy,
    checkpoints: Checkpoints,
    /// Last completed epoch; training continues from the one after it.
    epoch: usize,
}

impl<'c> Trainer<'c> {
    /// Builds a fresh model, or restores `train.load_epoch` when set.
    pub fn new(config: &'c Config, device: Device, checkpoints: Checkpoints) -> Result<Trainer<'c>> {
        let (var_store, model, epoch) =
            load_model(config, device, &checkpoints, config.train.load_epoch.as_deref())?;
        let optimizer = Adam {
            beta1: config.train.beta1,
            beta2: config.train.beta2,
            ..Adam::default()
        }
        .build(&var_store, config.train.lr)?;
        Ok(Trainer {
            config,
            device,
            var_store,
            model,
            optimizer,
            criterion: criterion(config),
            checkpoints,
            epoch,
        })
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    // Train until `train.epochs`, validating and checkpointing on the configured schedule.
    pub fn train(&mut self, train_set: &WindowedDataset, valid_set: Option<&WindowedDataset>) -> Result<()> {
        let config = self.config;
        let (train_cfg, data_cfg) = (&config.train, &config.data);
        let mut loader = DataLoader::new(
            train_set,
            LoaderOptions {
                batch_size: train_cfg.batch_size,
                shuffle: train_cfg.shuffle,
                num_workers: data_cfg.num_workers,
                pin_memory: data_cfg.pin_memory,
                drop_last: train_cfg.drop_last,
                seed: config.seed,
            },
        )?;
        let valid_set = valid_set.filter(|set| {
            if set.is_empty() {
                warn!("validation set is empty, validation is skipped");
            }
            !set.is_empty()
        });
        let mut valid_loader = valid_set
            .map(|set| {
                DataLoader::new(
                    set,
                    LoaderOptions {
                        batch_size: train_cfg.valid_batch_size,
                        num_workers: data_cfg.num_workers,
                        pin_memory: data_cfg.pin_memory,
                        ..LoaderOptions::default()
                    },
                )
            })
            .transpose()?;
        info!(
            windows = train_set.len(),
            batches = loader.batches_per_epoch(),
            from = self.epoch + 1,
            to = train_cfg.epochs,
            "training"
        );

        for epoch in self.epoch + 1..=train_cfg.epochs {
            let loss = self.train_epoch(&mut loader)?;
            info!(epoch, loss, "epoch finished");
            append_line(
                &self.checkpoints.log_path("train"),
                &format!("epoch:{} loss:{}", epoch, loss),
            )?;

            self.checkpoints
                .save(&self.var_store, epoch, epoch % train_cfg.save_epoch == 0)?;
            self.epoch = epoch;

            if let Some(valid_loader) = valid_loader.as_mut() {
                if epoch % train_cfg.valid_freq == 0 {
                    let valid_loss =
                        mean_loss(&self.model, valid_loader, &self.criterion, self.device, |_, _| Ok(()))?;
                    info!(epoch, loss = valid_loss, "validation");
                    append_line(
                        &self.checkpoints.log_path("valid"),
                        &format!("epoch:{} loss:{}", epoch, valid_loss),
                    )?;
                }
            }
        }
        Ok(())
    }

    // Perform one epoch, returning the mean batch loss.
    fn train_epoch(&mut self, loader: &mut DataLoader<'_, WindowedDataset>) -> Result<f64> {
        let mut total_loss = 0.0;
        let mut batches = 0;
        while let Some(batch) = loader.next_batch()? {
            batches += 1;
            total_loss += self.train_step(&batch.inputs, &batch.targets)?;
        }
        if batches == 0 {
            return Ok(0.0);
        }
        Ok(total_loss / batches as f64)
    }

    // Perform one training step on `[batch, seq_len]` inputs and targets.
    fn train_step(&mut self, inputs: &Tensor, targets: &Tensor) -> Result<f64> {
        let inputs = inputs.to_device(self.device);
        let targets = targets.to_device(self.device);
        // [batch, seq_len, vocab]
        let logits = self.model.forward_t(&inputs, true);
        let loss = self.criterion.loss(&logits, &targets);
        // backprop gradients, apply Adam update rule
        self.optimizer.backward_step(&loss);
        Ok(f64::try_from(&loss)?)
    }
}

/// Tokenizes the configured training (and validation) corpora and trains.
pub fn run(config: &Config, device: Device, tokenizer: &dyn TextCodec) -> Result<()> {
    let checkpoints = Checkpoints::new(config.checkpoint_dir());
    let load = |dir: &str| {
        WindowedDataset::new(
            &config.dataset_dir(dir),
            tokenizer,
            config.model.sequence as usize,
            config.data.stride,
            config.data.endoftext,
            config.data.padding,
        )
    };
    let train_set = load(&config.train.train_dir)?;
    let valid_set = if config.train.valid {
        Some(load(&config.train.valid_dir)?)
    } else {
        None
    };
    let mut trainer = Trainer::new(config, device, checkpoints.clone())?;
    checkpoints.write_model_summary(&trainer.var_store, "GPT")?;
    trainer.train(&train_set, valid_set.as_ref())
}
