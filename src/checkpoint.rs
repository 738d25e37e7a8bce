use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tch::nn::VarStore;
use tracing::info;

use crate::config::Config;

const LATEST: &str = "latest";

/// Layout of `checkpoints/<dataset>/`: `models/`, `model_params/`, `options/`, `log/`.
#[derive(Debug, Clone)]
pub struct Checkpoints {
    root: PathBuf,
}

impl Checkpoints {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Checkpoints { root: root.into() }
    }

    /// `models/epoch_<epoch>.pth`; `epoch` is a number or `"latest"`.
    pub fn model_path(&self, epoch: &str) -> PathBuf {
        self.root.join("models").join(format!("epoch_{}.pth", epoch))
    }

    fn latest_marker(&self) -> PathBuf {
        self.root.join("models").join("latest_epoch.txt")
    }

    pub fn log_path(&self, name: &str) -> PathBuf {
        self.root.join("log").join(format!("{}.txt", name))
    }

    /// Saves the weights as `latest`, and also as `epoch_<epoch>` when `keep` is set.
    pub fn save(&self, vs: &VarStore, epoch: usize, keep: bool) -> Result<()> {
        fs::create_dir_all(self.root.join("models"))?;
        if keep {
            let path = self.model_path(&epoch.to_string());
            vs.save(&path)
                .with_context(|| format!("failed to save {}", path.display()))?;
            info!(path = %path.display(), "saved checkpoint");
        }
        let latest = self.model_path(LATEST);
        vs.save(&latest)
            .with_context(|| format!("failed to save {}", latest.display()))?;
        fs::write(self.latest_marker(), epoch.to_string())?;
        Ok(())
    }

    /// Loads `epoch` into `vs` and returns the epoch number it was saved at.
    pub fn load(&self, vs: &mut VarStore, epoch: &str) -> Result<usize> {
        let path = self.model_path(epoch);
        vs.load(&path)
            .with_context(|| format!("failed to load checkpoint {}", path.display()))?;
        info!(path = %path.display(), "loaded checkpoint");
        let number = if epoch == LATEST {
            fs::read_to_string(self.latest_marker())
                .ok()
                .and_then(|text| text.trim().parse().ok())
                .unwrap_or(0)
        } else {
            epoch
                .parse()
                .with_context(|| format!("epoch must be a number or \"latest\", got {}", epoch))?
        };
        Ok(number)
    }

    /// Writes `model_params/<name>.txt`: parameter count and every variable's shape.
    pub fn write_model_summary(&self, vs: &VarStore, name: &str) -> Result<()> {
        let dir = self.root.join("model_params");
        fs::create_dir_all(&dir)?;
        let mut variables: Vec<_> = vs.variables().into_iter().collect();
        variables.sort_by(|a, b| a.0.cmp(&b.0));
        let total: i64 = variables.iter().map(|(_, t)| t.numel() as i64).sum();
        let mut file = fs::File::create(dir.join(format!("{}.txt", name)))?;
        writeln!(file, "Total number of parameters : {}M\n", total as f64 / 1e6)?;
        for (name, tensor) in &variables {
            writeln!(file, "{} {:?}", name, tensor.size())?;
        }
        info!(parameters = total, "model built");
        Ok(())
    }

    /// Appends the command line and effective configuration to `options/<mode>.txt`.
    pub fn record_options(&self, mode: &str, args: &[String], config: &Config) -> Result<()> {
        let dir = self.root.join("options");
        fs::create_dir_all(&dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{}.txt", mode)))?;
        writeln!(file, "--------------------------------------------")?;
        writeln!(file, "Command Line Arguments: {}", args.join(" "))?;
        writeln!(file, "--------------------------------------------")?;
        writeln!(file, "{}", toml::to_string_pretty(config)?)?;
        Ok(())
    }
}

/// Appends one line per call to a plain-text log, creating parent directories.
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)?;
    Ok(())
}
