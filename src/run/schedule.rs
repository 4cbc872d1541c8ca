use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::ipc::protocol::{BlockFields, BlockGroupFields, RunFields, TrialFields};

/// Runs to execute in one session, as delivered by the schedule derivation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSchedule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub runs: Vec<RunSchedule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSchedule {
    pub run_id: u32,
    #[serde(default = "default_scan_num")]
    pub scan_num: i32,
    #[serde(default)]
    pub disdaqs: u32,
    #[serde(default = "default_tr_time")]
    pub tr_time: u32,
    pub block_groups: Vec<BlockGroupSchedule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockGroupSchedule {
    pub blk_grp_id: u32,
    pub blocks: Vec<BlockSchedule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockSchedule {
    pub block_id: u32,
    pub trials: Vec<TrialSchedule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialSchedule {
    pub tr_id: u32,
    /// 1-based volume index within the run.
    pub vol: u32,
    /// Replay feature vector; absent when the trial is fed from the scanner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<f64>>,
}

fn default_scan_num() -> i32 {
    -1
}

fn default_tr_time() -> u32 {
    1
}

impl SessionSchedule {
    /// Load a schedule from JSON or TOML, chosen by file extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read schedule {}", path.display()))?;
        let schedule: SessionSchedule = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)
                .with_context(|| format!("invalid schedule {}", path.display()))?,
            _ => serde_json::from_str(&content)
                .with_context(|| format!("invalid schedule {}", path.display()))?,
        };
        schedule.validate()?;
        Ok(schedule)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut run_ids = HashSet::new();
        for run in &self.runs {
            if !run_ids.insert(run.run_id) {
                anyhow::bail!("duplicate run id {}", run.run_id);
            }
            run.validate()?;
        }
        Ok(())
    }
}

impl RunSchedule {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.run_id == 0 {
            anyhow::bail!("run ids start at 1");
        }
        if self.tr_time == 0 {
            anyhow::bail!("run {}: tr_time must be positive", self.run_id);
        }
        if self.block_groups.is_empty() {
            anyhow::bail!("run {} has no block groups", self.run_id);
        }

        let mut group_ids = HashSet::new();
        let mut last_vol: u32 = 0;
        for group in &self.block_groups {
            if !group_ids.insert(group.blk_grp_id) {
                anyhow::bail!(
                    "run {}: duplicate block group {}",
                    self.run_id,
                    group.blk_grp_id
                );
            }
            for block in &group.blocks {
                let mut prev_tr: Option<u32> = None;
                for trial in &block.trials {
                    if let Some(prev) = prev_tr {
                        if prev.checked_add(1) != Some(trial.tr_id) {
                            anyhow::bail!(
                                "run {} block {}: trial {} follows trial {}",
                                self.run_id,
                                block.block_id,
                                trial.tr_id,
                                prev
                            );
                        }
                    }
                    prev_tr = Some(trial.tr_id);

                    // Volumes partition the run across block groups
                    if last_vol.checked_add(1) != Some(trial.vol) {
                        anyhow::bail!(
                            "run {}: volume {} follows volume {}",
                            self.run_id,
                            trial.vol,
                            last_vol
                        );
                    }
                    last_vol = trial.vol;
                }
            }
        }
        if last_vol.checked_add(self.disdaqs / self.tr_time).is_none() {
            anyhow::bail!(
                "run {}: {} disdaqs push volume {} past the largest file number",
                self.run_id,
                self.disdaqs,
                last_vol
            );
        }
        Ok(())
    }

    /// Scanner file number for a volume, skipping the discarded acquisitions.
    pub fn file_num(&self, vol: u32) -> u32 {
        vol.saturating_add(self.disdaqs / self.tr_time.max(1))
    }

    pub fn trial_count(&self) -> usize {
        self.block_groups
            .iter()
            .flat_map(|g| &g.blocks)
            .map(|b| b.trials.len())
            .sum()
    }

    pub fn fields(&self) -> RunFields {
        RunFields {
            run_id: self.run_id,
            scan_num: self.scan_num,
            disdaqs: self.disdaqs,
            tr_time: self.tr_time,
            block_groups: self.block_groups.len(),
        }
    }
}

impl BlockGroupSchedule {
    pub fn fields(&self) -> BlockGroupFields {
        BlockGroupFields {
            blk_grp_id: self.blk_grp_id,
            blocks: self.blocks.len(),
        }
    }
}

impl BlockSchedule {
    pub fn fields(&self) -> BlockFields {
        BlockFields {
            block_id: self.block_id,
            trials: self.trials.len(),
        }
    }
}

impl TrialSchedule {
    pub fn fields(&self, file_num: u32, features: Option<Vec<f64>>) -> TrialFields {
        TrialFields {
            tr_id: self.tr_id,
            vol: self.vol,
            file_num,
            features,
        }
    }
}

/// Maps a scan and file number to the scanner's output filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DicomNaming {
    image_dir: PathBuf,
    pattern: String,
}

impl DicomNaming {
    /// `pattern` must contain two `{}` slots: scan number, then file number.
    pub fn new(image_dir: impl Into<PathBuf>, pattern: impl Into<String>) -> anyhow::Result<Self> {
        let pattern = pattern.into();
        if pattern.matches("{}").count() != 2 {
            anyhow::bail!(
                "name pattern '{}' needs exactly two '{{}}' placeholders",
                pattern
            );
        }
        Ok(Self {
            image_dir: image_dir.into(),
            pattern,
        })
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    pub fn file_name(&self, scan_num: i32, file_num: u32) -> crate::error::Result<PathBuf> {
        if scan_num < 0 {
            return Err(crate::error::RtError::domain(format!(
                "scan number not supplied or invalid: {}",
                scan_num
            )));
        }
        let name = self
            .pattern
            .replacen("{}", &format!("{:02}", scan_num), 1)
            .replacen("{}", &format!("{:03}", file_num), 1);
        Ok(self.image_dir.join(name))
    }

    /// Glob equivalent of the pattern, used to filter watch events.
    pub fn glob(&self) -> String {
        self.pattern.replace("{}", "*")
    }
}
