//! Local task plans for sessions without a flow service.
//!
//! ```toml
//! [[tasks]]
//! id = "outline"
//! title = "Write outline"
//! duration = 10
//! ```

use anyhow::{Context, Result};
use nudgeflow_core::config::get_data_dir;
use nudgeflow_core::FlowTask;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const PLAN_FILE_NAME: &str = "plan.toml";

#[derive(Debug, Deserialize)]
struct PlanFile {
    #[serde(default)]
    tasks: Vec<FlowTask>,
}

/// Where the plan is read from when `--plan` is not given
pub fn default_plan_path() -> Result<PathBuf> {
    Ok(get_data_dir()?.join(PLAN_FILE_NAME))
}

pub fn parse_plan(content: &str) -> Result<Vec<FlowTask>> {
    let plan: PlanFile = toml::from_str(content).context("Invalid plan file")?;
    if plan.tasks.is_empty() {
        anyhow::bail!("The plan contains no tasks");
    }
    Ok(plan.tasks)
}

pub fn load_plan(path: &Path) -> Result<Vec<FlowTask>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan {}", path.display()))?;
    let tasks = parse_plan(&content)?;
    log::debug!("Loaded {} tasks from {}", tasks.len(), path.display());
    Ok(tasks)
}
