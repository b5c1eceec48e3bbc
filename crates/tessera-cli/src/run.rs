//! Run command implementation for Tessera CLI.
//!
//! Executes a pre-scheduled plan: a list of stages, each a list of subgraphs.
//! The subgraphs of one stage run concurrently (up to the pool size); a stage
//! starts only after the previous one has fully finished, so any output a
//! stage wires from was published by an earlier stage.

use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tessera_core::{Executor, ExecutorConfig, Subgraph, UnitStatus};
use uuid::Uuid;

use crate::colors;

/// A pre-scheduled execution plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub stages: Vec<Vec<Subgraph>>,
}

impl Plan {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read plan {}: {}", path.display(), e))?;
        Self::parse(&text).map_err(|e| anyhow::anyhow!("invalid plan {}: {}", path.display(), e))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let mut plan: Self = serde_json::from_str(text)?;
        plan.validate()?;
        let run_id = Uuid::new_v4().simple().to_string();
        plan.assign_job_ids(&run_id);
        Ok(plan)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for (stage_idx, stage) in self.stages.iter().enumerate() {
            for subgraph in stage {
                if subgraph.tasks.is_empty() {
                    anyhow::bail!(
                        "stage {}: subgraph {} has no tasks",
                        stage_idx,
                        subgraph.label()
                    );
                }
                if let Some(task) = subgraph.tasks.iter().find(|t| t.name.is_empty()) {
                    anyhow::bail!(
                        "stage {}: subgraph {} has a task without a name ({:?})",
                        stage_idx,
                        subgraph.label(),
                        task.entrypoint
                    );
                }
            }
        }
        Ok(())
    }

    /// Give every anonymous subgraph a job id unique to this run.
    fn assign_job_ids(&mut self, run_id: &str) {
        for (stage_idx, stage) in self.stages.iter_mut().enumerate() {
            for (idx, subgraph) in stage.iter_mut().enumerate() {
                if subgraph.job_id.is_empty() {
                    subgraph.job_id = format!("{}-{}-{}", run_id, stage_idx, idx);
                }
            }
        }
    }

    pub fn subgraph_count(&self) -> usize {
        self.stages.iter().map(Vec::len).sum()
    }
}

/// Execute a plan file.
pub fn execute(plan_path: &Path, config: ExecutorConfig) -> anyhow::Result<()> {
    let start = Instant::now();
    let plan = Plan::load(plan_path)?;

    println!(
        "\n{}Tessera{} - Running {}{}{}",
        colors::BOLD,
        colors::RESET,
        colors::CYAN,
        plan_path.display(),
        colors::RESET
    );
    println!("{}", "─".repeat(50));

    if plan.subgraph_count() == 0 {
        println!("\n{}Plan has no subgraphs.{}", colors::YELLOW, colors::RESET);
        return Ok(());
    }

    let host = config.host_name.clone();
    let mut executor = Executor::new(config)?;
    let mut completed = 0;

    for (stage_idx, stage) in plan.stages.into_iter().enumerate() {
        println!(
            "\n{}Stage {}{} ({} subgraphs)",
            colors::BOLD,
            stage_idx,
            colors::RESET,
            stage.len()
        );

        let mut submitted = Vec::with_capacity(stage.len());
        for subgraph in stage {
            let label = subgraph.label();
            let ctrl_id = match executor.run_at(subgraph, &host) {
                Ok(ctrl_id) => ctrl_id,
                Err(e) => {
                    println!("  {}✗{} {}: {}", colors::RED, colors::RESET, label, e);
                    // Let already started units finish before giving up.
                    executor.join()?;
                    return Err(e.into());
                }
            };
            submitted.push((label, ctrl_id));
        }

        executor.join()?;

        let mut failed = 0;
        for (label, ctrl_id) in &submitted {
            match executor.proc_status(ctrl_id)? {
                Some(UnitStatus::Succeeded) => {
                    completed += 1;
                    println!("  {}✓{} {}", colors::GREEN, colors::RESET, label);
                }
                _ => {
                    failed += 1;
                    let reason = executor
                        .failure_report(ctrl_id)?
                        .map(|report| report.to_string())
                        .unwrap_or_else(|| "worker exited without a report".to_string());
                    println!(
                        "  {}✗{} {}: {}",
                        colors::RED,
                        colors::RESET,
                        label,
                        reason
                    );
                }
            }
        }

        if failed > 0 {
            anyhow::bail!("stage {}: {} of {} subgraphs failed", stage_idx, failed, submitted.len());
        }
    }

    println!("\n{}", "─".repeat(50));
    println!(
        "{}Completed{} {} subgraphs in {:.2}s",
        colors::GREEN,
        colors::RESET,
        completed,
        start.elapsed().as_secs_f64()
    );

    Ok(())
}
