//! Step and job function execution

use tracing::{debug, info};

use super::Context;
use crate::crd::{Step, Target};
use crate::error::Result;

/// Phase selecting which Steps run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    Initialize,
    Finalize,
}

impl StepPhase {
    /// Whether the step runs in this phase
    pub fn selects(self, step: &Step) -> bool {
        match self {
            StepPhase::Initialize => !step.is_finalize(),
            StepPhase::Finalize => step.is_finalize(),
        }
    }
}

impl Context {
    /// Run the target's steps for a phase, container by container
    ///
    /// Stops at the first failing step.
    pub async fn run_steps(&self, target: &Target, phase: StepPhase) -> Result<()> {
        for container in &target.containers {
            for step in container.steps.iter().filter(|s| phase.selects(s)) {
                debug!(container = %container.name, function = %step.name, phase = ?phase, "Running step");
                self.run_function(&container.name, &step.name).await?;
            }
        }
        info!(target = %target.target_name, phase = ?phase, "Steps completed");
        Ok(())
    }

    /// Run the job functions producing the data of a Job target
    pub async fn run_job_steps(&self, target: &Target) -> Result<()> {
        for container in &target.containers {
            for job in &container.job {
                self.run_function(&container.name, &job.name).await?;
            }
        }
        Ok(())
    }
}
