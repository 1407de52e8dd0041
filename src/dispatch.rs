//! Walks a stack at one lifecycle phase.

use crate::handle::SpankHandle;
use crate::job::JobContext;
use crate::stack::Stack;
use crate::{Context, SpankError};
use std::fmt;
use std::os::raw::c_int;
use thiserror::Error;
use tracing::{debug, error, trace};

/// Lifecycle points at which plugin callbacks run, in the order a job
/// normally goes through them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Phase {
    Init,
    JobProlog,
    InitPostOpt,
    LocalUserInit,
    StepUserInit,
    StepTaskInitPriv,
    StepUserTaskInit,
    StepTaskPostFork,
    StepTaskExit,
    JobEpilog,
    SlurmdExit,
    Exit,
}

impl Phase {
    pub const COUNT: usize = 12;

    pub const ALL: [Phase; Phase::COUNT] = [
        Phase::Init,
        Phase::JobProlog,
        Phase::InitPostOpt,
        Phase::LocalUserInit,
        Phase::StepUserInit,
        Phase::StepTaskInitPriv,
        Phase::StepUserTaskInit,
        Phase::StepTaskPostFork,
        Phase::StepTaskExit,
        Phase::JobEpilog,
        Phase::SlurmdExit,
        Phase::Exit,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::JobProlog => "job_prolog",
            Phase::InitPostOpt => "init_post_opt",
            Phase::LocalUserInit => "local_user_init",
            Phase::StepUserInit => "user_init",
            Phase::StepTaskInitPriv => "task_init_privileged",
            Phase::StepUserTaskInit => "task_init",
            Phase::StepTaskPostFork => "task_post_fork",
            Phase::StepTaskExit => "task_exit",
            Phase::JobEpilog => "job_epilog",
            Phase::SlurmdExit => "slurmd_exit",
            Phase::Exit => "exit",
        }
    }

    /// Entry point a plugin exports for this phase.
    pub fn symbol(self) -> &'static str {
        match self {
            Phase::Init => "slurm_spank_init",
            Phase::JobProlog => "slurm_spank_job_prolog",
            Phase::InitPostOpt => "slurm_spank_init_post_opt",
            Phase::LocalUserInit => "slurm_spank_local_user_init",
            Phase::StepUserInit => "slurm_spank_user_init",
            Phase::StepTaskInitPriv => "slurm_spank_task_init_privileged",
            Phase::StepUserTaskInit => "slurm_spank_task_init",
            Phase::StepTaskPostFork => "slurm_spank_task_post_fork",
            Phase::StepTaskExit => "slurm_spank_task_exit",
            Phase::JobEpilog => "slurm_spank_job_epilog",
            Phase::SlurmdExit => "slurm_spank_slurmd_exit",
            Phase::Exit => "slurm_spank_exit",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    /// Tasks have been started once these phases are reached.
    pub fn tasks_execd(self) -> bool {
        matches!(
            self,
            Phase::StepTaskPostFork | Phase::StepTaskExit | Phase::Exit
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("spank: no plugin stack: {}", SpankError::BadArg)]
    NoStack,
    #[error("spank: required plugin {plugin}: {phase}() failed with rc={rc}")]
    Required {
        plugin: String,
        phase: Phase,
        rc: c_int,
    },
}

impl CallError {
    /// Status reported to the host process.
    pub fn rc(&self) -> c_int {
        match self {
            CallError::NoStack => u32::from(SpankError::BadArg) as c_int,
            CallError::Required { rc, .. } => *rc,
        }
    }
}

/// Invokes the `phase` callback of every plugin of `stack`, in load order.
///
/// A failing optional plugin is ignored. The first failing required plugin
/// stops the walk and its status is returned; at [`Phase::Init`] a plugin
/// exporting `slurm_spank_init_failure_mode` gets that value reported instead.
pub fn call_stack(
    stack: Option<&mut Stack>,
    phase: Phase,
    mut job: JobContext<'_>,
    taskid: Option<usize>,
) -> Result<(), CallError> {
    let stack = stack.ok_or(CallError::NoStack)?;

    let task = match (stack.kind(), job.step()) {
        (Context::Remote, Some(step)) => taskid.filter(|&t| t < step.tasks.len()),
        _ => None,
    };

    for idx in 0..stack.plugins().len() {
        let plugin = &stack.plugins()[idx];
        let entry = match plugin.ops().get(phase) {
            Some(entry) => entry.clone(),
            None => continue,
        };
        let argv = plugin.argv_shared();
        let name = plugin.basename();
        let required = plugin.required();
        let failure_mode = plugin.ops().init_failure_mode();

        let rc = {
            let mut handle = SpankHandle::new(&mut *stack, idx, phase, job.reborrow(), task);
            entry(&mut handle, &argv)
        };
        trace!("spank: {}: {} = {}", name, phase, rc);

        if rc == 0 {
            continue;
        }

        if !required {
            debug!("spank: optional plugin {}: {}() failed with rc={}", name, phase, rc);
            continue;
        }

        error!("spank: required plugin {}: {}() failed with rc={}", name, phase, rc);
        let rc = match (phase, failure_mode) {
            (Phase::Init, Some(mode)) => mode,
            _ => rc,
        };
        return match rc {
            0 => Ok(()),
            rc => Err(CallError::Required {
                plugin: name,
                phase,
                rc,
            }),
        };
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_map_to_their_symbols() {
        assert_eq!(Phase::StepUserInit.symbol(), "slurm_spank_user_init");
        assert_eq!(Phase::StepUserTaskInit.symbol(), "slurm_spank_task_init");
        assert_eq!(Phase::StepTaskInitPriv.to_string(), "task_init_privileged");
        for (idx, phase) in Phase::ALL.iter().enumerate() {
            assert_eq!(phase.index(), idx);
            assert!(crate::sys::SPANK_SYMS.contains(&phase.symbol()));
        }
    }

    #[test]
    fn missing_stack_is_a_bad_argument() {
        let err = call_stack(None, Phase::Init, JobContext::None, None).unwrap_err();
        assert_eq!(err, CallError::NoStack);
        assert_eq!(err.rc(), 2);
    }
}
