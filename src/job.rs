//! Job and task records handed to plugin callbacks.

use libc::{gid_t, pid_t, uid_t};

/// Job option type of options forwarded by the stack.
pub const OPT_TYPE_SPANK: u32 = 0x4400;

/// A generic job option carried by the launch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptionInfo {
    pub kind: u32,
    pub option: String,
    pub optarg: Option<String>,
}

impl JobOptionInfo {
    pub fn spank(option: &str, optarg: Option<&str>) -> Self {
        JobOptionInfo {
            kind: OPT_TYPE_SPANK,
            option: option.to_string(),
            optarg: optarg.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepLayout {
    pub node_cnt: u32,
    pub task_cnt: u32,
}

/// What srun knows about the step it launches.
#[derive(Debug, Clone, Default)]
pub struct LauncherJobInfo {
    pub uid: uid_t,
    pub gid: gid_t,
    pub jobid: u32,
    pub stepid: u32,
    pub step_layout: Option<StepLayout>,
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskInfo {
    /// Node local task id.
    pub id: i32,
    /// Global task id.
    pub gtid: u32,
    pub pid: pid_t,
    pub exited: bool,
    pub estatus: i32,
    pub argv: Vec<String>,
}

/// A job step as seen by slurmstepd.
#[derive(Debug, Clone, Default)]
pub struct StepRecord {
    pub job_id: u32,
    pub step_id: u32,
    pub uid: uid_t,
    pub gid: gid_t,
    pub gids: Vec<gid_t>,
    pub array_job_id: u32,
    pub array_task_id: u32,
    pub nnodes: u32,
    pub nodeid: u32,
    /// Total number of tasks in the step.
    pub ntasks: u32,
    pub cpus: u16,
    pub cpus_per_task: u32,
    pub argv: Vec<String>,
    pub env: Vec<String>,
    /// Tasks running on this node.
    pub tasks: Vec<TaskInfo>,
    pub job_alloc_cores: Option<String>,
    pub step_alloc_cores: Option<String>,
    pub job_mem: u64,
    pub step_mem: u64,
    pub restart_cnt: u32,
    pub options: Vec<JobOptionInfo>,
}

impl StepRecord {
    pub fn node_tasks(&self) -> u32 {
        self.tasks.len() as u32
    }

    pub fn task_by_pid(&self, pid: pid_t) -> Option<&TaskInfo> {
        self.tasks.iter().find(|t| t.pid == pid)
    }
}

/// Job information in prolog/epilog context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobScriptInfo {
    pub jobid: u32,
    pub uid: uid_t,
    pub gid: gid_t,
}

/// The job a phase is dispatched for. Which variant is meaningful depends on
/// the context of the stack.
#[derive(Debug, Default)]
pub enum JobContext<'a> {
    #[default]
    None,
    Launcher(&'a mut LauncherJobInfo),
    Step(&'a mut StepRecord),
    Script(&'a JobScriptInfo),
}

impl<'a> JobContext<'a> {
    pub fn is_none(&self) -> bool {
        matches!(self, JobContext::None)
    }

    /// Borrows the same job for a shorter lifetime.
    pub fn reborrow(&mut self) -> JobContext<'_> {
        match self {
            JobContext::None => JobContext::None,
            JobContext::Launcher(job) => JobContext::Launcher(&mut **job),
            JobContext::Step(step) => JobContext::Step(&mut **step),
            JobContext::Script(info) => JobContext::Script(*info),
        }
    }

    pub fn step(&self) -> Option<&StepRecord> {
        match self {
            JobContext::Step(step) => Some(&**step),
            _ => None,
        }
    }

    pub fn step_mut(&mut self) -> Option<&mut StepRecord> {
        match self {
            JobContext::Step(step) => Some(&mut **step),
            _ => None,
        }
    }

    pub fn launcher(&self) -> Option<&LauncherJobInfo> {
        match self {
            JobContext::Launcher(job) => Some(&**job),
            _ => None,
        }
    }

    pub fn script(&self) -> Option<&JobScriptInfo> {
        match self {
            JobContext::Script(info) => Some(*info),
            _ => None,
        }
    }
}
