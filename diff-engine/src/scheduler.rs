//! Cooperative single-threaded task scheduling.
//!
//! Long computations are expressed as tasks that do one bounded unit of
//! work per [`Task::step`]. A [`Scheduler`] advances one task per
//! [`Scheduler::iteration`]; the host calls it from its idle hook.

use std::collections::VecDeque;
use std::fmt;

/// Result of one step of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStep {
    /// Run again later, optionally reporting a status message.
    Continue(Option<String>),
    Done,
}

/// A unit of resumable work.
pub trait Task {
    fn step(&mut self) -> TaskStep;
}

/// Callables are re-queued for as long as they return `true`.
impl<F: FnMut() -> bool> Task for F {
    fn step(&mut self) -> TaskStep {
        if self() {
            TaskStep::Continue(None)
        } else {
            TaskStep::Done
        }
    }
}

/// Handle for removing a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

/// Which queued task runs next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Policy {
    /// Most recently added first, so interactive requests preempt
    /// background work.
    #[default]
    Lifo,
    Fifo,
    /// Every task gets one step in turn.
    RoundRobin,
}

/// A queue of tasks run according to a [`Policy`].
pub struct Scheduler<'t> {
    policy: Policy,
    tasks: VecDeque<(TaskId, Box<dyn Task + 't>)>,
    next_id: u64,
    status: Option<String>,
}

impl fmt::Debug for Scheduler<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("policy", &self.policy)
            .field("tasks", &self.tasks.iter().map(|(id, _)| *id).collect::<Vec<_>>())
            .field("status", &self.status)
            .finish()
    }
}

impl Default for Scheduler<'_> {
    fn default() -> Self {
        Self::new(Policy::default())
    }
}

impl<'t> Scheduler<'t> {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy,
            tasks: VecDeque::new(),
            next_id: 0,
            status: None,
        }
    }

    pub fn lifo() -> Self {
        Self::new(Policy::Lifo)
    }

    pub fn fifo() -> Self {
        Self::new(Policy::Fifo)
    }

    pub fn round_robin() -> Self {
        Self::new(Policy::RoundRobin)
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Queue a task. `at_front` puts it at the opposite end of the queue
    /// from where it would normally go.
    pub fn add_task(&mut self, task: impl Task + 't, at_front: bool) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        let entry = (id, Box::new(task) as Box<dyn Task + 't>);
        if at_front {
            self.tasks.push_front(entry);
        } else {
            self.tasks.push_back(entry);
        }
        id
    }

    /// Run another scheduler as a single task of this one.
    pub fn add_scheduler(&mut self, scheduler: Scheduler<'t>, at_front: bool) -> TaskId {
        self.add_task(scheduler, at_front)
    }

    /// Drop a task by handle. Returns whether it was still queued.
    pub fn remove_task(&mut self, id: TaskId) -> bool {
        let before = self.tasks.len();
        self.tasks.retain(|(task_id, _)| *task_id != id);
        before != self.tasks.len()
    }

    pub fn remove_all_tasks(&mut self) {
        self.tasks.clear();
        self.status = None;
    }

    pub fn tasks_pending(&self) -> bool {
        !self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Latest status message reported by a task.
    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    /// Advance the current task by one step. Returns the number of tasks
    /// still queued.
    pub fn iteration(&mut self) -> usize {
        let taken = match self.policy {
            Policy::Lifo => self.tasks.pop_back(),
            Policy::Fifo | Policy::RoundRobin => self.tasks.pop_front(),
        };
        let Some((id, mut task)) = taken else {
            return 0;
        };

        match task.step() {
            TaskStep::Continue(status) => {
                if status.is_some() {
                    self.status = status;
                }
                match self.policy {
                    Policy::Lifo => self.tasks.push_back((id, task)),
                    Policy::Fifo => self.tasks.push_front((id, task)),
                    Policy::RoundRobin => self.tasks.push_back((id, task)),
                }
            }
            TaskStep::Done => {
                tracing::trace!(task = id.0, remaining = self.tasks.len(), "task finished");
            }
        }
        self.tasks.len()
    }

    /// Step until no tasks remain.
    pub fn run_until_idle(&mut self) {
        while self.iteration() > 0 {}
    }
}

impl Task for Scheduler<'_> {
    fn step(&mut self) -> TaskStep {
        if self.iteration() > 0 {
            TaskStep::Continue(self.status.clone())
        } else {
            TaskStep::Done
        }
    }
}

/// The environment a [`Runner`] drives its scheduler from.
pub trait SchedulerHost {
    /// Start calling [`Runner::on_idle`] whenever the host is idle.
    fn arm_idle(&mut self);
    fn disarm_idle(&mut self);
    fn progress(&mut self, status: Option<&str>);
    /// Activity indicator tick.
    fn pulse(&mut self) {}
}

/// Connects a scheduler to a host idle hook, arming the hook when work
/// arrives and disarming it once the queue drains.
pub struct Runner<'t, H> {
    scheduler: Scheduler<'t>,
    host: H,
    armed: bool,
}

impl<'t, H: SchedulerHost> Runner<'t, H> {
    pub fn new(scheduler: Scheduler<'t>, host: H) -> Self {
        Self {
            scheduler,
            host,
            armed: false,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn scheduler(&self) -> &Scheduler<'t> {
        &self.scheduler
    }

    pub fn add_task(&mut self, task: impl Task + 't, at_front: bool) -> TaskId {
        let id = self.scheduler.add_task(task, at_front);
        if !self.armed {
            self.host.arm_idle();
            self.armed = true;
        }
        id
    }

    pub fn remove_task(&mut self, id: TaskId) -> bool {
        let removed = self.scheduler.remove_task(id);
        self.disarm_if_idle();
        removed
    }

    pub fn remove_all_tasks(&mut self) {
        self.scheduler.remove_all_tasks();
        self.disarm_if_idle();
    }

    fn disarm_if_idle(&mut self) {
        if self.armed && !self.scheduler.tasks_pending() {
            self.host.disarm_idle();
            self.host.progress(None);
            self.armed = false;
        }
    }

    /// One idle callback. Returns whether the hook should stay armed.
    pub fn on_idle(&mut self) -> bool {
        let remaining = self.scheduler.iteration();
        self.host.progress(self.scheduler.status());
        self.host.pulse();
        if remaining == 0 {
            self.disarm_if_idle();
        }
        self.armed
    }

    pub fn run_until_idle(&mut self) {
        while self.on_idle() {}
    }
}
