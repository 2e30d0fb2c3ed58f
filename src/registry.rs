//! The explicitly owned root of all scheduling state.

use crate::table::Removed;
use crate::{
    ComponentInstanceId, Config, Error, InstanceScheduler, ResourceTypeId, Result, Task, TaskId,
};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

/// Owns every [`InstanceScheduler`] and the stack of active tasks of each
/// component instance.
///
/// Every call crossing into a component is bracketed by
/// [`start_task`](SchedulerContext::start_task) and
/// [`end_task`](SchedulerContext::end_task).
pub struct SchedulerContext {
    config: Config,
    next_task_id: Cell<u64>,
    instances: RefCell<BTreeMap<ComponentInstanceId, Rc<InstanceScheduler>>>,
    stacks: RefCell<BTreeMap<ComponentInstanceId, Vec<Rc<Task>>>>,
    /// Instances of the started but not yet ended calls, most recent last.
    active: RefCell<Vec<(ComponentInstanceId, TaskId)>>,
}

impl SchedulerContext {
    pub fn new(config: &Config) -> SchedulerContext {
        SchedulerContext {
            config: config.clone(),
            next_task_id: Cell::new(1),
            instances: RefCell::new(BTreeMap::new()),
            stacks: RefCell::new(BTreeMap::new()),
            active: RefCell::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the scheduler for `id`, creating it on first use.
    pub fn instance(&self, id: ComponentInstanceId) -> Rc<InstanceScheduler> {
        self.instances
            .borrow_mut()
            .entry(id)
            .or_insert_with(|| {
                log::debug!("creating scheduler for {id}");
                Rc::new(InstanceScheduler::new(id, &self.config))
            })
            .clone()
    }

    /// Starts a new task for a call into `instance`, pushing it onto that
    /// instance's task stack.
    pub fn start_task(
        &self,
        instance: ComponentInstanceId,
        is_async: bool,
        entry_name: Option<&str>,
    ) -> TaskId {
        let id = TaskId::new(self.next_task_id.get());
        self.next_task_id.set(id.as_u64() + 1);
        let task = Task::new(
            id,
            self.instance(instance),
            is_async,
            entry_name.map(|s| s.to_string()),
        );
        log::debug!(
            "start {id} on {instance} (async: {is_async}, entry: {:?})",
            task.entry_name()
        );
        self.stacks
            .borrow_mut()
            .entry(instance)
            .or_default()
            .push(task);
        self.active.borrow_mut().push((instance, id));
        id
    }

    /// Ends the call which started `expected`, popping it off the task stack of
    /// `instance`.
    ///
    /// Fails if the stack is empty or `expected` isn't the task on top of it.
    pub fn end_task(&self, instance: ComponentInstanceId, expected: TaskId) -> Result<Rc<Task>> {
        let task = {
            let mut stacks = self.stacks.borrow_mut();
            let stack = stacks
                .get_mut(&instance)
                .filter(|s| !s.is_empty())
                .ok_or(Error::EmptyTaskStack(instance))?;
            let found = stack.last().map_or(expected, |t| t.id());
            if found != expected {
                return Err(Error::TaskMismatch { expected, found });
            }
            stack.pop().ok_or(Error::EmptyTaskStack(instance))?
        };
        let mut active = self.active.borrow_mut();
        if let Some(i) = active.iter().rposition(|e| *e == (instance, expected)) {
            active.remove(i);
        }
        log::debug!("end {expected} on {instance}");
        Ok(task)
    }

    /// Ends the most recently started call which hasn't ended yet.
    pub fn end_current_task(&self) -> Result<Rc<Task>> {
        let (instance, task) = self
            .active
            .borrow()
            .last()
            .copied()
            .ok_or(Error::NoCurrentTask)?;
        self.end_task(instance, task)
    }

    /// Looks up an active task of `instance`.
    pub fn task(&self, instance: ComponentInstanceId, id: TaskId) -> Result<Rc<Task>> {
        self.stacks
            .borrow()
            .get(&instance)
            .and_then(|stack| stack.iter().find(|t| t.id() == id))
            .cloned()
            .ok_or(Error::UnknownTask(id, instance))
    }

    pub fn current_task(&self) -> Option<Rc<Task>> {
        let (instance, id) = self.active.borrow().last().copied()?;
        self.task(instance, id).ok()
    }

    pub fn current_task_id(&self) -> Option<TaskId> {
        self.active.borrow().last().map(|(_, id)| *id)
    }

    pub fn current_instance_id(&self) -> Option<ComponentInstanceId> {
        self.active.borrow().last().map(|(instance, _)| *instance)
    }

    /// Requests cancellation of an active task; see [`Task::request_cancel`].
    pub fn request_cancel(&self, instance: ComponentInstanceId, id: TaskId) -> Result<()> {
        self.task(instance, id)?.request_cancel()
    }

    /// Drops a resource handle of `instance`.
    ///
    /// Dropping a borrow releases it from the task it was lent to. Dropping an
    /// owned handle returns the representation whose destructor should run.
    pub fn resource_drop(
        &self,
        instance: ComponentInstanceId,
        ty: ResourceTypeId,
        handle: u32,
    ) -> Result<Option<u32>> {
        let Removed {
            value,
            scope,
            owned,
        } = self.instance(instance).resource_drop(ty, handle)?;
        if let Some(scope) = scope {
            // The lending task may already have ended.
            if let Ok(task) = self.task(instance, scope) {
                task.release_borrow(ty, handle);
            }
        }
        Ok(owned.then_some(value))
    }

    /// Runs one scheduling round on every instance, waking all tasks which
    /// yielded before this call. Returns the number woken.
    pub fn tick(&self) -> Result<usize> {
        let instances: Vec<_> = self.instances.borrow().values().cloned().collect();
        let mut woken = 0;
        for instance in instances {
            woken += instance.run_yielded()?;
        }
        Ok(woken)
    }
}

impl Default for SchedulerContext {
    fn default() -> SchedulerContext {
        SchedulerContext::new(&Config::default())
    }
}
