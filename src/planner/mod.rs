//! Ordered install/uninstall task execution
//!
//! A planner is the list of steps needed to bring a ControlPlane's
//! infrastructure up (init) or tear it down (deinit). Tasks run strictly in
//! order and the first failure stops the run. Every task is idempotent, so a
//! failed run is retried from the top on the next reconcile.

mod client;
mod etcd;

use async_trait::async_trait;
use tracing::{debug, error, info};

#[cfg(test)]
use mockall::automock;

use crate::crd::ControlPlane;
use crate::Error;

pub use self::client::{KubeManifestClient, ManagedKind, ManifestClient};
pub use self::etcd::{ApplyEtcdTask, DeleteEtcdTask, EtcdPlannerFactory, WaitEtcdTask};

#[cfg(test)]
pub use self::client::MockManifestClient;

/// Which direction a planner drives the ControlPlane
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlannerAction {
    /// Install and configure components
    Init,
    /// Remove components
    DeInit,
}

impl std::fmt::Display for PlannerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::DeInit => write!(f, "deinit"),
        }
    }
}

/// A runnable install or uninstall plan
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Planner: Send + Sync {
    /// Run every task in order, stopping at the first failure
    async fn execute(&self) -> Result<(), Error>;
}

/// A single idempotent step of a plan
#[async_trait]
pub trait Task: Send + Sync {
    /// Short task name used in logs and errors (e.g. "apply-etcd")
    fn name(&self) -> &str;

    /// Perform the step
    async fn run(&self) -> Result<(), Error>;
}

/// Builds init/deinit planners for a ControlPlane
#[cfg_attr(test, automock)]
pub trait PlannerFactory: Send + Sync {
    /// Planner that installs the ControlPlane's infrastructure
    fn init(&self, cp: &ControlPlane) -> Result<Box<dyn Planner>, Error>;

    /// Planner that removes the ControlPlane's infrastructure
    fn deinit(&self, cp: &ControlPlane) -> Result<Box<dyn Planner>, Error>;
}

/// Planner running a fixed list of tasks
pub struct TaskPlanner {
    action: PlannerAction,
    target: String,
    tasks: Vec<Box<dyn Task>>,
}

impl TaskPlanner {
    /// Create an empty planner for `target` (a "namespace/name" key)
    pub fn new(action: PlannerAction, target: impl Into<String>) -> Self {
        Self {
            action,
            target: target.into(),
            tasks: Vec::new(),
        }
    }

    /// Append a task
    pub fn with_task(mut self, task: impl Task + 'static) -> Self {
        self.tasks.push(Box::new(task));
        self
    }

    /// Names of the tasks in execution order
    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.name()).collect()
    }
}

#[async_trait]
impl Planner for TaskPlanner {
    async fn execute(&self) -> Result<(), Error> {
        info!(
            action = %self.action,
            target = %self.target,
            tasks = ?self.task_names(),
            "running planner"
        );

        for task in &self.tasks {
            debug!(action = %self.action, task = task.name(), "running task");
            if let Err(e) = task.run().await {
                error!(
                    action = %self.action,
                    target = %self.target,
                    task = task.name(),
                    error = %e,
                    "task failed"
                );
                return Err(match e {
                    Error::Planner { .. } => e,
                    other => Error::planner(task.name(), other.to_string()),
                });
            }
        }

        info!(action = %self.action, target = %self.target, "planner finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Task that records its name into a shared journal
    struct Recorder {
        name: &'static str,
        journal: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl Task for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&self) -> Result<(), Error> {
            self.journal.lock().unwrap().push(self.name);
            if self.fail {
                return Err(Error::internal("injected failure"));
            }
            Ok(())
        }
    }

    fn recorder(
        name: &'static str,
        journal: &Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    ) -> Recorder {
        Recorder {
            name,
            journal: journal.clone(),
            fail,
        }
    }

    /// Story: tasks run in the order they were added
    #[tokio::test]
    async fn story_tasks_run_in_order() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let planner = TaskPlanner::new(PlannerAction::Init, "demo/cp")
            .with_task(recorder("first", &journal, false))
            .with_task(recorder("second", &journal, false))
            .with_task(recorder("third", &journal, false));

        assert_eq!(planner.task_names(), vec!["first", "second", "third"]);
        planner.execute().await.unwrap();
        assert_eq!(*journal.lock().unwrap(), vec!["first", "second", "third"]);
    }

    /// Story: the first failing task stops the run and names itself
    #[tokio::test]
    async fn story_first_failure_stops_the_run() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let planner = TaskPlanner::new(PlannerAction::DeInit, "demo/cp")
            .with_task(recorder("first", &journal, false))
            .with_task(recorder("broken", &journal, true))
            .with_task(recorder("never", &journal, false));

        let err = planner.execute().await.unwrap_err();
        match err {
            Error::Planner { task, message } => {
                assert_eq!(task, "broken");
                assert!(message.contains("injected failure"));
            }
            other => panic!("expected planner error, got {other:?}"),
        }
        assert_eq!(*journal.lock().unwrap(), vec!["first", "broken"]);
    }

    #[tokio::test]
    async fn test_empty_planner_succeeds() {
        let planner = TaskPlanner::new(PlannerAction::Init, "demo/cp");
        assert!(planner.task_names().is_empty());
        assert!(planner.execute().await.is_ok());
    }
}
