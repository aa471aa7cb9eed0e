use crate::executor::Executor;
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct AppState {
    pub executor: Executor,
    pub scheduler: Scheduler,
}
