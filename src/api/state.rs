use std::sync::Arc;

use crate::notifier::Notifier;
use crate::queue::QueueManager;
use crate::scheduler::Scheduler;
use crate::storage::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub queues: Arc<QueueManager>,
    pub scheduler: Scheduler,
    pub notifier: Arc<Notifier>,
}
