//! Task scheduling: selection, dispatch, retries, callbacks.

pub mod callback;
pub mod dispatcher;
pub mod retry;
pub mod task;

pub use callback::{CallbackHandler, ClassifierRules, ResultClass};
pub use dispatcher::{Dispatcher, TickOutcome};
pub use task::{NewTask, TaskRecord, TaskStatus};
