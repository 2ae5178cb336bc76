//! Named-task queue with leases, retry, backoff and dead-lettering.
//!
//! ## Components
//!
//! - `Task` / `NewTask`: the queue row and its validated insert form
//! - `TaskStore`: persistence with atomic claim (in-memory or PostgreSQL)
//! - `HandlerRegistry`: task name -> handler lookup
//! - `Executor`: runs one claimed task under a timeout and finalizes it
//! - `handlers`: the built-in maintenance handlers
//! - `seed_tasks`: first-or-create of the recurring maintenance tasks

pub mod executor;
pub mod handlers;
pub mod postgres;
pub mod registry;
pub mod seed;
pub mod store;
pub mod types;

pub use executor::{ExecutionReport, Executor, Outcome, execute};
pub use handlers::{HandlerContext, register_builtin_handlers};
pub use postgres::PostgresTaskStore;
pub use registry::{HandlerError, HandlerRegistry, RegistryError, TaskHandler, handler_fn};
pub use seed::{SeedReport, seed_tasks};
pub use store::{InMemoryTaskStore, TaskStats, TaskStore, TaskStoreError};
pub use types::{DEFAULT_MAX_ATTEMPTS, NewTask, RetryPolicy, Task, TaskStatus};
