//! The capability kernel: per-endpoint reference tables, pending results
//! with pipelined message queues, reference-count based retirement, and the
//! crank scheduler that drains the run queue one delivery at a time.

pub mod clist;
pub mod error;
pub mod gc;
pub mod kernel;
pub mod lifecycle;
pub mod methods;
pub mod promise;
pub mod queue;
pub mod worker;

pub use clist::{Clist, ClistError, Imported};
pub use error::KernelError;
pub use gc::{GcError, KernelObject, ObjectTable};
pub use kernel::Kernel;
pub use lifecycle::{VatRecord, VatRegistry, VatStatus};
pub use methods::{KERNEL_HOOK, SharedKernel, kernel_methods};
pub use promise::{KernelPromise, PromiseState, PromiseTable, Resolution, Subscribed};
pub use queue::{RunItem, RunQueue};
pub use worker::{MuxWorkerService, VatChannel, WorkerService};
