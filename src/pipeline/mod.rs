pub mod batch;
pub mod identity;
pub mod orchestrator;
pub mod scheduler;

pub use orchestrator::Orchestrator;

/// Knobs the orchestrator needs from `Settings`.
#[derive(Debug, Clone, Copy)]
pub struct RunConfig {
    pub batch_size: usize,
    pub fail_after_n_records: Option<usize>,
}

impl RunConfig {
    pub fn new(batch_size: usize, fail_after_n_records: Option<usize>) -> Self {
        Self { batch_size: batch_size.max(1), fail_after_n_records }
    }
}
