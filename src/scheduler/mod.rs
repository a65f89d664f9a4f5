pub mod admission;
pub mod controller;
pub mod job;

pub use admission::Autoscaler;
pub use controller::JobController;
pub use job::{FailureReason, Job, JobSpec, JobStatus};
