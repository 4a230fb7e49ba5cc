pub mod caps;
pub mod command;
pub mod error;
pub mod fetch;
pub mod jobs;
pub mod plan;
pub mod probe;
pub mod supervise;
