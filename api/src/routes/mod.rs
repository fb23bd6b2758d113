pub mod analysis_jobs;
pub mod health;
pub mod quota;
