pub mod approvals;
pub mod daemon;
pub mod files;
