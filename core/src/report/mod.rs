pub mod diff;
pub mod status;

pub use diff::{CodeSnippet, KindDiff};
pub use status::{DashboardRow, Staleness};
