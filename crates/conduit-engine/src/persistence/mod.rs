pub mod sessions;
pub mod metrics;
pub mod schedule;

pub use sessions::SqliteSessionStore;
pub use metrics::SqliteMetricsStore;
pub use schedule::{ScheduledTask, SqliteScheduleStore};
