//! Score aggregation and client reports

mod aggregator;
mod report;

pub use aggregator::{Aggregate, Aggregator};
pub use report::{topic_report, EntityReport, ReportWriter, TopicReport, TopicSummary};
