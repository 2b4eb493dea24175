#![forbid(unsafe_code)]

pub mod normalize;
pub mod pipeline;

pub use normalize::{expand_intervals, group_by_item, normalize, ReportSample, SingleInterval};
pub use pipeline::{
    IngestSummary, ReportCallback, ReportHandler, ReportItemSpec, ReportPipeline, SinkRecorder,
};
