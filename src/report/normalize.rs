#![forbid(unsafe_code)]

use crate::protocol::{ReportInterval, ReportPayload};
use chrono::{DateTime, Utc};
use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// One `(timestamp, value)` reading for a single report item.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReportSample {
    pub dtstart: DateTime<Utc>,
    pub value: f64,
}

/// Interval carrying exactly one payload.
#[derive(Clone, Debug, PartialEq)]
pub struct SingleInterval {
    pub dtstart: DateTime<Utc>,
    pub item_id: String,
    pub value: f64,
}

/// Expands list payloads into sibling intervals that share the original timestamp.
pub fn expand_intervals(intervals: &[ReportInterval]) -> Vec<SingleInterval> {
    let mut expanded = Vec::with_capacity(intervals.len());
    for interval in intervals {
        match &interval.report_payload {
            ReportPayload::Single(entry) => expanded.push(SingleInterval {
                dtstart: interval.dtstart,
                item_id: entry.r_id.clone(),
                value: entry.value,
            }),
            ReportPayload::Multiple(entries) => {
                expanded.extend(entries.iter().map(|entry| SingleInterval {
                    dtstart: interval.dtstart,
                    item_id: entry.r_id.clone(),
                    value: entry.value,
                }))
            }
        }
    }
    expanded
}

/// Groups single-payload intervals by item id. Groups appear in first-seen order and keep the
/// input order of their samples.
pub fn group_by_item(intervals: Vec<SingleInterval>) -> Vec<(String, Vec<ReportSample>)> {
    let mut groups: Vec<(String, Vec<ReportSample>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for interval in intervals {
        let sample = ReportSample {
            dtstart: interval.dtstart,
            value: interval.value,
        };
        match index.entry(interval.item_id) {
            Entry::Occupied(slot) => groups[*slot.get()].1.push(sample),
            Entry::Vacant(slot) => {
                groups.push((slot.key().clone(), vec![sample]));
                slot.insert(groups.len() - 1);
            }
        }
    }
    groups
}

pub fn normalize(intervals: &[ReportInterval]) -> Vec<(String, Vec<ReportSample>)> {
    group_by_item(expand_intervals(intervals))
}
