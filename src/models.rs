// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

/// Cumulative per-segment statistics, keyed by (line, orientation,
/// sequence). Sums accumulate across analysis runs; `avg_speed` is derived
/// from the accumulated sums.
#[derive(Queryable, Selectable, Insertable, Clone, Debug)]
#[diesel(table_name = crate::schema::segment_stats)]
pub struct SegmentStatRow {
    pub line_id: i32,
    pub orientation: i16,
    pub sequence_num: i32,
    pub sum_distance: f64,
    pub sum_time: i64,
    pub count: i64,
    pub avg_speed: f64,
    pub last_updated: DateTime<Utc>,
    pub analysis_run_id: Option<Uuid>,
}

/// One distributed analysis run, for auditing what was mined when and with
/// how many workers.
#[derive(Queryable, Selectable, Insertable, Clone, Debug)]
#[diesel(table_name = crate::schema::analysis_runs)]
pub struct AnalysisRunRow {
    pub run_id: Uuid,
    pub total_records: i64,
    pub num_workers: i32,
    pub description: String,
    pub status: String,
    pub processing_time_ms: Option<i64>,
    pub segments_processed: Option<i32>,
    pub started_at: DateTime<Utc>,
}
