// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

//! Persistence of per-segment statistics across analysis runs.
//!
//! The store accumulates: upserting a sample batch adds its sums to
//! whatever is already recorded for each key, never overwrites. Mining the
//! same dataset twice against the same store therefore double-counts; the
//! `analysis_runs` table is the audit trail for that.

use crate::models::{AnalysisRunRow, SegmentStatRow};
use crate::postgres_tools::BuswayPostgresPool;
use crate::speed_miner::{MS_PER_HOUR, SegmentSample};
use crate::transit_graph::SegmentKey;
use ahash::AHashMap;
use anyhow::Result;
use chrono::Utc;
use diesel::prelude::*;
use diesel::upsert::excluded;
use diesel_async::RunQueryDsl;
use log::info;
use std::sync::Arc;
use uuid::Uuid;

/// Rows per upsert statement, to bound transaction size.
pub const UPSERT_BATCH_SIZE: usize = 500;

/// Segments with recorded samples needed before a fresh mining run is
/// skipped in favor of the persisted aggregate.
pub const DEFAULT_MIN_COVERAGE_SEGMENTS: i64 = 2000;

pub struct StatsStore {
    pool: Arc<BuswayPostgresPool>,
}

impl StatsStore {
    pub fn new(pool: Arc<BuswayPostgresPool>) -> Self {
        StatsStore { pool }
    }

    /// Inserts or accumulates one batch of samples. Existing rows get the
    /// new sums **added** to their stored sums; `avg_speed` is then
    /// recomputed from the accumulated totals.
    pub async fn upsert_batch(&self, samples: &[SegmentSample], run: Uuid) -> Result<()> {
        use crate::schema::segment_stats::dsl::*;

        let mut conn = self.pool.get().await?;

        for chunk in samples.chunks(UPSERT_BATCH_SIZE) {
            let rows: Vec<SegmentStatRow> = chunk
                .iter()
                .map(|sample| SegmentStatRow {
                    line_id: sample.key.line_id,
                    orientation: sample.key.orientation,
                    sequence_num: sample.key.sequence_num,
                    sum_distance: sample.sum_distance_km,
                    sum_time: sample.sum_time_ms,
                    count: sample.count,
                    avg_speed: sample.accumulator().avg_speed_kmh().unwrap_or(0.0),
                    last_updated: Utc::now(),
                    analysis_run_id: Some(run),
                })
                .collect();

            diesel::insert_into(segment_stats)
                .values(&rows)
                .on_conflict((line_id, orientation, sequence_num))
                .do_update()
                .set((
                    sum_distance.eq(sum_distance + excluded(sum_distance)),
                    sum_time.eq(sum_time + excluded(sum_time)),
                    count.eq(count + excluded(count)),
                    last_updated.eq(excluded(last_updated)),
                    analysis_run_id.eq(excluded(analysis_run_id)),
                ))
                .execute(&mut conn)
                .await?;
        }

        // avg_speed is derived from the accumulated sums; refresh it for
        // every row this run touched.
        diesel::sql_query(
            "UPDATE segment_stats \
             SET avg_speed = sum_distance / (sum_time / 3600000.0) \
             WHERE analysis_run_id = $1 AND sum_time > 0",
        )
        .bind::<diesel::sql_types::Uuid, _>(run)
        .execute(&mut conn)
        .await?;

        info!("upserted {} segment stat rows", samples.len());
        Ok(())
    }

    /// Number of segments with at least one recorded sample.
    pub async fn segments_with_samples(&self) -> Result<i64> {
        use crate::schema::segment_stats::dsl::*;

        let mut conn = self.pool.get().await?;
        let segments = segment_stats
            .filter(count.gt(0))
            .count()
            .get_result::<i64>(&mut conn)
            .await?;
        Ok(segments)
    }

    pub async fn has_sufficient_coverage(&self, min_segments: i64) -> Result<bool> {
        Ok(self.segments_with_samples().await? >= min_segments)
    }

    pub async fn load_all(&self) -> Result<Vec<SegmentStatRow>> {
        use crate::schema::segment_stats::dsl::*;

        let mut conn = self.pool.get().await?;
        let rows = segment_stats
            .order((line_id.asc(), orientation.asc(), sequence_num.asc()))
            .load::<SegmentStatRow>(&mut conn)
            .await?;
        Ok(rows)
    }

    pub async fn create_run(
        &self,
        total_records: i64,
        num_workers: i32,
        description: &str,
    ) -> Result<Uuid> {
        use crate::schema::analysis_runs::dsl::analysis_runs;

        let row = AnalysisRunRow {
            run_id: Uuid::new_v4(),
            total_records,
            num_workers,
            description: description.to_string(),
            status: "running".to_string(),
            processing_time_ms: None,
            segments_processed: None,
            started_at: Utc::now(),
        };

        let mut conn = self.pool.get().await?;
        diesel::insert_into(analysis_runs)
            .values(&row)
            .execute(&mut conn)
            .await?;

        Ok(row.run_id)
    }

    pub async fn complete_run(
        &self,
        run: Uuid,
        elapsed_ms: i64,
        segments_aggregated: i32,
    ) -> Result<()> {
        use crate::schema::analysis_runs::dsl::*;

        let mut conn = self.pool.get().await?;
        diesel::update(analysis_runs.filter(run_id.eq(run)))
            .set((
                status.eq("completed"),
                processing_time_ms.eq(Some(elapsed_ms)),
                segments_processed.eq(Some(segments_aggregated)),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }
}

/// Speed overlay from persisted rows, recomputed from the accumulated sums
/// rather than trusting the stored derived column.
pub fn overlay_from_rows(rows: &[SegmentStatRow]) -> AHashMap<SegmentKey, f64> {
    rows.iter()
        .filter(|row| row.sum_time > 0 && row.count > 0)
        .map(|row| {
            let key = SegmentKey {
                line_id: row.line_id,
                orientation: row.orientation,
                sequence_num: row.sequence_num,
            };
            (key, row.sum_distance / (row.sum_time as f64 / MS_PER_HOUR))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(sequence_num: i32, sum_distance: f64, sum_time: i64, count: i64) -> SegmentStatRow {
        SegmentStatRow {
            line_id: 131,
            orientation: 0,
            sequence_num,
            sum_distance,
            sum_time,
            count,
            avg_speed: 0.0,
            last_updated: Utc::now(),
            analysis_run_id: None,
        }
    }

    #[test]
    fn overlay_recomputes_speed_from_sums() {
        // 2 km in 6 minutes is 20 km/h.
        let rows = vec![row(1, 2.0, 360_000, 2), row(2, 1.0, 0, 0), row(3, 0.0, 0, 5)];
        let overlay = overlay_from_rows(&rows);

        assert_eq!(overlay.len(), 1);
        let key = SegmentKey {
            line_id: 131,
            orientation: 0,
            sequence_num: 1,
        };
        assert!((overlay[&key] - 20.0).abs() < 1e-9);
    }
}
