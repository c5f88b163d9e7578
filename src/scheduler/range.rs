/*
 * Copyright (c) 2025 Clément GRENNERAT
 *
 * This program is free software: you can redistribute it and/or modify it under the terms of the
 * GNU General Public License as published by the Free Software Foundation, version 3.
 * This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
 * even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
 * See the GNU General Public License for more details.
 * You should have received a copy of the GNU General Public License along with this program.
 * If not, see https://www.gnu.org/licenses/.
 *
 */

use crate::error::{Error, Result};
use auto_bench_fct::auto_bench_fct_hy;
use log::warn;
use prettytable::{format, row, Table};
use serde::{Deserialize, Serialize};

/// Interval `[start, end)` during which `tasks` tasks are available.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
    pub tasks: u32,
}

impl TimeRange {
    pub fn new(start: i64, end: i64, tasks: u32) -> Self {
        TimeRange { start, end, tasks }
    }
    pub fn duration(&self) -> i64 {
        self.end - self.start
    }
    pub fn contains(&self, time: i64) -> bool {
        self.start <= time && time < self.end
    }
}

/// Piecewise-constant task availability over time.
///
/// Ranges are sorted by start and never overlap. A range never carries zero tasks, and two touching
/// ranges never carry the same task count. Time outside every range has no availability.
/// The number of ranges is bounded by `capacity`: exceeding it is reported as [`Error::CapacityExceeded`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeList {
    ranges: Vec<TimeRange>,
    capacity: usize,
}

impl RangeList {
    pub fn new(capacity: usize) -> Self {
        RangeList { ranges: Vec::new(), capacity }
    }
    pub fn from_ranges<I: IntoIterator<Item = TimeRange>>(capacity: usize, ranges: I) -> Result<Self> {
        let mut list = RangeList::new(capacity);
        for range in ranges {
            list.push(range)?;
        }
        Ok(list)
    }

    pub fn ranges(&self) -> &[TimeRange] {
        &self.ranges
    }
    pub fn len(&self) -> usize {
        self.ranges.len()
    }
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
    pub fn capacity(&self) -> usize {
        self.capacity
    }
    pub fn first(&self) -> Option<&TimeRange> {
        self.ranges.first()
    }

    /// Appends a range after the last one, extending the last range if it touches it with the same task count.
    /// Empty ranges and ranges without tasks are ignored.
    pub fn push(&mut self, range: TimeRange) -> Result<()> {
        if range.start >= range.end || range.tasks == 0 {
            return Ok(());
        }
        if let Some(last) = self.ranges.last_mut() {
            debug_assert!(range.start >= last.end, "ranges must be pushed in time order");
            if last.end == range.start && last.tasks == range.tasks {
                last.end = range.end;
                return Ok(());
            }
        }
        if self.ranges.len() >= self.capacity {
            warn!(
                "ALERT:    range overflow ({} ranges max), range [{}, {}) x{} cannot be stored",
                self.capacity, range.start, range.end, range.tasks
            );
            return Err(Error::CapacityExceeded {
                what: "range series".into(),
                max: self.capacity,
            });
        }
        self.ranges.push(range);
        Ok(())
    }

    /// Rebuilds the list from ranges that can only be fewer or equal in number to the current ones.
    fn extend_coalesced(&mut self, ranges: impl IntoIterator<Item = TimeRange>) {
        for range in ranges {
            if range.start >= range.end || range.tasks == 0 {
                continue;
            }
            match self.ranges.last_mut() {
                Some(last) if last.end == range.start && last.tasks == range.tasks => last.end = range.end,
                _ => self.ranges.push(range),
            }
        }
    }

    pub fn tasks_at(&self, time: i64) -> u32 {
        let index = self.ranges.partition_point(|r| r.end <= time);
        match self.ranges.get(index) {
            Some(range) if range.start <= time => range.tasks,
            _ => 0,
        }
    }

    pub fn max_tasks(&self) -> u32 {
        self.ranges.iter().map(|r| r.tasks).max().unwrap_or(0)
    }

    /// Start of the first range offering at least `min_tasks` tasks (at least one).
    pub fn earliest_start(&self, min_tasks: u32) -> Option<i64> {
        self.ranges.iter().find(|r| r.tasks >= min_tasks.max(1)).map(|r| r.start)
    }

    /// Minimum availability over `[start, end)`, 0 if part of it is not covered.
    pub fn min_over(&self, start: i64, end: i64) -> u32 {
        if start >= end {
            return self.tasks_at(start);
        }
        let mut cursor = start;
        let mut min = u32::MAX;
        let first = self.ranges.partition_point(|r| r.end <= start);
        for range in &self.ranges[first..] {
            if range.start > cursor {
                return 0;
            }
            min = min.min(range.tasks);
            cursor = range.end;
            if cursor >= end {
                return min;
            }
        }
        0
    }

    fn boundaries(&self, other: &RangeList) -> Vec<i64> {
        let mut points: Vec<i64> = self
            .ranges
            .iter()
            .chain(other.ranges.iter())
            .flat_map(|r| [r.start, r.end])
            .collect();
        points.sort_unstable();
        points.dedup();
        points
    }

    /// Applies `op` to the task counts of both series between every pair of consecutive boundaries.
    fn combine(&self, other: &RangeList, op: impl Fn(u32, u32) -> u32) -> Result<RangeList> {
        let mut result = RangeList::new(self.capacity);
        let points = self.boundaries(other);
        for window in points.windows(2) {
            let (start, end) = (window[0], window[1]);
            result.push(TimeRange::new(start, end, op(self.tasks_at(start), other.tasks_at(start))))?;
        }
        Ok(result)
    }

    /// Pointwise minimum of both series.
    /// Also returns the earliest time at which the merged availability reaches `min_tasks`.
    #[auto_bench_fct_hy]
    pub fn merge(&self, other: &RangeList, min_tasks: u32) -> Result<(RangeList, Option<i64>)> {
        let merged = self.combine(other, u32::min)?;
        let earliest = merged.earliest_start(min_tasks);
        Ok((merged, earliest))
    }

    /// Pointwise sum of both series, used to build cluster-wide totals out of per-node series.
    /// Also returns the earliest time at which the total reaches `min_tasks`.
    #[auto_bench_fct_hy]
    pub fn accumulate(&self, other: &RangeList, min_tasks: u32) -> Result<(RangeList, Option<i64>)> {
        let total = self.combine(other, u32::saturating_add)?;
        let earliest = total.earliest_start(min_tasks);
        Ok((total, earliest))
    }

    /// Pointwise difference, floored at zero.
    pub fn subtract(&self, other: &RangeList) -> Result<RangeList> {
        self.combine(other, u32::saturating_sub)
    }

    /// Keeps the availability of `self` only where `mask` has availability.
    /// With a `reference_start`, a contiguous run of the result is retained only if it starts at or before it,
    /// i.e. both inputs are available from the reference start onward, not just eventually.
    pub fn intersect(&self, mask: &RangeList, reference_start: Option<i64>) -> Result<RangeList> {
        let masked = self.combine(mask, |tasks, mask_tasks| if mask_tasks > 0 { tasks } else { 0 })?;
        let Some(reference) = reference_start else {
            return Ok(masked);
        };
        let mut result = RangeList::new(self.capacity);
        let mut run_start = None;
        let mut previous_end = None;
        for range in masked.ranges {
            if previous_end != Some(range.start) {
                run_start = Some(range.start);
            }
            previous_end = Some(range.end);
            if run_start.is_some_and(|start| start <= reference) {
                result.push(range)?;
            }
        }
        Ok(result)
    }

    /// Clamps every task count to `cap`.
    pub fn limit_task_count(&mut self, cap: u32) {
        let ranges = std::mem::take(&mut self.ranges);
        self.extend_coalesced(ranges.into_iter().map(|r| TimeRange { tasks: r.tasks.min(cap), ..r }));
    }

    /// Removes the ranges offering less than `min_tasks` tasks.
    pub fn retain_at_least(&mut self, min_tasks: u32) {
        self.ranges.retain(|r| r.tasks >= min_tasks);
    }

    /// Compacts touching ranges with identical task counts and, if `now` is provided,
    /// discards the ranges ending at or before it.
    pub fn reduce(&mut self, now: Option<i64>) {
        let ranges = std::mem::take(&mut self.ranges);
        self.extend_coalesced(ranges.into_iter().filter(|r| now.is_none_or(|now| r.end > now)));
    }

    /// Turns an availability series into a start-time series: the value at `t` is the number of tasks
    /// available during the whole `[t, t + duration)` interval.
    #[auto_bench_fct_hy]
    pub fn start_windows(&self, duration: i64) -> Result<RangeList> {
        if duration <= 0 {
            return Ok(self.clone());
        }
        // The value changes when t crosses a boundary b, or when t + duration crosses it (t = b - duration + 1).
        let mut points: Vec<i64> = self
            .ranges
            .iter()
            .flat_map(|r| [r.start, r.end, r.start - duration + 1, r.end - duration + 1])
            .collect();
        points.sort_unstable();
        points.dedup();
        let mut result = RangeList::new(self.capacity);
        for window in points.windows(2) {
            let (start, end) = (window[0], window[1]);
            result.push(TimeRange::new(start, end, self.min_over(start, start + duration)))?;
        }
        Ok(result)
    }

    /// Builds a `Table` for displaying the ranges in a human-readable format.
    pub fn to_table(&self) -> Table {
        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_CLEAN);
        table.add_row(row![buFc->"Begin (epoch)", buFc->"End (epoch)", buFc->"Size (s)", buFc->"Tasks"]);
        for range in &self.ranges {
            table.add_row(row![range.start, range.end, range.duration(), range.tasks]);
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(ranges: &[(i64, i64, u32)]) -> RangeList {
        RangeList::from_ranges(64, ranges.iter().map(|(s, e, t)| TimeRange::new(*s, *e, *t))).unwrap()
    }

    /// Small deterministic generator of ordered series.
    fn generated(seed: u64, count: usize) -> RangeList {
        let mut state = seed;
        let mut next = move |modulo: u64| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) % modulo
        };
        let mut time = next(10) as i64;
        let mut ranges = Vec::new();
        for _ in 0..count {
            let start = time + next(5) as i64;
            let end = start + 1 + next(20) as i64;
            ranges.push(TimeRange::new(start, end, next(8) as u32));
            time = end;
        }
        RangeList::from_ranges(256, ranges).unwrap()
    }

    #[test]
    fn test_push_coalesces_and_drops_empty_ranges() {
        let series = list(&[(0, 10, 2), (10, 20, 2), (20, 25, 0), (25, 30, 3), (30, 30, 5)]);
        assert_eq!(series.ranges(), &[TimeRange::new(0, 20, 2), TimeRange::new(25, 30, 3)]);
    }

    #[test]
    fn test_push_overflow_is_reported() {
        let mut series = RangeList::new(2);
        series.push(TimeRange::new(0, 10, 1)).unwrap();
        series.push(TimeRange::new(10, 20, 2)).unwrap();
        let result = series.push(TimeRange::new(20, 30, 3));
        assert!(matches!(result, Err(Error::CapacityExceeded { max: 2, .. })));
        // Extending the last range does not need a new slot.
        series.push(TimeRange::new(20, 30, 2)).unwrap();
        assert_eq!(series.len(), 2);
    }

    #[test]
    fn test_merge_is_pointwise_min() {
        for seed in 0..20 {
            let a = generated(seed, 12);
            let b = generated(seed + 100, 9);
            let (merged, _) = a.merge(&b, 1).unwrap();
            for t in -5..400 {
                assert_eq!(merged.tasks_at(t), a.tasks_at(t).min(b.tasks_at(t)), "seed {} at {}", seed, t);
            }
        }
    }

    #[test]
    fn test_merge_earliest_start() {
        let a = list(&[(0, 100, 4)]);
        let b = list(&[(0, 50, 2), (50, 80, 6)]);
        let (merged, earliest) = a.merge(&b, 3).unwrap();
        assert_eq!(merged.ranges(), &[TimeRange::new(0, 50, 2), TimeRange::new(50, 80, 4)]);
        assert_eq!(earliest, Some(50));
        let (_, earliest) = a.merge(&b, 5).unwrap();
        assert_eq!(earliest, None);
    }

    #[test]
    fn test_accumulate_is_pointwise_sum() {
        for seed in 0..10 {
            let a = generated(seed, 10);
            let b = generated(seed + 7, 10);
            let (total, _) = a.accumulate(&b, 1).unwrap();
            for t in -5..400 {
                assert_eq!(total.tasks_at(t), a.tasks_at(t) + b.tasks_at(t));
            }
        }
        let (_, earliest) = list(&[(0, 10, 2)]).accumulate(&list(&[(5, 20, 2)]), 4).unwrap();
        assert_eq!(earliest, Some(5));
    }

    #[test]
    fn test_subtract() {
        let a = list(&[(0, 100, 4)]);
        let b = list(&[(10, 20, 1), (20, 30, 6)]);
        let result = a.subtract(&b).unwrap();
        assert_eq!(result.ranges(), &[TimeRange::new(0, 10, 4), TimeRange::new(10, 20, 3), TimeRange::new(30, 100, 4)]);
    }

    #[test]
    fn test_intersect_keeps_source_task_counts() {
        let total = list(&[(0, 100, 12)]);
        let mask = list(&[(20, 40, 1), (60, 80, 3)]);
        let result = total.intersect(&mask, None).unwrap();
        assert_eq!(result.ranges(), &[TimeRange::new(20, 40, 12), TimeRange::new(60, 80, 12)]);
    }

    #[test]
    fn test_intersect_with_boundary_match() {
        let total = list(&[(0, 50, 12), (50, 100, 8)]);
        let mask = list(&[(0, 70, 1), (80, 90, 1)]);
        let result = total.intersect(&mask, Some(10)).unwrap();
        // The run starting at 80 is only available eventually, not from the reference start.
        assert_eq!(result.ranges(), &[TimeRange::new(0, 50, 12), TimeRange::new(50, 70, 8)]);

        let late_mask = list(&[(20, 70, 1)]);
        assert!(total.intersect(&late_mask, Some(10)).unwrap().is_empty());
    }

    #[test]
    fn test_limit_task_count() {
        let mut series = list(&[(0, 10, 2), (10, 20, 6), (20, 30, 9)]);
        series.limit_task_count(5);
        assert_eq!(series.ranges(), &[TimeRange::new(0, 10, 2), TimeRange::new(10, 30, 5)]);
    }

    #[test]
    fn test_reduce_drops_processed_prefix() {
        let mut series = list(&[(0, 10, 2), (10, 20, 6), (25, 30, 9)]);
        series.reduce(Some(10));
        assert_eq!(series.ranges(), &[TimeRange::new(10, 20, 6), TimeRange::new(25, 30, 9)]);
        series.reduce(None);
        assert_eq!(series.len(), 2);
    }

    #[test]
    fn test_start_windows() {
        let series = list(&[(0, 10, 4), (10, 20, 2)]);
        let starts = series.start_windows(5).unwrap();
        assert_eq!(starts.ranges(), &[TimeRange::new(0, 6, 4), TimeRange::new(6, 16, 2)]);
        // A job of duration 5 starting at 15 ends at 20: still inside the series.
        assert_eq!(starts.tasks_at(15), 2);
        assert_eq!(starts.tasks_at(16), 0);
    }

    #[test]
    fn test_start_windows_across_gap() {
        let series = list(&[(0, 10, 4), (12, 40, 4)]);
        let starts = series.start_windows(10).unwrap();
        assert_eq!(starts.ranges(), &[TimeRange::new(0, 1, 4), TimeRange::new(12, 31, 4)]);
    }
}
