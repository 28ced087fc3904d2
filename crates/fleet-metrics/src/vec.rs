//! Labelled metric families.
//!
//! Each family holds one series per distinct label-value tuple. Series are
//! kept in a `BTreeMap` so exposition output is stable.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use tracing::warn;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Labels must be given in declaration order and all be present.
fn series_key(family: &str, names: &[&'static str], values: &[&str]) -> Option<Vec<String>> {
    if names.len() != values.len() {
        warn!(
            metric = family,
            expected = names.len(),
            got = values.len(),
            "label cardinality mismatch, sample dropped"
        );
        return None;
    }
    Some(values.iter().map(|v| v.to_string()).collect())
}

fn matches_partial(names: &[&'static str], key: &[String], filter: &[(&str, &str)]) -> bool {
    filter.iter().all(|(name, value)| {
        names
            .iter()
            .position(|n| n == name)
            .is_some_and(|i| key[i] == *value)
    })
}

// ── Gauge ─────────────────────────────────────────────────────────

pub struct GaugeVec {
    name: &'static str,
    help: &'static str,
    label_names: Vec<&'static str>,
    series: Mutex<BTreeMap<Vec<String>, f64>>,
}

impl GaugeVec {
    pub fn new(name: &'static str, help: &'static str, label_names: &[&'static str]) -> Self {
        Self {
            name,
            help,
            label_names: label_names.to_vec(),
            series: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }

    pub fn label_names(&self) -> &[&'static str] {
        &self.label_names
    }

    pub fn set(&self, labels: &[&str], value: f64) {
        if let Some(key) = series_key(self.name, &self.label_names, labels) {
            lock(&self.series).insert(key, value);
        }
    }

    pub fn add(&self, labels: &[&str], delta: f64) {
        if let Some(key) = series_key(self.name, &self.label_names, labels) {
            *lock(&self.series).entry(key).or_insert(0.0) += delta;
        }
    }

    pub fn inc(&self, labels: &[&str]) {
        self.add(labels, 1.0);
    }

    pub fn dec(&self, labels: &[&str]) {
        self.add(labels, -1.0);
    }

    pub fn get(&self, labels: &[&str]) -> Option<f64> {
        let key = series_key(self.name, &self.label_names, labels)?;
        lock(&self.series).get(&key).copied()
    }

    /// Remove every series whose labels include all of `filter`. Returns the
    /// number of series removed.
    pub fn delete_partial_match(&self, filter: &[(&str, &str)]) -> usize {
        let mut series = lock(&self.series);
        let before = series.len();
        series.retain(|key, _| !matches_partial(&self.label_names, key, filter));
        before - series.len()
    }

    /// Series whose labels include all of `filter`, with their values.
    pub fn matching(&self, filter: &[(&str, &str)]) -> Vec<(Vec<String>, f64)> {
        lock(&self.series)
            .iter()
            .filter(|(key, _)| matches_partial(&self.label_names, key, filter))
            .map(|(key, v)| (key.clone(), *v))
            .collect()
    }

    pub fn series_count(&self) -> usize {
        lock(&self.series).len()
    }

    pub(crate) fn snapshot(&self) -> Vec<(Vec<String>, f64)> {
        lock(&self.series).iter().map(|(k, v)| (k.clone(), *v)).collect()
    }
}

// ── Histogram ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HistogramSeries {
    /// Cumulative counts, one per bucket bound.
    pub(crate) buckets: Vec<u64>,
    pub(crate) sum: f64,
    pub(crate) count: u64,
}

pub struct HistogramVec {
    name: &'static str,
    help: &'static str,
    label_names: Vec<&'static str>,
    bounds: Vec<f64>,
    series: Mutex<BTreeMap<Vec<String>, HistogramSeries>>,
}

impl HistogramVec {
    pub fn new(
        name: &'static str,
        help: &'static str,
        label_names: &[&'static str],
        bounds: &[f64],
    ) -> Self {
        Self {
            name,
            help,
            label_names: label_names.to_vec(),
            bounds: bounds.to_vec(),
            series: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn help(&self) -> &'static str {
        self.help
    }

    pub fn label_names(&self) -> &[&'static str] {
        &self.label_names
    }

    pub fn bounds(&self) -> &[f64] {
        &self.bounds
    }

    pub fn observe(&self, labels: &[&str], value: f64) {
        let Some(key) = series_key(self.name, &self.label_names, labels) else {
            return;
        };
        let mut series = lock(&self.series);
        let entry = series.entry(key).or_insert_with(|| HistogramSeries {
            buckets: vec![0; self.bounds.len()],
            sum: 0.0,
            count: 0,
        });
        for (i, bound) in self.bounds.iter().enumerate() {
            if value <= *bound {
                entry.buckets[i] += 1;
            }
        }
        entry.sum += value;
        entry.count += 1;
    }

    pub fn sample_count(&self, labels: &[&str]) -> u64 {
        series_key(self.name, &self.label_names, labels)
            .and_then(|key| lock(&self.series).get(&key).map(|s| s.count))
            .unwrap_or(0)
    }

    pub fn sample_sum(&self, labels: &[&str]) -> f64 {
        series_key(self.name, &self.label_names, labels)
            .and_then(|key| lock(&self.series).get(&key).map(|s| s.sum))
            .unwrap_or(0.0)
    }

    pub fn delete_partial_match(&self, filter: &[(&str, &str)]) -> usize {
        let mut series = lock(&self.series);
        let before = series.len();
        series.retain(|key, _| !matches_partial(&self.label_names, key, filter));
        before - series.len()
    }

    pub fn series_count(&self) -> usize {
        lock(&self.series).len()
    }

    pub(crate) fn snapshot(&self) -> Vec<(Vec<String>, HistogramSeries)> {
        lock(&self.series).iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_set_and_overwrite() {
        let g = GaugeVec::new("g", "help", &["a", "b"]);
        g.set(&["1", "2"], 5.0);
        g.set(&["1", "2"], 7.0);
        assert_eq!(g.get(&["1", "2"]), Some(7.0));
        assert_eq!(g.series_count(), 1);
    }

    #[test]
    fn gauge_inc_dec() {
        let g = GaugeVec::new("g", "help", &[]);
        g.inc(&[]);
        g.inc(&[]);
        g.dec(&[]);
        assert_eq!(g.get(&[]), Some(1.0));
    }

    #[test]
    fn wrong_label_count_is_dropped() {
        let g = GaugeVec::new("g", "help", &["a", "b"]);
        g.set(&["only-one"], 1.0);
        assert_eq!(g.series_count(), 0);
    }

    #[test]
    fn partial_match_deletes_only_matching_series() {
        let g = GaugeVec::new("g", "help", &["namespace", "name", "status"]);
        g.set(&["ns", "run-1", "True"], 1.0);
        g.set(&["ns", "run-1", "False"], 1.0);
        g.set(&["ns", "run-2", "True"], 1.0);

        let removed = g.delete_partial_match(&[("namespace", "ns"), ("name", "run-1")]);
        assert_eq!(removed, 2);
        assert_eq!(g.series_count(), 1);
        assert!(g.get(&["ns", "run-2", "True"]).is_some());
    }

    #[test]
    fn partial_match_with_unknown_label_matches_nothing() {
        let g = GaugeVec::new("g", "help", &["name"]);
        g.set(&["x"], 1.0);
        assert_eq!(g.delete_partial_match(&[("bogus", "x")]), 0);
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let h = HistogramVec::new("h", "help", &["name"], &[1.0, 5.0, 10.0]);
        h.observe(&["x"], 0.5);
        h.observe(&["x"], 4.0);
        h.observe(&["x"], 50.0);
        let snap = h.snapshot();
        assert_eq!(snap[0].1.buckets, vec![1, 2, 2]);
        assert_eq!(h.sample_count(&["x"]), 3);
        assert_eq!(h.sample_sum(&["x"]), 54.5);
    }

    #[test]
    fn histogram_partial_delete() {
        let h = HistogramVec::new("h", "help", &["namespace", "name"], &[1.0]);
        h.observe(&["ns", "a"], 1.0);
        h.observe(&["ns", "b"], 1.0);
        assert_eq!(h.delete_partial_match(&[("name", "a")]), 1);
        assert_eq!(h.sample_count(&["ns", "a"]), 0);
        assert_eq!(h.sample_count(&["ns", "b"]), 1);
    }
}
