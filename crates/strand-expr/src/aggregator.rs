// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Aggregated matching of many predicates against one event.
//!
//! When thousands of pauses wait on the same event name, evaluating each
//! expression independently is linear in the pause count. Most pause
//! expressions are a single `path == literal` test, so the aggregator keeps
//! a two-level index `path -> literal -> ids`: one event resolves each
//! distinct path once and probes by value, which is sub-linear in the number
//! of registered predicates. Complex expressions fall back to direct
//! evaluation.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::ExprError;
use crate::eval::{Compiled, resolve_path};

/// An entry registered with the aggregator.
#[derive(Debug, Clone)]
struct Entry {
    compiled: Compiled,
    /// Present when the expression is a plain equality and indexed.
    indexed: Option<(String, String)>,
}

/// Canonical string form of a literal, with integral floats collapsed so
/// `250` and `250.0` probe the same bucket.
fn canonical(value: &Value) -> String {
    if let Some(f) = value.as_f64() {
        if f.fract() == 0.0 && f.abs() < 9e15 {
            return format!("{}", f as i64);
        }
        return format!("{}", f);
    }
    value.to_string()
}

/// Groups registered predicates so one event evaluates sub-linearly in the
/// number of predicates. IDs are caller-assigned and must be unique.
#[derive(Debug, Default)]
pub struct Aggregator {
    entries: HashMap<u64, Entry>,
    /// path -> canonical literal -> predicate ids.
    eq_index: HashMap<String, HashMap<String, Vec<u64>>>,
    /// Predicates that cannot be indexed and are evaluated one by one.
    slow: Vec<u64>,
}

impl Aggregator {
    /// Create an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a predicate under the given ID, compiling the source.
    pub fn add(&mut self, id: u64, source: &str) -> Result<(), ExprError> {
        let compiled = Compiled::new(source)?;
        let indexed = compiled
            .ast()
            .as_eq_predicate()
            .map(|(p, v)| (p.join("."), canonical(v)));
        match &indexed {
            Some((path, lit)) => {
                self.eq_index
                    .entry(path.clone())
                    .or_default()
                    .entry(lit.clone())
                    .or_default()
                    .push(id);
            }
            None => self.slow.push(id),
        }
        self.entries.insert(id, Entry { compiled, indexed });
        Ok(())
    }

    /// Remove a predicate. No-op when the ID is unknown.
    pub fn remove(&mut self, id: u64) {
        let Some(entry) = self.entries.remove(&id) else {
            return;
        };
        match entry.indexed {
            Some((path, lit)) => {
                if let Some(by_lit) = self.eq_index.get_mut(&path) {
                    if let Some(ids) = by_lit.get_mut(&lit) {
                        ids.retain(|x| *x != id);
                        if ids.is_empty() {
                            by_lit.remove(&lit);
                        }
                    }
                    if by_lit.is_empty() {
                        self.eq_index.remove(&path);
                    }
                }
            }
            None => self.slow.retain(|x| *x != id),
        }
    }

    /// Number of registered predicates.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evaluate the scope against every registered predicate, returning the
    /// IDs that matched. Evaluation errors on individual predicates are
    /// reported through `on_error` and treated as non-matches.
    pub fn matches(&self, scope: &Value, mut on_error: impl FnMut(u64, &ExprError)) -> Vec<u64> {
        let mut out = Vec::new();

        // Fast path: resolve each distinct indexed path once, probe by value.
        for (path, by_lit) in &self.eq_index {
            let segments: Vec<String> = path.split('.').map(str::to_string).collect();
            let actual = canonical(resolve_path(scope, &segments));
            if let Some(ids) = by_lit.get(&actual) {
                out.extend_from_slice(ids);
            }
        }

        // Slow path: full evaluation for complex expressions.
        for id in &self.slow {
            let entry = &self.entries[id];
            match entry.compiled.matches(scope) {
                Ok(true) => out.push(*id),
                Ok(false) => {}
                Err(e) => on_error(*id, &e),
            }
        }

        out.sort_unstable();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope(amount: i64, region: &str) -> Value {
        json!({ "event": { "data": { "amount": amount, "region": region } } })
    }

    #[test]
    fn test_indexed_equality_matches() {
        let mut agg = Aggregator::new();
        agg.add(1, "event.data.region == 'eu-1'").unwrap();
        agg.add(2, "event.data.region == 'us-1'").unwrap();
        agg.add(3, "event.data.amount == 5").unwrap();

        let hits = agg.matches(&scope(5, "eu-1"), |_, _| panic!("no errors expected"));
        assert_eq!(hits, vec![1, 3]);
    }

    #[test]
    fn test_numeric_representation_collapsed() {
        let mut agg = Aggregator::new();
        agg.add(4, "event.data.amount == 250.0").unwrap();
        let hits = agg.matches(&scope(250, "eu-1"), |_, _| {});
        assert_eq!(hits, vec![4]);
    }

    #[test]
    fn test_complex_expressions_use_slow_path() {
        let mut agg = Aggregator::new();
        agg.add(7, "event.data.amount > 10 && event.data.region == 'eu-1'")
            .unwrap();

        let hits = agg.matches(&scope(50, "eu-1"), |_, _| {});
        assert_eq!(hits, vec![7]);
        let hits = agg.matches(&scope(5, "eu-1"), |_, _| {});
        assert!(hits.is_empty());
    }

    #[test]
    fn test_remove() {
        let mut agg = Aggregator::new();
        agg.add(1, "event.data.region == 'eu-1'").unwrap();
        agg.add(2, "event.data.amount > 1").unwrap();
        assert_eq!(agg.len(), 2);

        agg.remove(1);
        agg.remove(2);
        assert!(agg.is_empty());
        assert!(agg.matches(&scope(5, "eu-1"), |_, _| {}).is_empty());
    }

    #[test]
    fn test_eval_errors_reported_not_fatal() {
        let mut agg = Aggregator::new();
        // Comparing a string field with > is a type error at eval time.
        agg.add(9, "event.data.region > 5").unwrap();
        let mut errors = 0;
        let hits = agg.matches(&scope(5, "eu-1"), |id, _| {
            assert_eq!(id, 9);
            errors += 1;
        });
        assert!(hits.is_empty());
        assert_eq!(errors, 1);
    }

    #[test]
    fn test_many_indexed_single_probe() {
        let mut agg = Aggregator::new();
        for i in 0..1000 {
            agg.add(i, &format!("event.data.amount == {i}")).unwrap();
        }
        let hits = agg.matches(&scope(421, "x"), |_, _| {});
        assert_eq!(hits, vec![421]);
    }
}
