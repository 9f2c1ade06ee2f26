//! The compiled pipeline of one SELECT: windows, filter, grouping,
//! aggregates, projections and the emitter.
//!
//! One `SelectPlan` holds the mutable execution state of one sub-select of
//! a stream. Tuples arrive tagged with the binding name of their FROM
//! relation via `input_name`; each admission produces a result set which
//! the emitter converts into output tuples.

use crate::context::Context;
use crate::error::{Result, RuntimeError};
use crate::exec::emitter::{EmitterState, OutputRow};
use crate::exec::evaluator::{collect_aggregates, eval, AggregateValues, RowContext};
use crate::exec::window::Window;
use crate::udf::UdfRegistry;
use crate::writer::Writer;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use freshet_core::ast::{Expr, Projection, Select};
use freshet_core::{Map, TraceEvent, Tuple};
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::sync::Mutex;

enum CompiledProjection {
    Expr { name: String, expr: Expr },
    Wildcard { relation: Option<String> },
}

pub struct SelectPlan {
    relations: Vec<String>,
    windows: IndexMap<String, Window>,
    filter: Option<Expr>,
    group_by: Vec<Expr>,
    having: Option<Expr>,
    projections: Vec<CompiledProjection>,
    aggregates: Vec<(String, Expr)>,
    grouped: bool,
    emitter: EmitterState,
    udfs: Arc<UdfRegistry>,
}

impl SelectPlan {
    /// Compiles a validated select. Unqualified column references are bound
    /// to the single FROM relation here; multi-relation selects were
    /// already rejected by validation if any remain.
    pub fn compile(select: &Select, udfs: Arc<UdfRegistry>) -> Result<Self> {
        let mut select = select.clone();
        if select.from.len() == 1 {
            let binding = select.from[0].binding_name().to_string();
            rename_select(&mut select, "", &binding);
        }

        let mut relations = Vec::new();
        let mut windows = IndexMap::new();
        for relation in &select.from {
            let binding = relation.binding_name().to_string();
            windows.insert(binding.clone(), Window::new(relation.window.clone()));
            relations.push(binding);
        }

        let mut aggregates = Vec::new();
        let mut projections = Vec::new();
        for (idx, projection) in select.projections.iter().enumerate() {
            match projection {
                Projection::Expr { expr, .. } => {
                    collect_aggregates(expr, &udfs, &mut aggregates);
                    projections.push(CompiledProjection::Expr {
                        name: projection.output_name(idx),
                        expr: expr.clone(),
                    });
                }
                Projection::Wildcard { relation } => {
                    projections.push(CompiledProjection::Wildcard {
                        relation: relation.clone(),
                    });
                }
            }
        }
        if let Some(having) = &select.having {
            collect_aggregates(having, &udfs, &mut aggregates);
        }
        let grouped = !select.group_by.is_empty() || !aggregates.is_empty();

        Ok(Self {
            relations,
            windows,
            filter: select.filter.clone(),
            group_by: select.group_by.clone(),
            having: select.having.clone(),
            projections,
            aggregates,
            grouped,
            emitter: EmitterState::new(&select.emitter),
            udfs,
        })
    }

    /// Admits one tuple and returns the output tuples the emitter releases.
    pub fn process(&mut self, ctx: &Context, trigger: Tuple) -> Result<Vec<Tuple>> {
        let relation = trigger.input_name.clone();
        let trigger_ts = trigger.timestamp;
        let trigger_trace = trigger.trace.clone();
        let trigger_batch = trigger.batch_id;

        match self.windows.get_mut(&relation) {
            Some(window) => window.push(trigger),
            None => {
                return Err(RuntimeError::Runtime(format!(
                    "tuple arrived on unknown input '{}'",
                    relation
                )))
            }
        }

        let rows = self.join_rows();
        let rows = self.filter_rows(ctx, rows)?;
        let result_set = if self.grouped {
            let rows = rows.into_iter().map(|(row, _)| row).collect();
            self.project_groups(ctx, rows, trigger_ts, &trigger_trace, trigger_batch)?
        } else {
            let mut out = Vec::with_capacity(rows.len());
            for (row, origins) in &rows {
                let data = self.eval_projections(ctx, row, None)?;
                let (ts, trace, batch_id) = newest_meta(row.values())
                    .unwrap_or((trigger_ts, trigger_trace.clone(), trigger_batch));
                out.push(OutputRow::new(data, origins, ts, trace, batch_id));
            }
            out
        };

        let emitted = self.emitter.emit(result_set);
        Ok(emitted
            .into_iter()
            .map(|row| {
                let mut tuple = Tuple::new(row.data);
                tuple.timestamp = row.timestamp;
                tuple.trace = row.trace;
                tuple.batch_id = row.batch_id;
                tuple
            })
            .collect())
    }

    /// Cartesian product of the current window contents in FROM order. Each
    /// row carries the admission sequences of its source tuples, the row's
    /// identity for emitter diffing.
    fn join_rows(&self) -> Vec<(RowContext, Vec<u64>)> {
        let mut rows = vec![(RowContext::new(), Vec::new())];
        for relation in &self.relations {
            let window = &self.windows[relation];
            if window.is_empty() {
                return Vec::new();
            }
            let mut next = Vec::with_capacity(rows.len() * window.len());
            for (row, origins) in &rows {
                for (seq, tuple) in window.entries() {
                    let mut joined = row.clone();
                    joined.insert(relation.clone(), tuple.clone());
                    let mut joined_origins = origins.clone();
                    joined_origins.push(seq);
                    next.push((joined, joined_origins));
                }
            }
            rows = next;
        }
        rows
    }

    fn filter_rows(
        &self,
        ctx: &Context,
        rows: Vec<(RowContext, Vec<u64>)>,
    ) -> Result<Vec<(RowContext, Vec<u64>)>> {
        let Some(filter) = &self.filter else {
            return Ok(rows);
        };
        let mut kept = Vec::with_capacity(rows.len());
        for (row, origins) in rows {
            // NULL in the predicate keeps the row out.
            if eval(filter, &row, &self.udfs, ctx, None)?.to_bool()? {
                kept.push((row, origins));
            }
        }
        Ok(kept)
    }

    fn project_groups(
        &self,
        ctx: &Context,
        rows: Vec<RowContext>,
        trigger_ts: DateTime<Utc>,
        trigger_trace: &[TraceEvent],
        trigger_batch: u64,
    ) -> Result<Vec<OutputRow>> {
        let mut groups: IndexMap<Vec<u8>, Vec<RowContext>> = IndexMap::new();
        if self.group_by.is_empty() {
            // A groupless aggregate query has exactly one group, even over
            // the empty result set (count() = 0 and friends).
            groups.insert(Vec::new(), rows);
        } else {
            for row in rows {
                let mut key = Vec::new();
                for expr in &self.group_by {
                    eval(expr, &row, &self.udfs, ctx, None)?.encode_canonical(&mut key);
                }
                groups.entry(key).or_default().push(row);
            }
        }

        let mut out = Vec::with_capacity(groups.len());
        for rows in groups.into_values() {
            let aggregates = self.eval_aggregates(ctx, &rows)?;
            let representative = rows.first().cloned().unwrap_or_default();
            if let Some(having) = &self.having {
                if !eval(having, &representative, &self.udfs, ctx, Some(&aggregates))?
                    .to_bool()?
                {
                    continue;
                }
            }
            let data = self.eval_projections(ctx, &representative, Some(&aggregates))?;
            let (ts, trace, batch_id) = newest_meta(rows.iter().flat_map(|r| r.values()))
                .unwrap_or((trigger_ts, trigger_trace.to_vec(), trigger_batch));
            out.push(OutputRow::new(data, &[], ts, trace, batch_id));
        }
        Ok(out)
    }

    /// Evaluates each distinct aggregate call once per group. Parameters
    /// marked aggregate receive the whole group as an array; the rest are
    /// evaluated on the group's representative row.
    fn eval_aggregates(&self, ctx: &Context, rows: &[RowContext]) -> Result<AggregateValues> {
        let mut values = AggregateValues::default();
        for (key, call) in &self.aggregates {
            let Expr::FuncCall { name, args } = call else {
                continue;
            };
            let udf = self
                .udfs
                .lookup(name)
                .ok_or_else(|| RuntimeError::Type(format!("unknown function '{}'", name)))?;
            let mut call_args = Vec::with_capacity(args.len());
            for (idx, arg) in args.iter().enumerate() {
                if udf.is_aggregation_parameter(idx) {
                    let mut group_values = Vec::with_capacity(rows.len());
                    for row in rows {
                        group_values.push(eval(arg, row, &self.udfs, ctx, None)?);
                    }
                    call_args.push(freshet_core::Value::Array(group_values));
                } else {
                    let representative = rows.first().cloned().unwrap_or_default();
                    call_args.push(eval(arg, &representative, &self.udfs, ctx, None)?);
                }
            }
            values.insert(key.clone(), udf.call(ctx, &call_args)?);
        }
        Ok(values)
    }

    fn eval_projections(
        &self,
        ctx: &Context,
        row: &RowContext,
        aggregates: Option<&AggregateValues>,
    ) -> Result<Map> {
        let mut data = Map::new();
        for projection in &self.projections {
            match projection {
                CompiledProjection::Expr { name, expr } => {
                    let value = eval(expr, row, &self.udfs, ctx, aggregates)?;
                    // A missing value means "field absent", so it is.
                    if !value.is_missing() {
                        data.insert(name.clone(), value);
                    }
                }
                CompiledProjection::Wildcard { relation } => match relation {
                    Some(relation) => {
                        if let Some(tuple) = row.get(relation.as_str()) {
                            for (k, v) in tuple.data() {
                                data.insert(k.clone(), v.clone());
                            }
                        }
                    }
                    None => {
                        for binding in &self.relations {
                            if let Some(tuple) = row.get(binding.as_str()) {
                                for (k, v) in tuple.data() {
                                    data.insert(k.clone(), v.clone());
                                }
                            }
                        }
                    }
                },
            }
        }
        Ok(data)
    }
}

/// Metadata of the newest tuple among `tuples`: output tuples carry the
/// maximum timestamp of their source tuples and that tuple's trace.
fn newest_meta<'a>(
    tuples: impl Iterator<Item = &'a Tuple>,
) -> Option<(DateTime<Utc>, Vec<TraceEvent>, u64)> {
    tuples
        .max_by_key(|t| t.timestamp)
        .map(|t| (t.timestamp, t.trace.clone(), t.batch_id))
}

fn rename_select(select: &mut Select, from: &str, to: &str) {
    for projection in &mut select.projections {
        if let Projection::Expr { expr, .. } = projection {
            *expr = expr.rename_referenced_relation(from, to);
        }
    }
    if let Some(filter) = &mut select.filter {
        *filter = filter.rename_referenced_relation(from, to);
    }
    for expr in &mut select.group_by {
        *expr = expr.rename_referenced_relation(from, to);
    }
    if let Some(having) = &mut select.having {
        *having = having.rename_referenced_relation(from, to);
    }
}

/// Runs a select plan inside a node's writer chain. The plan is the box's
/// only mutable state; with more than one worker the lock serializes window
/// updates while output order stays unspecified.
pub struct BoxWriter {
    plan: Mutex<SelectPlan>,
    out: Arc<dyn Writer>,
}

impl BoxWriter {
    pub fn new(plan: SelectPlan, out: Arc<dyn Writer>) -> Self {
        Self {
            plan: Mutex::new(plan),
            out,
        }
    }
}

#[async_trait]
impl Writer for BoxWriter {
    async fn write(&self, ctx: &Context, tuple: Tuple) -> Result<()> {
        let outputs = self.plan.lock().await.process(ctx, tuple)?;
        for tuple in outputs {
            self.out.write(ctx, tuple).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use freshet_core::ast::Stmt;
    use freshet_core::Value;

    fn plan_for(query: &str) -> SelectPlan {
        let (stmt, _) = freshet_parser::parse(query).unwrap();
        let Stmt::Select(union) = stmt else {
            panic!("expected a select")
        };
        SelectPlan::compile(&union.selects[0], Arc::new(UdfRegistry::default())).unwrap()
    }

    fn source_tuples(n: i64) -> Vec<Tuple> {
        let base = Utc::now();
        (1..=n)
            .map(|i| {
                let mut t = Tuple::new(Map::new())
                    .with_field("int", i)
                    .with_timestamp(base + Duration::seconds(i - 1))
                    .with_batch_id(i as u64 - 1);
                t.input_name = "source".to_string();
                t
            })
            .collect()
    }

    #[test]
    fn test_filter_and_projection() {
        let ctx = Context::new();
        let mut plan = plan_for(
            "SELECT ISTREAM int, str((int+1) % 3) AS x \
             FROM source [RANGE 1 TUPLES] WHERE int % 2 = 0",
        );
        let mut emitted = Vec::new();
        for t in source_tuples(4) {
            emitted.extend(plan.process(&ctx, t).unwrap());
        }
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].get_int("int"), Some(2));
        assert_eq!(emitted[0].get_str("x"), Some("0"));
        assert_eq!(emitted[1].get_int("int"), Some(4));
        assert_eq!(emitted[1].get_str("x"), Some("2"));
    }

    #[test]
    fn test_output_keeps_source_timestamp() {
        let ctx = Context::new();
        let mut plan = plan_for("SELECT ISTREAM int FROM source [RANGE 1 TUPLES]");
        let tuples = source_tuples(2);
        let expected_ts = tuples[0].timestamp;
        let out = plan.process(&ctx, tuples[0].clone()).unwrap();
        assert_eq!(out[0].timestamp, expected_ts);
    }

    #[test]
    fn test_groupless_count_over_time_window() {
        let ctx = Context::new();
        let mut plan = plan_for(
            "SELECT ISTREAM count(1) FROM source [RANGE 2 SECONDS] WHERE int % 2 = 0",
        );
        let mut counts = Vec::new();
        for t in source_tuples(4) {
            for out in plan.process(&ctx, t).unwrap() {
                counts.push(out.get_int("count").unwrap());
            }
        }
        // Odd tuples keep the count where it was; ISTREAM emits only on
        // change: 0 (empty group), 1, then 2 once both evens fit the window.
        assert_eq!(counts, vec![0, 1, 2]);
    }

    #[test]
    fn test_self_join_produces_both_columns() {
        let ctx = Context::new();
        let mut plan = plan_for(
            "SELECT RSTREAM source:int AS a, s2:int AS b \
             FROM source [RANGE 1 TUPLES], source [RANGE 1 TUPLES] AS s2",
        );
        let tuples = source_tuples(2);

        // Arrival on each binding separately, the way the fan-in feeds a
        // self-join through two edges.
        let mut first = tuples[0].clone();
        first.input_name = "source".to_string();
        let mut first_alias = tuples[0].clone();
        first_alias.input_name = "s2".to_string();

        assert!(plan.process(&ctx, first).unwrap().is_empty()); // s2 window still empty
        let out = plan.process(&ctx, first_alias).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get_int("a"), Some(1));
        assert_eq!(out[0].get_int("b"), Some(1));
        assert_eq!(out[0].timestamp, tuples[0].timestamp);
    }

    #[test]
    fn test_group_by_key() {
        let ctx = Context::new();
        let mut plan = plan_for(
            "SELECT RSTREAM parity, count(1) AS n FROM source [RANGE 4 TUPLES] GROUP BY parity",
        );
        let base = Utc::now();
        for i in 1..=4i64 {
            let mut t = Tuple::new(Map::new())
                .with_field("int", i)
                .with_field("parity", i % 2)
                .with_timestamp(base + Duration::seconds(i));
            t.input_name = "source".to_string();
            let out = plan.process(&ctx, t).unwrap();
            if i == 4 {
                assert_eq!(out.len(), 2);
                for row in &out {
                    assert_eq!(row.get_int("n"), Some(2));
                    assert!(row.get_int("parity").is_some());
                }
            }
        }
    }

    #[test]
    fn test_having_filters_groups() {
        let ctx = Context::new();
        let mut plan = plan_for(
            "SELECT RSTREAM count(1) AS n FROM source [RANGE 4 TUPLES] HAVING count(1) > 2",
        );
        let mut seen = Vec::new();
        for t in source_tuples(4) {
            for out in plan.process(&ctx, t).unwrap() {
                seen.push(out.get_int("n").unwrap());
            }
        }
        assert_eq!(seen, vec![3, 4]);
    }

    #[test]
    fn test_wildcard_merges_relation_data() {
        let ctx = Context::new();
        let mut plan = plan_for("SELECT RSTREAM * FROM source [RANGE 1 TUPLES]");
        let out = plan
            .process(&ctx, source_tuples(1).remove(0))
            .unwrap();
        assert_eq!(out[0].get_int("int"), Some(1));
    }

    #[test]
    fn test_missing_projection_omits_field() {
        let ctx = Context::new();
        let mut plan = plan_for("SELECT RSTREAM int, absent FROM source [RANGE 1 TUPLES]");
        let out = plan.process(&ctx, source_tuples(1).remove(0)).unwrap();
        assert_eq!(out[0].get_int("int"), Some(1));
        assert!(out[0].get("absent").is_none());
    }

    #[test]
    fn test_unknown_input_is_an_error() {
        let ctx = Context::new();
        let mut plan = plan_for("SELECT RSTREAM int FROM source [RANGE 1 TUPLES]");
        let mut t = Tuple::new(Map::new());
        t.input_name = "elsewhere".to_string();
        assert!(plan.process(&ctx, t).is_err());
    }

    #[test]
    fn test_eval_error_in_projection_propagates() {
        let ctx = Context::new();
        let mut plan = plan_for("SELECT RSTREAM int / 0 AS boom FROM source [RANGE 1 TUPLES]");
        let err = plan.process(&ctx, source_tuples(1).remove(0)).unwrap_err();
        assert!(matches!(err, RuntimeError::Type(_)));
    }

    #[test]
    fn test_istream_singleton_window_passes_duplicates_through() {
        // A duplicated stream re-admits identical payloads; every admission
        // is a new row, so ISTREAM over RANGE 1 TUPLES acts as a filter.
        let ctx = Context::new();
        let mut plan = plan_for("SELECT ISTREAM int FROM source [RANGE 1 TUPLES]");
        let tuples = source_tuples(1);
        let mut emitted = 0;
        for _ in 0..3 {
            emitted += plan.process(&ctx, tuples[0].shallow_copy()).unwrap().len();
        }
        assert_eq!(emitted, 3);
    }

    #[test]
    fn test_istream_aggregate_rows_compare_by_data() {
        // Grouped rows have no tuple identity: an unchanged count emits
        // nothing.
        let ctx = Context::new();
        let mut plan =
            plan_for("SELECT ISTREAM count(1) FROM source [RANGE 4 TUPLES] WHERE int % 2 = 0");
        let tuples = source_tuples(3);
        assert_eq!(plan.process(&ctx, tuples[0].clone()).unwrap().len(), 1); // count 0
        assert_eq!(plan.process(&ctx, tuples[1].clone()).unwrap().len(), 1); // count 1
        // The odd tuple leaves the count unchanged.
        assert_eq!(plan.process(&ctx, tuples[2].clone()).unwrap().len(), 0);
    }

    #[test]
    fn test_sum_aggregate_over_group() {
        let ctx = Context::new();
        let mut plan =
            plan_for("SELECT RSTREAM sum(int) AS total FROM source [RANGE 3 TUPLES]");
        let mut last = Value::Null;
        for t in source_tuples(3) {
            for out in plan.process(&ctx, t).unwrap() {
                last = out.get("total").cloned().unwrap();
            }
        }
        assert_eq!(last, Value::Int(6));
    }
}
