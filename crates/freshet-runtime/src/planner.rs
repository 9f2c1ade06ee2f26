//! Planner: applying parsed statements to a running topology
//!
//! The topology builder validates each statement, folds constant
//! expressions, and mutates the topology: instantiating sources and sinks
//! through the registry, planning boxes for CREATE STREAM, and wiring pipes
//! between fan-outs and fan-ins.

use crate::context::Context;
use crate::error::{Result, RuntimeError};
use crate::exec::evaluator::{contains_aggregate, eval, fold_expr, RowContext};
use crate::exec::plan::{BoxWriter, SelectPlan};
use crate::fanin::FanIn;
use crate::fanout::{FanOut, FanOutEvent};
use crate::pipe::{pipe, DropMode};
use crate::registry::Registry;
use crate::sink::{ChannelSink, SinkWriter};
use crate::state::{NoopStateStore, StateStore};
use crate::topology::{NodeBody, NodeKind, NodeState, StateHolder, Topology, TopologyNode};
use crate::udsf::UdsfWriter;
use crate::writer::{TraceWriter, Writer};
use freshet_core::ast::{
    DropTarget, Expr, Projection, Relation, RelationSource, Sampler, Select, SelectUnion,
    Shedding, Stmt, UpdateTarget,
};
use freshet_core::{Map, Tuple, Value};
use freshet_parser::parse_all;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{error, info};

/// Capacity of a pipe when the window declares no BUFFER SIZE.
const DEFAULT_PIPE_CAPACITY: usize = 1024;

/// Outcome of applying one statement.
#[derive(Debug)]
pub enum ApplyResult {
    Done,
    /// EVAL result.
    Value(Value),
    /// Ad-hoc SELECT result stream.
    Select(AdHocSelect),
}

/// Handle to the temporaries backing an ad-hoc SELECT. Dropping it tears
/// the temporary box and sink down.
#[derive(Debug)]
pub struct AdHocSelect {
    pub receiver: mpsc::UnboundedReceiver<Tuple>,
    topology: Weak<Topology>,
    stream: String,
    sink: String,
}

impl AdHocSelect {
    pub async fn next(&mut self) -> Option<Tuple> {
        self.receiver.recv().await
    }
}

impl Drop for AdHocSelect {
    fn drop(&mut self) {
        let Some(topology) = self.topology.upgrade() else {
            return;
        };
        let stream = std::mem::take(&mut self.stream);
        let sink = std::mem::take(&mut self.sink);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let ctx = topology.context().clone();
                for name in [stream, sink] {
                    if let Some(node) = topology.node(&name).await {
                        node.stop(&ctx).await;
                        topology.remove_node(&name).await;
                    }
                }
            });
        }
    }
}

pub struct TopologyBuilder {
    topology: Arc<Topology>,
    registry: Arc<Registry>,
    state_store: Arc<dyn StateStore>,
    ephemeral_counter: AtomicU64,
}

impl TopologyBuilder {
    pub fn new(topology: Arc<Topology>, registry: Arc<Registry>) -> Self {
        Self {
            topology,
            registry,
            state_store: Arc::new(NoopStateStore),
            ephemeral_counter: AtomicU64::new(0),
        }
    }

    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = store;
        self
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Parses and applies every statement in `text`.
    pub async fn apply_fql(&self, text: &str) -> Result<Vec<ApplyResult>> {
        let statements = parse_all(text)?;
        let mut results = Vec::with_capacity(statements.len());
        for stmt in statements {
            results.push(self.apply(stmt).await?);
        }
        Ok(results)
    }

    pub async fn apply(&self, stmt: Stmt) -> Result<ApplyResult> {
        let ctx = self.topology.context().clone();
        match stmt {
            Stmt::CreateSource {
                paused,
                name,
                source_type,
                params,
            } => {
                let params = self.const_params(&ctx, &params)?;
                let source = self.registry.create_source(&ctx, &source_type, &params)?;
                self.spawn_source(&ctx, &name, source, paused).await?;
                Ok(ApplyResult::Done)
            }

            Stmt::CreateSink {
                name,
                sink_type,
                params,
            } => {
                let params = self.const_params(&ctx, &params)?;
                let sink = self.registry.create_sink(&ctx, &sink_type, &params)?;
                self.spawn_sink(&ctx, &name, sink).await?;
                Ok(ApplyResult::Done)
            }

            Stmt::CreateState {
                name,
                state_type,
                params,
            } => {
                let params = self.const_params(&ctx, &params)?;
                let state = self.registry.create_state(&ctx, &state_type, &params)?;
                ctx.add_state(&name, state)?;
                Ok(ApplyResult::Done)
            }

            Stmt::CreateStream { name, select } => {
                self.create_stream(&ctx, &name, &select).await?;
                Ok(ApplyResult::Done)
            }

            Stmt::InsertInto { sink, stream } => {
                self.insert_into(&sink, &stream).await?;
                Ok(ApplyResult::Done)
            }

            Stmt::PauseSource(name) => {
                let node = self.topology.node_of_kind(&name, NodeKind::Source).await?;
                if let Some(fan_out) = &node.fan_out {
                    fan_out.set_paused(true);
                }
                if let (NodeBody::Source(source), Some(holder)) = (&node.body, &node.source_state)
                {
                    source.pause(&ctx).await?;
                    if holder.get() == NodeState::Running {
                        holder.set(NodeState::Paused);
                    }
                }
                Ok(ApplyResult::Done)
            }

            Stmt::ResumeSource(name) => {
                let node = self.topology.node_of_kind(&name, NodeKind::Source).await?;
                if let (NodeBody::Source(source), Some(holder)) = (&node.body, &node.source_state)
                {
                    source.resume(&ctx).await?;
                    if holder.get() == NodeState::Paused {
                        holder.set(NodeState::Running);
                    }
                }
                if let Some(fan_out) = &node.fan_out {
                    fan_out.set_paused(false);
                }
                Ok(ApplyResult::Done)
            }

            Stmt::RewindSource(name) => {
                let node = self.topology.node_of_kind(&name, NodeKind::Source).await?;
                match &node.body {
                    NodeBody::Source(source) => source.rewind(&ctx).await?,
                    _ => unreachable!("kind checked above"),
                }
                Ok(ApplyResult::Done)
            }

            Stmt::Drop { kind, name } => {
                self.drop_node(&ctx, kind, &name).await?;
                Ok(ApplyResult::Done)
            }

            Stmt::UpdateNode { kind, name, params } => {
                let params = self.const_params(&ctx, &params)?;
                match kind {
                    UpdateTarget::Source => {
                        let node = self.topology.node_of_kind(&name, NodeKind::Source).await?;
                        match &node.body {
                            NodeBody::Source(source) => source.update(&ctx, &params).await?,
                            _ => unreachable!("kind checked above"),
                        }
                    }
                    UpdateTarget::Sink => {
                        let node = self.topology.node_of_kind(&name, NodeKind::Sink).await?;
                        match &node.body {
                            NodeBody::Sink(sink) => sink.update(&ctx, &params).await?,
                            _ => unreachable!("kind checked above"),
                        }
                    }
                    UpdateTarget::State => {
                        let state = ctx.state(&name).ok_or_else(|| {
                            RuntimeError::plan(format!("state '{}' was not found", name))
                        })?;
                        state.update(&params)?;
                    }
                }
                Ok(ApplyResult::Done)
            }

            Stmt::LoadState {
                name,
                state_type,
                tag,
                params,
                create_if_not_saved,
            } => {
                let params = self.const_params(&ctx, &params)?;
                let loaded = self
                    .state_store
                    .load(&name, &state_type, tag.as_deref())?;
                let state = match (loaded, create_if_not_saved) {
                    (Some(state), _) => state,
                    (None, Some(create_params)) => {
                        let create_params = self.const_params(&ctx, &create_params)?;
                        self.registry.create_state(&ctx, &state_type, &create_params)?
                    }
                    (None, None) => {
                        return Err(RuntimeError::plan(format!(
                            "state '{}' was never saved",
                            name
                        )))
                    }
                };
                if !params.is_empty() {
                    state.update(&params)?;
                }
                ctx.replace_state(&name, state);
                Ok(ApplyResult::Done)
            }

            Stmt::SaveState { name, tag } => {
                let state = ctx.state(&name).ok_or_else(|| {
                    RuntimeError::plan(format!("state '{}' was not found", name))
                })?;
                self.state_store.save(&name, tag.as_deref(), &state)?;
                Ok(ApplyResult::Done)
            }

            Stmt::Select(union) => {
                let handle = self.ad_hoc_select(&ctx, union).await?;
                Ok(ApplyResult::Select(handle))
            }

            Stmt::Eval { expr, input } => {
                let value = self.eval_statement(&ctx, &expr, input.as_ref())?;
                Ok(ApplyResult::Value(value))
            }
        }
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    async fn spawn_source(
        &self,
        ctx: &Arc<Context>,
        name: &str,
        source: Arc<dyn crate::source::Source>,
        paused: bool,
    ) -> Result<()> {
        let fan_out = FanOut::new(NodeKind::Source, name);
        let holder = Arc::new(StateHolder::new());
        if paused {
            fan_out.set_paused(true);
        }
        let node = Arc::new(TopologyNode {
            name: name.to_string(),
            kind: NodeKind::Source,
            source_state: Some(holder.clone()),
            fan_ins: Vec::new(),
            fan_out: Some(fan_out.clone()),
            body: NodeBody::Source(source.clone()),
        });
        self.topology.add_node(node).await?;

        let ctx = ctx.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            holder.set(if paused {
                NodeState::Paused
            } else {
                NodeState::Running
            });
            let writer = TraceWriter::output(name.clone(), fan_out.clone() as Arc<dyn Writer>);
            if let Err(err) = source.generate(&ctx, &writer).await {
                if !matches!(err, RuntimeError::PipeClosed) {
                    error!(node = %name, %err, "the source stopped with an error");
                }
            }
            holder.set(NodeState::Stopping);
            fan_out.close(&ctx).await;
            holder.set(NodeState::Stopped);
            info!(node = %name, "source stopped");
        });
        Ok(())
    }

    async fn spawn_sink(
        &self,
        ctx: &Arc<Context>,
        name: &str,
        sink: Arc<dyn crate::sink::Sink>,
    ) -> Result<()> {
        let fan_in = FanIn::new(NodeKind::Sink, name);
        let node = Arc::new(TopologyNode {
            name: name.to_string(),
            kind: NodeKind::Sink,
            source_state: None,
            fan_ins: vec![fan_in.clone()],
            fan_out: None,
            body: NodeBody::Sink(sink.clone()),
        });
        self.topology.add_node(node).await?;

        let writer: Arc<dyn Writer> = Arc::new(TraceWriter::input(
            name,
            Arc::new(SinkWriter::new(sink.clone())),
        ));
        tokio::spawn(fan_in.clone().run(ctx.clone(), writer, 1));

        // Close the sink once its input winds down.
        let ctx = ctx.clone();
        tokio::spawn(async move {
            fan_in.state().wait_for(NodeState::Stopped).await;
            let _ = sink.close(&ctx).await;
        });
        Ok(())
    }

    async fn create_stream(
        &self,
        ctx: &Arc<Context>,
        name: &str,
        union: &SelectUnion,
    ) -> Result<()> {
        if self.topology.node(name).await.is_some() {
            return Err(RuntimeError::plan(format!(
                "node '{}' already exists",
                name
            )));
        }
        let fan_out = FanOut::new(NodeKind::Box, name);
        let mut fan_ins = Vec::new();

        for (select_idx, select) in union.selects.iter().enumerate() {
            let select = self.fold_select(ctx, select)?;
            self.validate_select(&select)?;

            let fan_in = FanIn::new(NodeKind::Box, name);
            for (rel_idx, relation) in select.from.iter().enumerate() {
                let binding = relation.binding_name().to_string();
                let upstream = match &relation.source {
                    RelationSource::Stream(stream) => self.upstream_fan_out(stream).await?,
                    RelationSource::Udsf { name: udsf_name, args } => {
                        self.create_udsf_node(ctx, name, select_idx, rel_idx, udsf_name, args)
                            .await?
                    }
                };
                let capacity = relation
                    .window
                    .capacity
                    .map(|c| c as usize)
                    .unwrap_or(DEFAULT_PIPE_CAPACITY);
                let drop_mode = match relation.window.shedding {
                    Shedding::Wait => DropMode::None,
                    Shedding::DropOldest => DropMode::Oldest,
                    Shedding::DropNewest => DropMode::Latest,
                };
                let (receiver, sender) = pipe(&binding, capacity, drop_mode);
                upstream
                    .add(&format!("{}#{}:{}", name, select_idx, binding), sender)
                    .await?;
                fan_in.add(&binding, receiver)?;
            }
            fan_in.stop_on_disconnect();

            let plan = SelectPlan::compile(&select, self.registry.udfs.clone())?;
            let out: Arc<dyn Writer> =
                Arc::new(TraceWriter::output(name, fan_out.clone() as Arc<dyn Writer>));
            let writer: Arc<dyn Writer> =
                Arc::new(TraceWriter::input(name, Arc::new(BoxWriter::new(plan, out))));
            tokio::spawn(fan_in.clone().run(ctx.clone(), writer, 1));
            fan_ins.push(fan_in);
        }

        // The stream's output closes after the last sub-select stops.
        {
            let fan_out = fan_out.clone();
            let fan_ins = fan_ins.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                for fan_in in &fan_ins {
                    fan_in.state().wait_for(NodeState::Stopped).await;
                }
                fan_out.close(&ctx).await;
            });
        }

        let node = Arc::new(TopologyNode {
            name: name.to_string(),
            kind: NodeKind::Box,
            source_state: None,
            fan_ins,
            fan_out: Some(fan_out),
            body: NodeBody::Box,
        });
        self.topology.add_node(node).await
    }

    /// Materializes the hidden node backing a `name(args)` FROM relation and
    /// returns its fan-out for the consuming box to subscribe to.
    async fn create_udsf_node(
        &self,
        ctx: &Arc<Context>,
        box_name: &str,
        select_idx: usize,
        rel_idx: usize,
        udsf_name: &str,
        args: &[Expr],
    ) -> Result<Arc<FanOut>> {
        let values: Vec<Value> = args
            .iter()
            .map(|e| self.const_value(ctx, e))
            .collect::<Result<_>>()?;
        let udsf = self.registry.create_udsf(udsf_name, &values)?;
        let input = udsf.input_stream().to_string();
        let upstream = self.upstream_fan_out(&input).await?;

        // '#' keeps the node out of the FQL namespace.
        let hidden = format!("{}#{}#{}_{}", box_name, udsf_name, select_idx, rel_idx);
        let fan_out = FanOut::new(NodeKind::Box, hidden.clone());
        let fan_in = FanIn::new(NodeKind::Box, hidden.clone());

        let (receiver, sender) = pipe(&input, DEFAULT_PIPE_CAPACITY, DropMode::None);
        upstream
            .add(&format!("{}:{}", hidden, input), sender)
            .await?;
        fan_in.add(&input, receiver)?;
        fan_in.stop_on_disconnect();

        let writer: Arc<dyn Writer> = Arc::new(UdsfWriter::new(
            udsf,
            fan_out.clone() as Arc<dyn Writer>,
        ));
        tokio::spawn(fan_in.clone().run(ctx.clone(), writer, 1));

        // When the consuming box goes away, the hidden node follows.
        {
            let topology = Arc::downgrade(&self.topology);
            let fan_in = fan_in.clone();
            let hidden = hidden.clone();
            fan_out.set_callback(move |event| {
                if event != FanOutEvent::Disconnect {
                    return;
                }
                let Some(topology) = topology.upgrade() else {
                    return;
                };
                let fan_in = fan_in.clone();
                let hidden = hidden.clone();
                tokio::spawn(async move {
                    fan_in.stop().await;
                    topology.remove_node(&hidden).await;
                });
            });
        }

        {
            let fan_out = fan_out.clone();
            let fan_in = fan_in.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                fan_in.state().wait_for(NodeState::Stopped).await;
                fan_out.close(&ctx).await;
            });
        }

        let node = Arc::new(TopologyNode {
            name: hidden,
            kind: NodeKind::Box,
            source_state: None,
            fan_ins: vec![fan_in],
            fan_out: Some(fan_out.clone()),
            body: NodeBody::Box,
        });
        self.topology.add_node(node).await?;
        Ok(fan_out)
    }

    async fn upstream_fan_out(&self, name: &str) -> Result<Arc<FanOut>> {
        let node = self
            .topology
            .node(name)
            .await
            .ok_or_else(|| RuntimeError::plan(format!("node '{}' was not found", name)))?;
        match (node.kind, &node.fan_out) {
            (NodeKind::Sink, _) | (_, None) => Err(RuntimeError::plan(format!(
                "node '{}' does not produce a stream",
                name
            ))),
            (_, Some(fan_out)) => Ok(fan_out.clone()),
        }
    }

    async fn insert_into(&self, sink: &str, stream: &str) -> Result<()> {
        let sink_node = self.topology.node_of_kind(sink, NodeKind::Sink).await?;
        let upstream = self.upstream_fan_out(stream).await?;
        let fan_in = sink_node
            .fan_ins
            .first()
            .ok_or_else(|| RuntimeError::plan(format!("sink '{}' has no input", sink)))?;
        let (receiver, sender) = pipe(stream, DEFAULT_PIPE_CAPACITY, DropMode::None);
        upstream.add(sink, sender).await?;
        fan_in.add(stream, receiver)?;
        Ok(())
    }

    async fn drop_node(&self, ctx: &Arc<Context>, kind: DropTarget, name: &str) -> Result<()> {
        let node_kind = match kind {
            DropTarget::Source => NodeKind::Source,
            DropTarget::Stream => NodeKind::Box,
            DropTarget::Sink => NodeKind::Sink,
            DropTarget::State => {
                ctx.remove_state(name).ok_or_else(|| {
                    RuntimeError::plan(format!("state '{}' was not found", name))
                })?;
                return Ok(());
            }
        };
        let node = self.topology.node_of_kind(name, node_kind).await?;
        node.stop(ctx).await;
        self.topology.remove_node(name).await;
        Ok(())
    }

    async fn ad_hoc_select(&self, ctx: &Arc<Context>, union: SelectUnion) -> Result<AdHocSelect> {
        let id = self.ephemeral_counter.fetch_add(1, Ordering::Relaxed);
        let stream = format!("_select_{}", id);
        let sink = format!("_select_sink_{}", id);

        self.create_stream(ctx, &stream, &union).await?;
        let (channel_sink, receiver) = ChannelSink::new();
        self.spawn_sink(ctx, &sink, Arc::new(channel_sink)).await?;
        self.insert_into(&sink, &stream).await?;

        Ok(AdHocSelect {
            receiver,
            topology: Arc::downgrade(&self.topology),
            stream,
            sink,
        })
    }

    fn eval_statement(
        &self,
        ctx: &Context,
        expr: &Expr,
        input: Option<&Expr>,
    ) -> Result<Value> {
        let udfs = &self.registry.udfs;
        if contains_aggregate(expr, udfs) {
            return Err(RuntimeError::plan(
                "aggregate functions cannot be used in EVAL",
            ));
        }
        match input {
            Some(input_expr) => {
                let input_value = self.const_value(ctx, input_expr)?;
                let Value::Map(map) = input_value else {
                    return Err(RuntimeError::plan("the ON clause of EVAL takes a map"));
                };
                let mut row = RowContext::new();
                row.insert(String::new(), Tuple::new(map));
                eval(expr, &row, udfs, ctx, None)
            }
            None => {
                if !expr.foldable() {
                    return Err(RuntimeError::plan(
                        "the expression is not evaluable without an ON input",
                    ));
                }
                eval(expr, &RowContext::new(), udfs, ctx, None)
            }
        }
    }

    // ========================================================================
    // Validation and constant folding
    // ========================================================================

    fn fold_select(&self, ctx: &Context, select: &Select) -> Result<Select> {
        let udfs = &self.registry.udfs;
        let mut folded = select.clone();
        for projection in &mut folded.projections {
            if let Projection::Expr { expr, .. } = projection {
                *expr = fold_expr(expr, udfs, ctx)?;
            }
        }
        if let Some(filter) = &mut folded.filter {
            *filter = fold_expr(filter, udfs, ctx)?;
        }
        for expr in &mut folded.group_by {
            *expr = fold_expr(expr, udfs, ctx)?;
        }
        if let Some(having) = &mut folded.having {
            *having = fold_expr(having, udfs, ctx)?;
        }
        Ok(folded)
    }

    fn validate_select(&self, select: &Select) -> Result<()> {
        let udfs = &self.registry.udfs;

        // FROM aliases must be unique within the select.
        let mut bindings: HashSet<&str> = HashSet::new();
        for relation in &select.from {
            if !bindings.insert(relation.binding_name()) {
                return Err(RuntimeError::plan(format!(
                    "relation alias '{}' is used more than once",
                    relation.binding_name()
                )));
            }
            let window = &relation.window;
            if window.range < 1 {
                return Err(RuntimeError::plan("the window range must be positive"));
            }
            if let Some(capacity) = window.capacity {
                if capacity < 1 {
                    return Err(RuntimeError::plan("BUFFER SIZE must be positive"));
                }
            }
        }

        // Aliased projections must be unique.
        let mut names: HashSet<String> = HashSet::new();
        for (idx, projection) in select.projections.iter().enumerate() {
            if let Projection::Expr { .. } = projection {
                let name = projection.output_name(idx);
                if !names.insert(name.clone()) {
                    return Err(RuntimeError::plan(format!(
                        "output column '{}' is produced more than once",
                        name
                    )));
                }
            }
            if let Projection::Wildcard {
                relation: Some(rel),
            } = projection
            {
                if !bindings.contains(rel.as_str()) {
                    return Err(RuntimeError::plan(format!(
                        "wildcard references unknown relation '{}'",
                        rel
                    )));
                }
            }
        }

        // Every referenced relation must come from FROM.
        let mut referenced = HashSet::new();
        for projection in &select.projections {
            if let Projection::Expr { expr, .. } = projection {
                referenced.extend(expr.referenced_relations());
            }
        }
        if let Some(filter) = &select.filter {
            referenced.extend(filter.referenced_relations());
        }
        for expr in &select.group_by {
            referenced.extend(expr.referenced_relations());
        }
        if let Some(having) = &select.having {
            referenced.extend(having.referenced_relations());
        }
        for relation in &referenced {
            if relation.is_empty() {
                if select.from.len() != 1 {
                    return Err(RuntimeError::plan(
                        "unqualified column references are ambiguous with multiple FROM relations",
                    ));
                }
                continue;
            }
            if !bindings.contains(relation.as_str()) {
                return Err(RuntimeError::plan(format!(
                    "expression references relation '{}' which is not in FROM",
                    relation
                )));
            }
        }

        if let Some(filter) = &select.filter {
            if contains_aggregate(filter, udfs) {
                return Err(RuntimeError::plan(
                    "aggregate functions are not allowed in WHERE",
                ));
            }
        }

        // GROUP BY expressions are row references or fold to constants.
        for expr in &select.group_by {
            if contains_aggregate(expr, udfs) {
                return Err(RuntimeError::plan(
                    "aggregate functions are not allowed in GROUP BY",
                ));
            }
            if !matches!(expr, Expr::RowValue { .. }) && !expr.foldable() {
                return Err(RuntimeError::plan(format!(
                    "GROUP BY expression '{}' must be a column reference or constant",
                    expr
                )));
            }
        }

        // Grouped selects restrict what projections may reference.
        let mut has_aggregate = select
            .having
            .as_ref()
            .map(|h| contains_aggregate(h, udfs))
            .unwrap_or(false);
        for projection in &select.projections {
            if let Projection::Expr { expr, .. } = projection {
                has_aggregate |= contains_aggregate(expr, udfs);
            }
        }
        let grouped = !select.group_by.is_empty() || has_aggregate;
        if grouped {
            for projection in &select.projections {
                match projection {
                    Projection::Wildcard { .. } => {
                        return Err(RuntimeError::plan(
                            "wildcard projections are not allowed in grouped selects",
                        ))
                    }
                    Projection::Expr { expr, .. } => {
                        self.validate_grouped_expr(expr, select, udfs)?;
                    }
                }
            }
            if let Some(having) = &select.having {
                self.validate_grouped_expr(having, select, udfs)?;
            }
        }
        self.validate_samplers(select)
    }

    /// In a grouped select, an expression must be built from grouped-over
    /// expressions, aggregate calls over the grouped set, constants, or row
    /// references into singleton (`RANGE 1 TUPLES`) windows.
    fn validate_grouped_expr(
        &self,
        expr: &Expr,
        select: &Select,
        udfs: &crate::udf::UdfRegistry,
    ) -> Result<()> {
        if select.group_by.iter().any(|g| g == expr) {
            return Ok(());
        }
        match expr {
            Expr::FuncCall { name, .. } if udfs.is_aggregate(name) => Ok(()),
            Expr::RowValue { relation, .. } => {
                let singleton = select
                    .from
                    .iter()
                    .find(|r| {
                        r.binding_name() == relation
                            || (relation.is_empty() && select.from.len() == 1)
                    })
                    .map(singleton_window)
                    .unwrap_or(false);
                if singleton {
                    Ok(())
                } else {
                    Err(RuntimeError::plan(format!(
                        "column '{}' must appear in GROUP BY or be aggregated",
                        expr
                    )))
                }
            }
            Expr::Null | Expr::Bool(_) | Expr::Int(_) | Expr::Float(_) | Expr::Str(_) => Ok(()),
            Expr::Array(items) => {
                for e in items {
                    self.validate_grouped_expr(e, select, udfs)?;
                }
                Ok(())
            }
            Expr::Map(entries) => {
                for (_, e) in entries {
                    self.validate_grouped_expr(e, select, udfs)?;
                }
                Ok(())
            }
            Expr::Binary { left, right, .. } => {
                self.validate_grouped_expr(left, select, udfs)?;
                self.validate_grouped_expr(right, select, udfs)
            }
            Expr::Unary { expr, .. } | Expr::IsCheck { expr, .. } | Expr::Cast { expr, .. } => {
                self.validate_grouped_expr(expr, select, udfs)
            }
            Expr::Case {
                operand,
                whens,
                else_branch,
            } => {
                if let Some(e) = operand {
                    self.validate_grouped_expr(e, select, udfs)?;
                }
                for (w, t) in whens {
                    self.validate_grouped_expr(w, select, udfs)?;
                    self.validate_grouped_expr(t, select, udfs)?;
                }
                if let Some(e) = else_branch {
                    self.validate_grouped_expr(e, select, udfs)?;
                }
                Ok(())
            }
            Expr::FuncCall { args, .. } => {
                for e in args {
                    self.validate_grouped_expr(e, select, udfs)?;
                }
                Ok(())
            }
        }
    }

    fn validate_samplers(&self, select: &Select) -> Result<()> {
        for sampler in &select.emitter.samplers {
            match sampler {
                Sampler::Limit(k) if *k < 0 => {
                    return Err(RuntimeError::plan("LIMIT must not be negative"))
                }
                Sampler::EveryKth(k) if *k < 1 => {
                    return Err(RuntimeError::plan("EVERY k-TH TUPLE requires k >= 1"))
                }
                Sampler::SamplePercent(p) if !(0.0..=100.0).contains(p) => {
                    return Err(RuntimeError::plan(
                        "SAMPLE takes a percentage between 0 and 100",
                    ))
                }
                Sampler::EveryInterval { millis } if *millis < 1 => {
                    return Err(RuntimeError::plan("the emission interval must be positive"))
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Evaluates a constant expression (WITH/SET parameter values, UDSF
    /// arguments) at plan time.
    fn const_value(&self, ctx: &Context, expr: &Expr) -> Result<Value> {
        let udfs = &self.registry.udfs;
        if contains_aggregate(expr, udfs) || !expr.foldable() {
            return Err(RuntimeError::plan(format!(
                "'{}' is not a constant expression",
                expr
            )));
        }
        eval(expr, &RowContext::new(), udfs, ctx, None)
            .map_err(|e| RuntimeError::plan(e.to_string()))
    }

    fn const_params(&self, ctx: &Context, params: &[(String, Expr)]) -> Result<Map> {
        let mut map = Map::new();
        for (key, expr) in params {
            map.insert(key.clone(), self.const_value(ctx, expr)?);
        }
        Ok(map)
    }
}

fn singleton_window(relation: &Relation) -> bool {
    relation.window.unit == freshet_core::ast::WindowUnit::Tuples && relation.window.range == 1
}
