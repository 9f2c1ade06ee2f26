//! End-to-end topology tests: source -> box -> sink over FQL statements.

use freshet_core::{TraceEventType, Tuple};
use freshet_runtime::sink::Sink;
use freshet_runtime::{ApplyResult, CollectorSink, Registry, Topology, TopologyBuilder};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

async fn wait_for(sink: &CollectorSink, n: usize) {
    tokio::time::timeout(WAIT, sink.wait_for(n))
        .await
        .unwrap_or_else(|_| panic!("sink did not receive {} tuples in time", n));
}

/// Builds the standard test topology: a paused 4-tuple source, the given
/// stream statement, a collecting sink wired to `box`, then resume.
async fn setup(stmt: &str, trace: bool) -> (TopologyBuilder, Arc<CollectorSink>) {
    let _ = tracing_subscriber::fmt::try_init();
    let sink = CollectorSink::new();
    let shared = sink.clone();
    let mut registry = Registry::default();
    registry.register_sink("collector", move |_, _| {
        Ok(shared.clone() as Arc<dyn Sink>)
    });

    let topology = Topology::new("e2e");
    topology.context().flags.set_tuple_trace(trace);
    let builder = TopologyBuilder::new(topology, Arc::new(registry));
    builder
        .apply_fql("CREATE PAUSED SOURCE source TYPE dummy WITH num=4")
        .await
        .unwrap();
    builder.apply_fql(stmt).await.unwrap();
    builder
        .apply_fql(
            "CREATE SINK snk TYPE collector;
             INSERT INTO snk FROM box;
             RESUME SOURCE source;",
        )
        .await
        .unwrap();
    (builder, sink)
}

fn int_counts(tuples: &[Tuple], key: &str) -> BTreeMap<i64, usize> {
    let mut counts = BTreeMap::new();
    for t in tuples {
        *counts.entry(t.get_int(key).unwrap()).or_insert(0) += 1;
    }
    counts
}

#[tokio::test]
async fn test_basic_box_connectivity() {
    let (builder, sink) = setup(
        "CREATE STREAM box AS SELECT ISTREAM int, str((int+1) % 3) AS x \
         FROM source [RANGE 1 TUPLES] WHERE int % 2 = 0",
        true,
    )
    .await;
    wait_for(&sink, 2).await;

    let tuples = sink.tuples();
    assert_eq!(tuples.len(), 2);
    assert_eq!(tuples[0].get_int("int"), Some(2));
    assert_eq!(tuples[0].get_str("x"), Some("0"));
    assert_eq!(tuples[1].get_int("int"), Some(4));
    assert_eq!(tuples[1].get_str("x"), Some("2"));

    // Each tuple traversed source -> box -> snk and recorded every hop.
    for t in &tuples {
        assert_eq!(t.trace.len(), 4, "trace: {:?}", t.trace);
        assert_eq!(t.trace[0].event_type, TraceEventType::Output);
        assert_eq!(t.trace[0].msg, "source");
        assert_eq!(t.trace[1].event_type, TraceEventType::Input);
        assert_eq!(t.trace[1].msg, "box");
        assert_eq!(t.trace[2].event_type, TraceEventType::Output);
        assert_eq!(t.trace[2].msg, "box");
        assert_eq!(t.trace[3].event_type, TraceEventType::Input);
        assert_eq!(t.trace[3].msg, "snk");
    }

    builder.topology().stop().await;
}

#[tokio::test]
async fn test_no_tuple_lost_without_shedding() {
    let (builder, sink) = setup(
        "CREATE STREAM box AS SELECT RSTREAM int FROM source [RANGE 1 TUPLES]",
        false,
    )
    .await;
    wait_for(&sink, 4).await;
    assert_eq!(sink.len(), 4);
    builder.topology().stop().await;
}

#[tokio::test]
async fn test_union_all_duplicates_matching_tuples() {
    let (builder, sink) = setup(
        "CREATE STREAM box AS \
         SELECT ISTREAM int FROM source [RANGE 1 TUPLES] WHERE int % 2 = 0 \
         UNION ALL \
         SELECT ISTREAM int FROM source [RANGE 1 TUPLES] WHERE int % 2 = 0",
        false,
    )
    .await;
    wait_for(&sink, 4).await;

    let counts = int_counts(&sink.tuples(), "int");
    assert_eq!(counts, BTreeMap::from([(2, 2), (4, 2)]));
    builder.topology().stop().await;
}

#[tokio::test]
async fn test_union_all_disjoint_filters() {
    let (builder, sink) = setup(
        "CREATE STREAM box AS \
         SELECT ISTREAM int FROM source [RANGE 1 TUPLES] WHERE int % 2 = 0 \
         UNION ALL \
         SELECT ISTREAM int FROM source [RANGE 1 TUPLES] WHERE int % 2 = 1",
        false,
    )
    .await;
    wait_for(&sink, 4).await;

    let counts = int_counts(&sink.tuples(), "int");
    assert_eq!(counts, BTreeMap::from([(1, 1), (2, 1), (3, 1), (4, 1)]));
    builder.topology().stop().await;
}

#[tokio::test]
async fn test_groupless_count_over_time_window() {
    let (builder, sink) = setup(
        "CREATE STREAM box AS SELECT ISTREAM count(1) \
         FROM source [RANGE 2 SECONDS] WHERE int % 2 = 0",
        false,
    )
    .await;
    wait_for(&sink, 3).await;

    let counts: Vec<i64> = sink
        .tuples()
        .iter()
        .map(|t| t.get_int("count").unwrap())
        .collect();
    // The third source tuple is odd: the count stays put and ISTREAM stays
    // quiet, so exactly three deltas arrive.
    assert_eq!(counts, vec![0, 1, 2]);
    builder.topology().stop().await;
}

#[tokio::test]
async fn test_rewind_replays_the_source() {
    let (builder, sink) = setup(
        "CREATE STREAM box AS SELECT ISTREAM int, str((int+1) % 3) AS x \
         FROM source [RANGE 1 TUPLES] WHERE int % 2 = 0",
        false,
    )
    .await;
    wait_for(&sink, 2).await;

    builder.apply_fql("REWIND SOURCE source;").await.unwrap();
    wait_for(&sink, 4).await;

    let counts = int_counts(&sink.tuples(), "int");
    assert_eq!(counts, BTreeMap::from([(2, 2), (4, 2)]));
    builder.topology().stop().await;
}

#[tokio::test]
async fn test_self_join_carries_both_columns() {
    let sink = CollectorSink::new();
    let capture = CollectorSink::new();
    let mut registry = Registry::default();
    {
        let sink = sink.clone();
        registry.register_sink("collector", move |_, _| Ok(sink.clone() as Arc<dyn Sink>));
    }
    {
        let capture = capture.clone();
        registry.register_sink("capture", move |_, _| {
            Ok(capture.clone() as Arc<dyn Sink>)
        });
    }

    let builder = TopologyBuilder::new(Topology::new("e2e"), Arc::new(registry));
    builder
        .apply_fql(
            "CREATE PAUSED SOURCE source TYPE dummy WITH num=4;
             CREATE STREAM box AS SELECT RSTREAM source:int AS a, s2:int AS b
                 FROM source [RANGE 1 TUPLES], source [RANGE 1 TUPLES] AS s2;
             CREATE SINK snk TYPE collector;
             CREATE SINK cap TYPE capture;
             INSERT INTO snk FROM box;
             INSERT INTO cap FROM source;
             RESUME SOURCE source;",
        )
        .await
        .unwrap();

    wait_for(&capture, 1).await;
    wait_for(&sink, 2).await;

    let outputs = sink.tuples();
    for t in &outputs {
        assert!(t.get("a").is_some(), "missing key a: {:?}", t.data());
        assert!(t.get("b").is_some(), "missing key b: {:?}", t.data());
    }
    // The first joined tuple pairs the first source tuple with itself and
    // carries its timestamp.
    let first_source = &capture.tuples()[0];
    assert_eq!(outputs[0].timestamp, first_source.timestamp);

    builder.topology().stop().await;
}

#[tokio::test]
async fn test_udsf_duplicates_tuples() {
    let (builder, sink) = setup(
        "CREATE STREAM box AS SELECT ISTREAM duplicate:int \
         FROM duplicate('source', 3) [RANGE 1 TUPLES]",
        false,
    )
    .await;
    wait_for(&sink, 12).await;

    assert_eq!(sink.len(), 12);
    let counts = int_counts(&sink.tuples(), "int");
    assert_eq!(counts, BTreeMap::from([(1, 3), (2, 3), (3, 3), (4, 3)]));
    builder.topology().stop().await;
}

#[tokio::test]
async fn test_shared_tuples_are_never_mutated_in_place() {
    let first = CollectorSink::new();
    let second = CollectorSink::new();
    let mut registry = Registry::default();
    {
        let first = first.clone();
        registry.register_sink("collector", move |_, _| Ok(first.clone() as Arc<dyn Sink>));
    }
    {
        let second = second.clone();
        registry.register_sink("collector2", move |_, _| {
            Ok(second.clone() as Arc<dyn Sink>)
        });
    }

    let builder = TopologyBuilder::new(Topology::new("e2e"), Arc::new(registry));
    builder
        .apply_fql(
            "CREATE PAUSED SOURCE source TYPE dummy WITH num=4;
             CREATE STREAM box AS SELECT ISTREAM int FROM source [RANGE 1 TUPLES];
             CREATE SINK snk1 TYPE collector;
             CREATE SINK snk2 TYPE collector2;
             INSERT INTO snk1 FROM box;
             INSERT INTO snk2 FROM box;
             RESUME SOURCE source;",
        )
        .await
        .unwrap();

    wait_for(&first, 4).await;
    wait_for(&second, 4).await;

    // Both sinks observed the same broadcast tuples; byte-for-byte equal
    // payloads prove no consumer mutated the shared data in place.
    for (a, b) in first.tuples().iter().zip(second.tuples().iter()) {
        let a_bytes = serde_json::to_vec(a.data()).unwrap();
        let b_bytes = serde_json::to_vec(b.data()).unwrap();
        assert_eq!(a_bytes, b_bytes);
    }

    builder.topology().stop().await;
}

#[tokio::test]
async fn test_ad_hoc_select_streams_results() {
    let builder = TopologyBuilder::new(Topology::new("e2e"), Arc::new(Registry::default()));
    builder
        .apply_fql("CREATE PAUSED SOURCE source TYPE dummy WITH num=4")
        .await
        .unwrap();

    let results = builder
        .apply_fql("SELECT RSTREAM int FROM source [RANGE 1 TUPLES]")
        .await
        .unwrap();
    let mut handle = match results.into_iter().next().unwrap() {
        ApplyResult::Select(handle) => handle,
        _ => panic!("expected an ad-hoc select handle"),
    };

    builder.apply_fql("RESUME SOURCE source").await.unwrap();
    for expected in 1..=4i64 {
        let tuple = tokio::time::timeout(WAIT, handle.next())
            .await
            .expect("timed out")
            .expect("stream ended early");
        assert_eq!(tuple.get_int("int"), Some(expected));
    }

    drop(handle);
    builder.topology().stop().await;
}

#[tokio::test]
async fn test_pause_and_resume_gate_the_flow() {
    let (builder, sink) = setup(
        "CREATE STREAM box AS SELECT RSTREAM int FROM source [RANGE 1 TUPLES]",
        false,
    )
    .await;
    wait_for(&sink, 4).await;

    builder.apply_fql("PAUSE SOURCE source;").await.unwrap();
    builder.apply_fql("REWIND SOURCE source;").await.unwrap();
    // Paused: the replay must not reach the sink yet.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sink.len(), 4);

    builder.apply_fql("RESUME SOURCE source;").await.unwrap();
    wait_for(&sink, 8).await;
    builder.topology().stop().await;
}

#[tokio::test]
async fn test_drop_stream_detaches_it() {
    let (builder, sink) = setup(
        "CREATE STREAM box AS SELECT RSTREAM int FROM source [RANGE 1 TUPLES]",
        false,
    )
    .await;
    wait_for(&sink, 4).await;

    builder.apply_fql("DROP STREAM box;").await.unwrap();
    assert!(builder.topology().node("box").await.is_none());

    // A rewound source now streams into a dropped edge; the sink stays at 4.
    builder.apply_fql("REWIND SOURCE source;").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sink.len(), 4);

    builder.topology().stop().await;
}
