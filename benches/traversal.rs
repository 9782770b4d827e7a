use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use meridian::graph::LinkGraph;
use meridian::sandbox::{ExecutionSession, ScriptedBackend};
use meridian::types::{ChunkId, CreateChunkInput, Link, LinkOrigin, LinkType, TraversalOrder};
use meridian::{ChunkStore, SessionConfig};
use std::sync::Arc;

/// Tree of `branching_factor` children per node, `max_depth` levels deep
fn build_tree(branching_factor: usize, max_depth: usize) -> (LinkGraph, ChunkId) {
    let root = "chunk-0".to_string();
    let mut graph = LinkGraph::new();
    let mut current_level = vec![root.clone()];
    let mut counter = 1;

    for _depth in 0..max_depth {
        let mut next_level = Vec::new();
        for parent in &current_level {
            for _ in 0..branching_factor {
                let child = format!("chunk-{}", counter);
                counter += 1;
                graph.add_link(Link {
                    from_id: parent.clone(),
                    to_id: child.clone(),
                    link_type: LinkType::RelatedTo,
                    strength: 1.0,
                    origin: LinkOrigin::Auto,
                    reason: None,
                    created_at: Utc::now(),
                });
                next_level.push(child);
            }
        }
        current_level = next_level;
    }
    (graph, root)
}

fn bench_graph_traversal(c: &mut Criterion) {
    // depth 4, branching factor 5 (~780 nodes)
    let (graph, root) = build_tree(5, 4);
    let starts = vec![root];

    let mut group = c.benchmark_group("graph_traversal");
    for max_nodes in [25usize, 200, 1000] {
        group.throughput(Throughput::Elements(max_nodes as u64));
        group.bench_with_input(BenchmarkId::new("bfs", max_nodes), &max_nodes, |b, &n| {
            b.iter(|| graph.traverse(black_box(&starts), n, TraversalOrder::BreadthFirst, None))
        });
        group.bench_with_input(BenchmarkId::new("dfs", max_nodes), &max_nodes, |b, &n| {
            b.iter(|| graph.traverse(black_box(&starts), n, TraversalOrder::DepthFirst, None))
        });
    }
    group.finish();
}

fn populated_store(count: usize) -> ChunkStore {
    let store = ChunkStore::open_in_memory().unwrap();
    let base = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
    let topics = ["rust", "sqlite", "graphs", "sandbox"];
    for i in 0..count {
        let input = CreateChunkInput::new(format!("Note {} about {}", i, topics[i % 4]))
            .with_tags(&[topics[i % 4], topics[(i + 1) % 4]])
            .in_conversation(format!("conv-{}", i / 10))
            .created_at(base + Duration::minutes(i as i64));
        store.create(input).unwrap();
    }
    store
}

fn bench_auto_linking(c: &mut Criterion) {
    let mut group = c.benchmark_group("auto_linking");
    group.throughput(Throughput::Elements(1));

    group.bench_function("create_into_500", |b| {
        let store = populated_store(500);
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            let input = CreateChunkInput::new(format!("Bench note {}", i))
                .with_tags(&["rust", "graphs"])
                .in_conversation("conv-bench");
            store.create(black_box(input)).unwrap()
        })
    });

    group.finish();
}

fn bench_store_traversal(c: &mut Criterion) {
    let store = populated_store(500);
    let start = store.list(Some("conv-0"), 1).unwrap()[0].id.clone();
    let starts = vec![start];

    c.bench_function("store_traverse_200", |b| {
        b.iter(|| store.traverse(black_box(&starts), 200, TraversalOrder::BreadthFirst, None))
    });
}

fn bench_snippet_step(c: &mut Criterion) {
    let store = Arc::new(populated_store(200));
    let snippet = "ids = search_chunks('rust', 10)\n\
                   tags = {}\n\
                   for i in ids:\n    for t in read_chunk(i)['tags']:\n        tags[t] = tags.get(t, 0) + 1\n\
                   top = sorted(tags.keys())";

    c.bench_function("snippet_step", |b| {
        b.iter(|| {
            let mut session = ExecutionSession::new(
                Arc::clone(&store),
                Arc::new(ScriptedBackend::default()),
                SessionConfig::default(),
            );
            session.execute(black_box(snippet)).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_graph_traversal,
    bench_auto_linking,
    bench_store_traversal,
    bench_snippet_step
);
criterion_main!(benches);
