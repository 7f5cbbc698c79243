//! Whole-plan scenarios: prefixes, build modes, and cache layout, driven
//! through the graph builder, executor, and builder together.

use morph_artifact_cache::LocalArtifactStore;
use morph_builder::{BuilderConfig, ChunkBuilder};
use morph_executor::{ExecutorConfig, PlanExecutor};
use morph_graph::{BuildGraph, GraphBuilder, TargetPolicy, UnitKind};
use morph_source::SourceResolver;
use morph_source::testing::InMemoryRepoCache;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const DEFS: &str = "git://example.com/defs";
const DEFS_SHA: &str = "1111111111111111111111111111111111111111";
const SRC: &str = "git://example.com/src";
const SRC_SHA: &str = "2222222222222222222222222222222222222222";

fn base_cache() -> InMemoryRepoCache {
    let cache = InMemoryRepoCache::new();
    cache.add_ref(DEFS, "master", DEFS_SHA);
    cache.add_ref(SRC, "master", SRC_SHA);
    cache.add_file(
        DEFS,
        DEFS_SHA,
        "base.morph",
        b"kind: system\nname: base\narch: x86_64\nstrata:\n  - morph: core\n    repo: git://example.com/defs\n    ref: master\n",
    );
    cache.add_file(SRC, SRC_SHA, "payload.txt", b"payload\n");
    cache
}

async fn build_all(cache: &Arc<InMemoryRepoCache>, tmp: &TempDir) -> (BuildGraph, LocalArtifactStore) {
    let repos: Arc<dyn morph_source::GitRepoCache> = Arc::clone(cache) as Arc<dyn morph_source::GitRepoCache>;
    let resolver = SourceResolver::new(Arc::clone(&repos));
    let policy = TargetPolicy::default();
    let graph = GraphBuilder::new(&resolver, &policy)
        .build(DEFS, "master", "base")
        .await
        .unwrap();
    let store = LocalArtifactStore::open(tmp.path().join("cache")).unwrap();
    let config = BuilderConfig {
        staging_root: tmp.path().join("staging"),
        ..BuilderConfig::default()
    };
    let builder = Arc::new(ChunkBuilder::new(store.clone(), repos, config));
    let executor = PlanExecutor::new(
        builder,
        ExecutorConfig { max_parallel: 2 },
        tmp.path().join("staging"),
    );
    let report = executor
        .execute(&graph, &CancellationToken::new(), None)
        .await
        .unwrap();
    assert!(report.success(), "{report:?}");
    (graph, store)
}

fn log_of(graph: &BuildGraph, store: &LocalArtifactStore, artifact: &str) -> String {
    let index = graph
        .indices()
        .find(|&i| graph.unit(i).artifact_name == artifact)
        .unwrap_or_else(|| panic!("no unit named {artifact}"));
    std::fs::read_to_string(store.build_log_path(&graph.unit(index).cache_key)).unwrap()
}

#[tokio::test]
async fn prefix_is_honoured_across_chunks() {
    let cache = base_cache();
    cache.add_file(
        DEFS,
        DEFS_SHA,
        "core.morph",
        b"kind: stratum\nname: core\nchunks:\n  - name: first\n    repo: git://example.com/src\n    ref: master\n    prefix: /plover\n  - name: second\n    repo: git://example.com/src\n    ref: master\n    prefix: /plover\n    build-depends: [first]\n",
    );
    cache.add_file(
        SRC,
        SRC_SHA,
        "first.morph",
        b"kind: chunk\nname: first\nbuild-system: manual\ninstall-commands:\n  - echo \"First chunk: prefix $PREFIX\"\n  - mkdir -p \"$DESTDIR$PREFIX/bin\"\n  - echo plover-tool > \"$DESTDIR$PREFIX/bin/plover-tool\"\n",
    );
    cache.add_file(
        SRC,
        SRC_SHA,
        "second.morph",
        b"kind: chunk\nname: second\nbuild-system: manual\ninstall-commands:\n  - echo \"Second chunk: prefix $PREFIX\"\n  - case \":$PATH:\" in *plover/bin*) echo \"path has plover\";; esac\n  - test -f \"$DESTDIR\" || mkdir -p \"$DESTDIR$PREFIX\"\n",
    );

    let tmp = TempDir::new().unwrap();
    let cache = Arc::new(cache);
    let (graph, store) = build_all(&cache, &tmp).await;

    let first_log = log_of(&graph, &store, "first");
    assert!(first_log.contains("First chunk: prefix /plover"), "{first_log}");

    let second_log = log_of(&graph, &store, "second");
    assert!(second_log.contains("Second chunk: prefix /plover"), "{second_log}");
    assert!(second_log.contains("path has plover"), "{second_log}");
}

#[tokio::test]
async fn bootstrap_tooling_stays_out_of_the_system() {
    let cache = base_cache();
    cache.add_file(
        DEFS,
        DEFS_SHA,
        "core.morph",
        b"kind: stratum\nname: core\nchunks:\n  - name: stage1-cc\n    repo: git://example.com/src\n    ref: master\n    morph: cc\n    build-mode: bootstrap\n  - name: cc\n    repo: git://example.com/src\n    ref: master\n    morph: cc\n    build-mode: test\n    build-depends: [stage1-cc]\n",
    );
    // The same morphology builds both; the prefix decides where cc lands.
    cache.add_file(
        SRC,
        SRC_SHA,
        "cc.morph",
        b"kind: chunk\nname: cc\nbuild-system: manual\ninstall-commands:\n  - mkdir -p \"$DESTDIR$PREFIX/bin\"\n  - echo \"cc from $PREFIX\" > \"$DESTDIR$PREFIX/bin/cc\"\n",
    );

    let tmp = TempDir::new().unwrap();
    let cache = Arc::new(cache);
    let (graph, store) = build_all(&cache, &tmp).await;

    let target = graph.unit(graph.target());
    assert_eq!(target.kind, UnitKind::System);
    let tarball = store.artifact_path(&target.cache_key, UnitKind::System, &target.artifact_name);

    let unpack = TempDir::new().unwrap();
    tar::Archive::new(std::fs::File::open(&tarball).unwrap())
        .unpack(unpack.path())
        .unwrap();

    let cc = unpack.path().join("usr/bin/cc");
    assert!(cc.exists(), "test-mode cc must be in the system at /usr/bin");
    let contents = std::fs::read_to_string(&cc).unwrap();
    assert!(contents.contains("cc from /usr"), "{contents}");
    assert!(
        !unpack.path().join("tools/bin/cc").exists(),
        "bootstrap cc must not reach the system tarball"
    );
}
