use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use engramdb::db::{Config, Database};
use engramdb::index::{detect_kernel, HnswIndex, HnswParams};
use engramdb::query::{Params, Value};
use engramdb::types::NodeId;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const DIMS: usize = 128;

fn micro_hnsw(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/hnsw");
    group.sample_size(20);
    for size in [1_000u64, 10_000] {
        let mut harness = HnswHarness::new(size);
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("search_k10", size), &size, |b, _| {
            b.iter(|| harness.search(10));
        });
        group.bench_with_input(BenchmarkId::new("insert", size), &size, |b, _| {
            b.iter(|| harness.insert());
        });
    }
    group.finish();
}

fn micro_hybrid(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/hybrid");
    group.sample_size(20);
    let mut config = Config::default();
    config.vector.dimensions = DIMS;
    let db = Database::open_in_memory(config).expect("db");
    let mut rng = ChaCha8Rng::seed_from_u64(17);
    let words = ["coffee", "grinder", "travel", "meeting", "deadline", "garden"];
    for i in 0..2_000 {
        let mut params = Params::new();
        let content = format!(
            "{} {} note {i}",
            words[rng.gen_range(0..words.len())],
            words[rng.gen_range(0..words.len())]
        );
        params.insert("content".into(), Value::from(content.as_str()));
        params.insert("embedding".into(), embedding_value(&mut rng));
        db.execute(
            "CREATE (:Memory {content: $content, embedding: $embedding})",
            params,
        )
        .expect("seed");
    }
    let mut params = Params::new();
    params.insert("embedding".into(), embedding_value(&mut rng));
    group.bench_function("procedure_k10", |b| {
        b.iter(|| {
            db.execute(
                "CALL db.index.hybrid.queryNodes('coffee grinder', $embedding, 10) YIELD node RETURN node",
                params.clone(),
            )
            .expect("hybrid")
        });
    });
    group.finish();
}

fn embedding_value(rng: &mut ChaCha8Rng) -> Value {
    Value::List(
        random_vector(rng)
            .into_iter()
            .map(|x| Value::Float(f64::from(x)))
            .collect(),
    )
}

fn random_vector(rng: &mut ChaCha8Rng) -> Vec<f32> {
    (0..DIMS).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

struct HnswHarness {
    index: HnswIndex,
    rng: ChaCha8Rng,
    next_id: u64,
}

impl HnswHarness {
    fn new(size: u64) -> Self {
        let params = HnswParams {
            dimensions: DIMS,
            ..HnswParams::default()
        };
        let mut index = HnswIndex::new(params, detect_kernel());
        let mut rng = ChaCha8Rng::seed_from_u64(size);
        for id in 1..=size {
            index
                .insert(NodeId(id), &random_vector(&mut rng))
                .expect("insert");
        }
        Self {
            index,
            rng,
            next_id: size + 1,
        }
    }

    fn search(&mut self, k: usize) -> usize {
        let query = random_vector(&mut self.rng);
        self.index.search(&query, k).expect("search").len()
    }

    fn insert(&mut self) {
        let vector = random_vector(&mut self.rng);
        self.index
            .insert(NodeId(self.next_id), &vector)
            .expect("insert");
        self.next_id += 1;
    }
}

criterion_group!(benches, micro_hnsw, micro_hybrid);
criterion_main!(benches);
