use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ticket_topology::algo::clustering::{self, Linkage};
use ticket_topology::algo::hdbscan::{hdbscan, HdbscanParams};
use ticket_topology::algo::tokenizer;
use ticket_topology::local::HashingEmbedder;

/// Synthetic ticket texts over a handful of recurring problems.
fn generate_texts(n: usize) -> Vec<String> {
    let problems = [
        "login timeout after password reset single sign on portal",
        "invoice export fails with missing tax code on posting",
        "printer queue stuck on floor two shared printer offline",
        "vpn connection drops every hour remote access client",
        "payroll report totals differ from ledger after closing",
        "mailbox full cannot receive external email quota",
        "purchase order approval workflow stuck pending manager",
        "inventory count mismatch between warehouse and system",
    ];
    (0..n)
        .map(|i| {
            let base = problems[i % problems.len()];
            format!("{base} ticket {i} site {}", i % 17)
        })
        .collect()
}

fn vectors(n: usize) -> Vec<Vec<f32>> {
    let embedder = HashingEmbedder::new(128);
    generate_texts(n)
        .iter()
        .map(|t| embedder.embed_one(t))
        .collect()
}

fn bench_tokenize(c: &mut Criterion) {
    let text = "Login timeout after password reset on the single sign-on portal";
    c.bench_function("tokenize/single", |b| {
        b.iter(|| tokenizer::tokenize(black_box(text)))
    });
}

fn bench_distance_matrix(c: &mut Criterion) {
    let mut group = c.benchmark_group("cosine_distance_matrix");
    for size in [100, 500, 1000] {
        let vs = vectors(size);
        let refs: Vec<&[f32]> = vs.iter().map(|v| v.as_slice()).collect();
        group.bench_with_input(BenchmarkId::from_parameter(size), &refs, |b, refs| {
            b.iter(|| black_box(clustering::cosine_distance_matrix(refs)))
        });
    }
    group.finish();
}

fn bench_hdbscan(c: &mut Criterion) {
    let mut group = c.benchmark_group("hdbscan");
    group.sample_size(10);
    for size in [100, 500, 1000] {
        let vs = vectors(size);
        let refs: Vec<&[f32]> = vs.iter().map(|v| v.as_slice()).collect();
        let distances = clustering::cosine_distance_matrix(&refs);
        let params = HdbscanParams::default();
        group.bench_with_input(BenchmarkId::from_parameter(size), &distances, |b, d| {
            b.iter(|| black_box(hdbscan(d, size, &params)))
        });
    }
    group.finish();
}

fn bench_hac(c: &mut Criterion) {
    let mut group = c.benchmark_group("hac_average");
    for size in [50, 200] {
        let vs = vectors(size);
        let refs: Vec<&[f32]> = vs.iter().map(|v| v.as_slice()).collect();
        let distances = clustering::cosine_distance_matrix(&refs);
        group.bench_with_input(BenchmarkId::from_parameter(size), &distances, |b, d| {
            b.iter(|| {
                let dendrogram = clustering::hac(d, size, Linkage::Average);
                black_box(clustering::cut_at_distance(&dendrogram, 0.35))
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_tokenize,
    bench_distance_matrix,
    bench_hdbscan,
    bench_hac,
);
criterion_main!(benches);
