use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::Rng;

use veridex::core::variant::{Variant, VariantArray};
use veridex::ft::config::FtFastConfig;
use veridex::ft::dataholder::{DataHolder, FtIndex};
use veridex::ft::postings::IdRelVec;
use veridex::query::codec;
use veridex::query::types::CondType;
use veridex::wire::serializer::{Serializer, WrSerializer};
use veridex::Query;

fn sample_query(conditions: usize) -> Query {
    let mut q = Query::new("bench_ns").limit(100).offset(10).sort("name", true);
    for i in 0..conditions {
        q = q
            .where_cond(format!("field_{}", i), CondType::Gt, VariantArray::single(Variant::Int(i as i32)))
            .unwrap();
    }
    q
}

fn bench_query_serialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_serialize");
    for &conditions in &[1usize, 8, 32] {
        let q = sample_query(conditions);
        group.bench_with_input(BenchmarkId::from_parameter(conditions), &q, |b, q| {
            b.iter(|| {
                let mut ser = WrSerializer::new();
                codec::serialize(black_box(q), &mut ser, codec::NORMAL);
                black_box(ser.len())
            })
        });
    }
    group.finish();
}

fn bench_query_deserialize(c: &mut Criterion) {
    let q = sample_query(16);
    let mut ser = WrSerializer::new();
    codec::serialize(&q, &mut ser, codec::NORMAL);
    let bytes = ser.into_bytes();

    c.bench_function("query_deserialize_16", |b| {
        b.iter(|| {
            let mut rd = Serializer::new(black_box(&bytes));
            black_box(codec::deserialize(&mut rd).unwrap())
        })
    });
}

fn bench_ft_commit(c: &mut Criterion) {
    let words = ["the", "quick", "brown", "fox", "jumps", "over", "lazy", "dog"];
    let mut rng = rand::thread_rng();
    let docs: Vec<String> = (0..500)
        .map(|_| {
            (0..24)
                .map(|_| words[rng.gen_range(0..words.len())])
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect();

    c.bench_function("ft_commit_500_docs", |b| {
        b.iter(|| {
            let mut holder: DataHolder<IdRelVec> = DataHolder::new(FtFastConfig::default());
            for (i, text) in docs.iter().enumerate() {
                holder.add_document(i, i, vec![(text.clone(), 0)]);
            }
            holder.start_commit(false);
            holder.process(1, false);
            black_box(holder.mem_stat())
        })
    });
}

criterion_group!(benches, bench_query_serialize, bench_query_deserialize, bench_ft_commit);
criterion_main!(benches);
