use criterion::{criterion_group, criterion_main, Criterion};
use punch::parser::parse_program;
use std::hint::black_box;

static INPUT: &str = include_str!("../../demos/showcase.pun");

fn parser(input: &str) {
    let (program, errors) = parse_program(input, "showcase.pun");
    assert!(errors.is_empty());
    _ = black_box(program);
}

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("parser", |b| {
        b.iter(|| {
            black_box(parser(black_box(INPUT)));
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
