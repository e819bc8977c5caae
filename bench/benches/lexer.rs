use criterion::{criterion_group, criterion_main, Criterion};
use punch::{lexer::Lexer, token::TokenKind};
use std::hint::black_box;

static INPUT: &str = include_str!("../../demos/showcase.pun");

fn lexer(input: &str) {
    let mut lexer = Lexer::new(input);
    let mut i = 0;
    loop {
        let token = lexer.next_token();
        if matches!(token.kind, TokenKind::Eof) {
            break;
        }
        if token.kind.is_trivia() {
            continue;
        }
        i += 1;
    }
    black_box(i);
}

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("lexer", |b| {
        b.iter(|| {
            black_box(lexer(black_box(INPUT)));
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
