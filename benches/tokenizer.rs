//! Benchmark suite for the unigram tokenizer
//!
//! Measures Viterbi segmentation, the piece cache, and encode/decode over
//! different input lengths.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use servir::tokenizer::{SpecialTokens, UnigramTokenizer};

fn create_tokenizer() -> UnigramTokenizer {
    // Lowercase letters, common bigrams, and a handful of whole words.
    let mut vocab: Vec<(String, f64)> = ('a'..='z').map(|c| (c.to_string(), -6.0)).collect();
    vocab.push(("\u{2581}".to_string(), -3.0));
    for (i, bigram) in ["th", "he", "in", "er", "an", "re", "on", "at", "en", "nd"]
        .iter()
        .enumerate()
    {
        vocab.push(((*bigram).to_string(), -4.0 - i as f64 * 0.1));
    }
    for (i, word) in ["\u{2581}the", "\u{2581}and", "\u{2581}hello", "\u{2581}world"]
        .iter()
        .enumerate()
    {
        vocab.push(((*word).to_string(), -2.0 - i as f64 * 0.1));
    }
    let special = SpecialTokens {
        bos: Some("<s>".to_string()),
        eos: Some("</s>".to_string()),
        ..Default::default()
    };
    UnigramTokenizer::from_vocab(vocab, &special, true, true, -10.0).unwrap()
}

fn bench_encode_lengths(c: &mut Criterion) {
    let tokenizer = create_tokenizer();
    let base = "the world and hello there in the end ";

    let mut group = c.benchmark_group("unigram_encode");
    for repeats in [1usize, 8, 64] {
        let text = base.repeat(repeats);
        group.bench_with_input(
            BenchmarkId::from_parameter(text.len()),
            &text,
            |b, text| {
                b.iter(|| tokenizer.encode(black_box(text), true, true, false, false));
            },
        );
    }
    group.finish();
}

fn bench_piece_cache(c: &mut Criterion) {
    let tokenizer = create_tokenizer();
    let text = "hello world hello world hello world";

    // Warm the cache so the hit path dominates.
    tokenizer.encode(text, false, false, false, false);

    c.bench_function("unigram_encode_cached", |b| {
        b.iter(|| tokenizer.encode(black_box(text), false, false, false, false));
    });
}

fn bench_decode(c: &mut Criterion) {
    let tokenizer = create_tokenizer();
    let ids = tokenizer.encode(&"the world and hello ".repeat(16), true, true, false, false);

    c.bench_function("unigram_decode", |b| {
        b.iter(|| tokenizer.decode(black_box(&ids), true));
    });
}

criterion_group!(benches, bench_encode_lengths, bench_piece_cache, bench_decode);
criterion_main!(benches);
