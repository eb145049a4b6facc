// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (C) 2025 Jonathan D.A. Jewell

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use review_contract::ResponseParser;
use review_policy::PolicySet;

const CANONICAL: &str = "Decision: Flagged\nPrimary Violation: No Advertisement\nExplanation: The review contains a promotional link to a discount website.";

const MESSY: &str = "Sure! Here is my assessment.\n\n**DECISION**: flag\n* primary violation (if flagged): promo\n* Explanation: The text pushes a coupon code\nand links to an external store.\n";

const UNLABELED: &str = "This review is not valid. It reads like an advertisement for a delivery app rather than a visit report.";

fn bench_parser(c: &mut Criterion) {
    let parser = ResponseParser::new(PolicySet::location_review_default()).expect("parser");

    let mut group = c.benchmark_group("response_parser");
    group.bench_function("canonical", |b| b.iter(|| parser.parse(black_box(CANONICAL))));
    group.bench_function("messy", |b| b.iter(|| parser.parse(black_box(MESSY))));
    group.bench_function("unlabeled", |b| b.iter(|| parser.parse(black_box(UNLABELED))));
    group.finish();
}

criterion_group!(benches, bench_parser);
criterion_main!(benches);
