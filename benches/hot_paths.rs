use std::sync::Arc;

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use logagg::ingest::event::Dimension;
use logagg::ingest::parse::parse_line;
use logagg::pipeline::grouper::group_by_key;
use logagg::pipeline::mapper::map_event;
use logagg::pipeline::record::PartialCount;
use logagg::pipeline::reducer::reduce_all;

const LINE: &str = "web-1: 203.0.113.7 - - [10/Oct/2024:13:55:36 +0000] \
    \"GET /api/v1/items?page=2 HTTP/1.1\" 200 5120 \"-\" \"Mozilla/5.0 (X11; Linux x86_64)\"";

fn build_window_input() -> Vec<PartialCount> {
    let server_id: Arc<str> = Arc::from("web-1");
    let mut partials = Vec::with_capacity(4_096);

    for i in 0..1_024u32 {
        let line = format!(
            "10.0.{}.{} - - [10/Oct/2024:13:55:36 +0000] \"GET /p/{} HTTP/1.1\" 200 12 \"-\" \"bench\"",
            i % 4,
            i % 32,
            i % 64,
        );
        let event = parse_line(&line, Some(&server_id)).expect("parse bench line");
        partials.extend(map_event(&event, &Dimension::ALL));
    }

    partials
}

fn bench_parse(c: &mut Criterion) {
    c.bench_function("parse_line/prefixed", |b| {
        b.iter(|| parse_line(black_box(LINE), None).expect("parse"))
    });

    c.bench_function("parse_line/malformed", |b| {
        b.iter(|| parse_line(black_box("garbage line"), None).is_err())
    });
}

fn bench_map(c: &mut Criterion) {
    let event = parse_line(LINE, None).expect("parse");

    c.bench_function("map_event/all_dimensions", |b| {
        b.iter(|| map_event(black_box(&event), black_box(&Dimension::ALL)))
    });
}

fn bench_window(c: &mut Criterion) {
    let partials = build_window_input();

    c.bench_function("window/group_and_reduce_4k", |b| {
        b.iter(|| {
            let records = reduce_all(group_by_key(black_box(partials.clone())), Utc::now());
            black_box(records.len())
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_parse(c);
    bench_map(c);
    bench_window(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
