use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::io::Write;

use sessionwatch::parser::{read_new_lines, split_lines};

fn make_claude_line(i: usize) -> String {
    format!(
        r#"{{"type":"assistant","message":{{"model":"m","content":[{{"type":"text","text":"response {i}"}}],"usage":{{"input_tokens":{},"output_tokens":{}}}}}}}"#,
        1000 + i * 10,
        200 + i * 5,
    )
}

fn create_jsonl_file(n: usize) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    for i in 0..n {
        writeln!(file, "{}", make_claude_line(i)).unwrap();
    }
    file.flush().unwrap();
    file
}

fn bench_read_new_lines(c: &mut Criterion) {
    let file = create_jsonl_file(2_000);
    let path = file.path().to_path_buf();
    let len = std::fs::metadata(&path).unwrap().len();

    c.bench_function("read_new_lines_2000_from_zero", |b| {
        b.iter(|| {
            let batch = read_new_lines(black_box(&path), 0, 2 * 1024 * 1024, 256 * 1024 * 1024).unwrap();
            black_box(batch.lines.len())
        })
    });

    c.bench_function("read_new_lines_2000_unchanged", |b| {
        b.iter(|| {
            let batch = read_new_lines(black_box(&path), len, 2 * 1024 * 1024, 256 * 1024 * 1024).unwrap();
            black_box(batch.lines.len())
        })
    });
}

fn bench_split_lines(c: &mut Criterion) {
    let mut buf = Vec::new();
    for i in 0..2_000 {
        buf.extend_from_slice(make_claude_line(i).as_bytes());
        buf.push(b'\n');
    }

    c.bench_function("split_lines_2000", |b| {
        b.iter(|| {
            let batch = split_lines(black_box(&buf), 0, 2 * 1024 * 1024);
            black_box(batch.lines.len())
        })
    });
}

fn bench_json_dispatch(c: &mut Criterion) {
    let line = make_claude_line(0);

    c.bench_function("serde_json_value_parse_and_dispatch", |b| {
        b.iter(|| {
            let v: serde_json::Value = serde_json::from_str(black_box(&line)).unwrap();
            black_box(v.get("type").and_then(|t| t.as_str()).map(|s| s.to_string()))
        })
    });
}

criterion_group!(benches, bench_read_new_lines, bench_split_lines, bench_json_dispatch);
criterion_main!(benches);
