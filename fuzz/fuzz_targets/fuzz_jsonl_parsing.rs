#![no_main]
use libfuzzer_sys::fuzz_target;
use std::io::Write;

fuzz_target!(|data: &[u8]| {
    // Exercise the byte-safe line splitter directly: it must never panic on
    // arbitrary bytes and must never return a `new_offset` beyond the buffer.
    let batch = sessionwatch::parser::split_lines(data, 0, 2 * 1024 * 1024);
    assert!(batch.new_offset <= data.len() as u64);

    // Exercise the filesystem-backed path too, and then feed each recovered
    // line through `serde_json::Value` parsing the way every source does.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fuzz.jsonl");
    {
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
    }
    if let Ok(read_batch) = sessionwatch::parser::read_new_lines(&path, 0, 2 * 1024 * 1024, 256 * 1024 * 1024) {
        for line in &read_batch.lines {
            let _: Result<serde_json::Value, _> = serde_json::from_str(line);
        }
    }
});
