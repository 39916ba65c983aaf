//! End-to-end partitioner scenarios.

use skypart::chunk_index::ChunkIndex;
use skypart::config::{run_pos, CommonArgs, PosArgs};
use std::path::Path;

fn pos_args(input: &Path, out_dir: &Path, num_nodes: u32) -> PosArgs {
    PosArgs {
        common: CommonArgs {
            input: vec![input.to_path_buf()],
            in_fields: vec!["id".into(), "ra".into(), "dec".into()],
            delimiter: ',',
            out_dir: out_dir.to_path_buf(),
            num_nodes,
            prefix: "chunk".into(),
            num_stripes: 18,
            num_sub_stripes_per_stripe: 5,
            overlap: 0.01667,
            chunk_field: Some("chunkId".into()),
            sub_chunk_field: "subChunkId".into(),
            block_size_mib: 1,
            num_workers: 2,
            pool_size_mib: 8,
        },
        pos: "ra,dec".into(),
        id_field: None,
        id_url: None,
    }
}

#[test]
fn partition_small_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("catalog.csv");
    std::fs::write(&input, "1, 2.0, 3.0\n2, 2.1, 3.1\n").unwrap();
    let out_dir = dir.path().join("out");

    run_pos(&pos_args(&input, &out_dir, 1)).unwrap();

    // At least one chunk file was produced and the index counts both
    // records.
    let chunk_files: Vec<_> = std::fs::read_dir(&out_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            name.starts_with("chunk_") && name.ends_with(".txt") && !name.contains("overlap")
        })
        .collect();
    assert!(!chunk_files.is_empty());

    let index = ChunkIndex::from_path(&out_dir.join("chunk_index.bin")).unwrap();
    let mut total = 0u64;
    for f in &chunk_files {
        let name = f.file_name().to_string_lossy().into_owned();
        let id: i32 = name["chunk_".len()..name.len() - ".txt".len()].parse().unwrap();
        total += index.chunk(id).num_records;
    }
    assert_eq!(total, 2);
}

#[test]
fn incremental_runs_accumulate_in_the_index() {
    let dir = tempfile::tempdir().unwrap();
    let out_dir = dir.path().join("out");

    let input_a = dir.path().join("a.csv");
    std::fs::write(&input_a, "1, 2.0, 3.0\n2, 2.0, 3.0\n3, 2.0, 3.0\n4, 2.0, 3.0\n5, 2.0, 3.0\n")
        .unwrap();
    run_pos(&pos_args(&input_a, &out_dir, 1)).unwrap();

    let input_b = dir.path().join("b.csv");
    std::fs::write(&input_b, "6, 2.0, 3.0\n7, 2.0, 3.0\n8, 2.0, 3.0\n").unwrap();
    run_pos(&pos_args(&input_b, &out_dir, 1)).unwrap();

    // The second run appended to the index file; reading it back
    // merges both runs' entries.
    let index = ChunkIndex::from_path(&out_dir.join("chunk_index.bin")).unwrap();
    let chunker = skypart::chunker::Chunker::new(18, 5, 0.01667).unwrap();
    let loc = chunker.locate(2.0, 3.0);
    assert_eq!(index.chunk(loc.chunk_id).num_records, 8);

    // The chunk file holds all eight rows.
    let content =
        std::fs::read_to_string(out_dir.join(format!("chunk_{}.txt", loc.chunk_id))).unwrap();
    assert_eq!(content.lines().count(), 8);
}

#[test]
fn multi_node_layout_places_chunk_files_in_node_directories() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("catalog.csv");
    // Positions spread widely over the sky so several chunks exist.
    let mut rows = String::new();
    for i in 0..36 {
        rows.push_str(&format!("{}, {}.5, {}.5\n", i, i * 10, (i % 17) * 5 - 40));
    }
    std::fs::write(&input, rows).unwrap();
    let out_dir = dir.path().join("out");

    let index = run_pos(&pos_args(&input, &out_dir, 8)).unwrap();
    assert!(index.len() > 1);

    // Every chunk file lives in the node directory its chunk hashes to.
    let mut found = 0;
    for entry in std::fs::read_dir(&out_dir).unwrap().filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with("node_") {
            continue;
        }
        let node: u32 = name["node_".len()..].parse().unwrap();
        assert_eq!(name.len(), "node_".len() + 5, "node directories are zero padded to 5");
        for file in std::fs::read_dir(entry.path()).unwrap().filter_map(|e| e.ok()) {
            let file_name = file.file_name().to_string_lossy().into_owned();
            if let Some(id) = file_name
                .strip_prefix("chunk_")
                .and_then(|s| s.strip_suffix(".txt"))
                .and_then(|s| s.strip_suffix("_overlap").or(Some(s)))
                .and_then(|s| s.parse::<i32>().ok())
            {
                assert_eq!(skypart::output::node_of(id, 8), node);
                found += 1;
            }
        }
    }
    assert!(found > 0);
}
