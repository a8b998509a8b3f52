mod common;

use common::{Harness, input, lines, test_config};
use splitmerge::actions::TaskHandler;
use splitmerge::actions::divide::{DivideHandler, partition, split_entries};
use splitmerge::error::HarnessError;
use splitmerge::runtime::task::{DivideOutput, MainInput, PathInput, TaskKind};

fn dictionary(count: usize) -> Vec<u8> {
    let mut body = Vec::new();
    for i in 0..count {
        body.extend_from_slice(format!("word{:03}\n", (i * 37) % 101).as_bytes());
    }
    body
}

#[test]
fn test_partition_near_equal_contiguous_chunks() {
    let entries: Vec<u32> = (0..10).collect();
    let chunks = partition(&entries, 4);
    let sizes: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
    assert_eq!(sizes, vec![3, 3, 2, 2]);
    assert_eq!(chunks.concat(), entries);
}

#[test]
fn test_partition_skips_empty_chunks() {
    let entries = [1, 2];
    let chunks = partition(&entries, 4);
    assert_eq!(chunks, vec![&[1][..], &[2][..]]);
    assert!(partition::<u8>(&[], 3).is_empty());
}

#[test]
fn test_split_entries_ignores_trailing_newline() {
    assert_eq!(split_entries(b"a\nb\n"), vec![&b"a"[..], &b"b"[..]]);
    assert_eq!(split_entries(b"a\nb"), vec![&b"a"[..], &b"b"[..]]);
    assert!(split_entries(b"").is_empty());
}

#[tokio::test]
async fn test_divide_writes_children_under_path_keys() {
    let mut config = test_config();
    config.policy.fan_out = 3;
    let harness = Harness::new(config);
    let main = MainInput::new("data", "dict.txt");
    let body = dictionary(10);
    harness.ctx.blobs.put(&main.root_key(), body.clone()).await.unwrap();

    let task = harness
        .claim(TaskKind::Divide, input(&main, PathInput::root(), vec![main.root_key()], false))
        .await;
    let updater = harness.updater(&task);
    let result = DivideHandler.execute(&harness.ctx, &task, &updater).await.expect("divide failed");
    let output: DivideOutput = serde_json::from_value(result).unwrap();

    assert_eq!(output.child_count, 3);
    let names: Vec<&str> = output.children.iter().map(|c| c.zip_name.as_str()).collect();
    assert_eq!(names, vec!["data/dict_part_0.txt", "data/dict_part_1.txt", "data/dict_part_2.txt"]);
    let entries: Vec<u64> = output.children.iter().map(|c| c.entries).collect();
    assert_eq!(entries, vec![4, 3, 3]);

    // Children concatenated in order give back the shard.
    let mut rejoined = Vec::new();
    for child in &output.children {
        let part = harness.ctx.blobs.get(&child.zip_name).await.unwrap();
        assert_eq!(child.bytes, part.len() as u64);
        rejoined.extend(lines(&part));
    }
    assert_eq!(rejoined, lines(&body));
    assert!(updater.sequence().await >= 3);
}

#[tokio::test]
async fn test_divide_is_deterministic() {
    let harness = Harness::new(test_config());
    let main = MainInput::new("data", "dict.txt");
    let shard = main.part_key(&PathInput(vec![1]), "txt");
    harness.ctx.blobs.put(&shard, dictionary(25)).await.unwrap();
    let divide = input(&main, PathInput(vec![1]), vec![shard], false);

    let mut runs = Vec::new();
    for _ in 0..2 {
        let task = harness.claim(TaskKind::Divide, divide.clone()).await;
        let updater = harness.updater(&task);
        let result = DivideHandler.execute(&harness.ctx, &task, &updater).await.unwrap();
        let output: DivideOutput = serde_json::from_value(result).unwrap();
        let mut bodies = Vec::new();
        for child in &output.children {
            bodies.push(harness.ctx.blobs.get(&child.zip_name).await.unwrap());
        }
        runs.push((output, bodies));
    }
    assert_eq!(runs[0], runs[1]);
    assert_eq!(runs[0].0.children[0].zip_name, "data/dict_part_1_0.txt");
}

#[tokio::test]
async fn test_divide_empty_shard_has_no_children() {
    let harness = Harness::new(test_config());
    let main = MainInput::new("data", "empty.txt");
    harness.ctx.blobs.put(&main.root_key(), Vec::new()).await.unwrap();

    let task = harness
        .claim(TaskKind::Divide, input(&main, PathInput::root(), vec![main.root_key()], false))
        .await;
    let updater = harness.updater(&task);
    let result = DivideHandler.execute(&harness.ctx, &task, &updater).await.unwrap();
    let output: DivideOutput = serde_json::from_value(result).unwrap();
    assert_eq!(output.child_count, 0);
    assert!(output.children.is_empty());
}

#[tokio::test]
async fn test_divide_missing_shard_is_not_found() {
    let harness = Harness::new(test_config());
    let main = MainInput::new("data", "missing.txt");

    let task = harness
        .claim(TaskKind::Divide, input(&main, PathInput::root(), vec![main.root_key()], false))
        .await;
    let updater = harness.updater(&task);
    let err = DivideHandler.execute(&harness.ctx, &task, &updater).await.unwrap_err();
    assert!(matches!(err, HarnessError::NotFound { .. }));
    assert!(!err.is_retryable());
}

#[test]
fn test_divide_requires_exactly_one_shard() {
    let main = MainInput::new("data", "dict.txt");
    assert!(DivideHandler.validate(&input(&main, PathInput::root(), Vec::new(), false)).is_err());
    assert!(
        DivideHandler
            .validate(&input(&main, PathInput::root(), vec![main.root_key()], false))
            .is_ok()
    );
}
