mod common;

use std::cmp::Ordering;

use common::{Harness, input, lines, test_config};
use splitmerge::actions::TaskHandler;
use splitmerge::actions::merge::{KWayMerge, MergeHandler};
use splitmerge::runtime::task::{MainInput, MergeOutput, PathInput, TaskKind};

/// Ordered by `key` only, so equal keys from different sources stay distinguishable.
#[derive(Debug, Clone, Copy)]
struct Tagged {
    key: u32,
    source: usize,
}

impl PartialEq for Tagged {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for Tagged {}
impl PartialOrd for Tagged {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Tagged {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

#[test]
fn test_kway_merge_sorted_union() {
    let sources = vec![vec![1, 4, 9], vec![2, 3, 10, 11], vec![], vec![0, 5]];
    let merged: Vec<i32> = KWayMerge::new(sources.into_iter().map(|s| s.into_iter())).collect();
    assert_eq!(merged, vec![0, 1, 2, 3, 4, 5, 9, 10, 11]);
}

#[test]
fn test_kway_merge_ties_prefer_earlier_source() {
    let sources = vec![
        vec![Tagged { key: 1, source: 0 }, Tagged { key: 5, source: 0 }],
        vec![Tagged { key: 1, source: 1 }, Tagged { key: 5, source: 1 }],
        vec![Tagged { key: 1, source: 2 }],
    ];
    let merged: Vec<(u32, usize)> = KWayMerge::new(sources.into_iter().map(|s| s.into_iter()))
        .map(|t| (t.key, t.source))
        .collect();
    assert_eq!(merged, vec![(1, 0), (1, 1), (1, 2), (5, 0), (5, 1)]);
}

#[test]
fn test_kway_merge_drops_exhausted_sources() {
    let mut merge = KWayMerge::new(vec![vec![1].into_iter(), vec![2, 3, 4].into_iter(), vec![].into_iter()]);
    assert_eq!(merge.active_sources(), 2);
    assert_eq!(merge.next(), Some(1));
    assert_eq!(merge.next(), Some(2));
    assert_eq!(merge.active_sources(), 1);
    assert_eq!(merge.by_ref().collect::<Vec<_>>(), vec![3, 4]);
    assert_eq!(merge.active_sources(), 0);
    assert_eq!(merge.next(), None);
}

#[test]
fn test_kway_merge_no_sources() {
    let sources: Vec<std::vec::IntoIter<u8>> = Vec::new();
    assert_eq!(KWayMerge::new(sources).count(), 0);
}

#[tokio::test]
async fn test_merge_handler_combines_sorted_children() {
    let harness = Harness::new(test_config());
    let main = MainInput::new("data", "words.txt");
    let children = ["apple\ncherry\n", "banana\nfig\n", "aardvark\ndate\n"];
    let mut keys = Vec::new();
    for (i, body) in children.iter().enumerate() {
        let key = main.sorted_key(&PathInput::root().child(i), "txt");
        harness.ctx.blobs.put(&key, body.as_bytes().to_vec()).await.unwrap();
        keys.push(key);
    }

    let task = harness
        .claim(TaskKind::Merge, input(&main, PathInput::root(), keys, false))
        .await;
    let updater = harness.updater(&task);
    let result = MergeHandler.execute(&harness.ctx, &task, &updater).await.expect("merge failed");
    let output: MergeOutput = serde_json::from_value(result).unwrap();

    assert_eq!(output.zip_name, "data/words_sorted.txt");
    assert_eq!(output.entries, 6);
    let merged = harness.ctx.blobs.get(&output.zip_name).await.unwrap();
    assert_eq!(lines(&merged), vec!["aardvark", "apple", "banana", "cherry", "date", "fig"]);
    assert_eq!(output.bytes, merged.len() as u64);
}

#[tokio::test]
async fn test_merge_handler_single_source_is_copied_verbatim() {
    let harness = Harness::new(test_config());
    let main = MainInput::new("data", "words.txt");
    let source = main.sorted_key(&PathInput(vec![0, 0]), "txt");
    // Deliberately not newline-terminated: a pass-through must not touch the bytes.
    harness.ctx.blobs.put(&source, b"kiwi\nlime".to_vec()).await.unwrap();

    let task = harness
        .claim(TaskKind::Merge, input(&main, PathInput(vec![0]), vec![source], false))
        .await;
    let updater = harness.updater(&task);
    let result = MergeHandler.execute(&harness.ctx, &task, &updater).await.unwrap();
    let output: MergeOutput = serde_json::from_value(result).unwrap();

    assert_eq!(output.zip_name, "data/words_sorted_0.txt");
    assert_eq!(harness.ctx.blobs.get(&output.zip_name).await.unwrap(), b"kiwi\nlime".to_vec());
    assert_eq!(output.entries, 2);
}

#[tokio::test]
async fn test_merge_handler_zero_sources_writes_empty_output() {
    let harness = Harness::new(test_config());
    let main = MainInput::new("data", "words.txt");

    let task = harness
        .claim(TaskKind::Merge, input(&main, PathInput(vec![2]), Vec::new(), false))
        .await;
    let updater = harness.updater(&task);
    let result = MergeHandler.execute(&harness.ctx, &task, &updater).await.unwrap();
    let output: MergeOutput = serde_json::from_value(result).unwrap();

    assert_eq!(output.entries, 0);
    assert!(harness.ctx.blobs.get(&output.zip_name).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_leaf_merge_sorts_raw_shard() {
    let harness = Harness::new(test_config());
    let main = MainInput::new("data", "words.txt");
    let shard = main.part_key(&PathInput(vec![1]), "txt");
    harness.ctx.blobs.put(&shard, b"pear\napple\nmango\napple\n".to_vec()).await.unwrap();

    let task = harness
        .claim(TaskKind::Merge, input(&main, PathInput(vec![1]), vec![shard], true))
        .await;
    let updater = harness.updater(&task);
    let result = MergeHandler.execute(&harness.ctx, &task, &updater).await.unwrap();
    let output: MergeOutput = serde_json::from_value(result).unwrap();

    assert_eq!(output.zip_name, "data/words_sorted_1.txt");
    let sorted = harness.ctx.blobs.get(&output.zip_name).await.unwrap();
    assert_eq!(sorted, b"apple\napple\nmango\npear\n".to_vec());
}

#[tokio::test]
async fn test_merge_rerun_overwrites_same_key() {
    let harness = Harness::new(test_config());
    let main = MainInput::new("data", "words.txt");
    let shard = main.part_key(&PathInput(vec![0]), "txt");
    harness.ctx.blobs.put(&shard, b"b\na\n".to_vec()).await.unwrap();
    let leaf = input(&main, PathInput(vec![0]), vec![shard], true);

    let mut outputs = Vec::new();
    for _ in 0..2 {
        let task = harness.claim(TaskKind::Merge, leaf.clone()).await;
        let updater = harness.updater(&task);
        outputs.push(MergeHandler.execute(&harness.ctx, &task, &updater).await.unwrap());
    }
    assert_eq!(outputs[0], outputs[1]);
    // The part shard plus a single sorted output.
    assert_eq!(harness.store.len(), 2);
}

#[tokio::test]
async fn test_large_merge_streams_parts() {
    let mut config = test_config();
    config.blob.multipart_threshold_bytes = 64;
    config.blob.part_size_bytes = 32;
    let harness = Harness::new(config);
    let main = MainInput::new("data", "words.txt");

    let mut sources = Vec::new();
    let mut expected = Vec::new();
    for i in 0..3 {
        let words: Vec<String> = (0..40).map(|n| format!("w{:03}", n * 3 + i)).collect();
        let key = main.sorted_key(&PathInput(vec![i]), "txt");
        harness
            .ctx
            .blobs
            .put(&key, format!("{}\n", words.join("\n")).into_bytes())
            .await
            .unwrap();
        sources.push(key);
        expected.extend(words);
    }
    expected.sort();
    let parts_before = harness.store.uploaded_parts();

    let task = harness
        .claim(TaskKind::Merge, input(&main, PathInput::root(), sources, false))
        .await;
    let updater = harness.updater(&task);
    let result = MergeHandler.execute(&harness.ctx, &task, &updater).await.unwrap();
    let output: MergeOutput = serde_json::from_value(result).unwrap();

    assert_eq!(output.entries, 120);
    assert_eq!(output.bytes, 120 * 5);
    // 600 bytes in 32-byte parts.
    assert_eq!(harness.store.uploaded_parts() - parts_before, 19);
    assert_eq!(lines(&harness.ctx.blobs.get(&output.zip_name).await.unwrap()), expected);
}

#[test]
fn test_leaf_merge_requires_single_shard() {
    let main = MainInput::new("data", "words.txt");
    let bad = input(&main, PathInput(vec![0]), vec!["a".to_string(), "b".to_string()], true);
    assert!(MergeHandler.validate(&bad).is_err());
}
