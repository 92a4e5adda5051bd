//! Property tests for bucketing, filtering and profile accumulation

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{base_time, read_hits, write_at, write_hits, LineHitMerge};
use covharvest::sandbox::LocalSandbox;
use covharvest::{
    BucketLabel, Bucketizer, CoverageReport, CumulativeProfile, FileCoverage, ProfileMerger,
    Sandbox,
};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tempfile::TempDir;

fn hit_map() -> impl Strategy<Value = BTreeMap<String, u64>> {
    prop::collection::btree_map("[a-c]\\.cpp:[1-5]", 0u64..4, 1..6)
}

fn fold_all(profiles: &[BTreeMap<String, u64>]) -> BTreeMap<String, u64> {
    let dir = TempDir::new().unwrap();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let sandbox = LocalSandbox::new(dir.path().join("sandbox"));
        let handle = sandbox.provision().await.unwrap();
        let merger = ProfileMerger::new(&sandbox, &handle, &LineHitMerge);
        let mut cumulative =
            CumulativeProfile::new(dir.path().join("cumulative.profdata"), dir.path().join("cum"));
        cumulative.reset().unwrap();
        for (i, profile) in profiles.iter().enumerate() {
            let path = dir.path().join(format!("bucket-{i}.profdata"));
            write_hits(&path, profile).unwrap();
            let start = i as u64 * 60;
            cumulative
                .fold(&merger, BucketLabel::new(start, start + 60), &path)
                .await
                .unwrap();
        }
        read_hits(cumulative.host_path()).unwrap()
    })
}

/// Merge `(A, B)` then `C`, and `A` then `(B, C)`, through the merger
fn grouped_merges(
    a: &BTreeMap<String, u64>,
    b: &BTreeMap<String, u64>,
    c: &BTreeMap<String, u64>,
) -> (BTreeMap<String, u64>, BTreeMap<String, u64>) {
    let dir = TempDir::new().unwrap();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let sandbox = LocalSandbox::new(dir.path().join("sandbox"));
        let handle = sandbox.provision().await.unwrap();
        let merger = ProfileMerger::new(&sandbox, &handle, &LineHitMerge);
        let path = |name: &str| dir.path().join(name);
        write_hits(&path("a"), a).unwrap();
        write_hits(&path("b"), b).unwrap();
        write_hits(&path("c"), c).unwrap();

        merger.merge(&[path("a"), path("b")], &path("ab")).await.unwrap();
        merger.merge(&[path("ab"), path("c")], &path("ab_c")).await.unwrap();
        merger.merge(&[path("b"), path("c")], &path("bc")).await.unwrap();
        merger.merge(&[path("a"), path("bc")], &path("a_bc")).await.unwrap();

        (
            read_hits(&path("ab_c")).unwrap(),
            read_hits(&path("a_bc")).unwrap(),
        )
    })
}

fn one_shot(profiles: &[BTreeMap<String, u64>]) -> BTreeMap<String, u64> {
    let mut total = BTreeMap::new();
    for profile in profiles {
        for (entry, hits) in profile {
            *total.entry(entry.clone()).or_insert(0) += hits;
        }
    }
    total
}

mod bucket_properties {
    use super::*;

    proptest! {
        #[test]
        fn prop_offset_lands_in_its_label(offset in 0u64..100_000, interval in 1u64..5_000) {
            let label = BucketLabel::for_offset(offset, interval);
            prop_assert!(label.contains(offset));
            prop_assert_eq!(label.end() - label.start(), interval);
            prop_assert_eq!(label.start() % interval, 0);
        }

        #[test]
        fn prop_label_order_is_numeric(
            a in 0u64..10_000,
            b in 0u64..10_000,
            interval in 1u64..500,
        ) {
            let la = BucketLabel::for_offset(a, interval);
            let lb = BucketLabel::for_offset(b, interval);
            prop_assert_eq!(la.cmp(&lb), la.start().cmp(&lb.start()));
            let parsed: BucketLabel = la.to_string().parse().unwrap();
            prop_assert_eq!(parsed, la);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_every_file_in_exactly_one_bucket(
            offsets in prop::collection::vec(0u64..600, 1..12),
            interval in 1i64..200,
        ) {
            let target = TempDir::new().unwrap();
            let out = TempDir::new().unwrap();
            for (i, offset) in offsets.iter().enumerate() {
                let group = if i % 2 == 0 { "g1" } else { "g2" };
                write_at(
                    &target.path().join(group),
                    &format!("p{i}.py"),
                    "pass\n",
                    base_time(),
                    *offset,
                );
            }
            let bucketizer = Bucketizer::new(target.path(), interval).unwrap();
            let groups = bucketizer.discover().unwrap();
            let first = bucketizer.plan(&groups);
            let second = bucketizer.plan(&groups);
            prop_assert_eq!(&first, &second);

            let classification = bucketizer.classify_into(&out.path().join("buckets")).unwrap();
            prop_assert_eq!(classification.total(), offsets.len());
            prop_assert_eq!(
                classification.label_counts().values().sum::<usize>(),
                offsets.len()
            );
            for placement in &first {
                let group_min = groups[&placement.key.group]
                    .iter()
                    .map(|f| f.modified)
                    .min()
                    .unwrap();
                let offset = placement
                    .file
                    .modified
                    .duration_since(group_min)
                    .unwrap()
                    .as_secs();
                prop_assert!(placement.key.label.contains(offset));
            }
        }
    }
}

mod filter_properties {
    use super::*;

    fn report() -> impl Strategy<Value = CoverageReport> {
        prop::collection::vec(("(src|lib)/(aten|torch)/[a-d]\\.cpp", 0u64..50, 0u64..50), 0..10)
            .prop_map(|rows| {
                CoverageReport::new(
                    rows.into_iter()
                        .map(|(path, a, b)| FileCoverage::new(path, a.min(b), a.max(b)))
                        .collect(),
                )
            })
    }

    fn required() -> impl Strategy<Value = Vec<String>> {
        let words = vec!["src", "lib", "aten", "torch", "a.cpp"];
        prop::collection::vec(prop::sample::select(words), 0..3)
            .prop_map(|v| v.into_iter().map(String::from).collect())
    }

    proptest! {
        #[test]
        fn prop_filter_keeps_only_matching_rows(report in report(), required in required()) {
            let original = report.clone();
            let filtered = report.filter(&required);
            for file in filtered.files() {
                prop_assert!(required.iter().all(|r| file.path.contains(r.as_str())));
                prop_assert!(original.files().contains(file));
            }
            let dropped = original.files().len() - filtered.files().len();
            let mismatching = original
                .files()
                .iter()
                .filter(|f| !required.iter().all(|r| f.path.contains(r.as_str())))
                .count();
            prop_assert_eq!(dropped, mismatching);
        }

        #[test]
        fn prop_score_never_exceeds_total(report in report(), required in required()) {
            let unfiltered = report.score();
            let score = report.filter(&required).score();
            prop_assert!(score.covered <= score.total);
            prop_assert!(score.total <= unfiltered.total);
            prop_assert!((0.0..=100.0).contains(&score.percent()));
        }
    }
}

mod merge_properties {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn prop_cumulative_equals_one_shot(profiles in prop::collection::vec(hit_map(), 1..5)) {
            prop_assert_eq!(fold_all(&profiles), one_shot(&profiles));
        }

        #[test]
        fn prop_merge_is_associative(a in hit_map(), b in hit_map(), c in hit_map()) {
            let (left, right) = grouped_merges(&a, &b, &c);
            prop_assert_eq!(&left, &right);
            prop_assert_eq!(left, one_shot(&[a, b, c]));
        }

        #[test]
        fn prop_fold_order_does_not_change_result(
            profiles in prop::collection::vec(hit_map(), 2..4),
        ) {
            let mut reversed = profiles.clone();
            reversed.reverse();
            prop_assert_eq!(fold_all(&profiles), fold_all(&reversed));
        }
    }

    #[test]
    fn test_fold_records_labels_in_order() {
        let dir = TempDir::new().unwrap();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let sandbox = LocalSandbox::new(dir.path().join("sandbox"));
            let handle = sandbox.provision().await.unwrap();
            let merger = ProfileMerger::new(&sandbox, &handle, &LineHitMerge);
            let mut cumulative = CumulativeProfile::new(
                dir.path().join("cumulative.profdata"),
                dir.path().join("cum"),
            );
            let mut labels = Vec::new();
            for start in [0u64, 60, 180] {
                let path: PathBuf = dir.path().join(format!("{start}.profdata"));
                write_hits(&path, &BTreeMap::from([("a.cpp:1".to_string(), 1)])).unwrap();
                let label = BucketLabel::new(start, start + 60);
                cumulative.fold(&merger, label, &path).await.unwrap();
                labels.push(label);
            }
            assert_eq!(cumulative.folded(), labels.as_slice());
            assert_eq!(read_hits(cumulative.host_path()).unwrap()["a.cpp:1"], 3);
        });
    }
}
