use anyhow::Error;
use chrono::{DateTime, Duration, Utc};

use stevedore_api_types::{CompiledGcPolicy, GcPolicy};
use stevedore_janitor::server::{evaluate_gc_policies, GcVerdict, ManifestGcInfo};

fn now() -> DateTime<Utc> {
    "2025-06-01T12:00:00Z".parse().unwrap()
}

fn compile(policies_json: &str) -> Vec<CompiledGcPolicy> {
    let policies: Vec<GcPolicy> = serde_json::from_str(policies_json).unwrap();
    policies.iter().map(|p| p.compile().unwrap()).collect()
}

fn manifest(digest: &str, age_days: i64, tags: &[&str]) -> ManifestGcInfo {
    ManifestGcInfo {
        digest: digest.to_string(),
        pushed_at: now() - Duration::days(age_days),
        last_pulled_at: None,
        tag_names: tags.iter().map(|t| t.to_string()).collect(),
        is_child: false,
    }
}

fn deleted_digests(
    policies: &[CompiledGcPolicy],
    manifests: &[ManifestGcInfo],
) -> Vec<String> {
    let refs: Vec<&CompiledGcPolicy> = policies.iter().collect();
    evaluate_gc_policies(&refs, manifests, now(), Duration::minutes(5))
        .into_iter()
        .filter_map(|(digest, verdict)| match verdict {
            GcVerdict::Delete => Some(digest),
            GcVerdict::Keep(_) => None,
        })
        .collect()
}

#[test]
fn test_delete_untagged() -> Result<(), Error> {
    let policies = compile(
        r#"[{
            "match_repository": ".*",
            "only_untagged": true,
            "action": "delete"
        }]"#,
    );

    let manifests = vec![
        manifest("sha256:aaa", 10, &[]),
        manifest("sha256:bbb", 10, &["latest"]),
        manifest("sha256:ccc", 3, &[]),
    ];
    assert_eq!(
        deleted_digests(&policies, &manifests),
        vec!["sha256:aaa".to_string(), "sha256:ccc".to_string()],
    );
    Ok(())
}

#[test]
fn test_protect_beats_delete_regardless_of_order() -> Result<(), Error> {
    // the delete policy comes first, but a matching protect still wins
    let policies = compile(
        r#"[
            {
                "match_repository": ".*",
                "action": "delete"
            },
            {
                "match_repository": ".*",
                "match_tag": "release-.*",
                "action": "protect"
            }
        ]"#,
    );

    let manifests = vec![
        manifest("sha256:aaa", 10, &["release-5"]),
        manifest("sha256:bbb", 10, &["nightly"]),
    ];
    assert_eq!(
        deleted_digests(&policies, &manifests),
        vec!["sha256:bbb".to_string()],
    );
    Ok(())
}

#[test]
fn test_recent_uploads_are_spared() -> Result<(), Error> {
    let policies = compile(
        r#"[{"match_repository": ".*", "action": "delete"}]"#,
    );

    let mut fresh = manifest("sha256:aaa", 0, &[]);
    fresh.pushed_at = now() - Duration::minutes(2);
    let manifests = vec![fresh, manifest("sha256:bbb", 1, &[])];

    let refs: Vec<&CompiledGcPolicy> = policies.iter().collect();
    let verdicts = evaluate_gc_policies(&refs, &manifests, now(), Duration::minutes(5));

    match &verdicts[0].1 {
        GcVerdict::Keep(status) => assert!(status.protected_by_recent_upload),
        GcVerdict::Delete => panic!("recently pushed manifest must not be deleted"),
    }
    match &verdicts[1].1 {
        GcVerdict::Delete => (),
        GcVerdict::Keep(_) => panic!("old manifest should have been deleted"),
    }
    Ok(())
}

#[test]
fn test_children_are_never_deleted() -> Result<(), Error> {
    let policies = compile(
        r#"[{"match_repository": ".*", "action": "delete"}]"#,
    );

    let mut child = manifest("sha256:aaa", 30, &[]);
    child.is_child = true;
    let manifests = vec![child];

    let refs: Vec<&CompiledGcPolicy> = policies.iter().collect();
    let verdicts = evaluate_gc_policies(&refs, &manifests, now(), Duration::minutes(5));
    match &verdicts[0].1 {
        GcVerdict::Keep(status) => assert!(status.protected_by_parent),
        GcVerdict::Delete => panic!("child manifest must not be deleted"),
    }
    Ok(())
}

#[test]
fn test_time_constraint_on_pushed_at() -> Result<(), Error> {
    let policies = compile(
        r#"[{
            "match_repository": ".*",
            "time_constraint": {
                "on": "pushed_at",
                "older_than": {"value": 2, "unit": "w"}
            },
            "action": "delete"
        }]"#,
    );

    let manifests = vec![
        manifest("sha256:aaa", 30, &[]),
        manifest("sha256:bbb", 7, &[]),
    ];
    assert_eq!(
        deleted_digests(&policies, &manifests),
        vec!["sha256:aaa".to_string()],
    );
    Ok(())
}

#[test]
fn test_time_constraint_on_last_pulled_at() -> Result<(), Error> {
    let policies = compile(
        r#"[{
            "match_repository": ".*",
            "time_constraint": {
                "on": "last_pulled_at",
                "older_than": {"value": 30, "unit": "d"}
            },
            "action": "delete"
        }]"#,
    );

    let mut pulled_recently = manifest("sha256:aaa", 90, &[]);
    pulled_recently.last_pulled_at = Some(now() - Duration::days(3));
    let mut pulled_long_ago = manifest("sha256:bbb", 90, &[]);
    pulled_long_ago.last_pulled_at = Some(now() - Duration::days(60));
    // never pulled counts as infinitely old
    let never_pulled = manifest("sha256:ccc", 90, &[]);

    let manifests = vec![pulled_recently, pulled_long_ago, never_pulled];
    assert_eq!(
        deleted_digests(&policies, &manifests),
        vec!["sha256:bbb".to_string(), "sha256:ccc".to_string()],
    );
    Ok(())
}

#[test]
fn test_unmatched_manifests_survive() -> Result<(), Error> {
    let policies = compile(
        r#"[{
            "match_repository": ".*",
            "match_tag": "nightly-.*",
            "action": "delete"
        }]"#,
    );

    let manifests = vec![manifest("sha256:aaa", 30, &["v1.0"])];
    assert!(deleted_digests(&policies, &manifests).is_empty());

    let refs: Vec<&CompiledGcPolicy> = policies.iter().collect();
    let verdicts = evaluate_gc_policies(&refs, &manifests, now(), Duration::minutes(5));
    match &verdicts[0].1 {
        GcVerdict::Keep(status) => {
            assert!(!status.protected_by_parent);
            assert!(!status.protected_by_recent_upload);
            assert!(status.protected_by_policy.is_none());
            assert!(status.relevant_policies.is_empty());
        }
        GcVerdict::Delete => panic!("unmatched manifest must survive"),
    }
    Ok(())
}

#[test]
fn test_gc_status_records_protecting_policy() -> Result<(), Error> {
    let policies = compile(
        r#"[
            {
                "match_repository": ".*",
                "match_tag": "release-.*",
                "action": "protect"
            },
            {
                "match_repository": ".*",
                "action": "delete"
            }
        ]"#,
    );

    let manifests = vec![manifest("sha256:aaa", 30, &["release-1"])];
    let refs: Vec<&CompiledGcPolicy> = policies.iter().collect();
    let verdicts = evaluate_gc_policies(&refs, &manifests, now(), Duration::minutes(5));

    match &verdicts[0].1 {
        GcVerdict::Keep(status) => {
            let protecting = status.protected_by_policy.as_ref().unwrap();
            assert_eq!(protecting.match_tag.as_deref(), Some("release-.*"));
            // the status serializes into gc_status_json without noise
            let json = serde_json::to_value(status).unwrap();
            assert!(json.get("protected_by_parent").is_none());
            assert!(json.get("protected_by_policy").is_some());
        }
        GcVerdict::Delete => panic!("protected manifest must survive"),
    }
    Ok(())
}
