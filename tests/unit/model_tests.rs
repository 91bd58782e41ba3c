use agent_warden::models::detection::{Detection, DetectionReport, FailureKind};
use agent_warden::models::spawn::{marker_for, Spawn, SpawnStatus, MARKER_LEN};
use agent_warden::AppError;

#[test]
fn terminal_statuses_are_absorbing() {
    for from in SpawnStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
        for to in SpawnStatus::ALL {
            assert!(
                !from.can_transition_to(to),
                "{from} must not transition to {to}"
            );
        }
    }
}

#[test]
fn forward_transitions_are_allowed() {
    use SpawnStatus::{Completed, Failed, Killed, Pending, Running, Timeout};

    assert!(Pending.can_transition_to(Running));
    for terminal in [Completed, Failed, Timeout, Killed] {
        assert!(Pending.can_transition_to(terminal));
        assert!(Running.can_transition_to(terminal));
    }
    assert!(!Running.can_transition_to(Pending));
    assert!(!Running.can_transition_to(Running));
}

#[test]
fn status_round_trips_through_strings() {
    for status in SpawnStatus::ALL {
        let parsed: SpawnStatus = status.as_str().parse().expect("known status");
        assert_eq!(parsed, status);
        assert_eq!(status.to_string(), status.as_str());
    }
    assert!(matches!(
        "paused".parse::<SpawnStatus>(),
        Err(AppError::Config(_))
    ));
}

#[test]
fn pipe_filter_uses_or_semantics_and_dedups() {
    let statuses = SpawnStatus::parse_filter("running|pending| running").expect("valid filter");
    assert_eq!(statuses, vec![SpawnStatus::Running, SpawnStatus::Pending]);

    assert!(SpawnStatus::parse_filter("").expect("empty").is_empty());
    assert!(SpawnStatus::parse_filter("running|bogus").is_err());
}

#[test]
fn new_spawn_is_pending_with_time_ordered_id() {
    let first = Spawn::new("agent-1".into(), None, None, None);
    std::thread::sleep(std::time::Duration::from_millis(2));
    let second = Spawn::new("agent-1".into(), Some(first.id.clone()), None, None);

    assert_eq!(first.status, SpawnStatus::Pending);
    assert!(first.pid.is_none());
    assert!(first.ended_at.is_none());
    let version = uuid::Uuid::parse_str(&first.id).expect("uuid").get_version_num();
    assert_eq!(version, 7);
    assert!(first.id < second.id, "v7 ids sort by creation time");
}

#[test]
fn marker_is_last_eight_characters() {
    let spawn = Spawn::new("agent-1".into(), None, None, None);
    assert_eq!(spawn.marker().len(), MARKER_LEN);
    assert!(spawn.id.ends_with(spawn.marker()));

    assert_eq!(marker_for("0192f0a4-1c2b-7def-8abc-0123456789ab"), "456789ab");
    assert_eq!(marker_for("short"), "short");
}

#[test]
fn only_orphan_kinds_are_enforced_by_default() {
    assert!(FailureKind::NoPid.is_orphan());
    assert!(FailureKind::DeadProcess.is_orphan());
    assert!(!FailureKind::Timeout.is_orphan());
    assert_eq!(
        FailureKind::DeadProcess.enforced_status(),
        Some(SpawnStatus::Failed)
    );
    assert_eq!(
        FailureKind::Timeout.enforced_status(),
        Some(SpawnStatus::Timeout)
    );
    assert_eq!(FailureKind::Stalled.enforced_status(), None);
    assert_eq!(FailureKind::NoSession.enforced_status(), None);
}

#[test]
fn report_splits_applied_and_candidates() {
    let detection = |spawn_id: &str, kind, applied| Detection {
        spawn_id: spawn_id.into(),
        agent_id: "agent-1".into(),
        kind,
        age_seconds: 30,
        idle_seconds: None,
        applied,
    };
    let report = DetectionReport {
        scanned: 3,
        detections: vec![
            detection("s1", FailureKind::DeadProcess, true),
            detection("s2", FailureKind::Stalled, false),
        ],
    };

    assert_eq!(report.applied().count(), 1);
    assert_eq!(report.candidates().count(), 1);
    assert_eq!(
        report.for_spawn("s2").map(|d| d.kind),
        Some(FailureKind::Stalled)
    );
    assert!(report.for_spawn("s3").is_none());

    let json = serde_json::to_string(&report).expect("serialize");
    assert!(json.contains("\"dead_process\""));
}
