//! End-to-end promotion attempts against in-memory collaborators.

mod common;

use common::{harness, Scenario};
use geoctl_mgmt::promotion::PROMOTION_LOCK;
use geoctl_mgmt::{
    AuditFilter, AuditTransition, CannedAnswers, FailureCategory, MigrationError, NodeRole,
    PromotionError, PromotionRequest, PromotionState, Question,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn all_confirmed() -> PromotionRequest {
    PromotionRequest {
        confirm_primary_down: Some(true),
        confirm_removing_keys: Some(true),
        skip_preflight_checks: Some(true),
    }
}

#[tokio::test]
async fn scenario_a_confirmed_promotion_completes() {
    let answers = Arc::new(CannedAnswers::new());
    let mut h = harness(Scenario::default(), answers.clone());

    let report = h
        .orchestrator
        .promote(all_confirmed(), &CancellationToken::new())
        .await;

    assert_eq!(report.final_state, PromotionState::Done);
    assert_eq!(report.exit_code(), 0);
    assert!(report.error.is_none());
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    assert_eq!(h.role.current_role(), NodeRole::Primary);
    assert!(h.journal.position("remove keys").is_some());
    assert!(answers.asked().is_empty());

    // every dependent service is back up
    for svc in ["puma", "sidekiq", "geo-logcursor", "nginx"] {
        assert!(h.supervisor.is_up(svc), "{} not running", svc);
    }
    assert!(h.orchestrator.slots().is_empty());
    assert_eq!(h.orchestrator.migrations().history().len(), 1);
    assert!(!h.locks.is_held(PROMOTION_LOCK));
}

#[tokio::test]
async fn flip_happens_only_after_quiesce_and_migration() {
    let mut h = harness(Scenario::default(), Arc::new(CannedAnswers::new()));
    let report = h
        .orchestrator
        .promote(all_confirmed(), &CancellationToken::new())
        .await;
    assert!(report.succeeded());

    let entries = h.journal.entries();
    assert_eq!(
        entries,
        vec![
            "stop nginx",
            "stop geo-logcursor",
            "stop sidekiq",
            "stop puma",
            "migrate geo:db:migrate",
            "flip",
            "remove keys",
            "start puma",
            "start sidekiq",
            "start geo-logcursor",
            "start nginx",
        ]
    );
    assert_eq!(
        report.visited,
        vec![
            PromotionState::Idle,
            PromotionState::AwaitConfirmPrimaryDown,
            PromotionState::QuiesceServices,
            PromotionState::RunMigrations,
            PromotionState::FlipRole,
            PromotionState::RemoveStaleKeys,
            PromotionState::ResumeServices,
            PromotionState::Done,
        ]
    );
}

#[tokio::test]
async fn scenario_b_stop_failure_halts_before_flip() {
    let scenario = Scenario {
        services: vec!["puma", "sidekiq", "geo-logcursor", "nginx"],
        fail_stop: vec!["sidekiq"],
        ..Scenario::default()
    };
    let mut h = harness(scenario, Arc::new(CannedAnswers::new()));

    let report = h
        .orchestrator
        .promote(all_confirmed(), &CancellationToken::new())
        .await;

    assert_eq!(report.final_state, PromotionState::Failed);
    assert_eq!(report.category(), Some(FailureCategory::ServiceStop));
    assert_eq!(report.exit_code(), 4);
    assert_eq!(report.last_completed, Some(PromotionState::AwaitConfirmPrimaryDown));

    // first two in stop order are down, the fourth was never touched
    assert!(!h.supervisor.is_up("nginx"));
    assert!(!h.supervisor.is_up("geo-logcursor"));
    assert!(h.supervisor.is_up("sidekiq"));
    assert!(h.supervisor.is_up("puma"));
    assert_eq!(h.journal.count_prefix("start "), 0);

    assert_eq!(h.role.current_role(), NodeRole::Secondary);
    assert!(h.journal.position("flip").is_none());
    assert!(h.journal.position("migrate geo:db:migrate").is_none());
    assert!(!report.entered(PromotionState::RunMigrations));
}

#[tokio::test]
async fn skip_preflight_never_enters_preflight() {
    let mut h = harness(Scenario::default(), Arc::new(CannedAnswers::new()));
    let report = h
        .orchestrator
        .promote(all_confirmed(), &CancellationToken::new())
        .await;
    assert!(!report.entered(PromotionState::Preflight));
    assert!(h.journal.position("preflight").is_none());
}

#[tokio::test]
async fn failed_preflight_stops_before_any_mutation() {
    let scenario = Scenario {
        preflight_passes: false,
        ..Scenario::default()
    };
    let mut h = harness(scenario, Arc::new(CannedAnswers::new()));
    let request = PromotionRequest {
        skip_preflight_checks: Some(false),
        ..all_confirmed()
    };

    let report = h.orchestrator.promote(request, &CancellationToken::new()).await;

    assert_eq!(report.category(), Some(FailureCategory::Preflight));
    assert_eq!(report.exit_code(), 7);
    assert_eq!(report.last_completed, Some(PromotionState::Idle));
    assert_eq!(h.journal.entries(), vec!["preflight"]);
}

#[tokio::test]
async fn refused_confirmation_halts_before_quiesce() {
    let mut h = harness(Scenario::default(), Arc::new(CannedAnswers::new()));
    let request = PromotionRequest {
        confirm_primary_down: Some(false),
        ..all_confirmed()
    };

    let report = h.orchestrator.promote(request, &CancellationToken::new()).await;

    assert_eq!(report.category(), Some(FailureCategory::ConfirmationRefused));
    assert_eq!(report.exit_code(), 3);
    assert!(!report.entered(PromotionState::QuiesceServices));
    assert_eq!(h.journal.count_prefix("stop "), 0);
    assert_eq!(h.role.current_role(), NodeRole::Secondary);
}

#[tokio::test]
async fn absent_flags_are_asked() {
    let answers = Arc::new(
        CannedAnswers::new()
            .answer(Question::SkipPreflightChecks, true)
            .answer(Question::PrimaryIsDown, true)
            .answer(Question::RemoveStaleKeys, false),
    );
    let mut h = harness(Scenario::default(), answers.clone());

    let report = h
        .orchestrator
        .promote(PromotionRequest::default(), &CancellationToken::new())
        .await;

    assert_eq!(
        answers.asked(),
        vec![
            Question::SkipPreflightChecks,
            Question::PrimaryIsDown,
            Question::RemoveStaleKeys
        ]
    );
    assert!(report.succeeded());
    assert_eq!(report.exit_code(), 0);
    assert!(h.journal.position("remove keys").is_none());
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("cleanup is outstanding"));
}

#[tokio::test]
async fn unanswered_primary_question_is_a_refusal() {
    let mut h = harness(Scenario::default(), Arc::new(CannedAnswers::new()));
    let request = PromotionRequest {
        confirm_primary_down: None,
        ..all_confirmed()
    };

    let report = h.orchestrator.promote(request, &CancellationToken::new()).await;
    assert_eq!(report.category(), Some(FailureCategory::ConfirmationRefused));
    assert_eq!(h.journal.count_prefix("stop "), 0);
}

#[tokio::test]
async fn migration_failure_leaves_services_quiesced() {
    let scenario = Scenario {
        migration_succeeds: false,
        ..Scenario::default()
    };
    let mut h = harness(scenario, Arc::new(CannedAnswers::new()));

    let report = h
        .orchestrator
        .promote(all_confirmed(), &CancellationToken::new())
        .await;

    assert_eq!(report.category(), Some(FailureCategory::Migration));
    assert_eq!(report.exit_code(), 5);
    assert_eq!(report.last_completed, Some(PromotionState::QuiesceServices));
    assert_eq!(h.journal.count_prefix("start "), 0);
    assert!(h.journal.position("flip").is_none());
    assert!(!h.supervisor.is_up("puma"));
    let history = h.orchestrator.migrations().history();
    assert_eq!(history.len(), 1);
    assert!(!history[0].succeeded());
}

#[tokio::test]
async fn migration_already_running_fails_in_progress() {
    let mut h = harness(Scenario::default(), Arc::new(CannedAnswers::new()));
    let _held = h.locks.try_acquire("migration-geo:db:migrate").unwrap();

    let report = h
        .orchestrator
        .promote(all_confirmed(), &CancellationToken::new())
        .await;

    assert_eq!(report.category(), Some(FailureCategory::Migration));
    assert!(matches!(
        report.error,
        Some(PromotionError::Migration {
            source: MigrationError::InProgress { .. },
            ..
        })
    ));
    assert!(h.journal.position("migrate geo:db:migrate").is_none());
}

#[tokio::test]
async fn role_flip_failure_is_not_retried() {
    let scenario = Scenario {
        flip_fails: true,
        ..Scenario::default()
    };
    let mut h = harness(scenario, Arc::new(CannedAnswers::new()));

    let report = h
        .orchestrator
        .promote(all_confirmed(), &CancellationToken::new())
        .await;

    assert_eq!(report.category(), Some(FailureCategory::RoleFlip));
    assert_eq!(report.exit_code(), 6);
    assert_eq!(h.journal.count_prefix("flip"), 1);
    assert_eq!(h.journal.count_prefix("start "), 0);
    assert!(h.journal.position("remove keys").is_none());
    assert!(!h.orchestrator.slots().is_empty());
}

#[tokio::test]
async fn resume_failure_is_a_warning_after_the_flip() {
    let scenario = Scenario {
        fail_start: vec!["sidekiq"],
        ..Scenario::default()
    };
    let mut h = harness(scenario, Arc::new(CannedAnswers::new()));

    let report = h
        .orchestrator
        .promote(all_confirmed(), &CancellationToken::new())
        .await;

    assert_eq!(report.final_state, PromotionState::Done);
    assert_eq!(report.exit_code(), 0);
    assert!(report.error.is_none());
    assert_eq!(h.role.current_role(), NodeRole::Primary);
    assert_eq!(h.journal.count_prefix("flip"), 1);
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("sidekiq"), "{:?}", report.warnings);

    assert!(h.supervisor.is_up("puma"));
    assert!(!h.supervisor.is_up("sidekiq"));
    assert!(h.journal.position("start geo-logcursor").is_none());
    let mut still_stopped = h.orchestrator.services().quiesced().to_vec();
    still_stopped.sort();
    assert_eq!(still_stopped, vec!["geo-logcursor", "nginx", "sidekiq"]);
}

#[tokio::test]
async fn key_removal_failure_is_a_warning_after_the_flip() {
    let scenario = Scenario {
        keys_fail: true,
        ..Scenario::default()
    };
    let mut h = harness(scenario, Arc::new(CannedAnswers::new()));

    let report = h
        .orchestrator
        .promote(all_confirmed(), &CancellationToken::new())
        .await;

    assert_eq!(report.final_state, PromotionState::Done);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(h.role.current_role(), NodeRole::Primary);
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("/var/opt/geo/.ssh/id_rsa"));
    assert!(report.entered(PromotionState::ResumeServices));
    for svc in ["puma", "sidekiq", "geo-logcursor", "nginx"] {
        assert!(h.supervisor.is_up(svc), "{} not running", svc);
    }

    let failed_removals = h.audit.query(&AuditFilter {
        transition: Some(AuditTransition::KeyRemoved),
        ..AuditFilter::default()
    });
    assert_eq!(failed_removals.len(), 1);
    assert!(!failed_removals[0].success);
}

#[tokio::test]
async fn concurrent_promotion_is_rejected() {
    let mut h = harness(Scenario::default(), Arc::new(CannedAnswers::new()));
    let _held = h.locks.try_acquire(PROMOTION_LOCK).unwrap();

    let report = h
        .orchestrator
        .promote(all_confirmed(), &CancellationToken::new())
        .await;

    assert_eq!(report.category(), Some(FailureCategory::InProgress));
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.visited, vec![PromotionState::Idle, PromotionState::Failed]);
    assert!(h.journal.entries().is_empty());
}

#[tokio::test]
async fn cancellation_is_honoured_during_preflight() {
    let mut h = harness(Scenario::default(), Arc::new(CannedAnswers::new()));
    let cancel = CancellationToken::new();
    cancel.cancel();
    let request = PromotionRequest {
        skip_preflight_checks: Some(false),
        ..all_confirmed()
    };

    let report = h.orchestrator.promote(request, &cancel).await;

    assert_eq!(report.category(), Some(FailureCategory::Cancelled));
    assert_eq!(report.exit_code(), 130);
    assert!(matches!(
        report.error,
        Some(PromotionError::Cancelled {
            state: PromotionState::Preflight
        })
    ));
    assert_eq!(h.journal.count_prefix("stop "), 0);
}

#[tokio::test]
async fn cancellation_is_ignored_once_quiesce_begins() {
    let cancel = CancellationToken::new();
    let scenario = Scenario {
        cancel_on_stop: Some(cancel.clone()),
        ..Scenario::default()
    };
    let mut h = harness(scenario, Arc::new(CannedAnswers::new()));

    let report = h.orchestrator.promote(all_confirmed(), &cancel).await;

    assert!(cancel.is_cancelled());
    assert!(report.succeeded());
    assert_eq!(h.role.current_role(), NodeRole::Primary);
}

#[tokio::test]
async fn every_visited_state_is_audited() {
    let mut h = harness(Scenario::default(), Arc::new(CannedAnswers::new()));
    let report = h
        .orchestrator
        .promote(all_confirmed(), &CancellationToken::new())
        .await;

    let entered: Vec<String> = h
        .audit
        .query(&AuditFilter {
            transition: Some(AuditTransition::StateEntered),
            attempt: Some(report.attempt_id),
            ..AuditFilter::default()
        })
        .into_iter()
        .map(|e| e.subject)
        .collect();
    let expected: Vec<String> = report.visited[1..].iter().map(|s| s.to_string()).collect();
    assert_eq!(entered, expected);

    let flips = h.audit.query(&AuditFilter {
        transition: Some(AuditTransition::RoleFlipped),
        ..AuditFilter::default()
    });
    assert_eq!(flips.len(), 1);
}
