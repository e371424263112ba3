mod common;

use common::{harness, harness_with, run_stages};
use handy_conductor::devops::operations::{resolve_escalation, EpicStatus, ResolutionOption};
use handy_conductor::devops::Rationale;
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn test_epic_runs_through_remediation_to_release() {
    let mut h = harness("BUILD=TESTS_FAILED,REMEDIATE=ALL_TESTS_PASS");
    let id = h.driver.manager().create_epic("add retry to the uploader").unwrap();

    let epic = h.driver.run_epic(&id, &CancellationToken::new()).await.unwrap();

    assert_eq!(epic.status, EpicStatus::Completed);
    assert_eq!(epic.current_stage.as_str(), "RELEASE");
    assert_eq!(
        run_stages(&h.store, &id),
        vec!["DESIGN", "BUILD", "REMEDIATE", "VALIDATE"]
    );
    assert!(h.store.list_escalations(true).unwrap().is_empty());
    assert!(h.world.unreleased_runs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_breaking_change_waits_for_operator_route() {
    let mut h = harness("BUILD=ALL_TESTS_PASS+BREAKING_CHANGE");
    let id = h.driver.manager().create_epic("drop the v1 api").unwrap();
    let cancel = CancellationToken::new();

    let epic = h.driver.run_epic(&id, &cancel).await.unwrap();
    assert_eq!(epic.status, EpicStatus::Blocked);
    assert_eq!(epic.blocked_reason, Some(Rationale::BreakingChange));
    assert_eq!(epic.current_stage.as_str(), "BUILD");

    let open = h.store.list_escalations(true).unwrap();
    assert_eq!(open.len(), 1);
    let escalation = &open[0];
    assert_eq!(escalation.message.rationale, Rationale::BreakingChange);
    let route: ResolutionOption = "route:VALIDATE".parse().unwrap();
    assert!(escalation.message.options.contains(&ResolutionOption::Complete));
    assert!(escalation.message.options.contains(&route));

    let epic = resolve_escalation(&h.store, h.driver.manager(), escalation.id, &route).unwrap();
    assert_eq!(epic.status, EpicStatus::Active);
    assert_eq!(epic.current_stage.as_str(), "VALIDATE");

    let epic = h.driver.run_epic(&id, &cancel).await.unwrap();
    assert_eq!(epic.status, EpicStatus::Completed);
    assert!(h.store.list_escalations(true).unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_turn_budget_blocks_after_first_stage() {
    let mut h = harness_with("", |s| s.budget.max_turns = Some(2));
    let id = h.driver.manager().create_epic("tiny budget").unwrap();

    let epic = h.driver.run_epic(&id, &CancellationToken::new()).await.unwrap();

    assert_eq!(epic.status, EpicStatus::Blocked);
    assert_eq!(epic.blocked_reason, Some(Rationale::BudgetExceeded));
    assert_eq!(run_stages(&h.store, &id), vec!["DESIGN"]);
    assert_eq!(h.world.invocations().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stuck_stage_resumes_same_session() {
    let mut h = harness("DESIGN=STALL|DESIGN_COMPLETE");
    let id = h.driver.manager().create_epic("flaky agent").unwrap();
    let cancel = CancellationToken::new();

    let epic = h.driver.run_epic(&id, &cancel).await.unwrap();
    assert_eq!(epic.status, EpicStatus::Blocked);
    assert_eq!(epic.blocked_reason, Some(Rationale::Stuck));
    assert!(h.world.terminations().iter().any(|(_, forced)| *forced));

    let open = h.store.list_escalations(true).unwrap();
    assert!(open[0].message.options.contains(&ResolutionOption::Resume));
    resolve_escalation(&h.store, h.driver.manager(), open[0].id, &ResolutionOption::Resume)
        .unwrap();

    let epic = h.driver.run_epic(&id, &cancel).await.unwrap();
    assert_eq!(epic.status, EpicStatus::Completed);

    let invocations = h.world.invocations();
    assert_eq!(invocations[1].session_name, invocations[0].session_name);
    assert!(!invocations[0].resume);
    assert!(invocations[1].resume);
    assert!(!invocations[2].resume);
}

#[tokio::test(start_paused = true)]
async fn test_remediation_loop_hits_attempt_limit() {
    let mut h = harness("BUILD=TESTS_FAILED,REMEDIATE=TESTS_FAILED");
    let id = h.driver.manager().create_epic("never green").unwrap();

    let epic = h.driver.run_epic(&id, &CancellationToken::new()).await.unwrap();

    assert_eq!(epic.status, EpicStatus::Blocked);
    assert_eq!(epic.blocked_reason, Some(Rationale::AttemptLimit));
    assert_eq!(epic.current_stage.as_str(), "REMEDIATE");
    let remediations = run_stages(&h.store, &id)
        .into_iter()
        .filter(|s| s == "REMEDIATE")
        .count();
    assert_eq!(remediations, h.settings.max_stage_attempts as usize);
}

#[tokio::test(start_paused = true)]
async fn test_completion_without_signal_escalates() {
    let mut h = harness("DESIGN=");
    let id = h.driver.manager().create_epic("quiet agent").unwrap();

    let epic = h.driver.run_epic(&id, &CancellationToken::new()).await.unwrap();

    assert_eq!(epic.status, EpicStatus::Blocked);
    assert_eq!(epic.blocked_reason, Some(Rationale::SignalMissing));
    assert_eq!(run_stages(&h.store, &id), vec!["DESIGN"]);
}

#[tokio::test(start_paused = true)]
async fn test_usage_reported_on_exit_counts_against_budget() {
    let mut h = harness_with("DESIGN=LINGER:DESIGN_COMPLETE", |s| s.budget.max_turns = Some(3));
    let id = h.driver.manager().create_epic("late reporter").unwrap();

    let epic = h.driver.run_epic(&id, &CancellationToken::new()).await.unwrap();

    assert_eq!(epic.status, EpicStatus::Blocked);
    assert_eq!(epic.blocked_reason, Some(Rationale::BudgetExceeded));
    let runs = h.store.runs_for_epic(&id).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].turns_used, 4);
    assert!(runs[0].cost > 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_breaking_change_outranks_budget() {
    let mut h = harness_with("DESIGN=DESIGN_COMPLETE+BREAKING_CHANGE", |s| {
        s.budget.max_turns = Some(0)
    });
    let id = h.driver.manager().create_epic("break and overspend").unwrap();

    let epic = h.driver.run_epic(&id, &CancellationToken::new()).await.unwrap();

    assert_eq!(epic.blocked_reason, Some(Rationale::BreakingChange));
    let open = h.store.list_escalations(true).unwrap();
    assert_eq!(open[0].message.rationale, Rationale::BreakingChange);
    assert!(open[0].message.options.contains(&ResolutionOption::Complete));
    assert!(open[0]
        .message
        .blocking_issues
        .iter()
        .any(|issue| issue.contains("exceed ceiling 0")));
}
