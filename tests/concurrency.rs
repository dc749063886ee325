// Racing writers on one proposal: exactly one commits, the rest see a
// conflict or the already-moved state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nckh_flow::domain::{
    ChangeCouncilPayload, Conclusion, CouncilPayload, CouncilSpec, CouncilType, FinalizePayload,
};
use nckh_flow::store::ProposalStore;
use nckh_flow::{MemoryStore, NckhFlowConfig, Proposal, ProposalState, Repository, WorkflowError};

mod fixtures;
use fixtures::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submits_commit_once() {
    let h = harness();
    let proposal = h.draft("NCKH-2025-300").await;

    let (a, b) = tokio::join!(
        h.service.submit_proposal(request(&proposal, owner(), ())),
        h.service.submit_proposal(request(&proposal, owner(), ())),
    );
    let results = [a, b];
    let committed = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(committed, 1);
    for result in &results {
        if let Err(e) = result {
            assert!(
                matches!(
                    e,
                    WorkflowError::ConcurrentModification { .. }
                        | WorkflowError::InvalidStateTransition { .. }
                ),
                "unexpected error {e:?}"
            );
        }
    }

    let stored = h.reload(&proposal).await;
    assert_eq!(stored.state, ProposalState::FacultyCouncilOutlineReview);
    assert_eq!(stored.workflow_log.len(), 1);
    assert_eq!(stored.review_cycle, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_finalize_and_change_council_race_on_same_version() {
    let h = harness();
    let (proposal, _) = h.in_faculty_review("NCKH-2025-310").await;
    h.evaluate_all(&proposal, &FACULTY_MEMBERS, 4, Conclusion::Pass).await;

    let replacement = h
        .service
        .create_council(
            &manager(),
            CouncilSpec {
                name: "Hoi dong thay the".to_string(),
                council_type: CouncilType::FacultyOutline,
                faculty_id: Some(FACULTY.to_string()),
                secretary_id: FACULTY_SECRETARY.to_string(),
                chair_id: None,
                member_ids: vec!["m3".to_string(), "m4".to_string(), "m5".to_string()],
            },
        )
        .await
        .unwrap();

    // both callers read the same snapshot
    let seen = h.reload(&proposal).await;
    let finalize = request(
        &seen,
        reviewer(FACULTY_SECRETARY),
        FinalizePayload::new(Conclusion::Pass, "Dat"),
    )
    .with_expected_version(seen.version);
    let change = request(
        &seen,
        manager(),
        ChangeCouncilPayload {
            council_id: replacement.id.clone(),
            reason: Some("Xung dot loi ich".to_string()),
        },
    )
    .with_expected_version(seen.version);

    let (finalized, changed) = tokio::join!(
        h.service.finalize_council_evaluation(finalize),
        h.service.change_council(change),
    );

    assert!(
        finalized.is_ok() ^ changed.is_ok(),
        "exactly one writer must win: {finalized:?} / {changed:?}"
    );
    let loser = finalized.as_ref().err().or(changed.as_ref().err());
    assert!(matches!(loser, Some(WorkflowError::ConcurrentModification { .. })));
    assert!(loser.is_some_and(WorkflowError::is_retryable));

    let stored = h.reload(&proposal).await;
    assert_eq!(stored.version, seen.version + 1);
    if finalized.is_ok() {
        assert_eq!(stored.state, ProposalState::SchoolCouncilOutlineReview);
        assert_eq!(stored.finalizations.len(), 1);
        assert_eq!(stored.council_id, None);
    } else {
        assert_eq!(stored.state, ProposalState::FacultyCouncilOutlineReview);
        assert!(stored.finalizations.is_empty());
        assert_eq!(stored.council_id.as_deref(), Some(replacement.id.as_str()));
        assert_eq!(stored.review_cycle, seen.review_cycle + 1);
    }
}

#[tokio::test]
async fn test_stale_expected_version_is_rejected_before_anything_else() {
    let h = harness();
    let proposal = h.draft("NCKH-2025-320").await;
    h.service.submit_proposal(request(&proposal, owner(), ())).await.unwrap();

    // version 0 is gone; the conflict wins over the (also failing) state check
    let err = h
        .service
        .submit_proposal(request(&proposal, owner(), ()).with_expected_version(0))
        .await
        .unwrap_err();
    match err {
        WorkflowError::ConcurrentModification { expected, actual, .. } => {
            assert_eq!((expected, actual), (0, 1));
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(h.service.metrics().conflicts, 1);
}

#[tokio::test]
async fn test_expected_target_guards_against_surprise_destinations() {
    let h = harness();
    let proposal = h.draft("NCKH-2025-330").await;

    let err = h
        .service
        .submit_proposal(
            request(&proposal, owner(), ())
                .with_expected_target(ProposalState::SchoolCouncilOutlineReview),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidStateTransition { .. }));
    assert_eq!(h.reload(&proposal).await.state, ProposalState::Draft);

    let outcome = h
        .service
        .submit_proposal(
            request(&proposal, owner(), ())
                .with_expected_target(ProposalState::FacultyCouncilOutlineReview),
        )
        .await
        .unwrap();
    assert_eq!(outcome.new_state, ProposalState::FacultyCouncilOutlineReview);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_members_submitting_together_do_not_conflict() {
    let h = harness();
    let (proposal, council) = h.in_faculty_review("NCKH-2025-335").await;
    for member in FACULTY_MEMBERS {
        h.prepare(&proposal, member, 4, Conclusion::Pass).await;
    }

    let handles: Vec<_> = FACULTY_MEMBERS
        .iter()
        .map(|member| {
            let service = Arc::clone(&h.service);
            let submit = request(&proposal, reviewer(member), ());
            tokio::spawn(async move { service.submit_evaluation(submit).await })
        })
        .collect();
    for joined in futures::future::join_all(handles).await {
        let outcome = joined.unwrap().unwrap();
        assert!(outcome.evaluation.is_submitted());
    }

    let roster = h
        .service
        .get_all_evaluations(&proposal.id, &reviewer(FACULTY_SECRETARY))
        .await
        .unwrap();
    assert!(roster.all_submitted);
    assert_eq!(roster.submitted_count, 3);

    let stored = h.reload(&proposal).await;
    assert_eq!(stored.holder_user_id.as_deref(), Some(council.secretary_id.as_str()));
    assert_eq!(stored.state, ProposalState::FacultyCouncilOutlineReview);
}

/// Proposal store whose commits stall before reaching the memory store.
struct StalledCommits {
    inner: Arc<MemoryStore>,
    stall: Duration,
}

#[async_trait]
impl ProposalStore for StalledCommits {
    async fn insert(&self, proposal: Proposal) -> Result<(), WorkflowError> {
        ProposalStore::insert(self.inner.as_ref(), proposal).await
    }

    async fn get(&self, id: &str) -> Result<Option<Proposal>, WorkflowError> {
        ProposalStore::get(self.inner.as_ref(), id).await
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        proposal: Proposal,
    ) -> Result<Proposal, WorkflowError> {
        tokio::time::sleep(self.stall).await;
        self.inner.compare_and_swap(expected_version, proposal).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_council_deleted_mid_assignment_never_dangles() {
    let store = Arc::new(MemoryStore::new());
    let repo = Repository {
        proposals: Arc::new(StalledCommits {
            inner: store.clone(),
            stall: Duration::from_millis(200),
        }),
        ..Repository::in_memory(store.clone())
    };
    let h = harness_over(store, repo, NckhFlowConfig::default());
    let proposal = h.draft("NCKH-2025-340").await;
    h.service.submit_proposal(request(&proposal, owner(), ())).await.unwrap();
    let council = h.faculty_council(CouncilType::FacultyOutline).await;

    // the assignment has loaded the council and is parked in its commit
    let service = Arc::clone(&h.service);
    let assign = request(
        &proposal,
        manager(),
        CouncilPayload {
            council_id: council.id.clone(),
        },
    );
    let assigning = tokio::spawn(async move { service.assign_council(assign).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.service.delete_council(&manager(), &council.id).await.unwrap();

    let err = assigning.await.unwrap().unwrap_err();
    assert!(
        matches!(err, WorkflowError::NotFound { entity: "council", .. }),
        "unexpected error {err:?}"
    );

    let stored = h.reload(&proposal).await;
    assert_eq!(stored.state, ProposalState::FacultyCouncilOutlineReview);
    assert_eq!(stored.council_id, None);

    // the proposal is still workable with another council
    let replacement = h.faculty_council(CouncilType::FacultyOutline).await;
    h.service
        .assign_council(request(
            &stored,
            manager(),
            CouncilPayload {
                council_id: replacement.id.clone(),
            },
        ))
        .await
        .unwrap();
    h.evaluate(&h.reload(&proposal).await, "m1", 4, Conclusion::Pass).await;
}
