//! Shared setup for the integration tests: a service over an in-memory store,
//! a small faculty directory and the usual cast of actors.

#![allow(dead_code)]

use std::sync::Arc;

use nckh_flow::domain::{ActionRequest, Conclusion, CouncilSpec, CouncilType, EvaluationPatch};
use nckh_flow::domain::{EvaluationSection, FinalizePayload};
use nckh_flow::{
    Actor, ChannelEffectSink, Council, Effect, MemoryStore, NckhFlowConfig, NewProposal,
    Proposal, Repository, StaticFacultyDirectory, UserRole, WorkflowService,
};
use tokio::sync::mpsc::UnboundedReceiver;

pub const FACULTY: &str = "CNTT";

pub fn owner() -> Actor {
    Actor::new("gv01", UserRole::GiangVien).with_faculty(FACULTY)
}

pub fn other_lecturer() -> Actor {
    Actor::new("gv02", UserRole::GiangVien).with_faculty(FACULTY)
}

pub fn manager() -> Actor {
    Actor::new("qlk01", UserRole::QuanLyKhoa).with_faculty(FACULTY)
}

pub fn office() -> Actor {
    Actor::new("khcn01", UserRole::PhongKhcn)
}

pub fn board() -> Actor {
    Actor::new("bgh01", UserRole::BanGiamHoc)
}

pub fn reviewer(id: &str) -> Actor {
    Actor::new(id, UserRole::HoiDong)
}

/// Faculty council: secretary `tk` plus voting members m1..m3.
pub const FACULTY_SECRETARY: &str = "tk";
pub const FACULTY_MEMBERS: [&str; 3] = ["m1", "m2", "m3"];

/// School council: secretary `stk` plus voting members s1..s3.
pub const SCHOOL_SECRETARY: &str = "stk";
pub const SCHOOL_MEMBERS: [&str; 3] = ["s1", "s2", "s3"];

pub fn directory() -> StaticFacultyDirectory {
    let mut directory = StaticFacultyDirectory::new()
        .with_member("gv01", FACULTY)
        .with_member("gv02", FACULTY)
        .with_member(FACULTY_SECRETARY, FACULTY)
        .with_member("m4", FACULTY)
        .with_member("m5", FACULTY)
        .with_member("outsider", "KT")
        .with_member(SCHOOL_SECRETARY, "KHCN");
    for member in FACULTY_MEMBERS {
        directory = directory.with_member(member, FACULTY);
    }
    for member in SCHOOL_MEMBERS {
        directory = directory.with_member(member, "KHCN");
    }
    directory
}

pub struct Harness {
    pub service: Arc<WorkflowService>,
    pub store: Arc<MemoryStore>,
    pub effects: UnboundedReceiver<Effect>,
}

pub fn harness() -> Harness {
    harness_with_config(NckhFlowConfig::default())
}

pub fn harness_with_config(config: NckhFlowConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let repo = Repository::in_memory(store.clone());
    harness_over(store, repo, config)
}

/// Service over `repo`; `store` is the memory store behind it, kept for direct inspection.
pub fn harness_over(store: Arc<MemoryStore>, repo: Repository, config: NckhFlowConfig) -> Harness {
    let (sink, effects) = ChannelEffectSink::new();
    let service = WorkflowService::new(repo, Arc::new(directory()), &config)
        .with_effect_sink(Arc::new(sink));
    Harness {
        service: Arc::new(service),
        store,
        effects,
    }
}

pub fn request<P>(proposal: &Proposal, actor: Actor, payload: P) -> ActionRequest<P> {
    ActionRequest::new(proposal.id.clone(), actor, payload)
}

impl Harness {
    pub fn drain_effects(&mut self) -> Vec<Effect> {
        let mut drained = Vec::new();
        while let Ok(effect) = self.effects.try_recv() {
            drained.push(effect);
        }
        drained
    }

    pub async fn draft(&self, code: &str) -> Proposal {
        self.service
            .create_proposal(
                &owner(),
                NewProposal {
                    code: code.to_string(),
                    title: "Edge inference for campus sensors".to_string(),
                    faculty_id: FACULTY.to_string(),
                    form_data: serde_json::json!({"budget": 120, "duration_months": 12}),
                },
            )
            .await
            .unwrap()
    }

    pub async fn faculty_council(&self, council_type: CouncilType) -> Council {
        self.service
            .create_council(
                &manager(),
                CouncilSpec {
                    name: format!("Hoi dong khoa {council_type}"),
                    council_type,
                    faculty_id: Some(FACULTY.to_string()),
                    secretary_id: FACULTY_SECRETARY.to_string(),
                    chair_id: Some("m1".to_string()),
                    member_ids: FACULTY_MEMBERS.iter().map(|m| m.to_string()).collect(),
                },
            )
            .await
            .unwrap()
    }

    pub async fn school_council(&self, council_type: CouncilType) -> Council {
        self.service
            .create_council(
                &office(),
                CouncilSpec {
                    name: format!("Hoi dong truong {council_type}"),
                    council_type,
                    faculty_id: None,
                    secretary_id: SCHOOL_SECRETARY.to_string(),
                    chair_id: None,
                    member_ids: SCHOOL_MEMBERS.iter().map(|m| m.to_string()).collect(),
                },
            )
            .await
            .unwrap()
    }

    pub async fn reload(&self, proposal: &Proposal) -> Proposal {
        self.service.get_proposal(&proposal.id).await.unwrap()
    }

    /// DRAFT submitted into faculty outline review with a faculty council assigned.
    pub async fn in_faculty_review(&self, code: &str) -> (Proposal, Council) {
        let proposal = self.draft(code).await;
        self.service
            .submit_proposal(request(&proposal, owner(), ()))
            .await
            .unwrap();
        let council = self.faculty_council(CouncilType::FacultyOutline).await;
        self.service
            .assign_council(request(
                &proposal,
                manager(),
                nckh_flow::domain::CouncilPayload {
                    council_id: council.id.clone(),
                },
            ))
            .await
            .unwrap();
        (self.reload(&proposal).await, council)
    }

    /// Every voting member opens, scores and submits with `conclusion`.
    pub async fn evaluate_all(&self, proposal: &Proposal, members: &[&str], score: u8, conclusion: Conclusion) {
        for member in members {
            self.evaluate(proposal, member, score, conclusion).await;
        }
    }

    pub async fn evaluate(&self, proposal: &Proposal, member: &str, score: u8, conclusion: Conclusion) {
        self.prepare(proposal, member, score, conclusion).await;
        self.service
            .submit_evaluation(request(proposal, reviewer(member), ()))
            .await
            .unwrap();
    }

    /// Opens and fills `member`'s draft without submitting it.
    pub async fn prepare(&self, proposal: &Proposal, member: &str, score: u8, conclusion: Conclusion) {
        self.service
            .get_or_create_evaluation(request(proposal, reviewer(member), ()))
            .await
            .unwrap();
        let patch = EvaluationSection::ALL
            .into_iter()
            .fold(EvaluationPatch::default(), |patch, section| {
                patch.with_score(section, score)
            })
            .with_conclusion(conclusion);
        self.service
            .update_evaluation_draft(request(proposal, reviewer(member), patch))
            .await
            .unwrap();
    }

    pub async fn finalize(&self, proposal: &Proposal, secretary: &str, conclusion: Conclusion, comments: &str) -> nckh_flow::ActionOutcome {
        self.service
            .finalize_council_evaluation(request(
                proposal,
                reviewer(secretary),
                FinalizePayload::new(conclusion, comments),
            ))
            .await
            .unwrap()
    }
}
