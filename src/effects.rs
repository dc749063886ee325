//! Post-commit side effects.
//!
//! The core never renders documents or sends notifications itself. Each committed
//! action returns the effects it produced and hands them to an [`EffectSink`],
//! which external collaborators drain at their own pace. Delivery is
//! fire-and-forget: a sink failure is logged and never undoes the commit.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::{ActionType, Conclusion, HolderUnit, ProposalState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Recipient {
    User(String),
    Unit(HolderUnit),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Effect {
    Transitioned {
        proposal_id: String,
        action: ActionType,
        from: ProposalState,
        to: ProposalState,
    },
    ReturnLogged {
        proposal_id: String,
        returned_from: ProposalState,
        reason: String,
    },
    CouncilAssigned {
        proposal_id: String,
        council_id: String,
        cycle: u32,
    },
    EvaluationsSuperseded {
        proposal_id: String,
        council_id: String,
        cycle: u32,
    },
    EvaluationOpened {
        proposal_id: String,
        evaluator_id: String,
        cycle: u32,
    },
    EvaluationSubmitted {
        proposal_id: String,
        evaluator_id: String,
        submitted_count: usize,
        total_members: usize,
    },
    CouncilFinalized {
        proposal_id: String,
        council_id: String,
        cycle: u32,
        conclusion: Conclusion,
    },
    Notify {
        proposal_id: String,
        recipient: Recipient,
        subject: String,
    },
    RenderDocument {
        proposal_id: String,
        template: String,
    },
}

impl Effect {
    pub fn proposal_id(&self) -> &str {
        match self {
            Effect::Transitioned { proposal_id, .. }
            | Effect::ReturnLogged { proposal_id, .. }
            | Effect::CouncilAssigned { proposal_id, .. }
            | Effect::EvaluationsSuperseded { proposal_id, .. }
            | Effect::EvaluationOpened { proposal_id, .. }
            | Effect::EvaluationSubmitted { proposal_id, .. }
            | Effect::CouncilFinalized { proposal_id, .. }
            | Effect::Notify { proposal_id, .. }
            | Effect::RenderDocument { proposal_id, .. } => proposal_id,
        }
    }
}

/// Consumer of committed effects.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait EffectSink: Send + Sync {
    fn dispatch(&self, effects: &[Effect]);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEffectSink;

impl EffectSink for NoopEffectSink {
    fn dispatch(&self, effects: &[Effect]) {
        debug!(count = effects.len(), "Discarding workflow effects");
    }
}

/// Forwards effects to an unbounded channel drained by an external worker.
#[derive(Debug, Clone)]
pub struct ChannelEffectSink {
    sender: mpsc::UnboundedSender<Effect>,
}

impl ChannelEffectSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Effect>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EffectSink for ChannelEffectSink {
    fn dispatch(&self, effects: &[Effect]) {
        for effect in effects {
            if self.sender.send(effect.clone()).is_err() {
                warn!(
                    proposal_id = %effect.proposal_id(),
                    "Effect receiver dropped; remaining effects discarded"
                );
                return;
            }
        }
    }
}
