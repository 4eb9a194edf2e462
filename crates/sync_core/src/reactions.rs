use shared::{
    domain::{MessageId, ReactionId, UserId},
    protocol::Reaction,
};

/// Network steps needed to make the server match an optimistic toggle. Reactions
/// are only ever created or deleted, never updated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactionOp {
    Create { symbol: String },
    Delete { reaction_id: ReactionId },
    Replace { delete: ReactionId, symbol: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TogglePlan {
    pub message_id: MessageId,
    /// Reaction set before the toggle; restored verbatim on any failure.
    pub snapshot: Vec<Reaction>,
    pub optimistic: Vec<Reaction>,
    pub op: ReactionOp,
    /// Placeholder id of the optimistic reaction when the toggle adds one.
    pub sentinel: Option<ReactionId>,
}

/// Computes the post-toggle reaction set for `user_id` synchronously.
///
/// - no prior reaction: add `symbol`
/// - prior reaction with `symbol`: remove it
/// - prior reaction with another symbol: swap it, keeping its position
pub fn plan_toggle(
    message_id: MessageId,
    current: &[Reaction],
    user_id: UserId,
    symbol: &str,
    sentinel: ReactionId,
) -> TogglePlan {
    let snapshot = current.to_vec();
    let optimistic_reaction = Reaction {
        id: sentinel,
        message_id,
        user_id,
        symbol: symbol.to_string(),
    };

    match current.iter().position(|reaction| reaction.user_id == user_id) {
        None => {
            let mut optimistic = snapshot.clone();
            optimistic.push(optimistic_reaction);
            TogglePlan {
                message_id,
                snapshot,
                optimistic,
                op: ReactionOp::Create {
                    symbol: symbol.to_string(),
                },
                sentinel: Some(sentinel),
            }
        }
        Some(i) if current[i].symbol == symbol => {
            let mut optimistic = snapshot.clone();
            let removed = optimistic.remove(i);
            TogglePlan {
                message_id,
                snapshot,
                optimistic,
                op: ReactionOp::Delete {
                    reaction_id: removed.id,
                },
                sentinel: None,
            }
        }
        Some(i) => {
            let mut optimistic = snapshot.clone();
            let previous = std::mem::replace(&mut optimistic[i], optimistic_reaction);
            TogglePlan {
                message_id,
                snapshot,
                optimistic,
                op: ReactionOp::Replace {
                    delete: previous.id,
                    symbol: symbol.to_string(),
                },
                sentinel: Some(sentinel),
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/reactions_tests.rs"]
mod tests;
