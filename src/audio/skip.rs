use serenity::model::id::{MessageId, UserId};
use std::collections::HashSet;

/// Umbral de votos configurado por servidor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkipRules {
    pub skips_required: usize,
    pub skip_ratio_required: f64,
}

impl SkipRules {
    pub fn new(skips_required: usize, skip_ratio_required: f64) -> Self {
        Self {
            skips_required,
            skip_ratio_required,
        }
    }

    /// Votes needed with `listeners` eligible members in the channel:
    /// `min(skips_required, ceil(ratio * listeners))`, never below one.
    pub fn votes_needed(&self, listeners: usize) -> usize {
        let listeners = listeners.max(1) as f64;
        let by_ratio = (self.skip_ratio_required * listeners).ceil().max(0.0) as usize;
        self.skips_required.min(by_ratio).max(1)
    }
}

impl Default for SkipRules {
    fn default() -> Self {
        Self::new(4, 0.5)
    }
}

/// Votos para la entrada actual. Se reinicia en cada `play`.
#[derive(Debug, Default)]
pub struct SkipState {
    voters: HashSet<UserId>,
    messages: Vec<MessageId>,
    epoch: u64,
}

impl SkipState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra el voto y devuelve el total. Votar dos veces no suma.
    pub fn add_skipper(&mut self, voter: UserId, message: Option<MessageId>) -> usize {
        if self.voters.insert(voter) {
            if let Some(message) = message {
                self.messages.push(message);
            }
        }
        self.voters.len()
    }

    pub fn reset(&mut self) {
        self.voters.clear();
        self.messages.clear();
        self.epoch += 1;
    }

    pub fn count(&self) -> usize {
        self.voters.len()
    }

    pub fn has_voted(&self, voter: UserId) -> bool {
        self.voters.contains(&voter)
    }

    /// Messages that carried a vote, so the chat layer can clean them up.
    pub fn messages(&self) -> &[MessageId] {
        &self.messages
    }

    /// Number of resets so far; one per started entry.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_votes_needed_takes_the_smaller_bound() {
        let rules = SkipRules::new(4, 0.5);
        assert_eq!(rules.votes_needed(1), 1);
        assert_eq!(rules.votes_needed(3), 2);
        assert_eq!(rules.votes_needed(7), 4);
        assert_eq!(rules.votes_needed(20), 4);
        // Canal vacío cuenta como un oyente
        assert_eq!(rules.votes_needed(0), 1);
    }

    #[test]
    fn test_repeated_votes_do_not_double_count() {
        let mut state = SkipState::new();
        let alice = UserId::new(10);

        assert_eq!(state.add_skipper(alice, Some(MessageId::new(1))), 1);
        assert_eq!(state.add_skipper(alice, Some(MessageId::new(2))), 1);
        assert_eq!(state.messages(), &[MessageId::new(1)]);

        assert_eq!(state.add_skipper(UserId::new(11), None), 2);
    }

    #[test]
    fn test_reset_voids_previous_votes() {
        let mut state = SkipState::new();
        state.add_skipper(UserId::new(10), None);
        state.reset();

        assert_eq!(state.count(), 0);
        assert!(!state.has_voted(UserId::new(10)));
        assert_eq!(state.epoch(), 1);
    }
}
