//! State names and rule scopes.
//!
//! States are plain names. Every definition contains the two pseudo-states
//! below; workflow authors declare the rest.
//!
//! ```text
//! Initial ──► (declared states ...) ──► Final
//! ```

/// Pseudo-state of an instance that has just been created.
pub const INITIAL: &str = "Initial";

/// Pseudo-state of a finalized instance.
pub const FINAL: &str = "Final";

/// Where a rule applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Scope {
    /// While the instance is in the named state. `During(INITIAL)` is
    /// what workflow authors call "Initially".
    During(&'static str),

    /// In every state except the pseudo-states.
    Any,
}

impl Scope {
    /// Scopes whose rules apply to an instance in `state`, most specific first.
    pub(crate) fn applicable(state: &'static str) -> Vec<Scope> {
        if state == FINAL {
            Vec::new()
        } else if state == INITIAL {
            vec![Scope::During(INITIAL)]
        } else {
            vec![Scope::During(state), Scope::Any]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_excludes_during_any() {
        assert_eq!(Scope::applicable(INITIAL), vec![Scope::During(INITIAL)]);
    }

    #[test]
    fn final_has_no_rules() {
        assert!(Scope::applicable(FINAL).is_empty());
    }

    #[test]
    fn declared_state_includes_during_any() {
        assert_eq!(
            Scope::applicable("Reserved"),
            vec![Scope::During("Reserved"), Scope::Any]
        );
    }
}
