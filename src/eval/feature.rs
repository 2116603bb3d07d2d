use crate::eval::ClauseId;
use nalgebra::Vector3;
use std::collections::BTreeMap;

/// A single branch resolution at an ambiguous `Min`/`Max` clause
///
/// `choice` is 0 to select the left-hand operand and 1 to select the
/// right-hand operand.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Choice {
    pub id: ClauseId,
    pub choice: u8,
}

/// A locally-selected branch assignment through every ambiguous `Min`/`Max`
/// clause at a point, together with the resulting one-sided gradient
///
/// Each non-degenerate choice carries a normalized ε-direction: moving the
/// sample point along it makes that branch the unambiguous winner.  The
/// feature is feasible only while the intersection of the half-spaces
/// induced by its ε-directions is non-empty, which
/// [`Feature::is_compatible`] checks one candidate direction at a time.
///
/// Two features are considered the same if their choice lists are equal;
/// ε-directions do not participate in deduplication.
#[derive(Clone, Debug)]
pub struct Feature {
    /// One-sided gradient, filled in once the feature is fully resolved
    pub deriv: Vector3<f64>,
    choices: Vec<Choice>,
    epsilons: BTreeMap<ClauseId, Vector3<f64>>,
}

impl Default for Feature {
    fn default() -> Self {
        Self {
            deriv: Vector3::zeros(),
            choices: vec![],
            epsilons: BTreeMap::new(),
        }
    }
}

impl Feature {
    /// Builds an empty feature carrying over a previous gradient
    pub(crate) fn with_deriv(deriv: Vector3<f64>) -> Self {
        Self {
            deriv,
            ..Self::default()
        }
    }

    /// Returns the ordered list of branch resolutions taken so far
    pub fn choices(&self) -> &[Choice] {
        &self.choices
    }

    /// Checks whether a direction lies in the intersection of the
    /// half-spaces induced by this feature's recorded ε-directions
    ///
    /// Degenerate (zero) directions are always rejected.
    pub fn is_compatible(&self, e: Vector3<f64>) -> bool {
        let norm = e.norm();
        if norm == 0.0 {
            return false;
        }
        let e = e / norm;
        self.epsilons.values().all(|prior| e.dot(prior) >= 0.0)
    }

    /// Attempts to extend the feature with an ε-carrying choice
    ///
    /// Returns `false` (leaving the feature unchanged) if the direction is
    /// degenerate or falls outside the feasible half-space intersection.
    pub(crate) fn push(
        &mut self,
        epsilon: Vector3<f64>,
        choice: Choice,
    ) -> bool {
        if self.is_compatible(epsilon) {
            self.push_raw(choice, epsilon / epsilon.norm());
            true
        } else {
            false
        }
    }

    /// Extends the feature with a choice that has no ε-direction
    /// (a degenerate clause whose operands are the same slot)
    pub(crate) fn push_choice(&mut self, choice: Choice) {
        // The choice list stays sorted by clause id, which is the order in
        // which a forward tape walk encounters the clauses; the pruner
        // consumes choices sequentially during that walk, while discovery
        // happens deepest-first.
        let pos = self.choices.partition_point(|c| c.id < choice.id);
        self.choices.insert(pos, choice);
    }

    /// Records a choice and its (already normalized) ε-direction without a
    /// feasibility check, used when replaying a previously validated feature
    pub(crate) fn push_raw(&mut self, choice: Choice, epsilon: Vector3<f64>) {
        self.epsilons.insert(choice.id, epsilon);
        self.push_choice(choice);
    }

    /// Looks up the stored ε-direction for the given clause, if any
    pub(crate) fn epsilon(&self, id: ClauseId) -> Option<Vector3<f64>> {
        self.epsilons.get(&id).copied()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_compatibility() {
        let mut f = Feature::default();
        assert!(f.is_compatible(Vector3::new(1.0, 0.0, 0.0)));
        assert!(!f.is_compatible(Vector3::zeros()));

        assert!(f.push(Vector3::new(1.0, 0.0, 0.0), Choice { id: 1, choice: 0 }));

        // Anything in the +X half-space stays feasible
        assert!(f.is_compatible(Vector3::new(1.0, 1.0, 0.0)));
        assert!(f.is_compatible(Vector3::new(0.0, 1.0, 0.0)));
        assert!(!f.is_compatible(Vector3::new(-1.0, 0.5, 0.0)));

        // An opposite-facing direction cannot be pushed
        let mut g = f.clone();
        assert!(!g.push(
            Vector3::new(-1.0, 0.0, 0.0),
            Choice { id: 2, choice: 1 }
        ));
        assert_eq!(g.choices().len(), 1);
    }

    #[test]
    fn test_dedup_key_ignores_epsilon() {
        let mut a = Feature::default();
        let mut b = Feature::default();
        a.push(Vector3::new(1.0, 0.0, 0.0), Choice { id: 3, choice: 0 });
        b.push(Vector3::new(0.0, 1.0, 0.0), Choice { id: 3, choice: 0 });
        assert_eq!(a.choices(), b.choices());
    }
}
