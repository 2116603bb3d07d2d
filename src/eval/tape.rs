use crate::{eval::Opcode, types::Interval};
use nalgebra::Vector3;

/// Index of a clause's output slot in the [`Results`](crate::eval::Results)
/// store
///
/// Slot 0 is reserved as the null sentinel: it marks "no remap" in the
/// pruner's scratch array and fills the unused operand of unary clauses.
pub type ClauseId = u32;

/// A single instruction in a flattened evaluation tape
///
/// Unary operations ignore `b`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Clause {
    pub op: Opcode,
    pub id: ClauseId,
    pub a: ClauseId,
    pub b: ClauseId,
}

/// How a tape on the stack was produced
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TapeType {
    /// The unpruned tape built from the expression graph
    Base,
    /// Pruned by interval dominance; carries the validating region
    Interval,
    /// Pruned by a feature's branch choices
    Feature,
    /// Pruned by scalar dominance at a single point
    Specialized,
}

/// A flat, linear program representing an expression graph
///
/// Clauses are stored root-first (ascending output ids from the front), and
/// every interpreter walks the tape back to front so that operand slots are
/// written before their users.
#[derive(Clone, Debug)]
pub struct Tape {
    /// Instructions, ordered root-first
    pub(crate) ops: Vec<Clause>,
    /// Slot holding the final answer after a full walk
    pub(crate) root: ClauseId,
    pub(crate) kind: TapeType,
    /// X/Y/Z region for which an [`TapeType::Interval`] pruning is valid
    pub(crate) bounds: Option<[Interval; 3]>,
}

impl Tape {
    pub(crate) fn with_capacity(n: usize) -> Self {
        Self {
            ops: Vec::with_capacity(n),
            root: 0,
            kind: TapeType::Base,
            bounds: None,
        }
    }

    /// Returns the number of clauses in the tape
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Checks whether the tape is empty
    ///
    /// This is only true for an expression with a leaf root, which evaluates
    /// through its pre-filled slot without any clauses.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Returns how this tape was produced
    pub fn kind(&self) -> TapeType {
        self.kind
    }

    /// Checks whether the validating region contains the given point
    ///
    /// Always false for tapes without a recorded region.
    pub(crate) fn contains(&self, p: Vector3<f32>) -> bool {
        match &self.bounds {
            Some([x, y, z]) => {
                x.contains(p.x) && y.contains(p.y) && z.contains(p.z)
            }
            None => false,
        }
    }
}
