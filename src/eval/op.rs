use crate::context::{BinaryOpcode, UnaryOpcode};

/// Opcode for a single clause in a flattened evaluation tape
///
/// This is a closed enumeration: every interpreter must handle every opcode
/// in its dispatch match.  The leaf opcodes (`Const`, `Var`, `VarX`, `VarY`,
/// `VarZ`) never appear in a tape; their values live in
/// [`Results`](crate::eval::Results) slots referenced by other clauses, and
/// hitting one during interpretation is a structural bug.
#[allow(missing_docs)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Opcode {
    // Leaves
    Const,
    Var,
    VarX,
    VarY,
    VarZ,

    // Binary operations
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    Atan2,
    Pow,
    NthRoot,
    Mod,
    NanFill,

    // Unary operations
    Square,
    Sqrt,
    Neg,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Exp,
    ConstVar,
}

impl From<BinaryOpcode> for Opcode {
    fn from(op: BinaryOpcode) -> Self {
        match op {
            BinaryOpcode::Add => Opcode::Add,
            BinaryOpcode::Sub => Opcode::Sub,
            BinaryOpcode::Mul => Opcode::Mul,
            BinaryOpcode::Div => Opcode::Div,
            BinaryOpcode::Min => Opcode::Min,
            BinaryOpcode::Max => Opcode::Max,
            BinaryOpcode::Atan2 => Opcode::Atan2,
            BinaryOpcode::Pow => Opcode::Pow,
            BinaryOpcode::NthRoot => Opcode::NthRoot,
            BinaryOpcode::Mod => Opcode::Mod,
            BinaryOpcode::NanFill => Opcode::NanFill,
        }
    }
}

impl From<UnaryOpcode> for Opcode {
    fn from(op: UnaryOpcode) -> Self {
        match op {
            UnaryOpcode::Square => Opcode::Square,
            UnaryOpcode::Sqrt => Opcode::Sqrt,
            UnaryOpcode::Neg => Opcode::Neg,
            UnaryOpcode::Sin => Opcode::Sin,
            UnaryOpcode::Cos => Opcode::Cos,
            UnaryOpcode::Tan => Opcode::Tan,
            UnaryOpcode::Asin => Opcode::Asin,
            UnaryOpcode::Acos => Opcode::Acos,
            UnaryOpcode::Atan => Opcode::Atan,
            UnaryOpcode::Exp => Opcode::Exp,
            UnaryOpcode::ConstVar => Opcode::ConstVar,
        }
    }
}
