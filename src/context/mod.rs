//! Expression graphs and the arena that deduplicates them
//!
//! A [`Context`] interns every distinct operation once and hands out opaque
//! [`Node`] handles.  Expressions are assembled through the builder methods
//! ([`add`](Context::add), [`min`](Context::min), [`sqrt`](Context::sqrt),
//! ...), which fold constant subtrees on the fly, and are compiled for
//! querying by [`Evaluator::new`](crate::eval::Evaluator::new).
mod indexed;
mod op;

use indexed::{define_index, IndexMap, IndexVec};
pub use op::{BinaryOpcode, Op, UnaryOpcode};

use crate::Error;

use std::collections::{BTreeMap, HashMap};

use ordered_float::OrderedFloat;

define_index!(Node, "An index in the `Context::ops` map");
define_index!(VarNode, "An index in the `Context::vars` map");

/// Arena of interned math operations
///
/// Handles returned by the builder methods are only meaningful for the
/// context that produced them, and stay valid until [`Context::clear`]
/// wipes the arena.
#[derive(Clone, Debug, Default)]
pub struct Context {
    ops: IndexMap<Op, Node>,
    vars: IndexMap<Var, VarNode>,
}

/// A `Var` represents an input which can vary during evaluation
///
/// The spatial inputs (X, Y, Z) are pre-defined; everything else is a named
/// free variable.
#[allow(missing_docs)]
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum Var {
    X,
    Y,
    Z,
    Named(String),
}

impl std::fmt::Display for Var {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Var::X => write!(f, "X"),
            Var::Y => write!(f, "Y"),
            Var::Z => write!(f, "Z"),
            Var::Named(s) => write!(f, "{s}"),
        }
    }
}

/// Generates the one-argument builder methods
macro_rules! op_unary_fns {
    ($($name:ident => $op:ident, $doc:literal;)*) => {
        $(
            #[doc = $doc]
            pub fn $name<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
                let a = a.into_node(self)?;
                self.op_unary(a, UnaryOpcode::$op)
            }
        )*
    };
}

impl Context {
    /// Build a new empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Empties the arena, invalidating every outstanding handle
    pub fn clear(&mut self) {
        self.ops.clear();
        self.vars.clear();
    }

    /// Returns the number of interned operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Checks whether the arena holds no operations
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Verifies that the handle belongs to this context
    fn check_node(&self, node: Node) -> Result<(), Error> {
        self.get_op(node).map(|_| ()).ok_or(Error::BadNode)
    }

    /// Looks up an operation by `Node` handle
    pub fn get_op(&self, node: Node) -> Option<&Op> {
        self.ops.get_by_index(node)
    }

    /// Returns the value of a constant node, or `None` for any other kind
    /// of node
    pub fn const_value(&self, n: Node) -> Result<Option<f64>, Error> {
        match self.get_op(n).ok_or(Error::BadNode)? {
            Op::Const(c) => Ok(Some(c.0)),
            _ => Ok(None),
        }
    }

    /// Returns the [`Var`] behind an input or free-variable node, or `None`
    /// for operation and constant nodes
    pub fn var_name(&self, n: Node) -> Result<Option<&Var>, Error> {
        match self.get_op(n).ok_or(Error::BadNode)? {
            Op::Input(v) | Op::Var(v) => self.get_var_by_index(*v).map(Some),
            _ => Ok(None),
        }
    }

    /// Looks up the [`Var`] associated with the given [`VarNode`]
    pub fn get_var_by_index(&self, n: VarNode) -> Result<&Var, Error> {
        self.vars.get_by_index(n).ok_or(Error::BadVar)
    }

    ////////////////////////////////////////////////////////////////////////////
    // Primitives

    fn input(&mut self, v: Var) -> Node {
        let v = self.vars.insert(v);
        self.ops.insert(Op::Input(v))
    }

    /// Constructs or finds the input node for the X axis
    /// ```
    /// # use spool::context::Context;
    /// let mut ctx = Context::new();
    /// let x = ctx.x();
    /// assert_eq!(ctx.eval_xyz(x, 0.5, 0.0, 0.0).unwrap(), 0.5);
    /// ```
    pub fn x(&mut self) -> Node {
        self.input(Var::X)
    }

    /// Constructs or finds the input node for the Y axis
    pub fn y(&mut self) -> Node {
        self.input(Var::Y)
    }

    /// Constructs or finds the input node for the Z axis
    pub fn z(&mut self) -> Node {
        self.input(Var::Z)
    }

    /// Interns the given constant value
    /// ```
    /// # let mut ctx = spool::context::Context::new();
    /// let c = ctx.constant(2.5);
    /// assert_eq!(ctx.eval_xyz(c, 0.0, 0.0, 0.0).unwrap(), 2.5);
    /// ```
    pub fn constant(&mut self, f: f64) -> Node {
        self.ops.insert(Op::Const(OrderedFloat(f)))
    }

    /// Constructs or finds a named free variable
    ///
    /// Free variables hold a value assigned outside of the X/Y/Z coordinate
    /// system; gradients with respect to them are available through
    /// [`Evaluator::gradient`](crate::eval::Evaluator::gradient).
    pub fn var(&mut self, name: &str) -> Node {
        let v = self.vars.insert(Var::Named(name.to_owned()));
        self.ops.insert(Op::Var(v))
    }

    ////////////////////////////////////////////////////////////////////////////
    // Interning helpers

    /// Interns a unary operation, folding a constant operand eagerly
    fn op_unary(&mut self, a: Node, op: UnaryOpcode) -> Result<Node, Error> {
        Ok(match self.const_value(a)? {
            Some(v) => self.constant(op.eval(v)),
            None => self.ops.insert(Op::Unary(op, a)),
        })
    }

    /// Interns a binary operation, folding eagerly when both operands are
    /// constants
    fn op_binary(
        &mut self,
        a: Node,
        b: Node,
        op: BinaryOpcode,
    ) -> Result<Node, Error> {
        Ok(match (self.const_value(a)?, self.const_value(b)?) {
            (Some(va), Some(vb)) => self.constant(op.eval(va, vb)),
            _ => self.ops.insert(Op::Binary(op, a, b)),
        })
    }

    /// Interns a commutative operation with its operands in handle order,
    /// so both argument orders land on the same node
    fn op_binary_sorted(
        &mut self,
        a: Node,
        b: Node,
        op: BinaryOpcode,
    ) -> Result<Node, Error> {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        self.op_binary(lo, hi, op)
    }

    ////////////////////////////////////////////////////////////////////////////
    // Builders

    /// Builds an addition node
    /// ```
    /// # let mut ctx = spool::context::Context::new();
    /// let y = ctx.y();
    /// let out = ctx.add(y, 2.0).unwrap();
    /// assert_eq!(ctx.eval_xyz(out, 0.0, 3.0, 0.0).unwrap(), 5.0);
    /// ```
    pub fn add<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        let b = b.into_node(self)?;
        if a == b {
            return self.mul(a, 2.0);
        }
        if self.const_value(a)? == Some(0.0) {
            return Ok(b);
        }
        if self.const_value(b)? == Some(0.0) {
            return Ok(a);
        }
        self.op_binary_sorted(a, b, BinaryOpcode::Add)
    }

    /// Builds a multiplication node
    pub fn mul<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        let b = b.into_node(self)?;
        if a == b {
            return self.square(a);
        }
        if self.const_value(a)? == Some(1.0) {
            return Ok(b);
        }
        if self.const_value(b)? == Some(1.0) {
            return Ok(a);
        }
        self.op_binary_sorted(a, b, BinaryOpcode::Mul)
    }

    /// Builds a node computing the minimum of its inputs
    /// ```
    /// # let mut ctx = spool::context::Context::new();
    /// let x = ctx.x();
    /// let y = ctx.y();
    /// let out = ctx.min(x, y).unwrap();
    /// assert_eq!(ctx.eval_xyz(out, 2.0, -1.0, 0.0).unwrap(), -1.0);
    /// ```
    pub fn min<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        let b = b.into_node(self)?;
        if a == b {
            Ok(a)
        } else {
            self.op_binary_sorted(a, b, BinaryOpcode::Min)
        }
    }

    /// Builds a node computing the maximum of its inputs
    pub fn max<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        let b = b.into_node(self)?;
        if a == b {
            Ok(a)
        } else {
            self.op_binary_sorted(a, b, BinaryOpcode::Max)
        }
    }

    /// Builds a subtraction node
    pub fn sub<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        let b = b.into_node(self)?;
        if self.const_value(b)? == Some(0.0) {
            return Ok(a);
        }
        if self.const_value(a)? == Some(0.0) {
            return self.neg(b);
        }
        self.op_binary(a, b, BinaryOpcode::Sub)
    }

    /// Builds a division node
    /// ```
    /// # let mut ctx = spool::context::Context::new();
    /// let x = ctx.x();
    /// let y = ctx.y();
    /// let out = ctx.div(x, y).unwrap();
    /// assert_eq!(ctx.eval_xyz(out, 9.0, 4.0, 0.0).unwrap(), 2.25);
    /// ```
    pub fn div<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        let b = b.into_node(self)?;
        // `0 / b` is not rewritten to 0: it must stay NaN-producing for
        // b == 0 or b == NaN
        if self.const_value(b)? == Some(1.0) {
            return Ok(a);
        }
        self.op_binary(a, b, BinaryOpcode::Div)
    }

    /// Builds a node computing `atan2(y, x)`
    /// ```
    /// # let mut ctx = spool::context::Context::new();
    /// let x = ctx.x();
    /// let y = ctx.y();
    /// let out = ctx.atan2(y, x).unwrap();
    /// let v = ctx.eval_xyz(out, 1.0, 1.0, 0.0).unwrap();
    /// assert_eq!(v, std::f64::consts::FRAC_PI_4);
    /// ```
    pub fn atan2<A: IntoNode, B: IntoNode>(
        &mut self,
        y: A,
        x: B,
    ) -> Result<Node, Error> {
        let y = y.into_node(self)?;
        let x = x.into_node(self)?;
        self.op_binary(y, x, BinaryOpcode::Atan2)
    }

    /// Builds a node which raises its input to a constant power
    ///
    /// The exponent is always materialized as a constant node, so the
    /// "constant right operand" precondition of `Pow` holds by construction.
    /// ```
    /// # let mut ctx = spool::context::Context::new();
    /// let x = ctx.x();
    /// let out = ctx.pow(x, 2.0).unwrap();
    /// assert_eq!(ctx.eval_xyz(out, 3.0, 0.0, 0.0).unwrap(), 9.0);
    /// ```
    pub fn pow<A: IntoNode>(&mut self, a: A, exp: f64) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        let b = self.constant(exp);
        self.op_binary(a, b, BinaryOpcode::Pow)
    }

    /// Builds a node which takes a constant root of its input
    /// ```
    /// # let mut ctx = spool::context::Context::new();
    /// let x = ctx.x();
    /// let out = ctx.nth_root(x, 2.0).unwrap();
    /// let v = ctx.eval_xyz(out, 9.0, 0.0, 0.0).unwrap();
    /// assert!((v - 3.0).abs() < 1e-12);
    /// ```
    pub fn nth_root<A: IntoNode>(
        &mut self,
        a: A,
        n: f64,
    ) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        let b = self.constant(n);
        self.op_binary(a, b, BinaryOpcode::NthRoot)
    }

    /// Builds a remainder node
    ///
    /// The result follows the Euclidean convention and always lies in
    /// `[0, |b|)`.
    pub fn modulo<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        let b = b.into_node(self)?;
        self.op_binary(a, b, BinaryOpcode::Mod)
    }

    /// Builds a node substituting its right input wherever the left one
    /// evaluates to NaN
    pub fn nanfill<A: IntoNode, B: IntoNode>(
        &mut self,
        a: A,
        b: B,
    ) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        let b = b.into_node(self)?;
        self.op_binary(a, b, BinaryOpcode::NanFill)
    }

    op_unary_fns! {
        square => Square, "Builds a node which squares its input";
        sqrt => Sqrt, "Builds a node which takes the square root of its input";
        neg => Neg, "Builds a node which negates its input";
        sin => Sin, "Builds a node which takes the sine of its input (radians)";
        cos => Cos, "Builds a node which takes the cosine of its input (radians)";
        tan => Tan, "Builds a node which takes the tangent of its input (radians)";
        asin => Asin, "Builds a node which takes the arcsine of its input";
        acos => Acos, "Builds a node which takes the arccosine of its input";
        atan => Atan, "Builds a node which takes the arctangent of its input";
        exp => Exp, "Builds a node which exponentiates its input";
    }

    /// Builds a node which pins its input against variable-gradient
    /// propagation
    ///
    /// The result is an identity for values, derivatives, and intervals, but
    /// reports a zero Jacobian with respect to every free variable.
    pub fn const_var<A: IntoNode>(&mut self, a: A) -> Result<Node, Error> {
        let a = a.into_node(self)?;
        self.op_unary(a, UnaryOpcode::ConstVar)
    }

    ////////////////////////////////////////////////////////////////////////////
    // Evaluation

    /// Evaluates a node by walking the graph recursively
    ///
    /// Every variable appearing in the expression must be bound in `vars`.
    /// This path exists for spot checks and constant folding; build an
    /// [`Evaluator`](crate::eval::Evaluator) for anything hot.
    pub fn eval(
        &self,
        root: Node,
        vars: &BTreeMap<Var, f64>,
    ) -> Result<f64, Error> {
        let mut cache = vec![None; self.ops.len()].into();
        self.eval_inner(root, vars, &mut cache)
    }

    /// Evaluates a node with only the spatial inputs bound
    pub fn eval_xyz(
        &self,
        root: Node,
        x: f64,
        y: f64,
        z: f64,
    ) -> Result<f64, Error> {
        let mut vars = BTreeMap::new();
        vars.insert(Var::X, x);
        vars.insert(Var::Y, y);
        vars.insert(Var::Z, z);
        self.eval(root, &vars)
    }

    fn eval_inner(
        &self,
        node: Node,
        vars: &BTreeMap<Var, f64>,
        cache: &mut IndexVec<Option<f64>, Node>,
    ) -> Result<f64, Error> {
        if usize::from(node) >= cache.len() {
            return Err(Error::BadNode);
        }
        if let Some(v) = cache[node] {
            return Ok(v);
        }
        let v = match self.get_op(node).ok_or(Error::BadNode)? {
            Op::Input(v) | Op::Var(v) => {
                let name = self.get_var_by_index(*v)?;
                *vars.get(name).ok_or(Error::BadVar)?
            }
            Op::Const(c) => c.0,
            Op::Binary(op, a, b) => {
                let (op, a, b) = (*op, *a, *b);
                let a = self.eval_inner(a, vars, cache)?;
                let b = self.eval_inner(b, vars, cache)?;
                op.eval(a, b)
            }
            Op::Unary(op, a) => {
                let (op, a) = (*op, *a);
                op.eval(self.eval_inner(a, vars, cache)?)
            }
        };
        cache[node] = Some(v);
        Ok(v)
    }

    /// Returns the nodes reachable from `root`, ordered such that every node
    /// appears after all of its children.
    ///
    /// Leaves come first; the root is last.  Ordering is by rank (0 for
    /// leaves, otherwise one more than the deepest child), with ties broken
    /// by node index for determinism.
    pub(crate) fn ordered(&self, root: Node) -> Result<Vec<Node>, Error> {
        enum Visit {
            Down(Node),
            Up(Node),
        }

        let mut rank: HashMap<Node, usize> = HashMap::new();
        let mut todo = vec![Visit::Down(root)];
        while let Some(v) = todo.pop() {
            match v {
                Visit::Down(n) => {
                    if rank.contains_key(&n) {
                        continue;
                    }
                    let op = self.get_op(n).ok_or(Error::BadNode)?;
                    match op {
                        Op::Const(..) | Op::Input(..) | Op::Var(..) => {
                            rank.insert(n, 0);
                        }
                        _ => {
                            todo.push(Visit::Up(n));
                            for c in op.iter_children() {
                                if !rank.contains_key(&c) {
                                    todo.push(Visit::Down(c));
                                }
                            }
                        }
                    }
                }
                Visit::Up(n) => {
                    let op = self.get_op(n).unwrap();
                    let r = op
                        .iter_children()
                        .map(|c| rank[&c])
                        .max()
                        .unwrap();
                    rank.insert(n, r + 1);
                }
            }
        }

        let mut out: Vec<Node> = rank.keys().copied().collect();
        out.sort_by_key(|n| (rank[n], usize::from(*n)));
        Ok(out)
    }
}

////////////////////////////////////////////////////////////////////////////////
/// Conversion into a [`Node`] within some [`Context`]
///
/// Floats convert by interning a constant, so builder calls can mix handles
/// and literals:
/// ```
/// # let mut ctx = spool::context::Context::new();
/// let x = ctx.x();
/// let halved = ctx.div(x, 2.0).unwrap();
/// assert_eq!(ctx.eval_xyz(halved, 3.0, 0.0, 0.0).unwrap(), 1.5);
/// ```
pub trait IntoNode {
    /// Converts the given value into a node
    fn into_node(self, ctx: &mut Context) -> Result<Node, Error>;
}

impl IntoNode for Node {
    fn into_node(self, ctx: &mut Context) -> Result<Node, Error> {
        ctx.check_node(self)?;
        Ok(self)
    }
}

impl IntoNode for f32 {
    fn into_node(self, ctx: &mut Context) -> Result<Node, Error> {
        Ok(ctx.constant(self as f64))
    }
}

impl IntoNode for f64 {
    fn into_node(self, ctx: &mut Context) -> Result<Node, Error> {
        Ok(ctx.constant(self))
    }
}

////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_constant_folding() {
        let mut ctx = Context::new();
        let a = ctx.constant(9.0);
        let b = ctx.constant(3.0);
        let q = ctx.div(a, b).unwrap();
        assert_eq!(ctx.const_value(q).unwrap(), Some(3.0));
        let r = ctx.sqrt(a).unwrap();
        assert_eq!(ctx.const_value(r).unwrap(), Some(3.0));

        // Folded results dedup against existing constants
        assert_eq!(q, b);
        assert_eq!(r, b);
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn test_identity_folds() {
        let mut ctx = Context::new();
        let x = ctx.x();
        assert_eq!(ctx.add(x, 0.0).unwrap(), x);
        assert_eq!(ctx.mul(x, 1.0).unwrap(), x);
        assert_eq!(ctx.div(x, 1.0).unwrap(), x);
        assert_eq!(ctx.sub(x, 0.0).unwrap(), x);
        assert_eq!(ctx.min(x, x).unwrap(), x);
        assert_eq!(ctx.max(x, x).unwrap(), x);
    }

    #[test]
    fn test_zero_over_expr_is_not_folded() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let q = ctx.div(0.0, x).unwrap();
        // 0 / x is NaN at x == 0, so it must stay an operation node
        assert_eq!(ctx.const_value(q).unwrap(), None);
        assert!(ctx.eval_xyz(q, 0.0, 0.0, 0.0).unwrap().is_nan());
        assert_eq!(ctx.eval_xyz(q, 2.0, 0.0, 0.0).unwrap(), 0.0);
    }

    #[test]
    fn test_commutative_dedup() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let ab = ctx.add(x, y).unwrap();
        let ba = ctx.add(y, x).unwrap();
        assert_eq!(ab, ba);

        let m1 = ctx.min(x, y).unwrap();
        let m2 = ctx.min(y, x).unwrap();
        assert_eq!(m1, m2);
    }

    #[test]
    fn test_clear() {
        let mut ctx = Context::new();
        let x = ctx.x();
        ctx.clear();
        assert!(ctx.is_empty());
        assert!(ctx.eval_xyz(x, 1.0, 0.0, 0.0).is_err());
    }

    #[test]
    fn test_eval() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let v = ctx.add(x, y).unwrap();

        assert_eq!(ctx.eval_xyz(v, 2.0, 3.0, 0.0).unwrap(), 5.0);

        let a = ctx.var("a");
        let v = ctx.mul(v, a).unwrap();
        assert_eq!(
            ctx.eval(
                v,
                &[
                    (Var::X, 2.0),
                    (Var::Y, 3.0),
                    (Var::Named("a".to_owned()), 2.0)
                ]
                .into_iter()
                .collect()
            )
            .unwrap(),
            10.0
        );
    }

    #[test]
    fn test_ordered() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let x2 = ctx.square(x).unwrap();
        let y2 = ctx.square(y).unwrap();
        let sum = ctx.add(x2, y2).unwrap();

        let flat = ctx.ordered(sum).unwrap();
        assert_eq!(flat.len(), 5);
        assert_eq!(*flat.last().unwrap(), sum);

        let pos = |n: Node| flat.iter().position(|&m| m == n).unwrap();
        assert!(pos(x) < pos(x2));
        assert!(pos(y) < pos(y2));
        assert!(pos(x2) < pos(sum));
        assert!(pos(y2) < pos(sum));
    }

    #[test]
    fn test_var_dedup() {
        let mut ctx = Context::new();
        let a1 = ctx.var("a");
        let a2 = ctx.var("a");
        assert_eq!(a1, a2);
        let b = ctx.var("b");
        assert_ne!(a1, b);

        let x = ctx.x();
        assert_eq!(ctx.var_name(x).unwrap(), Some(&Var::X));
        assert_eq!(
            ctx.var_name(b).unwrap(),
            Some(&Var::Named("b".to_owned()))
        );
    }

    #[test]
    fn test_pow_rhs_is_const() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let p = ctx.pow(x, 2.5).unwrap();
        let Some(Op::Binary(BinaryOpcode::Pow, _, b)) = ctx.get_op(p) else {
            panic!("expected pow node");
        };
        assert_eq!(ctx.const_value(*b).unwrap(), Some(2.5));
    }
}
