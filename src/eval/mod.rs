//! Tape construction, specialization, and interpretation
//!
//! The [`Evaluator`] flattens an expression graph into a linear tape once,
//! then answers point, interval, derivative, and Jacobian queries against
//! the top of a stack of progressively specialized tapes:
//!
//! ```
//! use spool::{context::Context, eval::Evaluator};
//! use nalgebra::Vector3;
//! use std::collections::BTreeMap;
//!
//! let mut ctx = Context::new();
//! let x = ctx.x();
//! let y = ctx.y();
//! let out = ctx.min(x, y)?;
//!
//! let mut eval = Evaluator::new(&ctx, out, &BTreeMap::new())?;
//!
//! // Inside a region where X is decisively smaller, pushing prunes the
//! // tape down to the X branch alone; popping restores it.
//! let i = eval.eval_region(
//!     Vector3::new(-3.0, 1.0, 0.0),
//!     Vector3::new(-2.0, 2.0, 0.0),
//! );
//! assert_eq!((i.lower(), i.upper()), (-3.0, -2.0));
//! eval.push();
//! assert_eq!(eval.eval(Vector3::new(-2.5, 1.5, 0.0)), -2.5);
//! assert!(eval.utilization() < 1.0);
//! eval.pop();
//! # Ok::<(), spool::Error>(())
//! ```
mod bimap;
mod feature;
mod op;
mod result;
mod tape;

pub use feature::{Choice, Feature};
pub use op::Opcode;
pub use result::{Results, SAMPLES};
pub use tape::{Clause, ClauseId, Tape, TapeType};

use bimap::Bimap;

use crate::{
    context::{BinaryOpcode, Context, Node, Op, Var},
    types::Interval,
    Error,
};

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use nalgebra::Vector3;

/// Root value and derivative rows returned by [`Evaluator::derivs`]
pub struct Derivs<'a> {
    pub v: &'a [f32],
    pub dx: &'a [f32],
    pub dy: &'a [f32],
    pub dz: &'a [f32],
}

/// Tape-based evaluator for a single expression graph
///
/// The evaluator owns a stack of tapes; the bottom tape is the full
/// flattened program and `push`/`specialize`/`pop` move a cursor up and
/// down through progressively pruned copies.  Tape storage is allocated
/// lazily per stack depth and retained forever, so a matched
/// `push`/`pop` sequence does not reallocate.
///
/// An evaluator is single-threaded; clone it for use from other threads.
#[derive(Clone, Debug)]
pub struct Evaluator {
    tapes: Vec<Tape>,
    /// Cursor into `tapes`; never moves below 0 (the base tape)
    tape: usize,

    result: Results,

    /// Pruning scratch, sized to the slot count
    disabled: Vec<bool>,
    remap: Vec<ClauseId>,

    /// Free-variable mapping, ordered by clause id
    vars: Bimap<ClauseId, Node>,

    /// Slots for the spatial inputs
    x: ClauseId,
    y: ClauseId,
    z: ClauseId,
}

impl Evaluator {
    /// Flattens the given root into a tape and prepares evaluation storage
    ///
    /// `vars` must provide an initial value for every free variable in the
    /// expression; a missing value, or a `Pow`/`NthRoot` node whose right
    /// operand is not a constant, fails with [`Error::MalformedTree`].
    pub fn new(
        ctx: &Context,
        root: Node,
        vars: &BTreeMap<Node, f32>,
    ) -> Result<Self, Error> {
        let flat = ctx.ordered(root)?;

        // Clause ids are assigned in decreasing order over the flattened
        // (operands-first) node list, so the root lands on id 1 and every
        // operand carries a larger id than its users.  Id 0 is the null
        // sentinel.
        let mut clauses: HashMap<Node, ClauseId> = HashMap::new();
        let mut id = flat.len() as ClauseId;

        let mut ops = Vec::with_capacity(flat.len());
        let mut constants: Vec<(ClauseId, f32)> = vec![];
        let mut var_map: Bimap<ClauseId, Node> = Bimap::new();
        let (mut x, mut y, mut z): (ClauseId, ClauseId, ClauseId) = (0, 0, 0);

        for &n in &flat {
            let op = ctx.get_op(n).ok_or(Error::BadNode)?;
            match *op {
                Op::Binary(bop, a, b) => {
                    if matches!(bop, BinaryOpcode::Pow | BinaryOpcode::NthRoot)
                        && ctx.const_value(b)?.is_none()
                    {
                        return Err(Error::MalformedTree(
                            "the right operand of a power must be a constant",
                        ));
                    }
                    let ca = *clauses
                        .get(&a)
                        .ok_or(Error::MalformedTree("unknown child id"))?;
                    let cb = *clauses
                        .get(&b)
                        .ok_or(Error::MalformedTree("unknown child id"))?;
                    ops.push(Clause {
                        op: bop.into(),
                        id,
                        a: ca,
                        b: cb,
                    });
                }
                Op::Unary(uop, a) => {
                    let ca = *clauses
                        .get(&a)
                        .ok_or(Error::MalformedTree("unknown child id"))?;
                    ops.push(Clause {
                        op: uop.into(),
                        id,
                        a: ca,
                        b: 0,
                    });
                }
                Op::Const(c) => constants.push((id, c.0 as f32)),
                Op::Var(_) => {
                    let v = *vars.get(&n).ok_or(Error::MalformedTree(
                        "missing value for free variable",
                    ))?;
                    constants.push((id, v));
                    var_map.insert(id, n);
                }
                Op::Input(v) => {
                    match ctx.get_var_by_index(v)? {
                        Var::X => x = id,
                        Var::Y => y = id,
                        Var::Z => z = id,
                        Var::Named(_) => {
                            return Err(Error::MalformedTree(
                                "named variable used as a spatial input",
                            ))
                        }
                    };
                }
            }
            clauses.insert(n, id);
            id -= 1;
        }
        debug_assert_eq!(id, 0);
        debug_assert_eq!(clauses[&root], 1);

        // The flattening visits operands before users, so `ops` came out in
        // descending-id order; flip it so the root leads the tape.
        ops.reverse();

        // Spatial inputs that don't appear in the expression still get
        // dedicated slots, since queries write them unconditionally.
        let mut num_slots = flat.len() + 1;
        for axis in [&mut x, &mut y, &mut z] {
            if *axis == 0 {
                *axis = num_slots as ClauseId;
                num_slots += 1;
            }
        }

        let mut result = Results::new(num_slots, var_map.len());
        for &(cid, v) in &constants {
            result.fill(v, cid);
        }
        result.set_deriv(x, Vector3::x());
        result.set_deriv(y, Vector3::y());
        result.set_deriv(z, Vector3::z());
        for (index, (&cid, _)) in var_map.iter().enumerate() {
            result.set_gradient(cid, index);
        }

        let tape = Tape {
            ops,
            root: 1,
            kind: TapeType::Base,
            bounds: None,
        };

        Ok(Self {
            tapes: vec![tape],
            tape: 0,
            result,
            disabled: vec![false; num_slots],
            remap: vec![0; num_slots],
            vars: var_map,
            x,
            y,
            z,
        })
    }

    /// Returns the tape at the top of the stack
    pub fn tape(&self) -> &Tape {
        &self.tapes[self.tape]
    }

    /// Ratio of the current tape length to the base tape length
    pub fn utilization(&self) -> f64 {
        self.tapes[self.tape].len() as f64 / self.tapes[0].len() as f64
    }

    ////////////////////////////////////////////////////////////////////////
    // Query entry points

    /// Loads a point into the given sample column
    pub fn set_point(&mut self, p: Vector3<f32>, k: usize) {
        self.result.set_f(self.x, k, p.x);
        self.result.set_f(self.y, k, p.y);
        self.result.set_f(self.z, k, p.z);
    }

    /// Loads a region into the X/Y/Z interval slots
    pub fn set_region(&mut self, lower: Vector3<f32>, upper: Vector3<f32>) {
        self.result.set_i(self.x, Interval::new(lower.x, upper.x));
        self.result.set_i(self.y, Interval::new(lower.y, upper.y));
        self.result.set_i(self.z, Interval::new(lower.z, upper.z));
    }

    /// Evaluates the expression at a single point
    pub fn eval(&mut self, p: Vector3<f32>) -> f32 {
        self.set_point(p, 0);
        self.values(1)[0]
    }

    /// Evaluates at a point using the deepest tape whose validating region
    /// contains it
    ///
    /// Falls back to the base (unpruned) tape when no interval tape on the
    /// stack covers the point.  The stack cursor is restored before
    /// returning.
    pub fn base_eval(&mut self, p: Vector3<f32>) -> f32 {
        let prev = self.tape;
        while self.tape > 0 {
            let t = &self.tapes[self.tape];
            if t.kind == TapeType::Interval && t.contains(p) {
                break;
            }
            self.tape -= 1;
        }
        let out = self.eval(p);
        self.tape = prev;
        out
    }

    /// Evaluates a conservative value range over the given region
    ///
    /// This also leaves the interval state loaded for a subsequent
    /// [`Evaluator::push`].
    pub fn eval_region(
        &mut self,
        lower: Vector3<f32>,
        upper: Vector3<f32>,
    ) -> Interval {
        self.set_region(lower, upper);
        self.interval()
    }

    ////////////////////////////////////////////////////////////////////////
    // Interpreters

    /// Runs the scalar interpreter over the first `count` sample columns
    ///
    /// Returns the root row prefix; callers must have loaded columns
    /// `0..count` with [`Evaluator::set_point`].
    pub fn values(&mut self, count: usize) -> &[f32] {
        assert!(count <= SAMPLES);
        let tape = &self.tapes[self.tape];
        let r = &mut self.result;
        for c in tape.ops.iter().rev() {
            let (id, a, b) = (c.id, c.a, c.b);
            match c.op {
                Opcode::Add => {
                    for k in 0..count {
                        let v = r.f(a, k) + r.f(b, k);
                        r.set_f(id, k, v);
                    }
                }
                Opcode::Sub => {
                    for k in 0..count {
                        let v = r.f(a, k) - r.f(b, k);
                        r.set_f(id, k, v);
                    }
                }
                Opcode::Mul => {
                    for k in 0..count {
                        let v = r.f(a, k) * r.f(b, k);
                        r.set_f(id, k, v);
                    }
                }
                Opcode::Div => {
                    for k in 0..count {
                        let v = r.f(a, k) / r.f(b, k);
                        r.set_f(id, k, v);
                    }
                }
                Opcode::Min => {
                    for k in 0..count {
                        let v = r.f(a, k).min(r.f(b, k));
                        r.set_f(id, k, v);
                    }
                }
                Opcode::Max => {
                    for k in 0..count {
                        let v = r.f(a, k).max(r.f(b, k));
                        r.set_f(id, k, v);
                    }
                }
                Opcode::Atan2 => {
                    for k in 0..count {
                        let v = r.f(a, k).atan2(r.f(b, k));
                        r.set_f(id, k, v);
                    }
                }
                Opcode::Pow => {
                    for k in 0..count {
                        let v = r.f(a, k).powf(r.f(b, k));
                        r.set_f(id, k, v);
                    }
                }
                Opcode::NthRoot => {
                    for k in 0..count {
                        let v = r.f(a, k).powf(1.0 / r.f(b, k));
                        r.set_f(id, k, v);
                    }
                }
                Opcode::Mod => {
                    for k in 0..count {
                        let v = r.f(a, k).rem_euclid(r.f(b, k));
                        r.set_f(id, k, v);
                    }
                }
                Opcode::NanFill => {
                    for k in 0..count {
                        let av = r.f(a, k);
                        let v = if av.is_nan() { r.f(b, k) } else { av };
                        r.set_f(id, k, v);
                    }
                }
                Opcode::Square => {
                    for k in 0..count {
                        let av = r.f(a, k);
                        r.set_f(id, k, av * av);
                    }
                }
                Opcode::Sqrt => {
                    for k in 0..count {
                        let v = r.f(a, k).sqrt();
                        r.set_f(id, k, v);
                    }
                }
                Opcode::Neg => {
                    for k in 0..count {
                        let v = -r.f(a, k);
                        r.set_f(id, k, v);
                    }
                }
                Opcode::Sin => {
                    for k in 0..count {
                        let v = r.f(a, k).sin();
                        r.set_f(id, k, v);
                    }
                }
                Opcode::Cos => {
                    for k in 0..count {
                        let v = r.f(a, k).cos();
                        r.set_f(id, k, v);
                    }
                }
                Opcode::Tan => {
                    for k in 0..count {
                        let v = r.f(a, k).tan();
                        r.set_f(id, k, v);
                    }
                }
                Opcode::Asin => {
                    for k in 0..count {
                        let v = r.f(a, k).asin();
                        r.set_f(id, k, v);
                    }
                }
                Opcode::Acos => {
                    for k in 0..count {
                        let v = r.f(a, k).acos();
                        r.set_f(id, k, v);
                    }
                }
                Opcode::Atan => {
                    for k in 0..count {
                        let v = r.f(a, k).atan();
                        r.set_f(id, k, v);
                    }
                }
                Opcode::Exp => {
                    for k in 0..count {
                        let v = r.f(a, k).exp();
                        r.set_f(id, k, v);
                    }
                }
                Opcode::ConstVar => {
                    for k in 0..count {
                        let v = r.f(a, k);
                        r.set_f(id, k, v);
                    }
                }
                Opcode::Const
                | Opcode::Var
                | Opcode::VarX
                | Opcode::VarY
                | Opcode::VarZ => {
                    panic!("invalid tape: leaf opcode {:?}", c.op)
                }
            }
        }
        self.result.values(self.tapes[self.tape].root, count)
    }

    /// Runs the scalar interpreter, then sweeps the per-sample partial
    /// derivatives along X/Y/Z for the first `count` columns
    pub fn derivs(&mut self, count: usize) -> Derivs<'_> {
        self.values(count);
        let tape = &self.tapes[self.tape];
        let r = &mut self.result;
        for c in tape.ops.iter().rev() {
            let (id, a, b) = (c.id, c.a, c.b);
            match c.op {
                Opcode::Add => {
                    for k in 0..count {
                        let (ad, bd) = (r.d(a, k), r.d(b, k));
                        r.set_d(
                            id,
                            k,
                            [ad[0] + bd[0], ad[1] + bd[1], ad[2] + bd[2]],
                        );
                    }
                }
                Opcode::Sub => {
                    for k in 0..count {
                        let (ad, bd) = (r.d(a, k), r.d(b, k));
                        r.set_d(
                            id,
                            k,
                            [ad[0] - bd[0], ad[1] - bd[1], ad[2] - bd[2]],
                        );
                    }
                }
                Opcode::Mul => {
                    // Product rule
                    for k in 0..count {
                        let (av, bv) = (r.f(a, k), r.f(b, k));
                        let (ad, bd) = (r.d(a, k), r.d(b, k));
                        r.set_d(
                            id,
                            k,
                            [
                                av * bd[0] + bv * ad[0],
                                av * bd[1] + bv * ad[1],
                                av * bd[2] + bv * ad[2],
                            ],
                        );
                    }
                }
                Opcode::Div => {
                    for k in 0..count {
                        let (av, bv) = (r.f(a, k), r.f(b, k));
                        let (ad, bd) = (r.d(a, k), r.d(b, k));
                        let d = bv * bv;
                        r.set_d(
                            id,
                            k,
                            [
                                (bv * ad[0] - av * bd[0]) / d,
                                (bv * ad[1] - av * bd[1]) / d,
                                (bv * ad[2] - av * bd[2]) / d,
                            ],
                        );
                    }
                }
                Opcode::Min => {
                    for k in 0..count {
                        let sel = if r.f(a, k) < r.f(b, k) { a } else { b };
                        let d = r.d(sel, k);
                        r.set_d(id, k, d);
                    }
                }
                Opcode::Max => {
                    for k in 0..count {
                        let sel = if r.f(a, k) < r.f(b, k) { b } else { a };
                        let d = r.d(sel, k);
                        r.set_d(id, k, d);
                    }
                }
                Opcode::Atan2 => {
                    for k in 0..count {
                        let (av, bv) = (r.f(a, k), r.f(b, k));
                        let (ad, bd) = (r.d(a, k), r.d(b, k));
                        let d = av * av + bv * bv;
                        r.set_d(
                            id,
                            k,
                            [
                                (ad[0] * bv - av * bd[0]) / d,
                                (ad[1] * bv - av * bd[1]) / d,
                                (ad[2] * bv - av * bd[2]) / d,
                            ],
                        );
                    }
                }
                Opcode::Pow => {
                    // The right operand is a constant, so its derivative
                    // contribution (which would involve ln of the base) is
                    // dropped.
                    for k in 0..count {
                        let (av, bv) = (r.f(a, k), r.f(b, k));
                        let ad = r.d(a, k);
                        let m = av.powf(bv - 1.0) * bv;
                        r.set_d(id, k, [m * ad[0], m * ad[1], m * ad[2]]);
                    }
                }
                Opcode::NthRoot => {
                    for k in 0..count {
                        let (av, bv) = (r.f(a, k), r.f(b, k));
                        let ad = r.d(a, k);
                        let m = av.powf(1.0 / bv - 1.0) / bv;
                        r.set_d(id, k, [m * ad[0], m * ad[1], m * ad[2]]);
                    }
                }
                Opcode::Mod => {
                    // Not the true partial of mod, but close enough for
                    // normals.
                    for k in 0..count {
                        let d = r.d(a, k);
                        r.set_d(id, k, d);
                    }
                }
                Opcode::NanFill => {
                    for k in 0..count {
                        let sel = if r.f(a, k).is_nan() { b } else { a };
                        let d = r.d(sel, k);
                        r.set_d(id, k, d);
                    }
                }
                Opcode::Square => {
                    for k in 0..count {
                        let m = 2.0 * r.f(a, k);
                        let ad = r.d(a, k);
                        r.set_d(id, k, [m * ad[0], m * ad[1], m * ad[2]]);
                    }
                }
                Opcode::Sqrt => {
                    for k in 0..count {
                        let av = r.f(a, k);
                        if av < 0.0 {
                            r.set_d(id, k, [0.0; 3]);
                        } else {
                            let m = 2.0 * r.f(id, k);
                            let ad = r.d(a, k);
                            r.set_d(id, k, [ad[0] / m, ad[1] / m, ad[2] / m]);
                        }
                    }
                }
                Opcode::Neg => {
                    for k in 0..count {
                        let ad = r.d(a, k);
                        r.set_d(id, k, [-ad[0], -ad[1], -ad[2]]);
                    }
                }
                Opcode::Sin => {
                    for k in 0..count {
                        let m = r.f(a, k).cos();
                        let ad = r.d(a, k);
                        r.set_d(id, k, [m * ad[0], m * ad[1], m * ad[2]]);
                    }
                }
                Opcode::Cos => {
                    for k in 0..count {
                        let m = -r.f(a, k).sin();
                        let ad = r.d(a, k);
                        r.set_d(id, k, [m * ad[0], m * ad[1], m * ad[2]]);
                    }
                }
                Opcode::Tan => {
                    for k in 0..count {
                        let m = (1.0 / r.f(a, k).cos()).powi(2);
                        let ad = r.d(a, k);
                        r.set_d(id, k, [m * ad[0], m * ad[1], m * ad[2]]);
                    }
                }
                Opcode::Asin => {
                    for k in 0..count {
                        let d = (1.0 - r.f(a, k).powi(2)).sqrt();
                        let ad = r.d(a, k);
                        r.set_d(id, k, [ad[0] / d, ad[1] / d, ad[2] / d]);
                    }
                }
                Opcode::Acos => {
                    for k in 0..count {
                        let d = -(1.0 - r.f(a, k).powi(2)).sqrt();
                        let ad = r.d(a, k);
                        r.set_d(id, k, [ad[0] / d, ad[1] / d, ad[2] / d]);
                    }
                }
                Opcode::Atan => {
                    for k in 0..count {
                        let d = r.f(a, k).powi(2) + 1.0;
                        let ad = r.d(a, k);
                        r.set_d(id, k, [ad[0] / d, ad[1] / d, ad[2] / d]);
                    }
                }
                Opcode::Exp => {
                    for k in 0..count {
                        let m = r.f(a, k).exp();
                        let ad = r.d(a, k);
                        r.set_d(id, k, [m * ad[0], m * ad[1], m * ad[2]]);
                    }
                }
                Opcode::ConstVar => {
                    for k in 0..count {
                        let d = r.d(a, k);
                        r.set_d(id, k, d);
                    }
                }
                Opcode::Const
                | Opcode::Var
                | Opcode::VarX
                | Opcode::VarY
                | Opcode::VarZ => {
                    panic!("invalid tape: leaf opcode {:?}", c.op)
                }
            }
        }
        let root = self.tapes[self.tape].root;
        let (v, dx, dy, dz) = self.result.derivs(root, count);
        Derivs { v, dx, dy, dz }
    }

    /// Runs the interval interpreter over the loaded X/Y/Z region
    pub fn interval(&mut self) -> Interval {
        let tape = &self.tapes[self.tape];
        let r = &mut self.result;
        for c in tape.ops.iter().rev() {
            let (a, b) = (r.i(c.a), r.i(c.b));
            let out = match c.op {
                Opcode::Add => a + b,
                Opcode::Sub => a - b,
                Opcode::Mul => a * b,
                Opcode::Div => a / b,
                Opcode::Min => a.min(b),
                Opcode::Max => a.max(b),
                Opcode::Atan2 => a.atan2(b),
                Opcode::Pow => a.pow(b.lower()),
                Opcode::NthRoot => a.nth_root(b.lower()),
                Opcode::Mod => {
                    // Lossy hull, wide enough for any divisor sign
                    if b.has_nan() {
                        f32::NAN.into()
                    } else {
                        Interval::new(
                            0.0,
                            b.lower().abs().max(b.upper().abs()),
                        )
                    }
                }
                Opcode::NanFill => {
                    if a.has_nan() {
                        b
                    } else {
                        a
                    }
                }
                Opcode::Square => a.square(),
                Opcode::Sqrt => a.sqrt(),
                Opcode::Neg => -a,
                Opcode::Sin => a.sin(),
                Opcode::Cos => a.cos(),
                Opcode::Tan => a.tan(),
                Opcode::Asin => a.asin(),
                Opcode::Acos => a.acos(),
                Opcode::Atan => a.atan(),
                Opcode::Exp => a.exp(),
                Opcode::ConstVar => a,
                Opcode::Const
                | Opcode::Var
                | Opcode::VarX
                | Opcode::VarY
                | Opcode::VarZ => {
                    panic!("invalid tape: leaf opcode {:?}", c.op)
                }
            };
            r.set_i(c.id, out);
        }
        self.result.i(self.tapes[self.tape].root)
    }

    /// Computes partial derivatives with respect to every free variable at
    /// the given point
    ///
    /// Returns a map from variable handle to ∂f/∂v; empty when the
    /// expression has no free variables.
    pub fn gradient(&mut self, p: Vector3<f32>) -> BTreeMap<Node, f32> {
        self.set_point(p, 0);
        self.values(1);

        let tape = &self.tapes[self.tape];
        let r = &mut self.result;
        let nv = r.var_count();
        for c in tape.ops.iter().rev() {
            let (av, bv) = (r.f(c.a, 0), r.f(c.b, 0));
            for k in 0..nv {
                let (ja, jb) = (r.j(c.a, k), r.j(c.b, k));
                let out = match c.op {
                    Opcode::Add => ja + jb,
                    Opcode::Sub => ja - jb,
                    Opcode::Mul => av * jb + bv * ja,
                    Opcode::Div => (bv * ja - av * jb) / (bv * bv),
                    Opcode::Min => {
                        if av < bv {
                            ja
                        } else {
                            jb
                        }
                    }
                    Opcode::Max => {
                        if av < bv {
                            jb
                        } else {
                            ja
                        }
                    }
                    Opcode::Atan2 => {
                        (ja * bv - av * jb) / (av * av + bv * bv)
                    }
                    Opcode::Pow => av.powf(bv - 1.0) * bv * ja,
                    Opcode::NthRoot => av.powf(1.0 / bv - 1.0) / bv * ja,
                    Opcode::Mod => ja,
                    Opcode::NanFill => {
                        if av.is_nan() {
                            jb
                        } else {
                            ja
                        }
                    }
                    Opcode::Square => 2.0 * av * ja,
                    Opcode::Sqrt => {
                        if av < 0.0 {
                            0.0
                        } else {
                            ja / (2.0 * av.sqrt())
                        }
                    }
                    Opcode::Neg => -ja,
                    Opcode::Sin => ja * av.cos(),
                    Opcode::Cos => -ja * av.sin(),
                    Opcode::Tan => ja * (1.0 / av.cos()).powi(2),
                    Opcode::Asin => ja / (1.0 - av * av).sqrt(),
                    Opcode::Acos => -ja / (1.0 - av * av).sqrt(),
                    Opcode::Atan => ja / (av * av + 1.0),
                    Opcode::Exp => ja * av.exp(),
                    Opcode::ConstVar => 0.0,
                    Opcode::Const
                    | Opcode::Var
                    | Opcode::VarX
                    | Opcode::VarY
                    | Opcode::VarZ => {
                        panic!("invalid tape: leaf opcode {:?}", c.op)
                    }
                };
                r.set_j(c.id, k, out);
            }
        }

        let root = self.tapes[self.tape].root;
        let mut out = BTreeMap::new();
        for (index, (_, &node)) in self.vars.iter().enumerate() {
            out.insert(node, self.result.j(root, index));
        }
        out
    }

    ////////////////////////////////////////////////////////////////////////
    // Tape specialization

    /// Emits the successor tape from the `disabled`/`remap` scratch arrays
    ///
    /// Remap chains are collapsed to their fixed point during emission, so
    /// the new tape carries no stale indirection.  Storage at each stack
    /// depth is allocated once and reused thereafter.
    fn push_tape(&mut self, kind: TapeType) {
        let prev = self.tape;
        self.tape += 1;
        if self.tape == self.tapes.len() {
            let cap = self.tapes[0].len();
            self.tapes.push(Tape::with_capacity(cap));
        } else {
            self.tapes[self.tape].ops.clear();
        }

        let (head, tail) = self.tapes.split_at_mut(self.tape);
        let prev_tape = &head[prev];
        let next = &mut tail[0];
        next.kind = kind;
        next.bounds = None;

        for c in &prev_tape.ops {
            if !self.disabled[c.id as usize] {
                let mut ra = c.a;
                while self.remap[ra as usize] != 0 {
                    ra = self.remap[ra as usize];
                }
                let mut rb = c.b;
                while self.remap[rb as usize] != 0 {
                    rb = self.remap[rb as usize];
                }
                next.ops.push(Clause {
                    op: c.op,
                    id: c.id,
                    a: ra,
                    b: rb,
                });
            }
        }

        let mut root = prev_tape.root;
        while self.remap[root as usize] != 0 {
            root = self.remap[root as usize];
        }
        next.root = root;

        debug_assert!(next.ops.len() <= prev_tape.ops.len());
    }

    /// Resets the pruning scratch and marks the current root active
    fn reset_scratch(&mut self) {
        self.disabled.fill(true);
        self.remap.fill(0);
        self.disabled[self.tapes[self.tape].root as usize] = false;
    }

    /// Prunes by the interval state of the most recent region evaluation
    ///
    /// `Min`/`Max` clauses whose operand ranges are strictly disjoint are
    /// remapped to the winning branch; the resulting tape records the
    /// validating region and answers any query within it.  Must be matched
    /// by a [`Evaluator::pop`].
    pub fn push(&mut self) {
        self.reset_scratch();

        let tape = &self.tapes[self.tape];
        for c in &tape.ops {
            if self.disabled[c.id as usize] {
                continue;
            }
            let (ia, ib) = (self.result.i(c.a), self.result.i(c.b));
            match c.op {
                Opcode::Max => {
                    if ia.lower() > ib.upper() {
                        self.disabled[c.a as usize] = false;
                        self.remap[c.id as usize] = c.a;
                    } else if ib.lower() > ia.upper() {
                        self.disabled[c.b as usize] = false;
                        self.remap[c.id as usize] = c.b;
                    }
                }
                Opcode::Min => {
                    if ia.lower() > ib.upper() {
                        self.disabled[c.b as usize] = false;
                        self.remap[c.id as usize] = c.b;
                    } else if ib.lower() > ia.upper() {
                        self.disabled[c.a as usize] = false;
                        self.remap[c.id as usize] = c.a;
                    }
                }
                _ => (),
            }
            if self.remap[c.id as usize] == 0 {
                self.disabled[c.a as usize] = false;
                self.disabled[c.b as usize] = false;
            } else {
                self.disabled[c.id as usize] = true;
            }
        }

        self.push_tape(TapeType::Interval);
        self.tapes[self.tape].bounds = Some([
            self.result.i(self.x),
            self.result.i(self.y),
            self.result.i(self.z),
        ]);
    }

    /// Prunes by a feature's branch choices, returning the minimized
    /// feature (matched choices plus their stored ε-directions)
    ///
    /// A clause consumes the next choice only if it is an ambiguous or
    /// degenerate `Min`/`Max` with a matching id; everything else keeps
    /// both branches.  Must be matched by a [`Evaluator::pop`].
    pub fn push_feature(&mut self, f: &Feature) -> Feature {
        self.reset_scratch();

        let mut out = Feature::with_deriv(f.deriv);
        let choices = f.choices();
        let mut itr = choices.iter().peekable();

        let tape = &self.tapes[self.tape];
        for c in &tape.ops {
            let matched = matches!(c.op, Opcode::Min | Opcode::Max)
                && itr.peek().is_some_and(|ch| ch.id == c.id)
                && (self.result.f(c.a, 0) == self.result.f(c.b, 0)
                    || c.a == c.b);

            if !self.disabled[c.id as usize] {
                if matched {
                    let ch = **itr.peek().unwrap();
                    match f.epsilon(c.id) {
                        Some(eps) => out.push_raw(ch, eps),
                        None => out.push_choice(ch),
                    }
                    if ch.choice == 0 {
                        self.disabled[c.a as usize] = false;
                        self.remap[c.id as usize] = c.a;
                    } else {
                        self.disabled[c.b as usize] = false;
                        self.remap[c.id as usize] = c.b;
                    }
                }
                if self.remap[c.id as usize] == 0 {
                    self.disabled[c.a as usize] = false;
                    self.disabled[c.b as usize] = false;
                } else {
                    self.disabled[c.id as usize] = true;
                }
            }

            if matched {
                itr.next();
            }
        }
        debug_assert!(itr.next().is_none());

        self.push_tape(TapeType::Feature);
        out
    }

    /// Evaluates at the given point, then prunes by scalar dominance
    ///
    /// Must be matched by a [`Evaluator::pop`].
    pub fn specialize(&mut self, p: Vector3<f32>) {
        self.eval(p);
        self.reset_scratch();

        let tape = &self.tapes[self.tape];
        for c in &tape.ops {
            if self.disabled[c.id as usize] {
                continue;
            }
            let (fa, fb) = (self.result.f(c.a, 0), self.result.f(c.b, 0));
            match c.op {
                Opcode::Max => {
                    if fa > fb {
                        self.disabled[c.a as usize] = false;
                        self.remap[c.id as usize] = c.a;
                    } else if fb > fa {
                        self.disabled[c.b as usize] = false;
                        self.remap[c.id as usize] = c.b;
                    }
                }
                Opcode::Min => {
                    if fa > fb {
                        self.disabled[c.b as usize] = false;
                        self.remap[c.id as usize] = c.b;
                    } else if fb > fa {
                        self.disabled[c.a as usize] = false;
                        self.remap[c.id as usize] = c.a;
                    }
                }
                _ => (),
            }
            if self.remap[c.id as usize] == 0 {
                self.disabled[c.a as usize] = false;
                self.disabled[c.b as usize] = false;
            } else {
                self.disabled[c.id as usize] = true;
            }
        }

        self.push_tape(TapeType::Specialized);
    }

    /// Undoes the most recent push, restoring the previous tape
    ///
    /// # Panics
    /// Popping the base tape is a usage error and aborts.
    pub fn pop(&mut self) {
        assert!(self.tape > 0, "cannot pop the base tape");
        self.tape -= 1;
    }

    ////////////////////////////////////////////////////////////////////////
    // Features and the inside test

    /// Enumerates every locally-compatible feature at the given point
    ///
    /// At a smooth point this returns a single feature holding the
    /// gradient; at a cusp or crease it returns one feature per distinct
    /// one-sided gradient.  Fails with [`Error::NoFeature`] when no branch
    /// resolution is feasible.
    pub fn features_at(
        &mut self,
        p: Vector3<f32>,
    ) -> Result<Vec<Feature>, Error> {
        let mut todo = VecDeque::new();
        todo.push_back(Feature::default());
        let mut done: Vec<Feature> = vec![];
        let mut seen: BTreeSet<Vec<Choice>> = BTreeSet::new();

        self.specialize(p);

        while let Some(f) = todo.pop_front() {
            // Push into this feature (storing a minimized version), then
            // compute derivatives; the value is unchanged, but the
            // derivatives depend on which branches we've selected.
            let mut f_ = self.push_feature(&f);
            let ds = self.derivs(1);
            let deriv = Vector3::new(
                ds.dx[0] as f64,
                ds.dy[0] as f64,
                ds.dz[0] as f64,
            );

            // Scan from the bottom up for the first ambiguous or degenerate
            // min/max clause; the scan stops there whether or not either
            // branch turns out to be feasible.
            let mut ambiguous = false;
            let tape = &self.tapes[self.tape];
            for c in tape.ops.iter().rev() {
                if !matches!(c.op, Opcode::Min | Opcode::Max) {
                    continue;
                }
                if c.a == c.b {
                    // A non-selection collapses to a single choice
                    ambiguous = true;
                    let mut fa = f_.clone();
                    fa.push_choice(Choice {
                        id: c.id,
                        choice: 0,
                    });
                    todo.push_back(fa);
                    break;
                } else if self.result.f(c.a, 0) == self.result.f(c.b, 0) {
                    ambiguous = true;
                    let da = self.result.d(c.a, 0);
                    let db = self.result.d(c.b, 0);
                    let lhs =
                        Vector3::new(da[0] as f64, da[1] as f64, da[2] as f64);
                    let rhs =
                        Vector3::new(db[0] as f64, db[1] as f64, db[2] as f64);
                    let epsilon = if c.op == Opcode::Min {
                        rhs - lhs
                    } else {
                        lhs - rhs
                    };

                    let mut fa = f_.clone();
                    if fa.push(
                        epsilon,
                        Choice {
                            id: c.id,
                            choice: 0,
                        },
                    ) {
                        todo.push_back(fa);
                    }
                    let mut fb = f_.clone();
                    if fb.push(
                        -epsilon,
                        Choice {
                            id: c.id,
                            choice: 1,
                        },
                    ) {
                        todo.push_back(fb);
                    }
                    break;
                }
            }

            if !ambiguous {
                f_.deriv = deriv;
                if seen.insert(f_.choices().to_vec()) {
                    done.push(f_);
                }
            }
            self.pop(); // feature tape
        }
        self.pop(); // specialization

        if done.is_empty() {
            Err(Error::NoFeature)
        } else {
            Ok(done)
        }
    }

    /// Checks whether the given point is inside the solid
    ///
    /// Strictly negative values are inside and strictly positive values are
    /// outside; on the surface itself, the point counts as inside unless
    /// every feature's gradient points outward.
    pub fn is_inside(&mut self, p: Vector3<f32>) -> bool {
        self.set_point(p, 0);
        let ds = self.derivs(1);
        let v = ds.v[0];
        let d = [ds.dx[0], ds.dy[0], ds.dz[0]];

        if v < 0.0 {
            return true;
        } else if v > 0.0 {
            return false;
        }

        // Shortcut for non-ambiguous zero crossings: a non-zero gradient
        // means nearby points take both signs.
        if !self.is_ambiguous() {
            return d.iter().any(|&x| x != 0.0);
        }

        let fs = match self.features_at(p) {
            Ok(fs) => fs,
            Err(_) => return false,
        };

        if fs.len() == 1 {
            return fs[0].deriv.norm() > 0.0;
        }

        // We're outside the model only if every feature faces outward: for
        // each epsilon we could move along, epsilon · deriv > 0.
        let mut pos = false;
        let mut neg = false;
        for f in &fs {
            pos |= f.is_compatible(f.deriv);
            neg |= f.is_compatible(-f.deriv);
        }
        !(pos && !neg)
    }

    /// Checks whether any `Min`/`Max` clause is value-tied in column 0
    ///
    /// Callers must have run a scalar evaluation first.
    pub fn is_ambiguous(&self) -> bool {
        self.tapes[self.tape].ops.iter().any(|c| {
            matches!(c.op, Opcode::Min | Opcode::Max)
                && self.result.f(c.a, 0) == self.result.f(c.b, 0)
        })
    }

    /// Evaluates at the given point, then checks for ambiguity
    pub fn is_ambiguous_at(&mut self, p: Vector3<f32>) -> bool {
        self.eval(p);
        self.is_ambiguous()
    }

    /// Returns the sample columns `< count` in which any `Min`/`Max` clause
    /// is value-tied
    ///
    /// Callers must have run `values(count)` first.
    pub fn ambiguous_samples(&self, count: usize) -> BTreeSet<usize> {
        let mut out = BTreeSet::new();
        for c in &self.tapes[self.tape].ops {
            if matches!(c.op, Opcode::Min | Opcode::Max) {
                for k in 0..count {
                    if self.result.f(c.a, k) == self.result.f(c.b, k) {
                        out.insert(k);
                    }
                }
            }
        }
        out
    }

    ////////////////////////////////////////////////////////////////////////
    // Variables

    /// Writes a new value for the given free variable
    ///
    /// Unknown handles are ignored.
    pub fn set_var(&mut self, var: Node, value: f32) {
        if let Some(&id) = self.vars.get_right(&var) {
            self.result.fill(value, id);
        }
    }

    /// Writes every provided variable value, reporting whether any differed
    /// from its previous value
    ///
    /// Entries for unknown variables are silently discarded.
    pub fn update_vars(&mut self, values: &BTreeMap<Node, f32>) -> bool {
        let mut changed = false;
        for (&id, node) in self.vars.iter() {
            if let Some(&v) = values.get(node) {
                if v != self.result.f(id, 0) {
                    self.result.fill(v, id);
                    changed = true;
                }
            }
        }
        changed
    }

    /// Unpacks the current value of every free variable
    pub fn var_values(&self) -> BTreeMap<Node, f32> {
        self.vars
            .iter()
            .map(|(&id, &node)| (node, self.result.f(id, 0)))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::Context;

    fn build(ctx: &Context, root: Node) -> Evaluator {
        Evaluator::new(ctx, root, &BTreeMap::new()).unwrap()
    }

    /// `(x - cx)² + (y - cy)² + (z - cz)² - 1`
    fn sphere(ctx: &mut Context, cx: f64, cy: f64, cz: f64) -> Node {
        let x = ctx.x();
        let y = ctx.y();
        let z = ctx.z();
        let dx = ctx.sub(x, cx).unwrap();
        let dy = ctx.sub(y, cy).unwrap();
        let dz = ctx.sub(z, cz).unwrap();
        let dx2 = ctx.square(dx).unwrap();
        let dy2 = ctx.square(dy).unwrap();
        let dz2 = ctx.square(dz).unwrap();
        let sum = ctx.add(dx2, dy2).unwrap();
        let sum = ctx.add(sum, dz2).unwrap();
        ctx.sub(sum, 1.0).unwrap()
    }

    #[test]
    fn test_constant_root() {
        let mut ctx = Context::new();
        let p = ctx.constant(1.5);
        let mut eval = build(&ctx, p);
        assert!(eval.tape().is_empty());
        assert_eq!(eval.eval(Vector3::zeros()), 1.5);
    }

    #[test]
    fn test_axis_root() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let mut eval = build(&ctx, x);
        assert_eq!(eval.eval(Vector3::new(2.0, 0.0, 0.0)), 2.0);

        eval.set_point(Vector3::new(2.0, 3.0, 4.0), 0);
        let ds = eval.derivs(1);
        assert_eq!((ds.dx[0], ds.dy[0], ds.dz[0]), (1.0, 0.0, 0.0));
    }

    #[test]
    fn test_operands_written_before_users() {
        let mut ctx = Context::new();
        let s = sphere(&mut ctx, 0.0, 0.0, 0.0);
        let y = ctx.y();
        let out = ctx.min(s, y).unwrap();
        let eval = build(&ctx, out);

        let tape = eval.tape();
        let position: HashMap<ClauseId, usize> = tape
            .ops
            .iter()
            .enumerate()
            .map(|(n, c)| (c.id, n))
            .collect();
        for (n, c) in tape.ops.iter().enumerate() {
            for operand in [c.a, c.b] {
                if let Some(&p) = position.get(&operand) {
                    // Interpreters run back-to-front, so operands must sit
                    // at a later index than their users
                    assert!(p > n, "operand {operand} written after use");
                }
            }
        }
        assert_eq!(tape.ops[0].id, tape.root);
    }

    #[test]
    fn test_push_prunes_dominated_branch() {
        let mut ctx = Context::new();
        let a = sphere(&mut ctx, -2.0, 0.0, 0.0);
        let b = sphere(&mut ctx, 2.0, 0.0, 0.0);
        let out = ctx.min(a, b).unwrap();
        let mut eval = build(&ctx, out);

        let full = eval.tape().len();
        let i = eval.eval_region(
            Vector3::new(1.0, -1.0, -1.0),
            Vector3::new(3.0, 1.0, 1.0),
        );
        assert!(i.contains(-1.0) && i.contains(2.0));

        eval.push();
        assert!(eval.tape().len() < full);
        assert!(eval.utilization() < 1.0);

        // The surviving branch answers queries inside the region exactly
        assert_eq!(eval.eval(Vector3::new(2.0, 0.0, 0.0)), -1.0);
        assert_eq!(eval.eval(Vector3::new(1.0, 0.0, 0.0)), 0.0);

        eval.pop();
        assert_eq!(eval.tape().len(), full);
        assert_eq!(eval.utilization(), 1.0);
    }

    #[test]
    fn test_push_pop_restores_results() {
        let mut ctx = Context::new();
        let a = sphere(&mut ctx, -2.0, 0.0, 0.0);
        let b = sphere(&mut ctx, 2.0, 0.0, 0.0);
        let out = ctx.min(a, b).unwrap();
        let mut eval = build(&ctx, out);

        let p = Vector3::new(2.5, 0.0, 0.0);
        let before = eval.eval(p);

        eval.eval_region(
            Vector3::new(1.0, -1.0, -1.0),
            Vector3::new(3.0, 1.0, 1.0),
        );
        eval.push();
        assert_eq!(eval.eval(p), before);
        eval.pop();
        assert_eq!(eval.eval(p), before);

        // Storage is reused on the next push at the same depth
        eval.eval_region(
            Vector3::new(-3.0, -1.0, -1.0),
            Vector3::new(-1.0, 1.0, 1.0),
        );
        eval.push();
        assert_eq!(eval.eval(Vector3::new(-2.0, 0.0, 0.0)), -1.0);
        eval.pop();
    }

    #[test]
    fn test_specialize() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let out = ctx.min(x, y).unwrap();
        let mut eval = build(&ctx, out);

        eval.specialize(Vector3::new(1.0, 0.0, 0.0));
        assert_eq!(eval.tape().kind(), TapeType::Specialized);
        assert!(eval.utilization() < 1.0);

        // The specialized tape is pinned to the Y branch
        assert_eq!(eval.eval(Vector3::new(-1.0, 3.0, 0.0)), 3.0);
        eval.pop();
        assert_eq!(eval.eval(Vector3::new(-1.0, 3.0, 0.0)), -1.0);
    }

    #[test]
    fn test_base_eval_falls_back() {
        let mut ctx = Context::new();
        let a = sphere(&mut ctx, -2.0, 0.0, 0.0);
        let b = sphere(&mut ctx, 2.0, 0.0, 0.0);
        let out = ctx.min(a, b).unwrap();
        let mut eval = build(&ctx, out);

        eval.eval_region(
            Vector3::new(1.0, -1.0, -1.0),
            Vector3::new(3.0, 1.0, 1.0),
        );
        eval.push();

        // The pruned tape only knows about sphere B, but base_eval walks
        // down to the base tape for points outside the validated region
        let p = Vector3::new(-2.0, 0.0, 0.0);
        assert_eq!(eval.eval(p), 15.0);
        assert_eq!(eval.base_eval(p), -1.0);

        // The cursor is restored afterwards
        assert!(eval.utilization() < 1.0);
        eval.pop();
    }

    #[test]
    fn test_mod_is_euclidean() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let out = ctx.modulo(x, 3.0).unwrap();
        let mut eval = build(&ctx, out);
        assert_eq!(eval.eval(Vector3::new(-1.0, 0.0, 0.0)), 2.0);
        assert_eq!(eval.eval(Vector3::new(7.0, 0.0, 0.0)), 1.0);
    }

    #[test]
    fn test_nanfill() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let s = ctx.sqrt(x).unwrap();
        let out = ctx.nanfill(s, 0.0).unwrap();
        let mut eval = build(&ctx, out);
        assert_eq!(eval.eval(Vector3::new(4.0, 0.0, 0.0)), 2.0);
        assert_eq!(eval.eval(Vector3::new(-4.0, 0.0, 0.0)), 0.0);
    }

    #[test]
    fn test_const_var_pins_gradient() {
        let mut ctx = Context::new();
        let a = ctx.var("a");
        let x = ctx.x();
        let pinned = ctx.const_var(a).unwrap();
        let out = ctx.mul(pinned, x).unwrap();

        let vars = [(a, 3.0)].into_iter().collect();
        let mut eval = Evaluator::new(&ctx, out, &vars).unwrap();

        assert_eq!(eval.eval(Vector3::new(2.0, 0.0, 0.0)), 6.0);
        let g = eval.gradient(Vector3::new(2.0, 0.0, 0.0));
        assert_eq!(g[&a], 0.0);

        // The value still responds to variable updates
        eval.set_var(a, 4.0);
        assert_eq!(eval.eval(Vector3::new(2.0, 0.0, 0.0)), 8.0);
    }

    #[test]
    fn test_update_vars() {
        let mut ctx = Context::new();
        let a = ctx.var("a");
        let b = ctx.var("b");
        let sum = ctx.add(a, b).unwrap();
        let x = ctx.x();
        let out = ctx.mul(sum, x).unwrap();

        let vars = [(a, 1.0), (b, 2.0)].into_iter().collect();
        let mut eval = Evaluator::new(&ctx, out, &vars).unwrap();
        assert_eq!(eval.eval(Vector3::new(1.0, 0.0, 0.0)), 3.0);

        let same = eval.var_values();
        assert!(!eval.update_vars(&same));

        let next = [(a, 2.0), (b, 2.0)].into_iter().collect();
        assert!(eval.update_vars(&next));
        assert_eq!(eval.eval(Vector3::new(1.0, 0.0, 0.0)), 4.0);
        assert_eq!(eval.var_values()[&a], 2.0);
    }

    #[test]
    fn test_missing_var_value() {
        let mut ctx = Context::new();
        let a = ctx.var("a");
        let x = ctx.x();
        let out = ctx.mul(a, x).unwrap();
        assert!(matches!(
            Evaluator::new(&ctx, out, &BTreeMap::new()),
            Err(Error::MalformedTree(_))
        ));
    }

    #[test]
    fn test_ambiguous_samples() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let out = ctx.min(x, y).unwrap();
        let mut eval = build(&ctx, out);

        eval.set_point(Vector3::new(0.0, 0.0, 0.0), 0);
        eval.set_point(Vector3::new(1.0, 0.0, 0.0), 1);
        eval.set_point(Vector3::new(2.0, 2.0, 0.0), 2);
        eval.values(3);
        let ambig = eval.ambiguous_samples(3);
        assert_eq!(ambig, [0, 2].into_iter().collect());
    }

    #[test]
    fn test_feature_tape_is_pruned() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let y = ctx.y();
        let out = ctx.min(x, y).unwrap();
        let mut eval = build(&ctx, out);

        let fs = eval.features_at(Vector3::zeros()).unwrap();
        assert_eq!(fs.len(), 2);
        for f in &fs {
            assert_eq!(f.choices().len(), 1);
        }

        // All tape pushes were matched by pops
        assert_eq!(eval.utilization(), 1.0);
    }

    #[test]
    #[should_panic(expected = "cannot pop the base tape")]
    fn test_pop_underflow() {
        let mut ctx = Context::new();
        let x = ctx.x();
        let mut eval = build(&ctx, x);
        eval.pop();
    }
}
