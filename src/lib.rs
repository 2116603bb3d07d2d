//! Tape-based evaluation of complex closed-form implicit surfaces.
//!
//! An expression over the spatial inputs `X`/`Y`/`Z` (plus optional named
//! free variables) is built up in a [`Context`](context::Context), then
//! flattened once into an [`Evaluator`](eval::Evaluator), which answers
//! point, interval, derivative, and Jacobian queries.  Inside a spatial
//! subdivision loop, [`push`](eval::Evaluator::push) specializes the tape to
//! the current region by pruning `min`/`max` branches that cannot win there,
//! and [`pop`](eval::Evaluator::pop) restores the previous tape without
//! reallocating.
//!
//! ```
//! use spool::{context::Context, eval::Evaluator};
//! use nalgebra::Vector3;
//! use std::collections::BTreeMap;
//!
//! let mut ctx = Context::new();
//! let x = ctx.x();
//! let y = ctx.y();
//! let x2 = ctx.square(x)?;
//! let y2 = ctx.square(y)?;
//! let r = ctx.add(x2, y2)?;
//! let circle = ctx.sub(r, 1.0)?;
//!
//! let mut eval = Evaluator::new(&ctx, circle, &BTreeMap::new())?;
//! assert_eq!(eval.eval(Vector3::new(0.0, 0.0, 0.0)), -1.0);
//! assert_eq!(eval.eval(Vector3::new(1.0, 0.0, 0.0)), 0.0);
//!
//! // Interval queries bound the function over a whole region
//! let i = eval.eval_region(
//!     Vector3::new(-1.0, -1.0, 0.0),
//!     Vector3::new(1.0, 1.0, 0.0),
//! );
//! assert_eq!((i.lower(), i.upper()), (-1.0, 1.0));
//! # Ok::<(), spool::Error>(())
//! ```
pub mod context;
pub mod eval;
pub mod types;

mod error;
pub use error::Error;
