//! End-to-end tests driving the evaluator the way a subdivider or mesher
//! would
use nalgebra::Vector3;
use spool::{
    context::{Context, Node},
    eval::Evaluator,
};
use std::collections::BTreeMap;

type V3 = Vector3<f32>;

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
fn unit_sphere() {
    let mut ctx = Context::new();
    let s = sphere(&mut ctx, 0.0, 0.0, 0.0);
    let mut eval = build(&ctx, s);

    assert_eq!(eval.eval(V3::new(0.0, 0.0, 0.0)), -1.0);
    assert_eq!(eval.eval(V3::new(1.0, 0.0, 0.0)), 0.0);

    let i = eval.eval_region(
        V3::new(-1.0, -1.0, -1.0),
        V3::new(1.0, 1.0, 1.0),
    );
    assert!(i.lower() <= -1.0);
    assert!(i.upper() >= 2.0);

    // No free variables, so the gradient map is empty
    assert!(eval.gradient(V3::new(0.5, 0.0, 0.0)).is_empty());
}

#[test]
fn min_of_axes_features() {
    let mut ctx = Context::new();
    let x = ctx.x();
    let y = ctx.y();
    let out = ctx.min(x, y).unwrap();
    let mut eval = build(&ctx, out);

    let fs = eval.features_at(V3::new(0.0, 0.0, 0.0)).unwrap();
    assert_eq!(fs.len(), 2);
    let derivs: Vec<Vector3<f64>> = fs.iter().map(|f| f.deriv).collect();
    assert!(derivs.contains(&Vector3::new(1.0, 0.0, 0.0)));
    assert!(derivs.contains(&Vector3::new(0.0, 1.0, 0.0)));

    assert!(eval.is_ambiguous_at(V3::new(0.0, 0.0, 0.0)));
    assert!(!eval.is_ambiguous_at(V3::new(1.0, 0.0, 0.0)));

    // Smooth points report a single feature
    let fs = eval.features_at(V3::new(1.0, 0.0, 0.0)).unwrap();
    assert_eq!(fs.len(), 1);
    assert_eq!(fs[0].deriv, Vector3::new(0.0, 1.0, 0.0));
}

#[test]
fn abs_x_is_outside_at_origin() {
    let mut ctx = Context::new();
    let x = ctx.x();
    let nx = ctx.neg(x).unwrap();
    let out = ctx.max(x, nx).unwrap();
    let mut eval = build(&ctx, out);

    let fs = eval.features_at(V3::new(0.0, 0.0, 0.0)).unwrap();
    assert_eq!(fs.len(), 2);
    let derivs: Vec<Vector3<f64>> = fs.iter().map(|f| f.deriv).collect();
    assert!(derivs.contains(&Vector3::new(1.0, 0.0, 0.0)));
    assert!(derivs.contains(&Vector3::new(-1.0, 0.0, 0.0)));

    // Both features point outward, so the crease at the origin is outside
    assert!(!eval.is_inside(V3::new(0.0, 0.0, 0.0)));
    assert!(!eval.is_inside(V3::new(-0.5, 0.0, 0.0)));
    assert!(!eval.is_inside(V3::new(0.5, 0.0, 0.0)));
}

#[test]
fn inside_on_smooth_surface() {
    let mut ctx = Context::new();
    let s = sphere(&mut ctx, 0.0, 0.0, 0.0);
    let mut eval = build(&ctx, s);

    assert!(eval.is_inside(V3::new(0.0, 0.0, 0.0)));
    assert!(!eval.is_inside(V3::new(2.0, 0.0, 0.0)));
    // On the surface, the gradient is non-zero, so inside points exist
    // arbitrarily close by
    assert!(eval.is_inside(V3::new(1.0, 0.0, 0.0)));
}

#[test]
fn disjoint_spheres_push_and_pop() {
    let mut ctx = Context::new();
    let a = sphere(&mut ctx, -2.0, 0.0, 0.0);
    let b = sphere(&mut ctx, 2.0, 0.0, 0.0);
    let out = ctx.min(a, b).unwrap();
    let mut eval = build(&ctx, out);

    // Record base-tape values before specializing
    let probes = [
        V3::new(2.0, 0.0, 0.0),
        V3::new(1.5, 0.5, -0.5),
        V3::new(3.0, 1.0, 1.0),
    ];
    let expected: Vec<f32> = probes.iter().map(|&p| eval.eval(p)).collect();

    let i = eval.eval_region(
        V3::new(1.0, -1.0, -1.0),
        V3::new(3.0, 1.0, 1.0),
    );
    assert!(i.contains(0.0));

    eval.push();
    assert!(eval.utilization() < 1.0);

    // Inside the validated region, the pruned tape matches the full one
    for (&p, &v) in probes.iter().zip(&expected) {
        assert_eq!(eval.eval(p), v);
    }

    eval.pop();
    assert_eq!(eval.utilization(), 1.0);
}

#[test]
fn variable_gradient_and_update() {
    let mut ctx = Context::new();
    let a = ctx.var("a");
    let x = ctx.x();
    let out = ctx.mul(a, x).unwrap();

    let vars: BTreeMap<Node, f32> = [(a, 3.0)].into_iter().collect();
    let mut eval = Evaluator::new(&ctx, out, &vars).unwrap();

    assert_eq!(eval.eval(V3::new(2.0, 0.0, 0.0)), 6.0);

    let g = eval.gradient(V3::new(2.0, 0.0, 0.0));
    assert_eq!(g.len(), 1);
    assert_eq!(g[&a], 2.0);

    eval.set_var(a, 4.0);
    assert_eq!(eval.eval(V3::new(2.0, 0.0, 0.0)), 8.0);
    assert_eq!(eval.var_values()[&a], 4.0);
}

#[test]
fn sqrt_clamps_out_of_domain() {
    let mut ctx = Context::new();
    let x = ctx.x();
    let out = ctx.sqrt(x).unwrap();
    let mut eval = build(&ctx, out);

    eval.set_point(V3::new(-1.0, 0.0, 0.0), 0);
    let ds = eval.derivs(1);
    assert!(ds.v[0].is_nan());
    assert_eq!(ds.dx[0], 0.0);

    let i = eval.eval_region(
        V3::new(-1.0, -1.0, -1.0),
        V3::new(1.0, 1.0, 1.0),
    );
    assert_eq!((i.lower(), i.upper()), (0.0, 1.0));
}

#[test]
fn nested_push_stack() {
    let mut ctx = Context::new();
    let a = sphere(&mut ctx, -2.0, 0.0, 0.0);
    let b = sphere(&mut ctx, 2.0, 0.0, 0.0);
    let c = sphere(&mut ctx, 0.0, 4.0, 0.0);
    let ab = ctx.min(a, b).unwrap();
    let out = ctx.min(ab, c).unwrap();
    let mut eval = build(&ctx, out);
    assert_eq!(eval.utilization(), 1.0);

    // A box hugging sphere B drops both other spheres
    eval.eval_region(V3::new(1.0, -1.0, -1.0), V3::new(3.0, 1.0, 1.0));
    eval.push();
    let depth1 = eval.utilization();
    assert!(depth1 < 1.0);

    // A sub-box has nothing further to prune but still stacks cleanly
    eval.eval_region(
        V3::new(1.5, -0.5, -0.5),
        V3::new(2.5, 0.5, 0.5),
    );
    eval.push();
    let depth2 = eval.utilization();
    assert!(depth2 <= depth1);
    assert_eq!(eval.eval(V3::new(2.0, 0.0, 0.0)), -1.0);

    eval.pop();
    assert_eq!(eval.utilization(), depth1);
    eval.pop();
    assert_eq!(eval.utilization(), 1.0);
}

#[test]
fn cloned_evaluators_are_independent() {
    let mut ctx = Context::new();
    let a = sphere(&mut ctx, -2.0, 0.0, 0.0);
    let b = sphere(&mut ctx, 2.0, 0.0, 0.0);
    let out = ctx.min(a, b).unwrap();
    let mut eval = build(&ctx, out);

    let mut other = eval.clone();
    other.eval_region(V3::new(1.0, -1.0, -1.0), V3::new(3.0, 1.0, 1.0));
    other.push();
    assert!(other.utilization() < 1.0);

    // The original is untouched by the clone's specialization
    assert_eq!(eval.utilization(), 1.0);
    assert_eq!(eval.eval(V3::new(-2.0, 0.0, 0.0)), -1.0);
}
