use conjmin::{
    differentiate_numerically, ConjugateDirection, ConjugateGradient, Gradient, Objective, Status,
};
use nalgebra::{dvector, DMatrix, DVector};
use pcg_rand::Pcg64;
use rand::{Rng, SeedableRng};

const QUADRATICS_TO_SOLVE: usize = 50;

/// `$f(x) = (x - t)^\top A (x - t)$` with `$A$` symmetric positive definite.
struct RandomQuadratic {
    a: DMatrix<f64>,
    t: DVector<f64>,
}

impl RandomQuadratic {
    fn generate(n: usize, rng: &mut impl Rng) -> Self {
        let b = DMatrix::from_fn(n, n, |_, _| rng.gen_range(-1.0..1.0));
        // A = B^T B + I is symmetric and safely positive definite
        let a = b.transpose() * &b + DMatrix::identity(n, n);
        let t = DVector::from_fn(n, |_, _| rng.gen_range(-3.0..3.0));
        Self { a, t }
    }
}

impl Objective for RandomQuadratic {
    fn evaluate(&mut self, p: &DVector<f64>) -> f64 {
        let d = p - &self.t;
        (&self.a * &d).dot(&d)
    }
}

impl Gradient for RandomQuadratic {
    fn gradient(&mut self, grad: &mut DVector<f64>, p: &DVector<f64>) {
        let d = p - &self.t;
        grad.copy_from(&(2.0 * (&self.a * &d)));
    }
}

#[test]
fn conjugate_gradient_solves_random_quadratics() {
    let mut rng = Pcg64::seed_from_u64(0);
    for _ in 0..QUADRATICS_TO_SOLVE {
        let mut problem = RandomQuadratic::generate(4, &mut rng);
        let mut x = DVector::zeros(4);
        let report = ConjugateGradient::new().minimize(&mut x, &mut problem);

        assert_eq!(report.status, Status::Success);
        for i in 0..4 {
            assert!(
                (x[i] - problem.t[i]).abs() < 1e-3,
                "coordinate {} off: {} vs {}",
                i,
                x[i],
                problem.t[i]
            );
        }
    }
}

#[test]
fn conjugate_direction_solves_random_quadratics() {
    let mut rng = Pcg64::seed_from_u64(1);
    for seed in 0..QUADRATICS_TO_SOLVE as u64 {
        let mut problem = RandomQuadratic::generate(3, &mut rng);
        let mut x = DVector::zeros(3);
        let report = ConjugateDirection::new()
            .with_seed(seed)
            .minimize(&mut x, &mut problem);

        assert_eq!(report.status, Status::Success);
        assert!(report.objective_function < 1e-6);
        for i in 0..3 {
            assert!((x[i] - problem.t[i]).abs() < 1e-2);
        }
    }
}

#[test]
fn analytic_gradient_matches_numeric() {
    let mut rng = Pcg64::seed_from_u64(2);
    let mut problem = RandomQuadratic::generate(5, &mut rng);
    for _ in 0..10 {
        let x = DVector::from_fn(5, |_, _| rng.gen_range(-5.0..5.0));
        let numeric = differentiate_numerically(&x, &mut problem);
        let mut analytic = DVector::zeros(5);
        problem.gradient(&mut analytic, &x);
        for i in 0..5 {
            assert!((numeric[i] - analytic[i]).abs() < 1e-4 * (1.0 + analytic[i].abs()));
        }
    }
}

#[test]
fn derivative_free_fits_exponential_decay() {
    // recover (a, b, c) of y = a exp(-b x) + c from noiseless samples by
    // least squares, starting near but not at the truth
    let truth = dvector![2.0, 0.7, 0.5];
    let samples: Vec<(f64, f64)> = (0..40)
        .map(|i| {
            let x = i as f64 * 0.25;
            (x, truth[0] * (-truth[1] * x).exp() + truth[2])
        })
        .collect();

    let mut sse = |p: &DVector<f64>| {
        samples
            .iter()
            .map(|&(x, y)| {
                let r = p[0] * (-p[1] * x).exp() + p[2] - y;
                r * r
            })
            .sum::<f64>()
    };

    let mut p = dvector![1.5, 1.0, 0.0];
    let report = ConjugateDirection::new()
        .with_max_function_calls(100_000)
        .minimize(&mut p, &mut sse);

    assert!(report.objective_function < 1e-3);
    for i in 0..3 {
        assert!((p[i] - truth[i]).abs() < 0.05, "parameter {} off: {}", i, p[i]);
    }
}

#[test]
fn tight_budget_never_worsens_the_start() {
    let mut rng = Pcg64::seed_from_u64(3);
    for _ in 0..QUADRATICS_TO_SOLVE {
        let mut problem = RandomQuadratic::generate(4, &mut rng);
        let mut x = DVector::from_fn(4, |_, _| rng.gen_range(-5.0..5.0));
        let start_value = problem.evaluate(&x);

        let report = ConjugateDirection::new()
            .with_max_function_calls(15)
            .minimize(&mut x, &mut problem);

        assert_eq!(report.status, Status::Suboptimal);
        assert!(report.objective_function <= start_value);
    }
}

#[test]
fn minimizers_agree_on_the_same_problem() {
    struct Banana;

    impl Objective for Banana {
        fn evaluate(&mut self, p: &DVector<f64>) -> f64 {
            (p[0] - 1.0).powi(2) + 10.0 * (p[1] - 2.0).powi(2)
        }
    }

    impl Gradient for Banana {
        fn gradient(&mut self, grad: &mut DVector<f64>, p: &DVector<f64>) {
            grad[0] = 2.0 * (p[0] - 1.0);
            grad[1] = 20.0 * (p[1] - 2.0);
        }
    }

    let mut cg_x = dvector![0.0, 0.0];
    let cg_report = ConjugateGradient::new().minimize(&mut cg_x, &mut Banana);
    assert_eq!(cg_report.status, Status::Success);

    let mut cd_x = dvector![5.0, 5.0];
    let cd_report = ConjugateDirection::new().minimize(&mut cd_x, &mut Banana);
    assert_eq!(cd_report.status, Status::Success);

    for i in 0..2 {
        assert!((cg_x[i] - cd_x[i]).abs() < 1e-2);
    }
}
