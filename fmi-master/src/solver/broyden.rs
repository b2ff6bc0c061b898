use nalgebra::{DMatrix, DVector};

use super::{
    ConvergenceFailure, FailureReason, Residual, RootFinder, SolveReport, SolverOptions,
};
use crate::Error;

/// How the Jacobian estimate is seeded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InitialJacobian {
    /// `-I`, exact for `f(x) = g(x) - x` when `g` does not depend on `x`. Costs no evaluations.
    #[default]
    NegativeIdentity,
    /// Forward differences, one extra evaluation per unknown.
    FiniteDifference,
}

/// No step moves an unknown by more than this many times `max(|x|, 1)`.
const MAX_STEP_GROWTH: f64 = 1e3;

/// Broyden's ("good") quasi-Newton method.
///
/// The Jacobian estimate is updated by a rank-one correction after every step, so each
/// iteration costs a single residual evaluation. If the estimate becomes singular it is rebuilt
/// once by finite differences before giving up. Steps are scaled down to at most
/// `MAX_STEP_GROWTH * max(|x|, 1)`.
#[derive(Debug, Clone, Default)]
pub struct Broyden {
    pub initial_jacobian: InitialJacobian,
}

impl Broyden {
    pub fn new(initial_jacobian: InitialJacobian) -> Self {
        Self { initial_jacobian }
    }
}

/// Forward-difference Jacobian. Differences at the rounding level of the residual are taken as
/// zero, so a residual that does not depend on an unknown yields a singular column.
fn finite_difference(
    residual: &mut Residual<'_>,
    x: &DVector<f64>,
    f: &DVector<f64>,
    fd_step: f64,
    evaluations: &mut usize,
) -> Result<DMatrix<f64>, Error> {
    let n = x.len();
    let mut jacobian = DMatrix::zeros(n, n);
    let mut probe = x.clone();
    let mut f_probe = DVector::zeros(n);
    for j in 0..n {
        let h = fd_step * x[j].abs().max(1.0);
        probe[j] = x[j] + h;
        residual(probe.as_slice(), f_probe.as_mut_slice())?;
        *evaluations += 1;
        let noise = 64.0 * f64::EPSILON * (probe.amax() + f.amax() + f_probe.amax());
        let column = (&f_probe - f).map(|d| if d.abs() <= noise { 0.0 } else { d / h });
        jacobian.set_column(j, &column);
        probe[j] = x[j];
    }
    Ok(jacobian)
}

fn failure(
    reason: FailureReason,
    f: &DVector<f64>,
    residual_norm: f64,
    iterations: usize,
    evaluations: usize,
) -> Error {
    Error::Convergence(ConvergenceFailure {
        unknowns: Vec::new(),
        residual: f.as_slice().to_vec(),
        residual_norm,
        iterations,
        evaluations,
        reason,
    })
}

impl RootFinder for Broyden {
    fn solve(
        &mut self,
        residual: &mut Residual<'_>,
        x: &mut [f64],
        options: &SolverOptions,
    ) -> Result<SolveReport, Error> {
        let n = x.len();
        let mut xv = DVector::from_column_slice(x);
        let mut f = DVector::zeros(n);
        residual(xv.as_slice(), f.as_mut_slice())?;
        let mut evaluations = 1;
        let mut norm = options.norm.of(f.as_slice());

        if !norm.is_finite() {
            return Err(failure(FailureReason::NonFinite, &f, norm, 0, evaluations));
        }
        if norm <= options.tolerance {
            return Ok(SolveReport {
                iterations: 0,
                evaluations,
                residual_norm: norm,
            });
        }

        let (mut jacobian, mut fresh) = match self.initial_jacobian {
            InitialJacobian::NegativeIdentity => (-DMatrix::<f64>::identity(n, n), false),
            InitialJacobian::FiniteDifference => (
                finite_difference(residual, &xv, &f, options.fd_step, &mut evaluations)?,
                true,
            ),
        };

        let mut iterations = 0;
        while iterations < options.max_iterations {
            let step = jacobian
                .clone()
                .lu()
                .solve(&(-&f))
                .filter(|step| step.iter().all(|v| v.is_finite()));

            let Some(mut step) = step else {
                if fresh {
                    x.copy_from_slice(xv.as_slice());
                    return Err(failure(
                        FailureReason::SingularJacobian,
                        &f,
                        norm,
                        iterations,
                        evaluations,
                    ));
                }
                log::debug!("Singular Jacobian estimate, rebuilding by finite differences");
                jacobian =
                    finite_difference(residual, &xv, &f, options.fd_step, &mut evaluations)?;
                fresh = true;
                continue;
            };

            let limit = MAX_STEP_GROWTH * xv.amax().max(1.0);
            let length = step.amax();
            if length > limit {
                log::debug!("Scaling step of length {length:e} down to {limit:e}");
                step *= limit / length;
            }

            iterations += 1;
            let x_next = &xv + &step;
            let mut f_next = DVector::zeros(n);
            residual(x_next.as_slice(), f_next.as_mut_slice())?;
            evaluations += 1;
            norm = options.norm.of(f_next.as_slice());
            log::debug!("Broyden iteration {iterations}: |f| = {norm:e}");

            if !norm.is_finite() {
                x.copy_from_slice(x_next.as_slice());
                return Err(failure(
                    FailureReason::NonFinite,
                    &f_next,
                    norm,
                    iterations,
                    evaluations,
                ));
            }

            let y = &f_next - &f;
            let ss = step.dot(&step);
            if ss > 0.0 {
                let correction = (&y - &jacobian * &step) * step.transpose() / ss;
                jacobian += correction;
            }
            xv = x_next;
            f = f_next;
            fresh = false;

            if norm <= options.tolerance {
                x.copy_from_slice(xv.as_slice());
                return Ok(SolveReport {
                    iterations,
                    evaluations,
                    residual_norm: norm,
                });
            }
        }

        x.copy_from_slice(xv.as_slice());
        Err(failure(
            FailureReason::MaxIterations,
            &f,
            norm,
            iterations,
            evaluations,
        ))
    }
}

#[cfg(test)]
mod tests {
    use float_cmp::approx_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(0.0)]
    #[case(-3.5)]
    #[case(1e6)]
    fn test_identity_coupling_converges_immediately(#[case] guess: f64) {
        // g(x) = x, so f(x) = g(x) - x = 0 everywhere.
        let mut evaluations = 0;
        let mut residual = |x: &[f64], f: &mut [f64]| -> Result<(), Error> {
            evaluations += 1;
            f[0] = x[0] - x[0];
            Ok(())
        };
        let mut x = [guess];
        let report = Broyden::default()
            .solve(&mut residual, &mut x, &SolverOptions::default())
            .unwrap();
        assert_eq!(evaluations, 1);
        assert_eq!(report.evaluations, 1);
        assert_eq!(report.residual_norm, 0.0);
        assert_eq!(x[0], guess);
    }

    #[rstest]
    #[case(InitialJacobian::NegativeIdentity)]
    #[case(InitialJacobian::FiniteDifference)]
    fn test_linear_loop(#[case] initial: InitialJacobian) {
        // u = 2 - x, x = u / 2  =>  u = 4/3, x = 2/3
        let mut last = Vec::new();
        let mut residual = |z: &[f64], f: &mut [f64]| -> Result<(), Error> {
            let (u, x) = (z[0], z[1]);
            f[0] = (2.0 - x) - u;
            f[1] = u / 2.0 - x;
            last = z.to_vec();
            Ok(())
        };
        let mut z = [0.0, 0.0];
        let report = Broyden::new(initial)
            .solve(&mut residual, &mut z, &SolverOptions::default())
            .unwrap();

        assert!(approx_eq!(f64, z[0], 4.0 / 3.0, epsilon = 1e-7));
        assert!(approx_eq!(f64, z[1], 2.0 / 3.0, epsilon = 1e-7));
        assert!(report.residual_norm <= 1e-8);
        assert!(report.evaluations <= 10, "{report:?}");
        // Last evaluation was at the returned root
        assert_eq!(last, z.to_vec());
    }

    #[test]
    fn test_nonlinear_scalar() {
        // g(x) = cos(x)
        let mut residual = |x: &[f64], f: &mut [f64]| -> Result<(), Error> {
            f[0] = x[0].cos() - x[0];
            Ok(())
        };
        let mut x = [1.0];
        Broyden::default()
            .solve(&mut residual, &mut x, &SolverOptions::default())
            .unwrap();
        assert!(approx_eq!(f64, x[0], 0.739_085_133_215_160_6, epsilon = 1e-7));
    }

    #[test]
    fn test_no_solution_reports_failure() {
        // g(x) = x + 1 has no fixed point.
        let mut residual = |_: &[f64], f: &mut [f64]| -> Result<(), Error> {
            f[0] = 1.0;
            Ok(())
        };
        let mut x = [0.0];
        let options = SolverOptions::default();
        let err = Broyden::default()
            .solve(&mut residual, &mut x, &options)
            .unwrap_err();
        match err {
            Error::Convergence(failure) => {
                assert!(failure.iterations <= options.max_iterations);
                assert_eq!(failure.residual, vec![1.0]);
                assert_eq!(failure.residual_norm, 1.0);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[rstest]
    #[case(InitialJacobian::NegativeIdentity)]
    #[case(InitialJacobian::FiniteDifference)]
    fn test_offset_identity_is_singular(#[case] initial: InitialJacobian) {
        // g(x) = x + 1 evaluated in floating point: differences are pure rounding noise.
        let mut residual = |x: &[f64], f: &mut [f64]| -> Result<(), Error> {
            f[0] = (x[0] + 1.0) - x[0];
            Ok(())
        };
        let mut x = [0.0];
        let err = Broyden::new(initial)
            .solve(&mut residual, &mut x, &SolverOptions::default())
            .unwrap_err();
        let Error::Convergence(failure) = err else {
            panic!("expected a convergence failure, got {err}");
        };
        assert_eq!(failure.reason, FailureReason::SingularJacobian);
        assert!(approx_eq!(f64, failure.residual_norm, 1.0, epsilon = 1e-9));
        assert!(x[0].abs() <= 1.0, "x = {}", x[0]);
    }

    #[test]
    fn test_step_length_is_bounded() {
        // Root at 1e9, far from the guess relative to the slope.
        let mut visited = Vec::new();
        let mut residual = |x: &[f64], f: &mut [f64]| -> Result<(), Error> {
            visited.push(x[0]);
            f[0] = 1e-6 * (1e9 - x[0]);
            Ok(())
        };
        let mut x = [0.0];
        let report = Broyden::default()
            .solve(&mut residual, &mut x, &SolverOptions::default())
            .unwrap();

        assert!(approx_eq!(f64, x[0], 1e9, epsilon = 0.1), "x = {}", x[0]);
        assert!(report.iterations >= 3, "{report:?}");
        for pair in visited.windows(2) {
            let bound = MAX_STEP_GROWTH * pair[0].abs().max(1.0);
            assert!((pair[1] - pair[0]).abs() <= bound * (1.0 + 1e-12), "{pair:?}");
        }
    }

    #[test]
    fn test_iteration_bound() {
        // x^2 - x + 1 has no real root; bounded by max_iterations
        let mut evaluations = 0;
        let mut residual = |x: &[f64], f: &mut [f64]| -> Result<(), Error> {
            evaluations += 1;
            f[0] = x[0] * x[0] + 1.0 - x[0];
            Ok(())
        };
        let options = SolverOptions {
            max_iterations: 5,
            ..Default::default()
        };
        let mut x = [0.3];
        let err = Broyden::default()
            .solve(&mut residual, &mut x, &options)
            .unwrap_err();
        let Error::Convergence(failure) = err else {
            panic!("expected a convergence failure");
        };
        assert!(failure.iterations <= 5);
        assert_eq!(failure.evaluations, evaluations);
    }

    #[test]
    fn test_residual_error_aborts() {
        let mut residual = |_: &[f64], _: &mut [f64]| -> Result<(), Error> {
            Err(Error::Transport("gone".into()))
        };
        let mut x = [0.0];
        let err = Broyden::default()
            .solve(&mut residual, &mut x, &SolverOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
