use super::{
    ConvergenceFailure, FailureReason, Residual, RootFinder, SolveReport, SolverOptions,
};
use crate::Error;

/// Relaxed successive substitution: `x <- x + relaxation * f(x)`.
///
/// One evaluation per iteration. Only converges when the coupling is a contraction.
#[derive(Debug, Clone)]
pub struct FixedPoint {
    pub relaxation: f64,
}

impl Default for FixedPoint {
    fn default() -> Self {
        Self { relaxation: 1.0 }
    }
}

impl RootFinder for FixedPoint {
    fn solve(
        &mut self,
        residual: &mut Residual<'_>,
        x: &mut [f64],
        options: &SolverOptions,
    ) -> Result<SolveReport, Error> {
        let mut f = vec![0.0; x.len()];
        let mut evaluations = 0;
        let mut iterations = 0;

        loop {
            residual(x, &mut f)?;
            evaluations += 1;
            let norm = options.norm.of(&f);
            log::debug!("Fixed-point iteration {iterations}: |f| = {norm:e}");

            if norm <= options.tolerance {
                return Ok(SolveReport {
                    iterations,
                    evaluations,
                    residual_norm: norm,
                });
            }
            if !norm.is_finite() || iterations == options.max_iterations {
                let reason = if norm.is_finite() {
                    FailureReason::MaxIterations
                } else {
                    FailureReason::NonFinite
                };
                return Err(Error::Convergence(ConvergenceFailure {
                    unknowns: Vec::new(),
                    residual: f,
                    residual_norm: norm,
                    iterations,
                    evaluations,
                    reason,
                }));
            }

            for (xi, fi) in x.iter_mut().zip(&f) {
                *xi += self.relaxation * fi;
            }
            iterations += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use float_cmp::approx_eq;

    use super::*;

    #[test]
    fn test_contraction() {
        // x = u / 2, u = 2 - x as a single substitution x = (2 - x) / 2
        let mut residual = |x: &[f64], f: &mut [f64]| -> Result<(), Error> {
            f[0] = (2.0 - x[0]) / 2.0 - x[0];
            Ok(())
        };
        let mut x = [0.0];
        let options = SolverOptions::default();
        // relaxation 2/3 solves this linear map in one step
        let report = FixedPoint { relaxation: 2.0 / 3.0 }
            .solve(&mut residual, &mut x, &options)
            .unwrap();
        assert!(approx_eq!(f64, x[0], 2.0 / 3.0, epsilon = 1e-12));
        assert!(report.evaluations <= 3);
    }

    #[test]
    fn test_divergent_map_is_bounded() {
        let mut residual = |x: &[f64], f: &mut [f64]| -> Result<(), Error> {
            f[0] = 3.0 * x[0] + 1.0 - x[0];
            Ok(())
        };
        let options = SolverOptions {
            max_iterations: 10,
            ..Default::default()
        };
        let mut x = [0.0];
        let err = FixedPoint::default()
            .solve(&mut residual, &mut x, &options)
            .unwrap_err();
        let Error::Convergence(failure) = err else {
            panic!("expected a convergence failure");
        };
        assert_eq!(failure.iterations, 10);
        assert_eq!(failure.evaluations, 11);
    }
}
