//! Weighted-least-squares state estimation with optional Huber
//! robustification.
//!
//! Gauss-Newton on the normal equations `(HᵀWH) Δx = HᵀW (z − h(x))`
//! from a flat start, with faer's partially pivoted LU factorizing the
//! gain matrix each iteration. Convergence is `max |Δx| < epsilon`.

use faer::prelude::SpSolver;
use faer::{FaerMat, Mat};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use gw_core::{BusId, Measurement, Network};

use crate::model::{MeasurementModel, ResolvedMeas};
use crate::EstimatorError;

/// Residual weighting scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Plain weighted least squares, weights `1/σ²`.
    Wls,
    /// Huber M-estimation: weights taper to `k/|r_norm| · 1/σ²` for
    /// residuals beyond `k` standard deviations, bounding the influence
    /// of gross errors.
    Huber,
}

/// One measurement's mismatch against the converged state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Residual {
    pub measurement: Measurement,
    /// `z − h(x̂)` in measurement units
    pub residual: f64,
    pub std_dev: f64,
}

impl Residual {
    /// Residual in standard deviations.
    pub fn normalized(&self) -> f64 {
        self.residual / self.std_dev
    }
}

/// The estimated operating point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEstimate {
    pub converged: bool,
    pub iterations: usize,
    pub elapsed_ms: f64,
    /// Buses in the order of the magnitude/angle vectors below
    pub bus_ids: Vec<BusId>,
    pub bus_vm_pu: Vec<f64>,
    pub bus_va_degree: Vec<f64>,
    pub residuals: Vec<Residual>,
    /// Dimension of the solved state vector, for chi-square degrees of
    /// freedom downstream
    pub num_states: usize,
}

impl StateEstimate {
    pub fn vm_pu(&self, id: BusId) -> Option<f64> {
        self.bus_ids
            .iter()
            .position(|&b| b == id)
            .map(|i| self.bus_vm_pu[i])
    }

    pub fn va_degree(&self, id: BusId) -> Option<f64> {
        self.bus_ids
            .iter()
            .position(|&b| b == id)
            .map(|i| self.bus_va_degree[i])
    }

    /// Largest absolute normalized residual.
    pub fn max_normalized_residual(&self) -> f64 {
        self.residuals
            .iter()
            .map(|r| r.normalized().abs())
            .fold(0.0, f64::max)
    }
}

/// Configurable Gauss-Newton state estimator.
#[derive(Debug, Clone)]
pub struct StateEstimator {
    algorithm: Algorithm,
    epsilon: f64,
    max_iterations: usize,
    base_mva: f64,
    huber_k: f64,
}

impl Default for StateEstimator {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Wls,
            epsilon: 1e-6,
            max_iterations: 20,
            base_mva: 100.0,
            huber_k: 1.5,
        }
    }
}

impl StateEstimator {
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            ..Self::default()
        }
    }

    /// Convergence tolerance on the state update, per-unit and radians.
    pub fn epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// System MVA base for power-measurement scaling.
    pub fn base_mva(mut self, base_mva: f64) -> Self {
        self.base_mva = base_mva;
        self
    }

    /// Huber tuning constant in standard deviations.
    pub fn huber_k(mut self, huber_k: f64) -> Self {
        self.huber_k = huber_k;
        self
    }

    /// Estimate bus voltages from the measurement set.
    pub fn estimate(
        &self,
        network: &Network,
        measurements: &[Measurement],
    ) -> Result<StateEstimate, EstimatorError> {
        let started = Instant::now();
        let model = MeasurementModel::build(network, self.base_mva)?;

        let resolved: Vec<ResolvedMeas> = measurements
            .iter()
            .map(|m| model.resolve(m))
            .collect::<Result<_, _>>()?;

        let m = resolved.len();
        let n_states = model.num_states();
        if m < n_states {
            return Err(EstimatorError::Observability {
                detail: format!(
                    "{m} measurements for {n_states} states ({} buses)",
                    model.num_buses()
                ),
            });
        }

        // Flat start
        let n_bus = model.num_buses();
        let mut v_mag = vec![1.0; n_bus];
        let mut v_ang = vec![0.0; n_bus];

        let mut jac_row = vec![0.0; n_states];
        let mut iterations = 0;
        let mut converged = false;
        let mut max_delta = f64::INFINITY;

        while iterations < self.max_iterations {
            iterations += 1;

            // Residuals and weights at the current state
            let mut residual = vec![0.0; m];
            let mut weight = vec![0.0; m];
            for (i, meas) in resolved.iter().enumerate() {
                let r = measurements[i].value - model.predict(meas, &v_mag, &v_ang);
                residual[i] = r;
                let sigma = measurements[i].std_dev;
                let base_w = 1.0 / (sigma * sigma);
                weight[i] = match self.algorithm {
                    Algorithm::Wls => base_w,
                    Algorithm::Huber => {
                        let r_norm = (r / sigma).abs();
                        if r_norm <= self.huber_k {
                            base_w
                        } else {
                            base_w * self.huber_k / r_norm
                        }
                    }
                };
            }

            // Normal equations: gain = HᵀWH, rhs = HᵀW r
            let mut gain: Mat<f64> = Mat::zeros(n_states, n_states);
            let mut rhs: Mat<f64> = Mat::zeros(n_states, 1);
            for (i, meas) in resolved.iter().enumerate() {
                model.jacobian_row(meas, &v_mag, &v_ang, &mut jac_row);
                let w = weight[i];
                for a in 0..n_states {
                    let ha = jac_row[a];
                    if ha == 0.0 {
                        continue;
                    }
                    let wha = w * ha;
                    rhs.write(a, 0, rhs.read(a, 0) + wha * residual[i]);
                    for b in 0..n_states {
                        let hb = jac_row[b];
                        if hb != 0.0 {
                            gain.write(a, b, gain.read(a, b) + wha * hb);
                        }
                    }
                }
            }

            let lu = gain.partial_piv_lu();
            let delta = lu.solve(&rhs);
            let dx: Vec<f64> = (0..n_states).map(|i| delta.read(i, 0)).collect();
            if dx.iter().any(|v| !v.is_finite()) {
                let uncovered = model.uncovered_buses(&resolved);
                let detail = if uncovered.is_empty() {
                    format!("singular gain matrix ({m} measurements, {n_states} states)")
                } else {
                    format!(
                        "singular gain matrix; buses without any measurement coverage: {:?}",
                        uncovered.iter().map(|b| b.value()).collect::<Vec<_>>()
                    )
                };
                return Err(EstimatorError::Observability { detail });
            }

            apply_update(&dx, &mut v_mag, &mut v_ang, &model);

            max_delta = dx.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
            if max_delta < self.epsilon {
                converged = true;
                break;
            }
        }

        let residuals: Vec<Residual> = resolved
            .iter()
            .zip(measurements)
            .map(|(rm, meas)| Residual {
                measurement: *meas,
                residual: meas.value - model.predict(rm, &v_mag, &v_ang),
                std_dev: meas.std_dev,
            })
            .collect();

        let estimate = StateEstimate {
            converged,
            iterations,
            elapsed_ms: started.elapsed().as_secs_f64() * 1e3,
            bus_ids: model.bus_ids().to_vec(),
            bus_vm_pu: v_mag,
            bus_va_degree: v_ang.iter().map(|a| a.to_degrees()).collect(),
            residuals,
            num_states: n_states,
        };

        if !converged {
            return Err(EstimatorError::Convergence {
                iterations,
                max_delta,
                estimate: Box::new(estimate),
            });
        }
        Ok(estimate)
    }
}

/// Scatter the state update back onto angle/magnitude vectors. The slack
/// angle stays pinned at zero.
fn apply_update(dx: &[f64], v_mag: &mut [f64], v_ang: &mut [f64], model: &MeasurementModel) {
    let n = v_mag.len();
    let mut cursor = 0;
    for (j, va) in v_ang.iter_mut().enumerate() {
        if model.is_slack(j) {
            continue;
        }
        *va += dx[cursor];
        cursor += 1;
    }
    for (j, vm) in v_mag.iter_mut().enumerate() {
        *vm += dx[(n - 1) + j];
    }
}

/// One-shot estimation with default tolerances.
pub fn estimate(
    network: &Network,
    measurements: &[Measurement],
    algorithm: Algorithm,
) -> Result<StateEstimate, EstimatorError> {
    StateEstimator::new(algorithm).estimate(network, measurements)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw_core::{
        Branch, BranchId, Bus, Edge, ElementRef, Kilovolts, MeasKind, Node, Stream,
    };

    fn three_bus_network() -> Network {
        let mut network = Network::new();
        let b0 = network.graph.add_node(Node::Bus(Bus {
            id: BusId::new(0),
            name: "Slack".to_string(),
            base_kv: Kilovolts(138.0),
            is_slack: true,
            ..Bus::default()
        }));
        let b1 = network.graph.add_node(Node::Bus(Bus {
            id: BusId::new(1),
            name: "Mid".to_string(),
            base_kv: Kilovolts(138.0),
            ..Bus::default()
        }));
        let b2 = network.graph.add_node(Node::Bus(Bus {
            id: BusId::new(2),
            name: "Load".to_string(),
            base_kv: Kilovolts(138.0),
            ..Bus::default()
        }));
        network.graph.add_edge(
            b0,
            b1,
            Edge::Branch(Branch::new(
                BranchId::new(0),
                "L01".to_string(),
                BusId::new(0),
                BusId::new(1),
                0.01,
                0.1,
            )),
        );
        network.graph.add_edge(
            b1,
            b2,
            Edge::Branch(Branch::new(
                BranchId::new(1),
                "L12".to_string(),
                BusId::new(1),
                BusId::new(2),
                0.02,
                0.15,
            )),
        );
        network.graph.add_edge(
            b0,
            b2,
            Edge::Branch(Branch::new(
                BranchId::new(2),
                "L02".to_string(),
                BusId::new(0),
                BusId::new(2),
                0.015,
                0.12,
            )),
        );
        network
    }

    /// Measurements evaluated exactly at a chosen true state.
    fn exact_measurements(network: &Network, v_mag: &[f64], v_ang: &[f64]) -> Vec<Measurement> {
        let model = MeasurementModel::build(network, 100.0).unwrap();
        let mut out = Vec::new();
        let mut push = |stream, element, kind, sigma: f64| {
            let probe = Measurement::new(stream, element, kind, 0.0, sigma);
            let resolved = model.resolve(&probe).unwrap();
            let value = model.predict(&resolved, v_mag, v_ang);
            out.push(probe.with_value(value));
        };

        for id in 0..3 {
            push(Stream::Scada, ElementRef::Bus(BusId::new(id)), MeasKind::V, 0.01);
        }
        for id in 0..3 {
            push(Stream::Scada, ElementRef::Branch(BranchId::new(id)), MeasKind::P, 0.5);
            push(Stream::Scada, ElementRef::Branch(BranchId::new(id)), MeasKind::Q, 0.5);
        }
        push(Stream::Scada, ElementRef::Bus(BusId::new(1)), MeasKind::P, 0.5);
        push(Stream::Scada, ElementRef::Bus(BusId::new(2)), MeasKind::Q, 0.5);
        out
    }

    const TRUE_VM: [f64; 3] = [1.02, 0.995, 0.978];
    const TRUE_VA: [f64; 3] = [0.0, -0.045, -0.092];

    #[test]
    fn wls_recovers_exact_state_from_noise_free_measurements() {
        let network = three_bus_network();
        let measurements = exact_measurements(&network, &TRUE_VM, &TRUE_VA);

        let estimate = estimate(&network, &measurements, Algorithm::Wls).unwrap();
        assert!(estimate.converged);
        assert!(estimate.iterations <= 10, "took {} iterations", estimate.iterations);
        for i in 0..3 {
            assert!(
                (estimate.bus_vm_pu[i] - TRUE_VM[i]).abs() < 1e-5,
                "vm[{i}]: {} vs {}",
                estimate.bus_vm_pu[i],
                TRUE_VM[i]
            );
            assert!(
                (estimate.bus_va_degree[i] - TRUE_VA[i].to_degrees()).abs() < 1e-4,
                "va[{i}]: {} vs {}",
                estimate.bus_va_degree[i],
                TRUE_VA[i].to_degrees()
            );
        }
        assert!(estimate.max_normalized_residual() < 1e-4);
        assert!((estimate.vm_pu(BusId::new(0)).unwrap() - 1.02).abs() < 1e-5);
    }

    #[test]
    fn estimation_is_deterministic() {
        let network = three_bus_network();
        let measurements = exact_measurements(&network, &TRUE_VM, &TRUE_VA);
        let a = estimate(&network, &measurements, Algorithm::Wls).unwrap();
        let b = estimate(&network, &measurements, Algorithm::Wls).unwrap();
        assert_eq!(a.iterations, b.iterations);
        assert_eq!(a.bus_vm_pu, b.bus_vm_pu);
        assert_eq!(a.bus_va_degree, b.bus_va_degree);
    }

    #[test]
    fn huber_resists_a_gross_error_better_than_wls() {
        let network = three_bus_network();
        let mut measurements = exact_measurements(&network, &TRUE_VM, &TRUE_VA);
        // Corrupt one flow measurement by 10 sigma.
        let idx = measurements
            .iter()
            .position(|m| {
                m.element == ElementRef::Branch(BranchId::new(1)) && m.kind == MeasKind::P
            })
            .unwrap();
        measurements[idx].value += 10.0 * measurements[idx].std_dev;

        let wls = estimate(&network, &measurements, Algorithm::Wls).unwrap();
        let huber = estimate(&network, &measurements, Algorithm::Huber).unwrap();

        // A flow outlier pulls the angle profile; Huber's tapered weights
        // absorb far less of it than plain least squares.
        let angle_err = |e: &StateEstimate| {
            (0..3)
                .map(|i| (e.bus_va_degree[i] - TRUE_VA[i].to_degrees()).abs())
                .fold(0.0_f64, f64::max)
        };
        assert!(
            angle_err(&huber) < angle_err(&wls),
            "huber {} vs wls {}",
            angle_err(&huber),
            angle_err(&wls)
        );
        // The corrupted channel stays visible in the Huber residuals.
        assert!(huber.max_normalized_residual() > 3.0);
    }

    #[test]
    fn underdetermined_set_is_rejected() {
        let network = three_bus_network();
        let measurements = vec![Measurement::new(
            Stream::Scada,
            ElementRef::Bus(BusId::new(0)),
            MeasKind::V,
            1.0,
            0.01,
        )];
        let err = estimate(&network, &measurements, Algorithm::Wls).unwrap_err();
        assert!(matches!(err, EstimatorError::Observability { .. }));
    }

    #[test]
    fn iteration_cap_yields_convergence_error_with_partial_estimate() {
        let network = three_bus_network();
        let measurements = exact_measurements(&network, &TRUE_VM, &TRUE_VA);
        let err = StateEstimator::new(Algorithm::Wls)
            .max_iterations(1)
            .epsilon(1e-12)
            .estimate(&network, &measurements)
            .unwrap_err();
        match err {
            EstimatorError::Convergence {
                iterations,
                estimate,
                ..
            } => {
                assert_eq!(iterations, 1);
                assert!(!estimate.converged);
                assert_eq!(estimate.bus_ids.len(), 3);
            }
            other => panic!("expected convergence error, got {other}"),
        }
    }

    #[test]
    fn angle_measurements_participate() {
        let network = three_bus_network();
        let mut measurements = exact_measurements(&network, &TRUE_VM, &TRUE_VA);
        let model = MeasurementModel::build(&network, 100.0).unwrap();
        for id in 1..3 {
            let probe = Measurement::new(
                Stream::Pmu,
                ElementRef::Bus(BusId::new(id)),
                MeasKind::Angle,
                0.0,
                0.01,
            );
            let resolved = model.resolve(&probe).unwrap();
            let value = model.predict(&resolved, &TRUE_VM, &TRUE_VA);
            measurements.push(probe.with_value(value));
        }
        let estimate = estimate(&network, &measurements, Algorithm::Wls).unwrap();
        assert!((estimate.bus_va_degree[2] - TRUE_VA[2].to_degrees()).abs() < 1e-4);
    }
}
