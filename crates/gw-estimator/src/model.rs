//! Measurement model h(x) and its Jacobian.
//!
//! The state vector is `[θ_1..θ_{n-1}, V_0..V_{n-1}]`: voltage angles at
//! every bus except the slack (whose angle is fixed at zero) followed by
//! voltage magnitudes at every bus. Each supported measurement kind maps
//! the state to a predicted value in the measurement's own units
//! (pu, MW/Mvar on the configured MVA base, degrees), and contributes one
//! analytic Jacobian row.

use num_complex::Complex64;
use std::collections::HashMap;

use gw_core::{BranchId, BusId, ElementRef, MeasKind, Measurement, Network};

use crate::EstimatorError;

const DEG_PER_RAD: f64 = 180.0 / std::f64::consts::PI;

/// From-end admittance terms of one in-service branch.
#[derive(Debug, Clone, Copy)]
struct BranchAdmittance {
    from: usize,
    to: usize,
    g_ff: f64,
    b_ff: f64,
    g_ft: f64,
    b_ft: f64,
}

/// A measurement resolved against the network topology.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ResolvedMeas {
    BusVoltage(usize),
    BusAngle(usize),
    BusInjectionP(usize),
    BusInjectionQ(usize),
    BranchFlowP(BranchId),
    BranchFlowQ(BranchId),
}

/// Network-derived quantities the Gauss-Newton iteration needs:
/// bus ordering, admittance matrix and per-branch from-end admittances.
pub(crate) struct MeasurementModel {
    buses: Vec<BusId>,
    bus_idx: HashMap<BusId, usize>,
    slack: usize,
    /// Dense Y-bus: `(G_ij, B_ij)` per entry
    y_bus: Vec<Vec<(f64, f64)>>,
    branch_adm: HashMap<BranchId, BranchAdmittance>,
    base_mva: f64,
}

impl MeasurementModel {
    pub(crate) fn build(network: &Network, base_mva: f64) -> Result<Self, EstimatorError> {
        let bus_list = network.buses();
        if bus_list.len() < 2 {
            return Err(EstimatorError::Validation(
                "network must contain at least two buses".to_string(),
            ));
        }

        let buses: Vec<BusId> = bus_list.iter().map(|b| b.id).collect();
        let bus_idx: HashMap<BusId, usize> =
            buses.iter().enumerate().map(|(i, &id)| (id, i)).collect();
        let slack_id = network.slack_bus().ok_or_else(|| {
            EstimatorError::Validation("network has no slack bus".to_string())
        })?;
        let slack = bus_idx[&slack_id];

        let n = buses.len();
        let mut y_bus = vec![vec![(0.0, 0.0); n]; n];
        let mut branch_adm = HashMap::new();

        for branch in network.branches_in_service() {
            let (Some(&i), Some(&j)) = (bus_idx.get(&branch.from_bus), bus_idx.get(&branch.to_bus))
            else {
                return Err(EstimatorError::Validation(format!(
                    "branch {} references unknown bus",
                    branch.id.value()
                )));
            };

            let z = Complex64::new(branch.resistance, branch.reactance);
            if z.norm_sqr() < 1e-12 {
                continue; // zero-impedance branches carry no model information
            }
            let y_series = z.inv();
            let b_shunt = branch.charging_b.value() / 2.0;

            let tap_mag = if branch.tap_ratio > 0.0 {
                branch.tap_ratio
            } else {
                1.0
            };
            let tap = Complex64::from_polar(tap_mag, branch.phase_shift.value());
            let tap_mag_sq = tap_mag * tap_mag;

            let y_ff = y_series / tap_mag_sq + Complex64::new(0.0, b_shunt);
            let y_ft = -(y_series / tap.conj());
            let y_tf = -(y_series / tap);
            let y_tt = y_series + Complex64::new(0.0, b_shunt);

            y_bus[i][j].0 += y_ft.re;
            y_bus[i][j].1 += y_ft.im;
            y_bus[j][i].0 += y_tf.re;
            y_bus[j][i].1 += y_tf.im;
            y_bus[i][i].0 += y_ff.re;
            y_bus[i][i].1 += y_ff.im;
            y_bus[j][j].0 += y_tt.re;
            y_bus[j][j].1 += y_tt.im;

            branch_adm.insert(
                branch.id,
                BranchAdmittance {
                    from: i,
                    to: j,
                    g_ff: y_ff.re,
                    b_ff: y_ff.im,
                    g_ft: y_ft.re,
                    b_ft: y_ft.im,
                },
            );
        }

        Ok(Self {
            buses,
            bus_idx,
            slack,
            y_bus,
            branch_adm,
            base_mva,
        })
    }

    pub(crate) fn num_buses(&self) -> usize {
        self.buses.len()
    }

    /// Angles at all non-slack buses plus magnitudes at every bus.
    pub(crate) fn num_states(&self) -> usize {
        2 * self.buses.len() - 1
    }

    pub(crate) fn bus_ids(&self) -> &[BusId] {
        &self.buses
    }

    pub(crate) fn is_slack(&self, bus_pos: usize) -> bool {
        bus_pos == self.slack
    }

    /// Map a raw measurement onto the topology, rejecting unknown
    /// elements and kinds the estimator cannot predict.
    pub(crate) fn resolve(&self, meas: &Measurement) -> Result<ResolvedMeas, EstimatorError> {
        if !(meas.std_dev > 0.0) {
            return Err(EstimatorError::Validation(format!(
                "measurement {} has non-positive std_dev {}",
                meas.key(),
                meas.std_dev
            )));
        }
        match (meas.element, meas.kind) {
            (ElementRef::Bus(id), kind) => {
                let &i = self.bus_idx.get(&id).ok_or_else(|| {
                    EstimatorError::Validation(format!("unknown bus id {}", id.value()))
                })?;
                match kind {
                    MeasKind::V => Ok(ResolvedMeas::BusVoltage(i)),
                    MeasKind::Angle => Ok(ResolvedMeas::BusAngle(i)),
                    MeasKind::P => Ok(ResolvedMeas::BusInjectionP(i)),
                    MeasKind::Q => Ok(ResolvedMeas::BusInjectionQ(i)),
                    MeasKind::Freq => Err(EstimatorError::Validation(format!(
                        "measurement {}: frequency is not an estimable quantity",
                        meas.key()
                    ))),
                }
            }
            (ElementRef::Branch(id), kind) => {
                if !self.branch_adm.contains_key(&id) {
                    return Err(EstimatorError::Validation(format!(
                        "unknown or out-of-service branch id {}",
                        id.value()
                    )));
                }
                match kind {
                    MeasKind::P => Ok(ResolvedMeas::BranchFlowP(id)),
                    MeasKind::Q => Ok(ResolvedMeas::BranchFlowQ(id)),
                    other => Err(EstimatorError::Validation(format!(
                        "measurement {}: '{}' is not defined on a branch",
                        meas.key(),
                        other
                    ))),
                }
            }
        }
    }

    /// Buses no resolved measurement touches, for observability diagnostics.
    pub(crate) fn uncovered_buses(&self, resolved: &[ResolvedMeas]) -> Vec<BusId> {
        let n = self.buses.len();
        let mut covered = vec![false; n];
        for m in resolved {
            match *m {
                ResolvedMeas::BusVoltage(i)
                | ResolvedMeas::BusAngle(i)
                | ResolvedMeas::BusInjectionP(i)
                | ResolvedMeas::BusInjectionQ(i) => covered[i] = true,
                ResolvedMeas::BranchFlowP(id) | ResolvedMeas::BranchFlowQ(id) => {
                    if let Some(adm) = self.branch_adm.get(&id) {
                        covered[adm.from] = true;
                        covered[adm.to] = true;
                    }
                }
            }
        }
        covered
            .iter()
            .enumerate()
            .filter(|(_, &c)| !c)
            .map(|(i, _)| self.buses[i])
            .collect()
    }

    /// Predicted value of one measurement at the given state.
    pub(crate) fn predict(&self, meas: &ResolvedMeas, v_mag: &[f64], v_ang: &[f64]) -> f64 {
        match *meas {
            ResolvedMeas::BusVoltage(i) => v_mag[i],
            ResolvedMeas::BusAngle(i) => v_ang[i] * DEG_PER_RAD,
            ResolvedMeas::BusInjectionP(i) => self.injection(i, v_mag, v_ang).0 * self.base_mva,
            ResolvedMeas::BusInjectionQ(i) => self.injection(i, v_mag, v_ang).1 * self.base_mva,
            ResolvedMeas::BranchFlowP(id) => {
                let a = self.branch_adm[&id];
                let (vf, vt) = (v_mag[a.from], v_mag[a.to]);
                let theta = v_ang[a.from] - v_ang[a.to];
                let p = vf * vf * a.g_ff + vf * vt * (a.g_ft * theta.cos() + a.b_ft * theta.sin());
                p * self.base_mva
            }
            ResolvedMeas::BranchFlowQ(id) => {
                let a = self.branch_adm[&id];
                let (vf, vt) = (v_mag[a.from], v_mag[a.to]);
                let theta = v_ang[a.from] - v_ang[a.to];
                let q = -vf * vf * a.b_ff + vf * vt * (a.g_ft * theta.sin() - a.b_ft * theta.cos());
                q * self.base_mva
            }
        }
    }

    /// Write one Jacobian row (derivatives of the prediction with respect
    /// to every state variable) into `row`.
    pub(crate) fn jacobian_row(
        &self,
        meas: &ResolvedMeas,
        v_mag: &[f64],
        v_ang: &[f64],
        row: &mut [f64],
    ) {
        row.fill(0.0);
        let n = self.buses.len();
        match *meas {
            ResolvedMeas::BusVoltage(i) => {
                row[self.col_v(i)] = 1.0;
            }
            ResolvedMeas::BusAngle(i) => {
                if let Some(col) = self.col_theta(i) {
                    row[col] = DEG_PER_RAD;
                }
            }
            ResolvedMeas::BusInjectionP(i) => {
                for j in 0..n {
                    if let Some(col) = self.col_theta(j) {
                        row[col] = self.dp_dtheta(i, j, v_mag, v_ang) * self.base_mva;
                    }
                    row[self.col_v(j)] = self.dp_dv(i, j, v_mag, v_ang) * self.base_mva;
                }
            }
            ResolvedMeas::BusInjectionQ(i) => {
                for j in 0..n {
                    if let Some(col) = self.col_theta(j) {
                        row[col] = self.dq_dtheta(i, j, v_mag, v_ang) * self.base_mva;
                    }
                    row[self.col_v(j)] = self.dq_dv(i, j, v_mag, v_ang) * self.base_mva;
                }
            }
            ResolvedMeas::BranchFlowP(id) => {
                let a = self.branch_adm[&id];
                let (vf, vt) = (v_mag[a.from], v_mag[a.to]);
                let theta = v_ang[a.from] - v_ang[a.to];
                let dp_dtheta_f = vf * vt * (-a.g_ft * theta.sin() + a.b_ft * theta.cos());
                if let Some(col) = self.col_theta(a.from) {
                    row[col] = dp_dtheta_f * self.base_mva;
                }
                if let Some(col) = self.col_theta(a.to) {
                    row[col] = -dp_dtheta_f * self.base_mva;
                }
                let flow_term = a.g_ft * theta.cos() + a.b_ft * theta.sin();
                row[self.col_v(a.from)] = (2.0 * vf * a.g_ff + vt * flow_term) * self.base_mva;
                row[self.col_v(a.to)] = vf * flow_term * self.base_mva;
            }
            ResolvedMeas::BranchFlowQ(id) => {
                let a = self.branch_adm[&id];
                let (vf, vt) = (v_mag[a.from], v_mag[a.to]);
                let theta = v_ang[a.from] - v_ang[a.to];
                let dq_dtheta_f = vf * vt * (a.g_ft * theta.cos() + a.b_ft * theta.sin());
                if let Some(col) = self.col_theta(a.from) {
                    row[col] = dq_dtheta_f * self.base_mva;
                }
                if let Some(col) = self.col_theta(a.to) {
                    row[col] = -dq_dtheta_f * self.base_mva;
                }
                let flow_term = a.g_ft * theta.sin() - a.b_ft * theta.cos();
                row[self.col_v(a.from)] = (-2.0 * vf * a.b_ff + vt * flow_term) * self.base_mva;
                row[self.col_v(a.to)] = vf * flow_term * self.base_mva;
            }
        }
    }

    /// State-vector column of bus `j`'s angle; `None` for the slack.
    fn col_theta(&self, j: usize) -> Option<usize> {
        use std::cmp::Ordering;
        match j.cmp(&self.slack) {
            Ordering::Less => Some(j),
            Ordering::Equal => None,
            Ordering::Greater => Some(j - 1),
        }
    }

    /// State-vector column of bus `j`'s voltage magnitude.
    fn col_v(&self, j: usize) -> usize {
        (self.buses.len() - 1) + j
    }

    /// Net complex power injection at bus `i` in per-unit.
    fn injection(&self, i: usize, v_mag: &[f64], v_ang: &[f64]) -> (f64, f64) {
        let n = self.buses.len();
        let mut p = 0.0;
        let mut q = 0.0;
        for j in 0..n {
            let (g_ij, b_ij) = self.y_bus[i][j];
            let theta_ij = v_ang[i] - v_ang[j];
            p += v_mag[i] * v_mag[j] * (g_ij * theta_ij.cos() + b_ij * theta_ij.sin());
            q += v_mag[i] * v_mag[j] * (g_ij * theta_ij.sin() - b_ij * theta_ij.cos());
        }
        (p, q)
    }

    /// ∂P_i/∂θ_j
    fn dp_dtheta(&self, i: usize, j: usize, v_mag: &[f64], v_ang: &[f64]) -> f64 {
        let (g_ij, b_ij) = self.y_bus[i][j];
        let theta_ij = v_ang[i] - v_ang[j];
        if i == j {
            let (_, q_i) = self.injection(i, v_mag, v_ang);
            -q_i - b_ij * v_mag[i] * v_mag[i]
        } else {
            v_mag[i] * v_mag[j] * (g_ij * theta_ij.sin() - b_ij * theta_ij.cos())
        }
    }

    /// ∂P_i/∂V_j
    fn dp_dv(&self, i: usize, j: usize, v_mag: &[f64], v_ang: &[f64]) -> f64 {
        let (g_ij, b_ij) = self.y_bus[i][j];
        let theta_ij = v_ang[i] - v_ang[j];
        if i == j {
            let (p_i, _) = self.injection(i, v_mag, v_ang);
            p_i / v_mag[i] + g_ij * v_mag[i]
        } else {
            v_mag[i] * (g_ij * theta_ij.cos() + b_ij * theta_ij.sin())
        }
    }

    /// ∂Q_i/∂θ_j
    fn dq_dtheta(&self, i: usize, j: usize, v_mag: &[f64], v_ang: &[f64]) -> f64 {
        let (g_ij, b_ij) = self.y_bus[i][j];
        let theta_ij = v_ang[i] - v_ang[j];
        if i == j {
            let (p_i, _) = self.injection(i, v_mag, v_ang);
            p_i - g_ij * v_mag[i] * v_mag[i]
        } else {
            -v_mag[i] * v_mag[j] * (g_ij * theta_ij.cos() + b_ij * theta_ij.sin())
        }
    }

    /// ∂Q_i/∂V_j
    fn dq_dv(&self, i: usize, j: usize, v_mag: &[f64], v_ang: &[f64]) -> f64 {
        let (g_ij, b_ij) = self.y_bus[i][j];
        let theta_ij = v_ang[i] - v_ang[j];
        if i == j {
            let (_, q_i) = self.injection(i, v_mag, v_ang);
            q_i / v_mag[i] - b_ij * v_mag[i]
        } else {
            v_mag[i] * (g_ij * theta_ij.sin() - b_ij * theta_ij.cos())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw_core::{Branch, Bus, Edge, Kilovolts, Node, Stream};

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
        network
    }

    #[test]
    fn state_dimensions() {
        let model = MeasurementModel::build(&three_bus_network(), 100.0).unwrap();
        assert_eq!(model.num_buses(), 3);
        assert_eq!(model.num_states(), 5);
    }

    #[test]
    fn resolve_rejects_unknown_elements() {
        let model = MeasurementModel::build(&three_bus_network(), 100.0).unwrap();
        let bad_bus = Measurement::new(
            Stream::Scada,
            ElementRef::Bus(BusId::new(17)),
            MeasKind::V,
            1.0,
            0.01,
        );
        assert!(matches!(
            model.resolve(&bad_bus),
            Err(EstimatorError::Validation(_))
        ));

        let freq = Measurement::new(
            Stream::Pmu,
            ElementRef::Bus(BusId::new(0)),
            MeasKind::Freq,
            60.0,
            0.005,
        );
        assert!(matches!(
            model.resolve(&freq),
            Err(EstimatorError::Validation(_))
        ));

        let v_on_branch = Measurement::new(
            Stream::Scada,
            ElementRef::Branch(BranchId::new(0)),
            MeasKind::V,
            1.0,
            0.01,
        );
        assert!(matches!(
            model.resolve(&v_on_branch),
            Err(EstimatorError::Validation(_))
        ));
    }

    #[test]
    fn flat_state_predicts_zero_flow() {
        let model = MeasurementModel::build(&three_bus_network(), 100.0).unwrap();
        let v_mag = vec![1.0; 3];
        let v_ang = vec![0.0; 3];
        let flow = model.resolve(&Measurement::new(
            Stream::Scada,
            ElementRef::Branch(BranchId::new(0)),
            MeasKind::P,
            0.0,
            0.5,
        ));
        let p = model.predict(&flow.unwrap(), &v_mag, &v_ang);
        assert!(p.abs() < 1e-9, "flat start should carry no flow, got {p}");
    }

    #[test]
    fn jacobian_matches_finite_difference() {
        let model = MeasurementModel::build(&three_bus_network(), 100.0).unwrap();
        let v_mag = vec![1.02, 0.99, 0.97];
        let v_ang = vec![0.0, -0.05, -0.11];
        let n_states = model.num_states();

        let measurements = [
            Measurement::new(
                Stream::Scada,
                ElementRef::Branch(BranchId::new(0)),
                MeasKind::P,
                0.0,
                0.5,
            ),
            Measurement::new(
                Stream::Scada,
                ElementRef::Branch(BranchId::new(1)),
                MeasKind::Q,
                0.0,
                0.5,
            ),
            Measurement::new(
                Stream::Scada,
                ElementRef::Bus(BusId::new(1)),
                MeasKind::P,
                0.0,
                0.5,
            ),
            Measurement::new(
                Stream::Scada,
                ElementRef::Bus(BusId::new(2)),
                MeasKind::Q,
                0.0,
                0.5,
            ),
        ];

        let eps = 1e-7;
        for meas in &measurements {
            let resolved = model.resolve(meas).unwrap();
            let mut row = vec![0.0; n_states];
            model.jacobian_row(&resolved, &v_mag, &v_ang, &mut row);

            for s in 0..n_states {
                // Perturb state variable s: angles occupy the first n-1
                // slots (slack is bus 0 here), magnitudes the rest.
                let mut v_mag_p = v_mag.clone();
                let mut v_ang_p = v_ang.clone();
                if s < 2 {
                    v_ang_p[s + 1] += eps;
                } else {
                    v_mag_p[s - 2] += eps;
                }
                let fd = (model.predict(&resolved, &v_mag_p, &v_ang_p)
                    - model.predict(&resolved, &v_mag, &v_ang))
                    / eps;
                assert!(
                    (fd - row[s]).abs() < 1e-3,
                    "d(h)/dx[{s}] mismatch: analytic {} vs fd {fd}",
                    row[s]
                );
            }
        }
    }

    #[test]
    fn uncovered_buses_reported() {
        let model = MeasurementModel::build(&three_bus_network(), 100.0).unwrap();
        let resolved = vec![model
            .resolve(&Measurement::new(
                Stream::Scada,
                ElementRef::Bus(BusId::new(0)),
                MeasKind::V,
                1.0,
                0.01,
            ))
            .unwrap()];
        let uncovered = model.uncovered_buses(&resolved);
        assert_eq!(uncovered, vec![BusId::new(1), BusId::new(2)]);
    }
}
