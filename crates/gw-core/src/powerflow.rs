//! Power-flow collaborator seam.
//!
//! The engine does not solve AC load flow itself; it consumes a solver
//! supplied by a collaborator component behind the [`PowerFlow`] trait.
//! Contingency scans, telemetry truth refreshes and default-measurement
//! generation all go through this interface, so tests can substitute a
//! deterministic stand-in.

use serde::{Deserialize, Serialize};

use crate::{BranchId, BusId, Network};

/// Per-bus solved quantities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusResult {
    pub id: BusId,
    pub vm_pu: f64,
    pub va_degree: f64,
    /// Net active injection (MW)
    pub p_mw: f64,
    /// Net reactive injection (Mvar)
    pub q_mvar: f64,
}

/// Per-branch solved quantities (from-end convention).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchResult {
    pub id: BranchId,
    /// Flow as a percentage of the branch rating
    pub loading_percent: f64,
    pub p_from_mw: f64,
    pub q_from_mvar: f64,
    pub p_to_mw: f64,
}

/// Result of one power-flow solve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerFlowSolution {
    pub converged: bool,
    pub bus_results: Vec<BusResult>,
    pub branch_results: Vec<BranchResult>,
}

impl PowerFlowSolution {
    /// Highest loading percentage across all solved branches.
    pub fn max_loading_percent(&self) -> f64 {
        self.branch_results
            .iter()
            .map(|b| b.loading_percent)
            .fold(0.0, f64::max)
    }

    pub fn bus(&self, id: BusId) -> Option<&BusResult> {
        self.bus_results.iter().find(|b| b.id == id)
    }

    pub fn branch(&self, id: BranchId) -> Option<&BranchResult> {
        self.branch_results.iter().find(|b| b.id == id)
    }
}

/// External AC load-flow capability.
///
/// Implementations must be pure with respect to the passed network: the
/// contingency engine calls `solve` on outage copies from many jobs
/// concurrently.
pub trait PowerFlow: Send + Sync {
    fn solve(&self, network: &Network) -> anyhow::Result<PowerFlowSolution>;
}

impl<T: PowerFlow + ?Sized> PowerFlow for std::sync::Arc<T> {
    fn solve(&self, network: &Network) -> anyhow::Result<PowerFlowSolution> {
        (**self).solve(network)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_loading_over_empty_solution_is_zero() {
        let solution = PowerFlowSolution {
            converged: true,
            bus_results: vec![],
            branch_results: vec![],
        };
        assert_eq!(solution.max_loading_percent(), 0.0);
    }

    #[test]
    fn lookup_by_id() {
        let solution = PowerFlowSolution {
            converged: true,
            bus_results: vec![BusResult {
                id: BusId::new(2),
                vm_pu: 1.01,
                va_degree: -3.2,
                p_mw: 0.0,
                q_mvar: 0.0,
            }],
            branch_results: vec![BranchResult {
                id: BranchId::new(5),
                loading_percent: 84.0,
                p_from_mw: 42.0,
                q_from_mvar: 5.0,
                p_to_mw: -41.5,
            }],
        };
        assert!((solution.bus(BusId::new(2)).unwrap().vm_pu - 1.01).abs() < 1e-12);
        assert!(solution.branch(BranchId::new(4)).is_none());
        assert!((solution.max_loading_percent() - 84.0).abs() < 1e-12);
    }
}
