//! Contingency scan execution and security screening.
//!
//! Each case is applied as an outage copy of the base network, handed
//! to the power-flow collaborator, and the solved operating point is
//! screened against thermal, voltage and angle-spread limits. Cases
//! whose solve fails or does not converge are counted but never ranked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use gw_core::{BranchId, BusId, Network, PowerFlow, PowerFlowSolution};

use crate::contingency::{enumerate_n1, enumerate_n2, Contingency};
use crate::RtcaError;

/// Security screening limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Limits {
    /// Thermal limit as percent of branch rating
    pub loading_percent: f64,
    /// Lower voltage band (pu)
    pub v_low_pu: f64,
    /// Upper voltage band (pu)
    pub v_high_pu: f64,
    /// Maximum angle difference across an in-service branch (degrees)
    pub angle_spread_deg: f64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            loading_percent: 100.0,
            v_low_pu: 0.95,
            v_high_pu: 1.05,
            angle_spread_deg: 30.0,
        }
    }
}

/// Which cases a scan covers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanKind {
    N1,
    N2,
    Custom(Vec<Contingency>),
}

impl ScanKind {
    fn cases(&self, network: &Network) -> Vec<Contingency> {
        match self {
            ScanKind::N1 => enumerate_n1(network),
            ScanKind::N2 => enumerate_n2(network),
            ScanKind::Custom(cases) => cases.clone(),
        }
    }
}

/// Scan parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    pub kind: ScanKind,
    /// How many ranked insecure cases to keep
    pub top_k: usize,
    pub limits: Limits,
}

impl ScanConfig {
    pub fn n1() -> Self {
        Self {
            kind: ScanKind::N1,
            top_k: 20,
            limits: Limits::default(),
        }
    }

    pub fn n2() -> Self {
        Self {
            kind: ScanKind::N2,
            ..Self::n1()
        }
    }

    pub fn custom(cases: Vec<Contingency>) -> Self {
        Self {
            kind: ScanKind::Custom(cases),
            ..Self::n1()
        }
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }
}

/// A single limit violation found in a solved outage case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    Overload {
        branch: BranchId,
        loading_percent: f64,
    },
    UnderVoltage {
        bus: BusId,
        vm_pu: f64,
    },
    OverVoltage {
        bus: BusId,
        vm_pu: f64,
    },
    AngleSpread {
        from: BusId,
        to: BusId,
        delta_deg: f64,
    },
}

/// Severity banding by the worst branch loading of the case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn from_loading(loading_percent: f64) -> Self {
        if loading_percent > 150.0 {
            Severity::Critical
        } else if loading_percent > 125.0 {
            Severity::High
        } else if loading_percent > 110.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

/// Outcome of one contingency case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutageRecord {
    pub contingency: Contingency,
    pub converged: bool,
    /// Worst loading across the remaining branches
    pub max_loading_percent: f64,
    pub violations: Vec<Violation>,
    /// Present only when the case has violations
    pub severity: Option<Severity>,
    /// Solver failure message, when the case could not be solved
    pub error: Option<String>,
}

impl OutageRecord {
    pub fn is_secure(&self) -> bool {
        self.converged && self.violations.is_empty()
    }
}

/// Aggregate counts over every case scanned.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ScanCounts {
    pub total: usize,
    pub secure: usize,
    pub insecure: usize,
    pub not_converged: usize,
    pub failed: usize,
}

/// A completed scan: ranked insecure cases plus aggregate counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    /// Insecure cases, descending by worst loading, truncated to `top_k`
    pub ranked: Vec<OutageRecord>,
    pub counts: ScanCounts,
    pub elapsed_ms: f64,
}

impl ScanResult {
    pub fn worst(&self) -> Option<&OutageRecord> {
        self.ranked.first()
    }
}

/// Per-case progress snapshot handed to the progress callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanProgress {
    pub completed: usize,
    pub total: usize,
    pub current_outage: String,
    pub elapsed_s: f64,
    /// Remaining-time estimate from the mean case duration so far
    pub eta_s: f64,
}

/// Screen one solved case against the limits.
fn screen(network: &Network, solution: &PowerFlowSolution, limits: &Limits) -> Vec<Violation> {
    let mut violations = Vec::new();

    for branch in &solution.branch_results {
        if branch.loading_percent > limits.loading_percent {
            violations.push(Violation::Overload {
                branch: branch.id,
                loading_percent: branch.loading_percent,
            });
        }
    }

    let mut angles: HashMap<BusId, f64> = HashMap::new();
    for bus in &solution.bus_results {
        angles.insert(bus.id, bus.va_degree);
        if bus.vm_pu < limits.v_low_pu {
            violations.push(Violation::UnderVoltage {
                bus: bus.id,
                vm_pu: bus.vm_pu,
            });
        } else if bus.vm_pu > limits.v_high_pu {
            violations.push(Violation::OverVoltage {
                bus: bus.id,
                vm_pu: bus.vm_pu,
            });
        }
    }

    for (from, to) in network.adjacent_bus_pairs() {
        if let (Some(&a), Some(&b)) = (angles.get(&from), angles.get(&to)) {
            let delta = (a - b).abs();
            if delta > limits.angle_spread_deg {
                violations.push(Violation::AngleSpread {
                    from,
                    to,
                    delta_deg: delta,
                });
            }
        }
    }

    violations
}

/// Run a full scan synchronously.
///
/// The cancel flag is checked before every case; a set flag aborts with
/// [`RtcaError::Cancelled`]. `on_progress` fires after each case.
pub fn run_scan<P: PowerFlow + ?Sized>(
    network: &Network,
    solver: &P,
    config: &ScanConfig,
    cancel: &AtomicBool,
    mut on_progress: impl FnMut(ScanProgress),
) -> Result<ScanResult, RtcaError> {
    let started = Instant::now();
    let cases = config.kind.cases(network);
    let total = cases.len();
    let mut counts = ScanCounts {
        total,
        ..ScanCounts::default()
    };
    let mut records: Vec<OutageRecord> = Vec::new();

    tracing::info!(total, "contingency scan started");

    for (done, case) in cases.into_iter().enumerate() {
        if cancel.load(Ordering::Relaxed) {
            tracing::info!(completed = done, total, "contingency scan cancelled");
            return Err(RtcaError::Cancelled);
        }

        let outage_net = network.with_outage(&case.outages);
        let record = match solver.solve(&outage_net) {
            Ok(solution) if solution.converged => {
                let violations = screen(&outage_net, &solution, &config.limits);
                let max_loading = solution.max_loading_percent();
                if violations.is_empty() {
                    counts.secure += 1;
                } else {
                    counts.insecure += 1;
                }
                let severity =
                    (!violations.is_empty()).then(|| Severity::from_loading(max_loading));
                OutageRecord {
                    contingency: case,
                    converged: true,
                    max_loading_percent: max_loading,
                    violations,
                    severity,
                    error: None,
                }
            }
            Ok(_) => {
                counts.not_converged += 1;
                OutageRecord {
                    contingency: case,
                    converged: false,
                    max_loading_percent: 0.0,
                    violations: vec![],
                    severity: None,
                    error: None,
                }
            }
            Err(e) => {
                counts.failed += 1;
                tracing::warn!(error = %e, "case solve failed");
                OutageRecord {
                    contingency: case,
                    converged: false,
                    max_loading_percent: 0.0,
                    violations: vec![],
                    severity: None,
                    error: Some(e.to_string()),
                }
            }
        };

        let completed = done + 1;
        let elapsed_s = started.elapsed().as_secs_f64();
        let eta_s = if completed > 0 {
            elapsed_s / completed as f64 * (total - completed) as f64
        } else {
            0.0
        };
        on_progress(ScanProgress {
            completed,
            total,
            current_outage: record.contingency.label.clone(),
            elapsed_s,
            eta_s,
        });

        records.push(record);
    }

    let mut ranked: Vec<OutageRecord> = records
        .into_iter()
        .filter(|r| r.converged && !r.violations.is_empty())
        .collect();
    ranked.sort_by(|a, b| {
        b.max_loading_percent
            .partial_cmp(&a.max_loading_percent)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked.truncate(config.top_k);

    let elapsed_ms = started.elapsed().as_secs_f64() * 1e3;
    tracing::info!(
        total,
        insecure = counts.insecure,
        elapsed_ms,
        "contingency scan finished"
    );

    Ok(ScanResult {
        ranked,
        counts,
        elapsed_ms,
    })
}
