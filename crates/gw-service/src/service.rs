//! The engine facade.
//!
//! [`EstimationService`] wires the estimator, calibration store,
//! contingency engine and telemetry generator to a grid catalog and a
//! power-flow collaborator, and is the single entry point embedders
//! talk to.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use gw_calib::{CalibrationFactor, CalibrationStore};
use gw_core::{
    ElementRef, MeasKind, Measurement, Network, PowerFlow, PowerFlowSolution, Stream,
};
use gw_estimator::{
    bad_data, Algorithm, BadDataReport, CalibrationSuggestion, StateEstimate, StateEstimator,
};
use gw_rtca::{JobEvent, JobId, JobRegistry, JobSnapshot, JobStatus, ScanConfig, ScanResult};
use gw_telemetry::{TelemetryFrame, TelemetryGenerator, TelemetryParams};

use crate::catalog::GridSource;
use crate::config::ServiceConfig;
use crate::error::ServiceError;

/// Sigma floor for generated per-unit measurements
const SIGMA_FLOOR_PU: f64 = 0.01;
/// Sigma floor for generated MW/Mvar measurements
const SIGMA_FLOOR_MW: f64 = 0.1;

/// An estimation run with its bad-data screening attached.
#[derive(Debug, Clone, Serialize)]
pub struct EstimationOutcome {
    pub estimate: StateEstimate,
    pub bad_data: BadDataReport,
}

/// Facade over the estimation-and-security engine.
pub struct EstimationService {
    grids: Arc<dyn GridSource>,
    solver: Arc<dyn PowerFlow>,
    calibration: Arc<CalibrationStore>,
    jobs: Arc<JobRegistry>,
    config: ServiceConfig,
}

impl EstimationService {
    pub fn new(
        grids: Arc<dyn GridSource>,
        solver: Arc<dyn PowerFlow>,
        calibration: Arc<CalibrationStore>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            grids,
            solver,
            calibration,
            jobs: JobRegistry::shared(),
            config,
        }
    }

    pub fn calibration(&self) -> &Arc<CalibrationStore> {
        &self.calibration
    }

    pub fn grid_ids(&self) -> Vec<String> {
        self.grids.grid_ids()
    }

    fn network(&self, grid_id: &str) -> Result<Network, ServiceError> {
        self.grids
            .network(grid_id)
            .ok_or_else(|| ServiceError::GridNotFound(grid_id.to_string()))
    }

    fn solve(&self, grid_id: &str, network: &Network) -> Result<PowerFlowSolution, ServiceError> {
        let solution = self.solver.solve(network).map_err(ServiceError::PowerFlow)?;
        if !solution.converged {
            return Err(ServiceError::PowerFlowDiverged(grid_id.to_string()));
        }
        Ok(solution)
    }

    /// Build a SCADA measurement set from the solved base case: voltage
    /// magnitude at every bus plus from-end P/Q on every in-service
    /// branch, with relative sigmas floored per quantity type.
    pub fn default_measurements(&self, grid_id: &str) -> Result<Vec<Measurement>, ServiceError> {
        let network = self.network(grid_id)?;
        let solution = self.solve(grid_id, &network)?;
        let noise = self.config.default_noise;

        let mut measurements = Vec::new();
        for bus in &solution.bus_results {
            measurements.push(Measurement::new(
                Stream::Scada,
                ElementRef::Bus(bus.id),
                MeasKind::V,
                bus.vm_pu,
                (noise * bus.vm_pu.abs()).max(SIGMA_FLOOR_PU),
            ));
        }
        for branch in &solution.branch_results {
            let element = ElementRef::Branch(branch.id);
            measurements.push(Measurement::new(
                Stream::Scada,
                element,
                MeasKind::P,
                branch.p_from_mw,
                (noise * branch.p_from_mw.abs()).max(SIGMA_FLOOR_MW),
            ));
            measurements.push(Measurement::new(
                Stream::Scada,
                element,
                MeasKind::Q,
                branch.q_from_mvar,
                (noise * branch.q_from_mvar.abs()).max(SIGMA_FLOOR_MW),
            ));
        }
        Ok(measurements)
    }

    /// Run state estimation and bad-data screening on a grid.
    ///
    /// With no measurement set supplied, one is generated from the base
    /// case. Calibration corrections are applied before estimation, and
    /// frequency channels (telemetry-only) are dropped.
    pub fn estimate(
        &self,
        grid_id: &str,
        measurements: Option<Vec<Measurement>>,
        algorithm: Algorithm,
    ) -> Result<EstimationOutcome, ServiceError> {
        let network = self.network(grid_id)?;
        let mut measurements = match measurements {
            Some(m) => m,
            None => self.default_measurements(grid_id)?,
        };
        measurements.retain(|m| m.kind != MeasKind::Freq);
        self.calibration.correct_all(&mut measurements);

        let estimator = StateEstimator::new(algorithm)
            .epsilon(self.config.epsilon)
            .max_iterations(self.config.max_iterations)
            .base_mva(self.config.base_mva)
            .huber_k(self.config.huber_k);
        let estimate = estimator.estimate(&network, &measurements)?;
        let report = bad_data::detect(&estimate, self.config.confidence);

        tracing::info!(
            grid_id,
            iterations = estimate.iterations,
            chi_square = report.chi_square,
            global_suspect = report.global_suspect,
            "estimation finished"
        );
        Ok(EstimationOutcome {
            estimate,
            bad_data: report,
        })
    }

    /// Bad-data screening only, discarding the state solution.
    ///
    /// `confidence` overrides the configured chi-square level for this
    /// call; `None` uses [`ServiceConfig::confidence`].
    pub fn bad_data_check(
        &self,
        grid_id: &str,
        measurements: Option<Vec<Measurement>>,
        algorithm: Algorithm,
        confidence: Option<f64>,
    ) -> Result<BadDataReport, ServiceError> {
        let outcome = self.estimate(grid_id, measurements, algorithm)?;
        let confidence = confidence.unwrap_or(self.config.confidence);
        Ok(bad_data::detect(&outcome.estimate, confidence))
    }

    /// Persist a calibration suggestion from bad-data analysis.
    pub fn apply_suggestion(
        &self,
        suggestion: &CalibrationSuggestion,
    ) -> Result<CalibrationFactor, ServiceError> {
        Ok(self
            .calibration
            .apply(suggestion.key, suggestion.scale, suggestion.bias)?)
    }

    /// Start a contingency scan job for a grid.
    pub fn start_scan(&self, grid_id: &str, config: ScanConfig) -> Result<JobId, ServiceError> {
        let network = self.network(grid_id)?;
        Ok(self
            .jobs
            .spawn_scan(grid_id, network, self.solver.clone(), config))
    }

    pub fn scan_status(&self, id: JobId) -> Result<JobStatus, ServiceError> {
        Ok(self.jobs.status(id)?)
    }

    /// The job with its grid and lifecycle timestamps.
    pub fn scan_job(&self, id: JobId) -> Result<JobSnapshot, ServiceError> {
        Ok(self.jobs.get(id)?)
    }

    pub fn scan_result(&self, id: JobId) -> Result<Option<Arc<ScanResult>>, ServiceError> {
        Ok(self.jobs.result(id)?)
    }

    pub fn subscribe_scan(
        &self,
        id: JobId,
    ) -> Result<broadcast::Receiver<JobEvent>, ServiceError> {
        Ok(self.jobs.subscribe(id)?)
    }

    pub fn cancel_scan(&self, id: JobId) -> Result<(), ServiceError> {
        Ok(self.jobs.cancel(id)?)
    }

    /// Start a synthetic telemetry stream for a grid, with stored
    /// calibrations applied to every frame.
    pub fn stream_telemetry(
        &self,
        grid_id: &str,
        params: TelemetryParams,
    ) -> Result<(mpsc::Receiver<TelemetryFrame>, JoinHandle<()>), ServiceError> {
        let network = self.network(grid_id)?;
        let generator = TelemetryGenerator::new(network, self.solver.clone(), params)
            .with_calibration(self.calibration.clone());
        Ok(generator.spawn())
    }
}
