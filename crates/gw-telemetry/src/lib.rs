//! # gw-telemetry: Synthetic Measurement Streams
//!
//! Emits PMU and SCADA telemetry frames derived from a solved operating
//! point, degraded the way real instrumentation degrades: slow sensor
//! drift, Gaussian noise, and occasional gross errors, with calibration
//! corrections applied last so the stream reflects what a corrected
//! front end would hand to the estimator.
//!
//! Seeded runs are bit-reproducible: frame cadence and drift are derived
//! from the tick counter, never from wall-clock time. Frames flow over a
//! bounded tokio channel; dropping the receiver stops the generator.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use gw_calib::CalibrationStore;
use gw_core::{
    ElementRef, Load, MeasKind, Measurement, Network, Node, PowerFlow, PowerFlowSolution, Stream,
};

const NOMINAL_FREQ_HZ: f64 = 60.0;
const FREQ_SIGMA_HZ: f64 = 0.02;
/// Noise floor for per-unit quantities
const SIGMA_FLOOR_PU: f64 = 0.01;
/// Noise floor for MW/Mvar quantities
const SIGMA_FLOOR_MW: f64 = 0.1;
/// Gross errors span this many noise sigmas
const GROSS_ERROR_RANGE: std::ops::Range<f64> = 5.0..20.0;
/// Supported PMU reporting rates
const PMU_HZ_RANGE: std::ops::RangeInclusive<f64> = 10.0..=120.0;

/// Stream shaping parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryParams {
    /// PMU reporting rate; clamped to 10..=120 Hz
    pub pmu_hz: f64,
    /// Seconds between SCADA frames
    pub scada_period_s: f64,
    /// Relative Gaussian noise (fraction of the true value)
    pub noise_pct: f64,
    /// Probability a sample carries a gross error
    pub bad_rate: f64,
    /// Sensor-aging bias growth per minute of stream time
    pub drift_per_min: f64,
    /// Relative load perturbation applied before each truth refresh
    pub load_variation: f64,
    /// Reproducible stream when set; entropy-seeded otherwise
    pub seed: Option<u64>,
    /// Stop after this many PMU ticks; `None` streams until the
    /// receiver drops
    pub max_ticks: Option<u64>,
}

impl Default for TelemetryParams {
    fn default() -> Self {
        Self {
            pmu_hz: 60.0,
            scada_period_s: 2.0,
            noise_pct: 0.01,
            bad_rate: 0.005,
            drift_per_min: 0.0002,
            load_variation: 0.02,
            seed: None,
            max_ticks: None,
        }
    }
}

/// One emitted batch of measurements from a single acquisition path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub stream: Stream,
    pub tick: u64,
    pub timestamp: DateTime<Utc>,
    pub measurements: Vec<Measurement>,
}

/// Source of synthetic telemetry for one network.
pub struct TelemetryGenerator {
    network: Network,
    solver: Arc<dyn PowerFlow>,
    calibration: Option<Arc<CalibrationStore>>,
    params: TelemetryParams,
}

impl TelemetryGenerator {
    pub fn new(network: Network, solver: Arc<dyn PowerFlow>, params: TelemetryParams) -> Self {
        Self {
            network,
            solver,
            calibration: None,
            params,
        }
    }

    /// Apply stored corrections to every emitted frame.
    pub fn with_calibration(mut self, store: Arc<CalibrationStore>) -> Self {
        self.calibration = Some(store);
        self
    }

    /// Start streaming. The task ends when the receiver is dropped or
    /// `max_ticks` PMU ticks have been emitted.
    pub fn spawn(self) -> (mpsc::Receiver<TelemetryFrame>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(32);
        let handle = tokio::spawn(self.run(tx));
        (rx, handle)
    }

    async fn run(self, tx: mpsc::Sender<TelemetryFrame>) {
        let hz = self
            .params
            .pmu_hz
            .clamp(*PMU_HZ_RANGE.start(), *PMU_HZ_RANGE.end());
        let ticks_per_scada = (self.params.scada_period_s * hz).round().max(1.0) as u64;
        let mut rng = match self.params.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / hz));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut truth = match self.solver.solve(&self.network) {
            Ok(solution) if solution.converged => solution,
            Ok(_) | Err(_) => {
                tracing::error!("base-case power flow failed, telemetry not started");
                return;
            }
        };

        let mut tick: u64 = 0;
        loop {
            ticker.tick().await;
            tick += 1;
            // Stream time in minutes, from ticks so seeded runs replay
            let drift_factor = self.params.drift_per_min * (tick as f64 / hz / 60.0);

            let scada_due = tick % ticks_per_scada == 0;
            if scada_due {
                // Wander the operating point before each SCADA refresh.
                let varied = self.vary_loads(&mut rng);
                match self.solver.solve(&varied) {
                    Ok(solution) if solution.converged => truth = solution,
                    Ok(_) => tracing::warn!(tick, "load-variation case did not converge"),
                    Err(e) => tracing::warn!(tick, error = %e, "load-variation solve failed"),
                }
            }

            let pmu = self.frame(Stream::Pmu, tick, self.sample_pmu(&truth, drift_factor, &mut rng));
            if tx.send(pmu).await.is_err() {
                tracing::debug!(tick, "telemetry receiver dropped");
                break;
            }
            if scada_due {
                let scada = self.frame(
                    Stream::Scada,
                    tick,
                    self.sample_scada(&truth, drift_factor, &mut rng),
                );
                if tx.send(scada).await.is_err() {
                    break;
                }
            }

            if self.params.max_ticks.is_some_and(|max| tick >= max) {
                break;
            }
        }
    }

    fn frame(&self, stream: Stream, tick: u64, mut measurements: Vec<Measurement>) -> TelemetryFrame {
        if let Some(store) = &self.calibration {
            store.correct_all(&mut measurements);
        }
        TelemetryFrame {
            stream,
            tick,
            timestamp: Utc::now(),
            measurements,
        }
    }

    /// Per-bus voltage magnitude, angle and a frequency sample.
    fn sample_pmu(
        &self,
        truth: &PowerFlowSolution,
        drift_factor: f64,
        rng: &mut ChaCha8Rng,
    ) -> Vec<Measurement> {
        let mut out = Vec::with_capacity(truth.bus_results.len() * 3);
        for bus in &truth.bus_results {
            let element = ElementRef::Bus(bus.id);
            out.push(self.degrade(
                Stream::Pmu,
                element,
                MeasKind::V,
                bus.vm_pu,
                SIGMA_FLOOR_PU,
                drift_factor,
                rng,
            ));
            out.push(self.degrade(
                Stream::Pmu,
                element,
                MeasKind::Angle,
                bus.va_degree,
                SIGMA_FLOOR_PU,
                drift_factor,
                rng,
            ));
            let freq = NOMINAL_FREQ_HZ + rng.gen::<f64>() * 2.0 * FREQ_SIGMA_HZ - FREQ_SIGMA_HZ;
            out.push(Measurement::new(
                Stream::Pmu,
                element,
                MeasKind::Freq,
                freq,
                FREQ_SIGMA_HZ,
            ));
        }
        out
    }

    /// Branch from-end flows and bus injections.
    fn sample_scada(
        &self,
        truth: &PowerFlowSolution,
        drift_factor: f64,
        rng: &mut ChaCha8Rng,
    ) -> Vec<Measurement> {
        let mut out =
            Vec::with_capacity((truth.branch_results.len() + truth.bus_results.len()) * 2);
        for branch in &truth.branch_results {
            let element = ElementRef::Branch(branch.id);
            out.push(self.degrade(
                Stream::Scada,
                element,
                MeasKind::P,
                branch.p_from_mw,
                SIGMA_FLOOR_MW,
                drift_factor,
                rng,
            ));
            out.push(self.degrade(
                Stream::Scada,
                element,
                MeasKind::Q,
                branch.q_from_mvar,
                SIGMA_FLOOR_MW,
                drift_factor,
                rng,
            ));
        }
        for bus in &truth.bus_results {
            let element = ElementRef::Bus(bus.id);
            out.push(self.degrade(
                Stream::Scada,
                element,
                MeasKind::P,
                bus.p_mw,
                SIGMA_FLOOR_MW,
                drift_factor,
                rng,
            ));
            out.push(self.degrade(
                Stream::Scada,
                element,
                MeasKind::Q,
                bus.q_mvar,
                SIGMA_FLOOR_MW,
                drift_factor,
                rng,
            ));
        }
        out
    }

    /// Truth value through the degradation pipeline: drift, Gaussian
    /// noise, then a possible gross error.
    #[allow(clippy::too_many_arguments)]
    fn degrade(
        &self,
        stream: Stream,
        element: ElementRef,
        kind: MeasKind,
        truth: f64,
        sigma_floor: f64,
        drift_factor: f64,
        rng: &mut ChaCha8Rng,
    ) -> Measurement {
        let sigma = (self.params.noise_pct * truth.abs()).max(sigma_floor);
        let drifted = truth * (1.0 + drift_factor);
        let noise = gaussian(rng) * sigma;
        let mut value = drifted + noise;
        if rng.gen::<f64>() < self.params.bad_rate {
            let magnitude = rng.gen_range(GROSS_ERROR_RANGE) * sigma;
            let sign = if rng.gen::<bool>() { 1.0 } else { -1.0 };
            value += sign * magnitude;
        }
        Measurement::new(stream, element, kind, value, sigma)
    }

    /// Copy of the network with every load perturbed independently.
    fn vary_loads(&self, rng: &mut ChaCha8Rng) -> Network {
        let spread = self.params.load_variation;
        let mut varied = self.network.clone();
        for node in varied.graph.node_weights_mut() {
            if let Node::Load(Load {
                active_power,
                reactive_power,
                ..
            }) = node
            {
                let factor = 1.0 + rng.gen_range(-spread..=spread);
                *active_power = *active_power * factor;
                *reactive_power = *reactive_power * factor;
            }
        }
        varied
    }
}

/// Standard normal sample via Box-Muller.
fn gaussian(rng: &mut ChaCha8Rng) -> f64 {
    let u1: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}
