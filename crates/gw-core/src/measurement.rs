//! Typed field measurements.
//!
//! A [`Measurement`] is immutable once taken. Its identity for
//! calibration lookup is the [`MeasurementKey`] quadruple
//! `(stream, element_type, element_id, meas_type)`; the value itself is
//! deliberately not part of the key so a drifting sensor keeps one
//! calibration record across samples.

use serde::{Deserialize, Serialize};

use crate::{BranchId, BusId};

/// Acquisition path a measurement arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stream {
    Scada,
    Pmu,
    Manual,
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stream::Scada => write!(f, "SCADA"),
            Stream::Pmu => write!(f, "PMU"),
            Stream::Manual => write!(f, "manual"),
        }
    }
}

/// Network element a measurement is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "element_type", content = "element_id", rename_all = "snake_case")]
pub enum ElementRef {
    Bus(BusId),
    /// Lines and transformers share branch ids; measurements are taken
    /// at the from end.
    Branch(BranchId),
}

impl std::fmt::Display for ElementRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElementRef::Bus(id) => write!(f, "bus-{}", id.value()),
            ElementRef::Branch(id) => write!(f, "branch-{}", id.value()),
        }
    }
}

/// Physical quantity a measurement reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasKind {
    /// Voltage magnitude (pu)
    V,
    /// Active power (MW): injection for buses, from-end flow for branches
    P,
    /// Reactive power (Mvar)
    Q,
    /// Voltage angle (degrees)
    Angle,
    /// System frequency (Hz); telemetry only, not estimable state
    Freq,
}

impl std::fmt::Display for MeasKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeasKind::V => write!(f, "v"),
            MeasKind::P => write!(f, "p"),
            MeasKind::Q => write!(f, "q"),
            MeasKind::Angle => write!(f, "angle"),
            MeasKind::Freq => write!(f, "freq"),
        }
    }
}

/// Identity of a sensor channel, the calibration-store key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeasurementKey {
    pub stream: Stream,
    pub element: ElementRef,
    pub kind: MeasKind,
}

impl std::fmt::Display for MeasurementKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.stream, self.element, self.kind)
    }
}

/// A single field measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub stream: Stream,
    pub element: ElementRef,
    pub kind: MeasKind,
    pub value: f64,
    /// Standard deviation; must be positive for weighting to be defined
    pub std_dev: f64,
}

impl Measurement {
    pub fn new(stream: Stream, element: ElementRef, kind: MeasKind, value: f64, std_dev: f64) -> Self {
        Self {
            stream,
            element,
            kind,
            value,
            std_dev,
        }
    }

    /// The calibration-store identity of this measurement.
    pub fn key(&self) -> MeasurementKey {
        MeasurementKey {
            stream: self.stream,
            element: self.element,
            kind: self.kind,
        }
    }

    /// Same measurement with a corrected value.
    pub fn with_value(mut self, value: f64) -> Self {
        self.value = value;
        self
    }
}
