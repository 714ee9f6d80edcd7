//! # gw-calib: Sensor Calibration Store
//!
//! Persistent scale/bias corrections for telemetry channels, keyed by
//! the `(stream, element_type, element_id, meas_type)` quadruple.
//! Records live in memory behind a read-write lock and are flushed to a
//! JSON file on every mutation with a write-to-temp-then-rename so a
//! crash never leaves a half-written store on disk.
//!
//! Corrections are applied as `corrected = (raw - bias) * scale`.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use gw_core::{Measurement, MeasurementKey};

/// Errors from the calibration store.
#[derive(Debug, thiserror::Error)]
pub enum CalibError {
    #[error("no calibration record for {key}")]
    NotFound { key: MeasurementKey },

    #[error("calibration scale must be positive, got {0}")]
    InvalidScale(f64),

    #[error("calibration store I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("calibration store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// A stored correction for one sensor channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationFactor {
    pub key: MeasurementKey,
    /// Multiplicative correction, applied after the bias is removed
    pub scale: f64,
    /// Additive offset subtracted from the raw reading
    pub bias: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CalibrationFactor {
    /// Apply this correction to a raw value.
    pub fn correct(&self, raw: f64) -> f64 {
        (raw - self.bias) * self.scale
    }
}

/// Thread-safe calibration store with optional file persistence.
pub struct CalibrationStore {
    records: RwLock<HashMap<MeasurementKey, CalibrationFactor>>,
    path: Option<PathBuf>,
}

impl CalibrationStore {
    /// Open a file-backed store, loading any existing records.
    ///
    /// A missing file starts the store empty; it is created on the
    /// first mutation.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CalibError> {
        let path = path.as_ref().to_path_buf();
        let records = if path.exists() {
            let data = fs::read_to_string(&path)?;
            let factors: Vec<CalibrationFactor> = serde_json::from_str(&data)?;
            factors.into_iter().map(|f| (f.key, f)).collect()
        } else {
            HashMap::new()
        };
        tracing::debug!(path = %path.display(), records = records.len(), "calibration store opened");
        Ok(Self {
            records: RwLock::new(records),
            path: Some(path),
        })
    }

    /// A store that never touches disk, for tests and ephemeral runs.
    pub fn in_memory() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            path: None,
        }
    }

    /// Insert or update the correction for a channel.
    ///
    /// An existing record keeps its creation timestamp; only
    /// `updated_at` moves.
    pub fn apply(
        &self,
        key: MeasurementKey,
        scale: f64,
        bias: f64,
    ) -> Result<CalibrationFactor, CalibError> {
        if !(scale > 0.0) {
            return Err(CalibError::InvalidScale(scale));
        }
        let now = Utc::now();
        let factor = {
            let mut records = self.records.write();
            let factor = records
                .entry(key)
                .and_modify(|f| {
                    f.scale = scale;
                    f.bias = bias;
                    f.updated_at = now;
                })
                .or_insert(CalibrationFactor {
                    key,
                    scale,
                    bias,
                    created_at: now,
                    updated_at: now,
                });
            *factor
        };
        self.flush()?;
        tracing::info!(%key, scale, bias, "calibration applied");
        Ok(factor)
    }

    /// Remove the correction for a channel.
    pub fn clear(&self, key: MeasurementKey) -> Result<(), CalibError> {
        {
            let mut records = self.records.write();
            if records.remove(&key).is_none() {
                return Err(CalibError::NotFound { key });
            }
        }
        self.flush()?;
        tracing::info!(%key, "calibration cleared");
        Ok(())
    }

    /// Remove every record, returning how many were dropped.
    pub fn clear_all(&self) -> Result<usize, CalibError> {
        let dropped = {
            let mut records = self.records.write();
            let n = records.len();
            records.clear();
            n
        };
        self.flush()?;
        Ok(dropped)
    }

    /// Look up the correction for a channel.
    pub fn lookup(&self, key: MeasurementKey) -> Option<CalibrationFactor> {
        self.records.read().get(&key).copied()
    }

    /// All records, ordered by key display form for stable output.
    pub fn list(&self) -> Vec<CalibrationFactor> {
        let mut factors: Vec<CalibrationFactor> =
            self.records.read().values().copied().collect();
        factors.sort_by_key(|f| f.key.to_string());
        factors
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Correct a measurement if a record exists for its channel;
    /// otherwise it passes through untouched.
    pub fn correct(&self, measurement: Measurement) -> Measurement {
        match self.lookup(measurement.key()) {
            Some(factor) => {
                let corrected = factor.correct(measurement.value);
                measurement.with_value(corrected)
            }
            None => measurement,
        }
    }

    /// Correct a whole measurement set in place.
    pub fn correct_all(&self, measurements: &mut [Measurement]) {
        let records = self.records.read();
        for m in measurements.iter_mut() {
            if let Some(factor) = records.get(&m.key()) {
                m.value = factor.correct(m.value);
            }
        }
    }

    fn flush(&self) -> Result<(), CalibError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let factors = {
            let records = self.records.read();
            let mut factors: Vec<CalibrationFactor> = records.values().copied().collect();
            factors.sort_by_key(|f| f.key.to_string());
            factors
        };
        let json = serde_json::to_string_pretty(&factors)?;

        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
