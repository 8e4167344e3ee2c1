//! Predictor - loading model artifacts and scoring windows
//!
//! The daemon never trains or inspects a model. It needs two things:
//! - `ModelLoader::load(path)`: turn the artifact on disk into a model
//! - `Model::predict(window)`: map an oldest-first window to one value
//!
//! `JsonModelLoader` reads the linear autoregressive artifact exported by
//! the training pipeline. `FakeModelLoader` serves scripted models to tests.

use drift_common::{MonitorError, MonitorResult, Window};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

// ============================================================================
// Traits
// ============================================================================

/// A loaded model
pub trait Model: Send + Sync {
    /// Number of samples a window must contain
    fn input_len(&self) -> usize;

    /// Predict the next value from an oldest-first window
    ///
    /// A window of the wrong length fails with `MonitorError::WindowLength`.
    fn predict(&self, window: &Window) -> MonitorResult<f64>;
}

/// Loads models from artifacts on disk
pub trait ModelLoader: Send + Sync {
    fn load(&self, path: &Path) -> MonitorResult<Box<dyn Model>>;
}

fn check_window(expected: usize, window: &Window) -> MonitorResult<()> {
    if window.len() != expected {
        return Err(MonitorError::WindowLength {
            expected,
            actual: window.len(),
        });
    }
    Ok(())
}

// ============================================================================
// Linear autoregressive model (Production)
// ============================================================================

/// On-disk artifact: `prediction = bias + sum(weights[i] * window[i])`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub input_len: usize,
    pub weights: Vec<f64>,
    #[serde(default)]
    pub bias: f64,
}

impl LinearModel {
    fn validate(&self) -> MonitorResult<()> {
        if self.input_len == 0 {
            return Err(MonitorError::Model("input_len must be at least 1".to_string()));
        }
        if self.weights.len() != self.input_len {
            return Err(MonitorError::Model(format!(
                "expected {} weights, found {}",
                self.input_len,
                self.weights.len()
            )));
        }
        if !self.bias.is_finite() || self.weights.iter().any(|w| !w.is_finite()) {
            return Err(MonitorError::Model("coefficients must be finite".to_string()));
        }
        Ok(())
    }
}

impl Model for LinearModel {
    fn input_len(&self) -> usize {
        self.input_len
    }

    fn predict(&self, window: &Window) -> MonitorResult<f64> {
        check_window(self.input_len, window)?;
        let dot: f64 = self
            .weights
            .iter()
            .zip(window.samples())
            .map(|(w, x)| w * x)
            .sum();
        Ok(self.bias + dot)
    }
}

/// Reads `LinearModel` artifacts encoded as JSON
#[derive(Debug, Default, Clone)]
pub struct JsonModelLoader;

impl ModelLoader for JsonModelLoader {
    fn load(&self, path: &Path) -> MonitorResult<Box<dyn Model>> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            MonitorError::Model(format!("cannot read {}: {}", path.display(), e))
        })?;
        let model: LinearModel = serde_json::from_str(&contents).map_err(|e| {
            MonitorError::Model(format!("cannot parse {}: {}", path.display(), e))
        })?;
        model.validate()?;
        debug!("Loaded linear model with {} inputs from {}", model.input_len, path.display());
        Ok(Box::new(model))
    }
}

// ============================================================================
// Fake Model Loader (Testing)
// ============================================================================

pub type PredictFn = Arc<dyn Fn(&Window) -> f64 + Send + Sync>;

struct FakeModel {
    input_len: usize,
    predict_fn: PredictFn,
    predictions: Arc<Mutex<usize>>,
}

impl Model for FakeModel {
    fn input_len(&self) -> usize {
        self.input_len
    }

    fn predict(&self, window: &Window) -> MonitorResult<f64> {
        check_window(self.input_len, window)?;
        *self.predictions.lock().unwrap() += 1;
        Ok((self.predict_fn)(window))
    }
}

/// Hands out scripted models
///
/// Each successful `load` takes the next queued generation; once the queue
/// is empty the last generation keeps being served.
///
/// ```rust,ignore
/// let loader = FakeModelLoader::new(10, |_| f64::NAN)   // drifts at once
///     .then_load(|w| w.samples()[9]);                  // retrained model
/// ```
pub struct FakeModelLoader {
    input_len: usize,
    current: Mutex<PredictFn>,
    generations: Mutex<VecDeque<PredictFn>>,
    load_failures: Mutex<VecDeque<String>>,
    reload_failures: Mutex<VecDeque<String>>,
    loads: Mutex<usize>,
    failed_loads: Mutex<usize>,
    predictions: Arc<Mutex<usize>>,
}

impl FakeModelLoader {
    pub fn new<F>(input_len: usize, f: F) -> Self
    where
        F: Fn(&Window) -> f64 + Send + Sync + 'static,
    {
        Self {
            input_len,
            current: Mutex::new(Arc::new(f)),
            generations: Mutex::new(VecDeque::new()),
            load_failures: Mutex::new(VecDeque::new()),
            reload_failures: Mutex::new(VecDeque::new()),
            loads: Mutex::new(0),
            failed_loads: Mutex::new(0),
            predictions: Arc::new(Mutex::new(0)),
        }
    }

    /// Model served by the next load after the current one
    pub fn then_load<F>(self, f: F) -> Self
    where
        F: Fn(&Window) -> f64 + Send + Sync + 'static,
    {
        self.generations.lock().unwrap().push_back(Arc::new(f));
        self
    }

    /// Make the next load attempt fail with `msg`
    pub fn fail_next_load(self, msg: &str) -> Self {
        self.load_failures.lock().unwrap().push_back(msg.to_string());
        self
    }

    /// Make the next load after a successful one fail with `msg`
    pub fn fail_reload(self, msg: &str) -> Self {
        self.reload_failures.lock().unwrap().push_back(msg.to_string());
        self
    }

    /// Successful loads so far
    pub fn load_count(&self) -> usize {
        *self.loads.lock().unwrap()
    }

    pub fn failed_load_count(&self) -> usize {
        *self.failed_loads.lock().unwrap()
    }

    pub fn prediction_count(&self) -> usize {
        *self.predictions.lock().unwrap()
    }
}

impl ModelLoader for FakeModelLoader {
    fn load(&self, _path: &Path) -> MonitorResult<Box<dyn Model>> {
        if let Some(msg) = self.load_failures.lock().unwrap().pop_front() {
            *self.failed_loads.lock().unwrap() += 1;
            return Err(MonitorError::Model(msg));
        }
        if *self.loads.lock().unwrap() > 0 {
            if let Some(msg) = self.reload_failures.lock().unwrap().pop_front() {
                *self.failed_loads.lock().unwrap() += 1;
                return Err(MonitorError::Model(msg));
            }
        }

        let mut loads = self.loads.lock().unwrap();
        let mut current = self.current.lock().unwrap();
        // The first load serves the constructor's model
        if *loads > 0 {
            if let Some(next) = self.generations.lock().unwrap().pop_front() {
                *current = next;
            }
        }
        *loads += 1;

        Ok(Box::new(FakeModel {
            input_len: self.input_len,
            predict_fn: Arc::clone(&current),
            predictions: Arc::clone(&self.predictions),
        }))
    }
}
