//! Observer pattern for optimization monitoring.
//!
//! Observers can be registered with any driver and are notified after each outer iteration with
//! the full parameter vector. Multiple observers run in the order they were added; with none
//! registered, notification is a no-op.
//!
//! ```text
//! ┌─────────────────┐
//! │     Driver      │
//! │ (LM/particles)  │
//! └────────┬────────┘
//!          │ observers.notify(params, iteration)
//!          ├──────────────┬──────────────┐
//!          ▼              ▼              ▼
//!    ┌──────────┐  ┌──────────┐  ┌──────────┐
//!    │ Progress │  │ Metrics  │  │  Custom  │
//!    │  logger  │  │ recorder │  │ observer │
//!    └──────────┘  └──────────┘  └──────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use nalgebra::DVector;
//! use std::sync::{Arc, Mutex};
//! use voxfit::observers::OptObserver;
//!
//! struct ErrorHistory {
//!     errors: Arc<Mutex<Vec<f64>>>,
//! }
//!
//! impl OptObserver for ErrorHistory {
//!     fn on_step(&self, _params: &DVector<f64>, _iteration: usize) {}
//!
//!     fn set_iteration_metrics(
//!         &self,
//!         error: f64,
//!         _gradient_norm: f64,
//!         _damping: Option<f64>,
//!         _step_norm: f64,
//!         _accepted: Option<bool>,
//!     ) {
//!         if let Ok(mut errors) = self.errors.lock() {
//!             errors.push(error);
//!         }
//!     }
//! }
//! ```

use nalgebra::DVector;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::error;

/// Observer-specific error types
#[derive(Debug, Clone, Error)]
pub enum ObserverError {
    /// Mutex was poisoned (thread panicked while holding lock)
    #[error("Mutex poisoned in {context}: {reason}")]
    MutexPoisoned { context: String, reason: String },
}

impl ObserverError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    ///
    /// # Arguments
    /// * `source_error` - The original error (must implement Debug)
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for observer operations
pub type ObserverResult<T> = Result<T, ObserverError>;

/// Observer trait for monitoring optimization progress.
///
/// Observers must be `Send`; use interior mutability (`Mutex`) to record anything. Errors should
/// be handled inside the observer, never by panicking.
pub trait OptObserver: Send {
    /// Called after each outer iteration.
    ///
    /// # Arguments
    ///
    /// * `params` - Full parameter vector of the state
    /// * `iteration` - Outer iteration number, starting at 0
    fn on_step(&self, params: &DVector<f64>, iteration: usize);

    /// Metrics of the iteration about to be reported through `on_step`.
    ///
    /// # Arguments
    ///
    /// * `error` - Global error after the iteration
    /// * `gradient_norm` - L2 norm of `J·r`
    /// * `damping` - Current damping (None for undamped drivers)
    /// * `step_norm` - L2 norm of the kept step
    /// * `accepted` - Whether a trial step was kept (None when the driver has no trials)
    fn set_iteration_metrics(
        &self,
        _error: f64,
        _gradient_norm: f64,
        _damping: Option<f64>,
        _step_norm: f64,
        _accepted: Option<bool>,
    ) {
        // Default implementation does nothing
    }
}

/// Collection of observers owned by a driver.
#[derive(Default)]
pub struct OptObserverVec {
    observers: Vec<Box<dyn OptObserver>>,
}

impl OptObserverVec {
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
        }
    }

    /// Add an observer; observers are called in insertion order.
    pub fn add(&mut self, observer: impl OptObserver + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// Set iteration metrics for all observers. Call before [`OptObserverVec::notify`].
    #[inline]
    pub fn set_iteration_metrics(
        &self,
        error: f64,
        gradient_norm: f64,
        damping: Option<f64>,
        step_norm: f64,
        accepted: Option<bool>,
    ) {
        for observer in &self.observers {
            observer.set_iteration_metrics(error, gradient_norm, damping, step_norm, accepted);
        }
    }

    /// Notify all observers with the current parameters.
    #[inline]
    pub fn notify(&self, params: &DVector<f64>, iteration: usize) {
        for observer in &self.observers {
            observer.on_step(params, iteration);
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.observers.len()
    }
}

/// Records the error and the parameter vector reported after every outer iteration.
///
/// Clones share one history, so keep a clone and hand the other to the driver.
#[derive(Debug, Clone, Default)]
pub struct IterationHistory {
    errors: Arc<Mutex<Vec<f64>>>,
    params: Arc<Mutex<Vec<DVector<f64>>>>,
}

fn lock<'a, T>(mutex: &'a Mutex<T>, context: &str) -> ObserverResult<MutexGuard<'a, T>> {
    mutex.lock().map_err(|e| {
        ObserverError::MutexPoisoned {
            context: context.to_string(),
            reason: e.to_string(),
        }
        .log()
    })
}

impl IterationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Global error after each iteration, in order.
    pub fn errors(&self) -> ObserverResult<Vec<f64>> {
        Ok(lock(&self.errors, "IterationHistory::errors")?.clone())
    }

    /// Parameter vector after each iteration, in order.
    pub fn parameters(&self) -> ObserverResult<Vec<DVector<f64>>> {
        Ok(lock(&self.params, "IterationHistory::parameters")?.clone())
    }
}

impl OptObserver for IterationHistory {
    fn on_step(&self, params: &DVector<f64>, _iteration: usize) {
        if let Ok(mut history) = lock(&self.params, "IterationHistory::on_step") {
            history.push(params.clone());
        }
    }

    fn set_iteration_metrics(
        &self,
        error: f64,
        _gradient_norm: f64,
        _damping: Option<f64>,
        _step_norm: f64,
        _accepted: Option<bool>,
    ) {
        if let Ok(mut errors) = lock(&self.errors, "IterationHistory::set_iteration_metrics") {
            errors.push(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct TestObserver {
        calls: Arc<Mutex<Vec<usize>>>,
        errors: Arc<Mutex<Vec<f64>>>,
    }

    impl TestObserver {
        fn new() -> Self {
            Self {
                calls: Arc::new(Mutex::new(Vec::new())),
                errors: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl OptObserver for TestObserver {
        fn on_step(&self, _params: &DVector<f64>, iteration: usize) {
            // In test code, we log and ignore mutex poisoning errors since they indicate test bugs
            if let Ok(mut guard) = self.calls.lock().map_err(|e| {
                ObserverError::MutexPoisoned {
                    context: "TestObserver::on_step".to_string(),
                    reason: e.to_string(),
                }
                .log()
            }) {
                guard.push(iteration);
            }
        }

        fn set_iteration_metrics(
            &self,
            error: f64,
            _gradient_norm: f64,
            _damping: Option<f64>,
            _step_norm: f64,
            _accepted: Option<bool>,
        ) {
            if let Ok(mut guard) = self.errors.lock() {
                guard.push(error);
            }
        }
    }

    #[test]
    fn test_empty_observers() {
        let observers = OptObserverVec::new();
        assert!(observers.is_empty());
        assert_eq!(observers.len(), 0);

        // Should not panic with no observers
        observers.notify(&DVector::zeros(3), 0);
    }

    #[test]
    fn test_single_observer() -> Result<(), ObserverError> {
        let observer = TestObserver::new();
        let calls = observer.calls.clone();

        let mut observers = OptObserverVec::new();
        observers.add(observer);
        assert_eq!(observers.len(), 1);

        let params = DVector::from_vec(vec![1.0, 2.0]);
        observers.notify(&params, 0);
        observers.notify(&params, 1);
        observers.notify(&params, 2);

        let guard = calls.lock().map_err(|e| {
            ObserverError::MutexPoisoned {
                context: "test_single_observer".to_string(),
                reason: e.to_string(),
            }
            .log()
        })?;
        assert_eq!(*guard, vec![0, 1, 2]);
        Ok(())
    }

    #[test]
    fn test_multiple_observers_receive_metrics() -> Result<(), ObserverError> {
        let observer1 = TestObserver::new();
        let observer2 = TestObserver::new();
        let (errors1, errors2) = (observer1.errors.clone(), observer2.errors.clone());

        let mut observers = OptObserverVec::new();
        observers.add(observer1);
        observers.add(observer2);
        assert_eq!(observers.len(), 2);

        observers.set_iteration_metrics(4.5, 1.0, Some(0.1), 0.2, Some(true));
        observers.notify(&DVector::zeros(1), 5);

        for (name, errors) in [("errors1", errors1), ("errors2", errors2)] {
            let guard = errors.lock().map_err(|e| {
                ObserverError::MutexPoisoned {
                    context: format!("test_multiple_observers_receive_metrics ({name})"),
                    reason: e.to_string(),
                }
                .log()
            })?;
            assert_eq!(*guard, vec![4.5]);
        }
        Ok(())
    }

    #[test]
    fn test_iteration_history_records_in_order() -> Result<(), ObserverError> {
        let history = IterationHistory::new();
        let mut observers = OptObserverVec::new();
        observers.add(history.clone());

        for (i, error) in [3.0, 2.0, 1.5].into_iter().enumerate() {
            observers.set_iteration_metrics(error, 0.0, None, 0.0, None);
            observers.notify(&DVector::from_element(2, i as f64), i);
        }
        assert_eq!(history.errors()?, vec![3.0, 2.0, 1.5]);
        let params = history.parameters()?;
        assert_eq!(params.len(), 3);
        assert_eq!(params[2], DVector::from_element(2, 2.0));
        Ok(())
    }

    #[test]
    fn test_poisoned_history_reports_error() {
        let history = IterationHistory::new();
        let errors = Arc::clone(&history.errors);
        let poisoner = std::thread::spawn(move || {
            let _guard = errors.lock();
            panic!("recording thread died");
        });
        assert!(poisoner.join().is_err());

        // Recording into a poisoned history is dropped instead of panicking.
        history.set_iteration_metrics(1.0, 0.0, None, 0.0, None);
        history.on_step(&DVector::zeros(1), 0);

        match history.errors() {
            Err(ObserverError::MutexPoisoned { context, .. }) => {
                assert_eq!(context, "IterationHistory::errors");
            }
            other => panic!("expected a poisoned mutex, got {other:?}"),
        }
        assert!(history.parameters().is_ok_and(|p| p.len() == 1));

        let top: crate::VoxfitError = ObserverError::MutexPoisoned {
            context: "IterationHistory::errors".to_string(),
            reason: "poisoned".to_string(),
        }
        .into();
        assert!(matches!(top, crate::VoxfitError::Observer(_)));
    }
}
