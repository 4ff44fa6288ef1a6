//! Ordered teardown of telemetry sub-resources.
//!
//! Each sub-resource registers its teardown as soon as it has been built, so
//! a failure halfway through startup still releases everything that came up.
//! Running the registry drains it: a second run has nothing to do.

use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::TelemetryError;

type TeardownFn = Box<dyn FnOnce() -> Result<(), TelemetryError> + Send + 'static>;

struct Teardown {
    component: &'static str,
    run: TeardownFn,
}

/// Teardowns in registration order.
#[derive(Default)]
pub struct ShutdownRegistry {
    teardowns: Vec<Teardown>,
}

impl ShutdownRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a blocking teardown for `component`.
    pub fn register<F>(&mut self, component: &'static str, teardown: F)
    where
        F: FnOnce() -> Result<(), TelemetryError> + Send + 'static,
    {
        self.teardowns.push(Teardown {
            component,
            run: Box::new(teardown),
        });
    }

    pub fn len(&self) -> usize {
        self.teardowns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.teardowns.is_empty()
    }

    /// Run every registered teardown, in order, within `timeout` overall.
    ///
    /// A failing or timed-out teardown does not stop the ones after it; all
    /// failures are returned together. The registry is empty afterwards.
    pub async fn run(&mut self, timeout: Duration) -> Result<(), TelemetryError> {
        let deadline = Instant::now() + timeout;
        let mut errors = Vec::new();

        for Teardown { component, run } in self.teardowns.drain(..) {
            // SDK shutdowns block on their export workers. Detached, so one
            // that overruns the deadline cannot delay runtime teardown.
            let (tx, rx) = oneshot::channel();
            let spawned = std::thread::Builder::new()
                .name(format!("teardown-{component}"))
                .spawn(move || {
                    let _ = tx.send(run());
                });
            if let Err(e) = spawned {
                errors.push(TelemetryError::shutdown(component, e));
                continue;
            }

            match tokio::time::timeout_at(deadline, rx).await {
                Ok(Ok(Ok(()))) => tracing::debug!(component, "Telemetry component shut down"),
                Ok(Ok(Err(e))) => errors.push(e),
                Ok(Err(_)) => errors.push(TelemetryError::shutdown(component, "teardown panicked")),
                Err(_) => errors.push(TelemetryError::Timeout { component }),
            }
        }

        TelemetryError::join(errors).map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for ShutdownRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.teardowns.iter().map(|t| t.component))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recording(
        log: &Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
        fail: bool,
    ) -> impl FnOnce() -> Result<(), TelemetryError> + Send + 'static {
        let log = Arc::clone(log);
        move || {
            log.lock().unwrap().push(name);
            if fail {
                Err(TelemetryError::shutdown(name, "drain failed"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_runs_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ShutdownRegistry::new();
        registry.register("first", recording(&log, "first", false));
        registry.register("second", recording(&log, "second", false));
        registry.register("third", recording(&log, "third", false));

        registry.run(Duration::from_secs(5)).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_later_teardowns() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ShutdownRegistry::new();
        registry.register("tracer", recording(&log, "tracer", true));
        registry.register("meter", recording(&log, "meter", true));

        let err = registry.run(Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(*log.lock().unwrap(), vec!["tracer", "meter"]);
        assert_eq!(err.flatten().len(), 2);
        assert!(err.to_string().contains("tracer"));
        assert!(err.to_string().contains("meter"));
    }

    #[tokio::test]
    async fn test_second_run_is_a_noop() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ShutdownRegistry::new();
        registry.register("tracer", recording(&log, "tracer", true));
        registry.register("meter", recording(&log, "meter", false));

        assert!(registry.run(Duration::from_secs(5)).await.is_err());
        assert!(registry.is_empty());

        assert!(registry.run(Duration::from_secs(5)).await.is_ok());
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_registry_succeeds() {
        let mut registry = ShutdownRegistry::new();
        assert!(registry.run(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_deadline_bounds_slow_teardowns() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ShutdownRegistry::new();
        registry.register("stuck", || {
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        });
        registry.register("meter", recording(&log, "meter", false));

        let err = registry.run(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err.flatten()[0], TelemetryError::Timeout { component: "stuck" }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_abandoned_teardown_does_not_hold_runtime_open() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();
        let started = std::time::Instant::now();

        let result = runtime.block_on(async {
            let mut registry = ShutdownRegistry::new();
            registry.register("stuck", || {
                std::thread::sleep(Duration::from_secs(3));
                Ok(())
            });
            registry.run(Duration::from_millis(100)).await
        });
        drop(runtime);

        assert!(matches!(result, Err(TelemetryError::Timeout { component: "stuck" })));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_panicking_teardown_is_reported() {
        let mut registry = ShutdownRegistry::new();
        registry.register("exploding", || panic!("exporter poisoned"));

        let err = registry.run(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, TelemetryError::Shutdown { component: "exploding", .. }));
    }
}
