use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, info_span};

use crate::event_source::EventSource;
use crate::read_model::ProjectionStore;

use super::{EngineError, EngineState, ProjectionEngine};

/// Handle to control and join a running projection.
#[derive(Debug)]
pub struct ProjectionHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<EngineState>,
    join: JoinHandle<Result<(), EngineError>>,
}

impl ProjectionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Resolve once the engine reports `target`.
    ///
    /// Fails with `Stopped` if the engine exits without ever reaching it.
    pub async fn wait_until(&self, target: EngineState) -> Result<(), EngineError> {
        let mut state = self.state.clone();
        let reached = state.wait_for(|current| *current == target).await.is_ok();
        if reached {
            Ok(())
        } else {
            Err(EngineError::Stopped {
                projection: self.name.clone(),
                state: *state.borrow(),
            })
        }
    }

    /// Request graceful shutdown and wait for the engine to stop.
    ///
    /// Returns the error that paused the engine, if any.
    pub async fn shutdown(self) -> Result<(), EngineError> {
        let _ = self.shutdown.send(true);
        match self.join.await {
            Ok(result) => result,
            Err(err) => Err(EngineError::WorkerPanicked(err.to_string())),
        }
    }
}

/// Run `engine` on the tokio runtime until shut down or paused.
pub fn spawn<S, T>(mut engine: ProjectionEngine<S, T>) -> ProjectionHandle
where
    S: EventSource + 'static,
    T: ProjectionStore + 'static,
{
    let name = engine.projection().name().to_string();
    let (shutdown, shutdown_rx) = watch::channel(false);
    let state = engine.subscribe_state();
    let span = info_span!("projection", name = %name);

    let join = tokio::spawn(async move { engine.run(shutdown_rx).await }.instrument(span));

    ProjectionHandle {
        name,
        shutdown,
        state,
        join,
    }
}
