// Dedicated boundary thread for the isolated runner

use crate::config::EngineLimits;
use crate::error::RunnerError;
use crate::protocol::{BoundaryMessage, Capabilities, HostMessage};
use crate::sandbox::{Boundary, BoundaryEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Host side of one boundary thread
///
/// QuickJS contexts are `!Send`, so each boundary lives on its own OS thread
/// with a single-threaded tokio runtime driving its timers. Dropping the
/// handle (or calling [`WorkerHandle::terminate`]) ends the thread, even in
/// the middle of a synchronous script.
pub(crate) struct WorkerHandle {
    commands: Option<mpsc::UnboundedSender<HostMessage>>,
    terminate: Arc<AtomicBool>,
}

impl WorkerHandle {
    /// Queue a message for the boundary; fails once the worker is gone
    pub fn send(&self, message: HostMessage) -> Result<(), RunnerError> {
        self.commands
            .as_ref()
            .ok_or(RunnerError::BoundaryTerminated)?
            .send(message)
            .map_err(|_| RunnerError::WorkerShutdown)
    }

    /// A sender that does not keep the worker alive
    pub fn downgrade(&self) -> Option<mpsc::WeakUnboundedSender<HostMessage>> {
        self.commands.as_ref().map(|tx| tx.downgrade())
    }

    /// Interrupt any running script and close the command channel
    pub fn terminate(&mut self) {
        self.terminate.store(true, Ordering::Relaxed);
        self.commands = None;
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Start a boundary thread
///
/// Returns the command handle and the stream of messages the boundary posts.
/// The stream ends when the thread exits.
pub(crate) fn spawn(
    generation: u64,
    limits: EngineLimits,
    capabilities: Capabilities,
) -> Result<(WorkerHandle, mpsc::UnboundedReceiver<BoundaryMessage>), RunnerError> {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let terminate = Arc::new(AtomicBool::new(false));

    let flag = terminate.clone();
    std::thread::Builder::new()
        .name(format!("connector-boundary-{generation}"))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::error!(generation, error = %e, "Failed to start boundary runtime");
                    return;
                }
            };
            let boundary = match Boundary::new(limits, capabilities, Some(flag.clone())) {
                Ok(boundary) => boundary,
                Err(e) => {
                    tracing::error!(generation, error = %e, "Failed to create boundary");
                    return;
                }
            };
            runtime.block_on(drive(boundary, command_rx, event_tx, flag));
            tracing::debug!(generation, "Boundary thread exited");
        })
        .map_err(|e| RunnerError::Engine(format!("failed to spawn boundary thread: {e}")))?;

    Ok((
        WorkerHandle {
            commands: Some(command_tx),
            terminate,
        },
        event_rx,
    ))
}

async fn drive(
    mut boundary: Boundary,
    mut commands: mpsc::UnboundedReceiver<HostMessage>,
    events: mpsc::UnboundedSender<BoundaryMessage>,
    terminate: Arc<AtomicBool>,
) {
    let (due_tx, mut due_rx) = mpsc::unbounded_channel::<u32>();
    let mut timers: HashMap<u32, JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(message) => boundary.handle(message),
                None => break,
            },
            Some(id) = due_rx.recv() => {
                if timers.remove(&id).is_some() {
                    boundary.fire_timer(id);
                }
            }
        }

        if terminate.load(Ordering::Relaxed) {
            break;
        }

        for event in boundary.drain() {
            match event {
                BoundaryEvent::Message(message) => {
                    if events.send(message).is_err() {
                        terminate.store(true, Ordering::Relaxed);
                    }
                }
                BoundaryEvent::ScheduleTimer { id, delay } => {
                    let due = due_tx.clone();
                    let task = tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = due.send(id);
                    });
                    timers.insert(id, task);
                }
                BoundaryEvent::CancelTimer { id } => {
                    if let Some(task) = timers.remove(&id) {
                        task.abort();
                    }
                }
            }
        }

        if terminate.load(Ordering::Relaxed) {
            break;
        }
    }

    for (_, task) in timers {
        task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transpile;
    use serde_json::json;

    #[tokio::test]
    async fn worker_loads_and_runs() {
        let (worker, mut events) =
            spawn(1, EngineLimits::default(), Capabilities::standard()).unwrap();
        let compiled = transpile::compile("export default { test: () => 'ok' };").unwrap();
        worker.send(HostMessage::Load { code: compiled.code }).unwrap();
        assert_eq!(events.recv().await, Some(BoundaryMessage::Loaded));

        worker
            .send(HostMessage::Run {
                method_path: "test".into(),
                context: json!({}),
                request_id: "r1".into(),
                proxy_fetch: true,
                operation_data: json!(null),
                is_fields: false,
            })
            .unwrap();
        assert_eq!(
            events.recv().await,
            Some(BoundaryMessage::Result {
                request_id: "r1".into(),
                result: json!("ok"),
            })
        );
    }

    #[tokio::test]
    async fn timers_fire_on_the_worker() {
        let (worker, mut events) =
            spawn(2, EngineLimits::default(), Capabilities::standard()).unwrap();
        let compiled = transpile::compile(
            "export default { test: () => new Promise((r) => setTimeout(() => r('later'), 10)) };",
        )
        .unwrap();
        worker.send(HostMessage::Load { code: compiled.code }).unwrap();
        assert_eq!(events.recv().await, Some(BoundaryMessage::Loaded));

        worker
            .send(HostMessage::Run {
                method_path: "test".into(),
                context: json!({}),
                request_id: "r".into(),
                proxy_fetch: true,
                operation_data: json!(null),
                is_fields: false,
            })
            .unwrap();
        let message = events.recv().await.unwrap();
        assert_eq!(message.request_id(), Some("r"));
    }

    #[tokio::test]
    async fn terminate_stops_a_busy_worker() {
        let (mut worker, mut events) =
            spawn(3, EngineLimits::default(), Capabilities::standard()).unwrap();
        let compiled =
            transpile::compile("export default { spin: () => { while (true) {} } };").unwrap();
        worker.send(HostMessage::Load { code: compiled.code }).unwrap();
        assert_eq!(events.recv().await, Some(BoundaryMessage::Loaded));

        worker
            .send(HostMessage::Run {
                method_path: "spin".into(),
                context: json!({}),
                request_id: "r".into(),
                proxy_fetch: true,
                operation_data: json!(null),
                is_fields: false,
            })
            .unwrap();
        worker.terminate();

        let closed = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while events.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok(), "worker thread did not stop");
    }
}
