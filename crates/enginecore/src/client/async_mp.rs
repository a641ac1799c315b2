//! Async multiprocess client.
//!
//! Same wire protocol as `SyncMpClient`, over tokio sockets. The output pump
//! is a tokio task started on the first call that needs responses
//! (`get_output_async` or any utility call).

use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::SinkExt;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::pump::{OutputItem, OutputRouter, run_async_pump};
use super::{Connection, EngineCoreClient, connect_worker};
use crate::bridge::codec::{OutputCodec, RequestCodec};
use crate::bridge::protocol::{
    EngineCoreInput, EngineCoreOutputs, EngineCoreRequest, UtilityCall, UtilityMethod,
    UtilityValue,
};
use crate::correlator::UtilityCorrelator;
use crate::error::ClientError;
use crate::health::EngineHealth;
use crate::launcher::WorkerLauncher;
use crate::resources::{BackgroundResources, EngineState, PumpHandle};

/// Pump pieces waiting for their first consumer.
struct IdlePump {
    reader: FramedRead<tokio::net::UnixStream, OutputCodec>,
    router: OutputRouter<UnboundedSender<OutputItem>>,
}

pub struct AsyncMpClient {
    input: tokio::sync::Mutex<FramedWrite<tokio::net::UnixStream, RequestCodec>>,
    outputs: tokio::sync::Mutex<UnboundedReceiver<OutputItem>>,
    idle_pump: Mutex<Option<IdlePump>>,
    runtime: Handle,
    correlator: Arc<UtilityCorrelator>,
    state: Arc<EngineState>,
    resources: Mutex<BackgroundResources>,
    shut_down: AtomicBool,
}

impl AsyncMpClient {
    /// Launch a worker and connect to it. Must be called inside a Tokio
    /// runtime; blocks the calling thread until the worker is up.
    pub fn new(launcher: &dyn WorkerLauncher, startup_timeout: Duration) -> Result<Self, ClientError> {
        let runtime = current_runtime()?;
        let state = EngineState::new();
        let correlator = UtilityCorrelator::new();
        let Connection {
            resources,
            input,
            output,
        } = connect_worker(launcher, startup_timeout, &state, &correlator)?;
        Self::assemble(runtime, resources, input, output, state, correlator)
    }

    /// Client over already-connected channels, with no worker to manage.
    pub fn from_streams(input: UnixStream, output: UnixStream) -> Result<Self, ClientError> {
        let runtime = current_runtime()?;
        let state = EngineState::new();
        let correlator = UtilityCorrelator::new();
        let mut resources =
            BackgroundResources::new(Arc::clone(&state), Some(Arc::clone(&correlator)));
        resources.input_channel = Some(input.try_clone()?);
        resources.output_channel = Some(output.try_clone()?);
        Self::assemble(runtime, resources, input, output, state, correlator)
    }

    fn assemble(
        runtime: Handle,
        resources: BackgroundResources,
        input: UnixStream,
        output: UnixStream,
        state: Arc<EngineState>,
        correlator: Arc<UtilityCorrelator>,
    ) -> Result<Self, ClientError> {
        input.set_nonblocking(true)?;
        output.set_nonblocking(true)?;
        let input = tokio::net::UnixStream::from_std(input)?;
        let output = tokio::net::UnixStream::from_std(output)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let idle_pump = IdlePump {
            reader: FramedRead::new(output, OutputCodec::new()),
            router: OutputRouter::new(Arc::clone(&state), Arc::clone(&correlator), tx),
        };
        state.mark_running();

        Ok(Self {
            input: tokio::sync::Mutex::new(FramedWrite::new(input, RequestCodec::new())),
            outputs: tokio::sync::Mutex::new(rx),
            idle_pump: Mutex::new(Some(idle_pump)),
            runtime,
            correlator,
            state,
            resources: Mutex::new(resources),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Start the output pump if it is not running yet.
    fn ensure_pump(&self) {
        let Some(idle) = self
            .idle_pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let mut resources = self.resources.lock().unwrap_or_else(PoisonError::into_inner);
        if self.state.is_closing() {
            // Dropping the idle pump closes the output queue.
            return;
        }
        tracing::debug!("Starting output pump task");
        let task = self.runtime.spawn(run_async_pump(idle.reader, idle.router));
        resources.pump = Some(PumpHandle::Task(task));
    }

    async fn send_input(&self, input: EngineCoreInput) -> Result<(), ClientError> {
        if self.state.is_dead() {
            return Err(ClientError::EngineDead);
        }
        if self.state.is_closing() {
            return Err(self.state.closed_error());
        }
        let mut channel = self.input.lock().await;
        channel
            .send(input)
            .await
            .map_err(|e| self.state.rewrite(ClientError::Transport(e)))
    }
}

fn current_runtime() -> Result<Handle, ClientError> {
    Handle::try_current().map_err(|_| {
        ClientError::Config("the async client must be created inside a Tokio runtime".to_string())
    })
}

#[async_trait]
impl EngineCoreClient for AsyncMpClient {
    async fn add_request_async(&self, mut request: EngineCoreRequest) -> Result<(), ClientError> {
        request.prompt = None;
        self.send_input(EngineCoreInput::Add(request)).await
    }

    async fn get_output_async(&self) -> Result<EngineCoreOutputs, ClientError> {
        if self.state.is_dead() {
            return Err(ClientError::EngineDead);
        }
        self.ensure_pump();
        match self.outputs.lock().await.recv().await {
            Some(item) => item.map_err(|e| self.state.rewrite(e)),
            None => Err(self.state.closed_error()),
        }
    }

    async fn abort_requests_async(&self, request_ids: &[String]) -> Result<(), ClientError> {
        if request_ids.is_empty() {
            return Ok(());
        }
        self.send_input(EngineCoreInput::Abort(request_ids.to_vec()))
            .await
    }

    async fn call_utility_async(&self, method: UtilityMethod) -> Result<UtilityValue, ClientError> {
        self.ensure_pump();
        let call = self
            .correlator
            .register(method.name())
            .map_err(|e| self.state.rewrite(e))?;
        self.send_input(EngineCoreInput::Utility(UtilityCall {
            call_id: call.call_id(),
            method,
        }))
        .await?;
        call.wait().await.map_err(|e| match e {
            ClientError::Utility { .. } => e,
            other => self.state.rewrite(other),
        })
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down async engine core client");
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release();
        // Pump never started: close the queue so waiters see the shutdown.
        self.idle_pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn health(&self) -> EngineHealth {
        self.state.health()
    }
}

impl Drop for AsyncMpClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use futures::StreamExt;

    use super::*;
    use crate::bridge::protocol::{EngineCoreOutput, OutputBatch, OutputFrame, UtilityOutput};

    struct FakeWorker {
        requests: FramedRead<tokio::net::UnixStream, RequestCodec>,
        outputs: FramedWrite<tokio::net::UnixStream, OutputCodec>,
    }

    impl FakeWorker {
        async fn next_request(&mut self) -> EngineCoreInput {
            self.requests.next().await.unwrap().unwrap()
        }

        async fn next_call(&mut self) -> UtilityCall {
            match self.next_request().await {
                EngineCoreInput::Utility(call) => call,
                other => panic!("expected utility call, got {:?}", other),
            }
        }
    }

    fn tokio_stream(stream: UnixStream) -> tokio::net::UnixStream {
        stream.set_nonblocking(true).unwrap();
        tokio::net::UnixStream::from_std(stream).unwrap()
    }

    fn client_with_fake_worker() -> (AsyncMpClient, FakeWorker) {
        let (client_input, worker_input) = UnixStream::pair().unwrap();
        let (worker_output, client_output) = UnixStream::pair().unwrap();
        let client = AsyncMpClient::from_streams(client_input, client_output).unwrap();
        (
            client,
            FakeWorker {
                requests: FramedRead::new(tokio_stream(worker_input), RequestCodec::new()),
                outputs: FramedWrite::new(tokio_stream(worker_output), OutputCodec::new()),
            },
        )
    }

    #[test]
    fn construction_outside_runtime_is_a_config_error() {
        let (a, b) = UnixStream::pair().unwrap();
        assert!(matches!(
            AsyncMpClient::from_streams(a, b),
            Err(ClientError::Config(_))
        ));
    }

    #[tokio::test]
    async fn generation_outputs_flow_through_the_pump() {
        let (client, mut worker) = client_with_fake_worker();
        client
            .add_request_async(EngineCoreRequest::new("r1", vec![5]).with_prompt("p"))
            .await
            .unwrap();
        let EngineCoreInput::Add(request) = worker.next_request().await else {
            panic!("expected add");
        };
        assert_eq!(request.prompt, None);

        worker
            .outputs
            .send(OutputFrame::Batch(OutputBatch::Generation(EngineCoreOutputs::new(
                vec![EngineCoreOutput {
                    request_id: "r1".into(),
                    new_token_ids: vec![5],
                    finish_reason: None,
                    stop_reason: None,
                }],
            ))))
            .await
            .unwrap();

        let out = client.get_output_async().await.unwrap();
        assert_eq!(out.request_ids().collect::<Vec<_>>(), ["r1"]);
    }

    #[tokio::test]
    async fn concurrent_utility_calls_resolve_independently() {
        let (client, mut worker) = client_with_fake_worker();

        let responder = async {
            let first = worker.next_call().await;
            let second = worker.next_call().await;
            // Answer out of order.
            for call in [second, first] {
                let value = match call.method {
                    UtilityMethod::AddLora { .. } => UtilityValue::Bool(true),
                    UtilityMethod::ListLoras => UtilityValue::LoraIds(BTreeSet::from([8])),
                    other => panic!("unexpected method {:?}", other),
                };
                worker
                    .outputs
                    .send(OutputFrame::Batch(OutputBatch::Utility(UtilityOutput::success(
                        call.call_id,
                        value,
                    ))))
                    .await
                    .unwrap();
            }
        };

        let (added, listed, ()) = tokio::join!(
            client.add_lora_async(crate::bridge::protocol::LoraRequest::new("a", 8, "/a")),
            client.list_loras_async(),
            responder,
        );
        assert!(added.unwrap());
        assert_eq!(listed.unwrap(), BTreeSet::from([8]));
    }

    #[tokio::test]
    async fn remote_failure_stays_scoped_to_its_call() {
        let (client, mut worker) = client_with_fake_worker();
        let responder = async {
            let call = worker.next_call().await;
            worker
                .outputs
                .send(OutputFrame::Batch(OutputBatch::Utility(UtilityOutput::failure(
                    call.call_id,
                    "unsupported sleep level 9",
                ))))
                .await
                .unwrap();
        };

        let (result, ()) = tokio::join!(client.sleep_async(9), responder);
        assert!(matches!(
            result,
            Err(ClientError::Utility { method: "sleep", .. })
        ));
        assert!(!client.is_engine_dead());
    }

    #[tokio::test]
    async fn dead_sentinel_fails_pending_and_later_calls() {
        let (client, mut worker) = client_with_fake_worker();
        let responder = async {
            worker.next_call().await;
            worker.outputs.send(OutputFrame::EngineDead).await.unwrap();
        };

        let (result, ()) = tokio::join!(client.wake_up_async(), responder);
        assert!(matches!(result, Err(ClientError::EngineDead)));
        assert!(matches!(
            client.get_output_async().await,
            Err(ClientError::EngineDead)
        ));
        assert!(matches!(
            client.profile_async(true).await,
            Err(ClientError::EngineDead)
        ));
        assert!(client.is_engine_dead());
    }

    #[tokio::test]
    async fn cancelled_call_releases_its_slot() {
        let (client, mut worker) = client_with_fake_worker();
        let timed_out = tokio::time::timeout(
            Duration::from_millis(50),
            client.execute_dummy_batch_async(),
        )
        .await;
        assert!(timed_out.is_err());
        assert_eq!(client.correlator.pending_count(), 0);

        // The late answer is ignored.
        let call = worker.next_call().await;
        worker
            .outputs
            .send(OutputFrame::Batch(OutputBatch::Utility(UtilityOutput::success(
                call.call_id,
                UtilityValue::Unit,
            ))))
            .await
            .unwrap();
        assert!(!client.is_engine_dead());
    }

    #[tokio::test]
    async fn shutdown_wakes_output_waiters() {
        let (client, _worker) = client_with_fake_worker();
        client.shutdown();
        client.shutdown();
        assert!(matches!(
            client.get_output_async().await,
            Err(ClientError::ShutDown)
        ));
        assert!(matches!(
            client.add_request_async(EngineCoreRequest::new("late", vec![])).await,
            Err(ClientError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn blocking_surface_is_unsupported() {
        let (client, _worker) = client_with_fake_worker();
        assert!(matches!(
            client.get_output(),
            Err(ClientError::Unsupported("get_output"))
        ));
        assert!(matches!(
            client.list_loras(),
            Err(ClientError::Unsupported("call_utility"))
        ));
    }
}
