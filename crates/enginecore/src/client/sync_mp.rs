//! Blocking multiprocess client.
//!
//! Requests are written straight to the request channel. A dedicated pump
//! thread is the only reader of the response channel; `get_output` only
//! pops the queue it fills.

use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::pump::{OutputItem, OutputRouter, run_blocking_pump};
use super::{Connection, EngineCoreClient, connect_worker};
use crate::bridge::codec::{BlockingFramed, OutputCodec, RequestCodec};
use crate::bridge::protocol::{
    EngineCoreInput, EngineCoreOutputs, EngineCoreRequest, UtilityCall, UtilityMethod,
    UtilityValue,
};
use crate::correlator::UtilityCorrelator;
use crate::error::ClientError;
use crate::health::EngineHealth;
use crate::launcher::WorkerLauncher;
use crate::resources::{BackgroundResources, EngineState, PumpHandle};

pub struct SyncMpClient {
    input: Mutex<BlockingFramed<UnixStream, RequestCodec>>,
    outputs: Mutex<Receiver<OutputItem>>,
    correlator: Arc<UtilityCorrelator>,
    state: Arc<EngineState>,
    resources: Mutex<BackgroundResources>,
    shut_down: AtomicBool,
}

impl SyncMpClient {
    /// Launch a worker and connect to it.
    pub fn new(launcher: &dyn WorkerLauncher, startup_timeout: Duration) -> Result<Self, ClientError> {
        let state = EngineState::new();
        let correlator = UtilityCorrelator::new();
        let Connection {
            resources,
            input,
            output,
        } = connect_worker(launcher, startup_timeout, &state, &correlator)?;
        Self::assemble(resources, input, output, state, correlator)
    }

    /// Client over already-connected channels, with no worker to manage.
    pub fn from_streams(input: UnixStream, output: UnixStream) -> Result<Self, ClientError> {
        let state = EngineState::new();
        let correlator = UtilityCorrelator::new();
        let mut resources =
            BackgroundResources::new(Arc::clone(&state), Some(Arc::clone(&correlator)));
        resources.input_channel = Some(input.try_clone()?);
        resources.output_channel = Some(output.try_clone()?);
        Self::assemble(resources, input, output, state, correlator)
    }

    fn assemble(
        mut resources: BackgroundResources,
        input: UnixStream,
        output: UnixStream,
        state: Arc<EngineState>,
        correlator: Arc<UtilityCorrelator>,
    ) -> Result<Self, ClientError> {
        let (tx, rx) = mpsc::channel();
        let router = OutputRouter::new(Arc::clone(&state), Arc::clone(&correlator), tx);
        let reader = BlockingFramed::new(output, OutputCodec::new());
        let pump = std::thread::Builder::new()
            .name("enginecore-output-pump".to_string())
            .spawn(move || run_blocking_pump(reader, router))?;
        resources.pump = Some(PumpHandle::Thread(pump));
        state.mark_running();

        Ok(Self {
            input: Mutex::new(BlockingFramed::new(input, RequestCodec::new())),
            outputs: Mutex::new(rx),
            correlator,
            state,
            resources: Mutex::new(resources),
            shut_down: AtomicBool::new(false),
        })
    }

    fn send_input(&self, input: EngineCoreInput) -> Result<(), ClientError> {
        if self.state.is_dead() {
            return Err(ClientError::EngineDead);
        }
        if self.state.is_closing() {
            return Err(self.state.closed_error());
        }
        let mut channel = self.input.lock().unwrap_or_else(PoisonError::into_inner);
        channel
            .send(input)
            .map_err(|e| self.state.rewrite(ClientError::Transport(e)))
    }

    fn outputs(&self) -> MutexGuard<'_, Receiver<OutputItem>> {
        self.outputs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl EngineCoreClient for SyncMpClient {
    fn add_request(&self, mut request: EngineCoreRequest) -> Result<(), ClientError> {
        // The worker only needs token ids.
        request.prompt = None;
        self.send_input(EngineCoreInput::Add(request))
    }

    fn get_output(&self) -> Result<EngineCoreOutputs, ClientError> {
        if self.state.is_dead() {
            return Err(ClientError::EngineDead);
        }
        match self.outputs().recv() {
            Ok(item) => item.map_err(|e| self.state.rewrite(e)),
            // Pump gone and queue drained.
            Err(_) => Err(self.state.closed_error()),
        }
    }

    fn abort_requests(&self, request_ids: &[String]) -> Result<(), ClientError> {
        if request_ids.is_empty() {
            return Ok(());
        }
        self.send_input(EngineCoreInput::Abort(request_ids.to_vec()))
    }

    fn call_utility(&self, method: UtilityMethod) -> Result<UtilityValue, ClientError> {
        let call = self
            .correlator
            .register(method.name())
            .map_err(|e| self.state.rewrite(e))?;
        self.send_input(EngineCoreInput::Utility(UtilityCall {
            call_id: call.call_id(),
            method,
        }))?;
        call.wait_blocking().map_err(|e| match e {
            ClientError::Utility { .. } => e,
            other => self.state.rewrite(other),
        })
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down engine core client");
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release();
    }

    fn health(&self) -> EngineHealth {
        self.state.health()
    }
}

impl Drop for SyncMpClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::bridge::protocol::{LoraRequest, OutputBatch, OutputFrame, UtilityOutput};

    /// Client wired to a fake worker we drive by hand.
    struct FakeWorker {
        requests: BlockingFramed<UnixStream, RequestCodec>,
        outputs: BlockingFramed<UnixStream, OutputCodec>,
    }

    fn client_with_fake_worker() -> (SyncMpClient, FakeWorker) {
        let (client_input, worker_input) = UnixStream::pair().unwrap();
        let (worker_output, client_output) = UnixStream::pair().unwrap();
        let client = SyncMpClient::from_streams(client_input, client_output).unwrap();
        (
            client,
            FakeWorker {
                requests: BlockingFramed::new(worker_input, RequestCodec::new()),
                outputs: BlockingFramed::new(worker_output, OutputCodec::new()),
            },
        )
    }

    fn generation(ids: &[&str]) -> OutputFrame {
        OutputFrame::Batch(OutputBatch::Generation(EngineCoreOutputs::new(
            ids.iter()
                .map(|id| crate::bridge::protocol::EngineCoreOutput {
                    request_id: id.to_string(),
                    new_token_ids: vec![],
                    finish_reason: None,
                    stop_reason: None,
                })
                .collect(),
        )))
    }

    #[test]
    fn add_request_strips_prompt() {
        let (client, mut worker) = client_with_fake_worker();
        client
            .add_request(
                EngineCoreRequest::new("r1", vec![1, 2])
                    .with_prompt("hello")
                    .with_lora(LoraRequest::new("a", 7, "/a")),
            )
            .unwrap();

        match worker.requests.next_frame().unwrap().unwrap() {
            EngineCoreInput::Add(request) => {
                assert_eq!(request.request_id, "r1");
                assert_eq!(request.prompt, None);
                assert_eq!(request.prompt_token_ids, vec![1, 2]);
                assert_eq!(request.lora_request.map(|l| l.lora_int_id), Some(7));
            }
            other => panic!("unexpected input: {:?}", other),
        }
    }

    #[test]
    fn abort_sends_one_frame_and_skips_empty() {
        let (client, mut worker) = client_with_fake_worker();
        client.abort_requests(&[]).unwrap();
        client
            .abort_requests(&["a".to_string(), "b".to_string()])
            .unwrap();
        client.shutdown();

        assert_eq!(
            worker.requests.next_frame().unwrap().unwrap(),
            EngineCoreInput::Abort(vec!["a".to_string(), "b".to_string()])
        );
        assert!(worker.requests.next_frame().is_none());
    }

    #[test]
    fn utility_result_is_routed_by_call_id() {
        let (client, mut worker) = client_with_fake_worker();
        let client = Arc::new(client);
        let caller = {
            let client = Arc::clone(&client);
            std::thread::spawn(move || client.list_loras())
        };

        let EngineCoreInput::Utility(call) = worker.requests.next_frame().unwrap().unwrap() else {
            panic!("expected utility call");
        };
        assert_eq!(call.method, UtilityMethod::ListLoras);

        // A generation batch in between goes to the queue, not the caller.
        worker.outputs.send(generation(&["r1"])).unwrap();
        worker
            .outputs
            .send(OutputFrame::Batch(OutputBatch::Utility(UtilityOutput::success(
                call.call_id,
                UtilityValue::LoraIds(BTreeSet::from([3])),
            ))))
            .unwrap();

        assert_eq!(caller.join().unwrap().unwrap(), BTreeSet::from([3]));
        assert_eq!(
            client.get_output().unwrap().request_ids().collect::<Vec<_>>(),
            ["r1"]
        );
    }

    #[test]
    fn dead_sentinel_fails_pending_and_later_calls() {
        let (client, mut worker) = client_with_fake_worker();
        let client = Arc::new(client);
        let caller = {
            let client = Arc::clone(&client);
            std::thread::spawn(move || client.reset_prefix_cache())
        };
        let EngineCoreInput::Utility(_) = worker.requests.next_frame().unwrap().unwrap() else {
            panic!("expected utility call");
        };

        worker.outputs.send(OutputFrame::EngineDead).unwrap();

        assert!(matches!(caller.join().unwrap(), Err(ClientError::EngineDead)));
        assert!(matches!(client.get_output(), Err(ClientError::EngineDead)));
        assert!(matches!(client.get_output(), Err(ClientError::EngineDead)));
        assert!(matches!(
            client.add_request(EngineCoreRequest::new("late", vec![])),
            Err(ClientError::EngineDead)
        ));
        assert!(matches!(client.wake_up(), Err(ClientError::EngineDead)));
        assert_eq!(
            client.health(),
            EngineHealth {
                errored: true,
                is_running: false
            }
        );
    }

    #[test]
    fn worker_hangup_is_engine_death() {
        let (client, worker) = client_with_fake_worker();
        drop(worker);
        assert!(matches!(client.get_output(), Err(ClientError::EngineDead)));
        assert!(client.is_engine_dead());
    }

    #[test]
    fn malformed_frame_is_reported_then_reading_continues() {
        let (client, mut worker) = client_with_fake_worker();
        {
            use std::io::Write;
            let stream = worker.outputs.get_ref();
            let mut stream = stream.try_clone().unwrap();
            stream.write_all(&[0, 0, 0, 3, b'{', b'x', b'}']).unwrap();
        }
        worker.outputs.send(generation(&["r2"])).unwrap();

        assert!(matches!(client.get_output(), Err(ClientError::Protocol(_))));
        assert_eq!(
            client.get_output().unwrap().request_ids().collect::<Vec<_>>(),
            ["r2"]
        );
        assert!(!client.is_engine_dead());
    }

    #[test]
    fn undecodable_utility_reply_fails_its_caller() {
        let (client, mut worker) = client_with_fake_worker();
        let client = Arc::new(client);
        let caller = {
            let client = Arc::clone(&client);
            std::thread::spawn(move || client.list_loras())
        };
        let EngineCoreInput::Utility(call) = worker.requests.next_frame().unwrap().unwrap() else {
            panic!("expected utility call");
        };

        let payload = format!(
            r#"{{"kind":"utility","call_id":{},"result":{{"type":"bogus"}}}}"#,
            call.call_id
        );
        {
            use std::io::Write;
            let mut stream = worker.outputs.get_ref().try_clone().unwrap();
            stream
                .write_all(&(payload.len() as u32).to_be_bytes())
                .unwrap();
            stream.write_all(payload.as_bytes()).unwrap();
        }
        worker.outputs.send(generation(&["r3"])).unwrap();

        assert!(matches!(
            caller.join().unwrap(),
            Err(ClientError::Protocol(_))
        ));
        assert_eq!(client.correlator.pending_count(), 0);
        // The error went to the caller, so the queue only holds the batch.
        assert_eq!(
            client.get_output().unwrap().request_ids().collect::<Vec<_>>(),
            ["r3"]
        );
        assert!(!client.is_engine_dead());
    }

    #[test]
    fn shutdown_is_idempotent_and_not_death() {
        let (client, _worker) = client_with_fake_worker();
        client.shutdown();
        client.shutdown();

        assert!(!client.is_engine_dead());
        assert!(!client.health().is_running);
        assert!(matches!(client.get_output(), Err(ClientError::ShutDown)));
        assert!(matches!(client.sleep(1), Err(ClientError::ShutDown)));
    }

    #[tokio::test]
    async fn async_surface_is_unsupported() {
        let (client, _worker) = client_with_fake_worker();
        assert!(matches!(
            client.get_output_async().await,
            Err(ClientError::Unsupported("get_output_async"))
        ));
        drop(client);
    }
}
