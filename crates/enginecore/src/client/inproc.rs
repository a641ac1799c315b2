//! In-process client: the caller drives the engine directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::EngineCoreClient;
use crate::bridge::protocol::{EngineCoreOutputs, EngineCoreRequest, UtilityMethod, UtilityValue};
use crate::engine::{EngineCore, EngineFactory, apply_utility};
use crate::error::ClientError;
use crate::health::EngineHealth;
use crate::resources::EngineState;

/// Runs the engine on the calling thread. `get_output` performs one step.
pub struct InprocClient {
    engine: Mutex<Box<dyn EngineCore>>,
    state: Arc<EngineState>,
    shut_down: AtomicBool,
}

impl InprocClient {
    pub fn new(factory: &dyn EngineFactory) -> Result<Self, ClientError> {
        let engine = factory
            .build()
            .map_err(|e| ClientError::Startup(format!("{:#}", e)))?;
        let state = EngineState::new();
        state.mark_running();
        tracing::info!("In-process engine core ready");
        Ok(Self {
            engine: Mutex::new(engine),
            state,
            shut_down: AtomicBool::new(false),
        })
    }

    fn engine(&self) -> Result<MutexGuard<'_, Box<dyn EngineCore>>, ClientError> {
        if self.state.is_closing() {
            return Err(self.state.closed_error());
        }
        self.engine
            .lock()
            .map_err(|_| ClientError::Engine("engine lock poisoned by an earlier panic".to_string()))
    }
}

#[async_trait]
impl EngineCoreClient for InprocClient {
    fn add_request(&self, request: EngineCoreRequest) -> Result<(), ClientError> {
        self.engine()?.add_request(request);
        Ok(())
    }

    async fn add_request_async(&self, request: EngineCoreRequest) -> Result<(), ClientError> {
        self.add_request(request)
    }

    fn get_output(&self) -> Result<EngineCoreOutputs, ClientError> {
        self.engine()?
            .step()
            .map_err(|e| ClientError::Engine(format!("{:#}", e)))
    }

    async fn get_output_async(&self) -> Result<EngineCoreOutputs, ClientError> {
        self.get_output()
    }

    fn abort_requests(&self, request_ids: &[String]) -> Result<(), ClientError> {
        if request_ids.is_empty() {
            return Ok(());
        }
        self.engine()?.abort_requests(request_ids);
        Ok(())
    }

    async fn abort_requests_async(&self, request_ids: &[String]) -> Result<(), ClientError> {
        self.abort_requests(request_ids)
    }

    fn call_utility(&self, method: UtilityMethod) -> Result<UtilityValue, ClientError> {
        let name = method.name();
        let mut engine = self.engine()?;
        apply_utility(engine.as_mut(), method).map_err(|e| ClientError::Utility {
            method: name,
            message: format!("{:#}", e),
        })
    }

    async fn call_utility_async(&self, method: UtilityMethod) -> Result<UtilityValue, ClientError> {
        self.call_utility(method)
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.mark_closing();
        self.engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shutdown();
        tracing::info!("In-process engine core shut down");
    }

    fn health(&self) -> EngineHealth {
        self.state.health()
    }
}

impl Drop for InprocClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::bridge::protocol::LoraRequest;
    use crate::echo::EchoEngine;

    fn client() -> InprocClient {
        InprocClient::new(EchoEngine::factory().as_ref()).unwrap()
    }

    #[test]
    fn each_get_output_runs_one_step() {
        let client = client();
        client.add_request(EngineCoreRequest::new("r1", vec![1])).unwrap();
        client.add_request(EngineCoreRequest::new("r2", vec![2])).unwrap();

        assert_eq!(
            client.get_output().unwrap().request_ids().collect::<Vec<_>>(),
            ["r1"]
        );
        assert_eq!(
            client.get_output().unwrap().request_ids().collect::<Vec<_>>(),
            ["r2"]
        );
        assert!(client.health().is_running);
    }

    #[tokio::test]
    async fn async_surface_matches_blocking_one() {
        let client = client();
        client
            .add_request_async(EngineCoreRequest::new("r1", vec![9]))
            .await
            .unwrap();
        client.abort_requests_async(&[]).await.unwrap();
        let out = client.get_output_async().await.unwrap();
        assert_eq!(out.outputs[0].new_token_ids, vec![9]);
        assert!(client.add_lora_async(LoraRequest::new("a", 2, "/a")).await.unwrap());
        assert_eq!(client.list_loras_async().await.unwrap(), BTreeSet::from([2]));
    }

    #[test]
    fn utility_failure_is_scoped_to_the_call() {
        let client = client();
        match client.pin_lora(4) {
            Err(ClientError::Utility { method, .. }) => assert_eq!(method, "pin_lora"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!client.is_engine_dead());
        client.sleep(1).unwrap();
        client.wake_up().unwrap();
    }

    #[test]
    fn step_failure_surfaces_as_engine_error() {
        let factory = || -> anyhow::Result<Box<dyn EngineCore>> {
            Ok(Box::new(EchoEngine::new().with_fail_after_steps(0)))
        };
        let client = InprocClient::new(&factory).unwrap();
        client.add_request(EngineCoreRequest::new("r1", vec![])).unwrap();
        assert!(matches!(client.get_output(), Err(ClientError::Engine(_))));
    }

    #[test]
    fn calls_after_shutdown_fail() {
        let client = client();
        client.shutdown();
        client.shutdown();
        assert!(!client.health().is_running);
        assert!(matches!(
            client.add_request(EngineCoreRequest::new("late", vec![])),
            Err(ClientError::ShutDown)
        ));
    }
}
