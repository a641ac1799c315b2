//! Engine core collaborator interface.
//!
//! The engine itself (scheduling, model execution) lives outside this crate.
//! Both the worker loop and the in-process client drive it through
//! `EngineCore`, and utility calls are dispatched with `apply_utility`.

use std::collections::BTreeSet;

use crate::bridge::protocol::{
    EngineCoreOutputs, EngineCoreRequest, LoraRequest, UtilityMethod, UtilityValue,
};

/// The compute engine, treated as opaque.
pub trait EngineCore: Send {
    /// Run one scheduling/execution step. An error here is fatal for the engine.
    fn step(&mut self) -> anyhow::Result<EngineCoreOutputs>;

    fn add_request(&mut self, request: EngineCoreRequest);

    fn abort_requests(&mut self, request_ids: &[String]);

    /// Whether `step` has work to do. The worker blocks on input when false.
    fn has_unfinished_requests(&self) -> bool;

    fn profile(&mut self, is_start: bool) -> anyhow::Result<()>;

    fn reset_prefix_cache(&mut self) -> anyhow::Result<()>;

    fn sleep(&mut self, level: u32) -> anyhow::Result<()>;

    fn wake_up(&mut self) -> anyhow::Result<()>;

    fn execute_dummy_batch(&mut self) -> anyhow::Result<()>;

    fn add_lora(&mut self, lora: LoraRequest) -> anyhow::Result<bool>;

    fn remove_lora(&mut self, lora_id: u64) -> anyhow::Result<bool>;

    fn list_loras(&self) -> anyhow::Result<BTreeSet<u64>>;

    fn pin_lora(&mut self, lora_id: u64) -> anyhow::Result<bool>;

    fn shutdown(&mut self) {}
}

/// Builds an engine inside whichever thread or process will own it.
pub trait EngineFactory: Send + Sync {
    fn build(&self) -> anyhow::Result<Box<dyn EngineCore>>;
}

impl<F> EngineFactory for F
where
    F: Fn() -> anyhow::Result<Box<dyn EngineCore>> + Send + Sync,
{
    fn build(&self) -> anyhow::Result<Box<dyn EngineCore>> {
        self()
    }
}

/// Dispatch a utility method to the engine.
pub fn apply_utility(
    engine: &mut dyn EngineCore,
    method: UtilityMethod,
) -> anyhow::Result<UtilityValue> {
    let value = match method {
        UtilityMethod::Profile { is_start } => {
            engine.profile(is_start)?;
            UtilityValue::Unit
        }
        UtilityMethod::ResetPrefixCache => {
            engine.reset_prefix_cache()?;
            UtilityValue::Unit
        }
        UtilityMethod::Sleep { level } => {
            engine.sleep(level)?;
            UtilityValue::Unit
        }
        UtilityMethod::WakeUp => {
            engine.wake_up()?;
            UtilityValue::Unit
        }
        UtilityMethod::ExecuteDummyBatch => {
            engine.execute_dummy_batch()?;
            UtilityValue::Unit
        }
        UtilityMethod::AddLora { lora } => UtilityValue::Bool(engine.add_lora(lora)?),
        UtilityMethod::RemoveLora { lora_id } => UtilityValue::Bool(engine.remove_lora(lora_id)?),
        UtilityMethod::ListLoras => UtilityValue::LoraIds(engine.list_loras()?),
        UtilityMethod::PinLora { lora_id } => UtilityValue::Bool(engine.pin_lora(lora_id)?),
    };
    Ok(value)
}
