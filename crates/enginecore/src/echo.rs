//! Reference engine that echoes prompt tokens back.
//!
//! Each `step` finishes exactly one pending request (FIFO), echoing up to
//! `max_tokens` of its prompt tokens. A request naming a LoRA that is not
//! loaded is aborted with a stop reason instead. Used by the demo worker
//! binary and tests.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use anyhow::{bail, ensure};

use crate::bridge::protocol::{
    EngineCoreOutput, EngineCoreOutputs, EngineCoreRequest, FinishReason, LoraRequest,
};
use crate::engine::{EngineCore, EngineFactory};

#[derive(Debug, Default)]
pub struct EchoEngine {
    pending: VecDeque<EngineCoreRequest>,
    loras: BTreeSet<u64>,
    pinned: BTreeSet<u64>,
    sleep_level: Option<u32>,
    profiling: bool,
    steps: u64,
    /// Fail every step after this many, to exercise dead-engine handling.
    fail_after_steps: Option<u64>,
}

impl EchoEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fail_after_steps(mut self, steps: u64) -> Self {
        self.fail_after_steps = Some(steps);
        self
    }

    pub fn factory() -> Arc<dyn EngineFactory> {
        Arc::new(|| -> anyhow::Result<Box<dyn EngineCore>> { Ok(Box::new(EchoEngine::new())) })
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleep_level.is_some()
    }

    pub fn is_profiling(&self) -> bool {
        self.profiling
    }
}

impl EngineCore for EchoEngine {
    fn step(&mut self) -> anyhow::Result<EngineCoreOutputs> {
        if let Some(limit) = self.fail_after_steps
            && self.steps >= limit
        {
            bail!("echo engine step budget of {} exhausted", limit);
        }
        if self.is_sleeping() {
            return Ok(EngineCoreOutputs::default());
        }
        let Some(request) = self.pending.pop_front() else {
            return Ok(EngineCoreOutputs::default());
        };
        self.steps += 1;

        if let Some(lora) = &request.lora_request
            && !self.loras.contains(&lora.lora_int_id)
        {
            let stop_reason = format!("LoRA {} is not loaded", lora.lora_int_id);
            return Ok(EngineCoreOutputs::new(vec![EngineCoreOutput {
                request_id: request.request_id,
                new_token_ids: vec![],
                finish_reason: Some(FinishReason::Abort),
                stop_reason: Some(stop_reason),
            }]));
        }

        let max_tokens = request.sampling_params.max_tokens as usize;
        let truncated = request.prompt_token_ids.len() > max_tokens;
        let output = EngineCoreOutput {
            request_id: request.request_id,
            new_token_ids: request.prompt_token_ids.into_iter().take(max_tokens).collect(),
            finish_reason: Some(if truncated {
                FinishReason::Length
            } else {
                FinishReason::Stop
            }),
            stop_reason: None,
        };
        Ok(EngineCoreOutputs::new(vec![output]))
    }

    fn add_request(&mut self, request: EngineCoreRequest) {
        tracing::trace!(request_id = %request.request_id, "Echo engine queued request");
        self.pending.push_back(request);
    }

    fn abort_requests(&mut self, request_ids: &[String]) {
        self.pending
            .retain(|r| !request_ids.iter().any(|id| *id == r.request_id));
    }

    fn has_unfinished_requests(&self) -> bool {
        !self.pending.is_empty() && !self.is_sleeping()
    }

    fn profile(&mut self, is_start: bool) -> anyhow::Result<()> {
        self.profiling = is_start;
        Ok(())
    }

    fn reset_prefix_cache(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn sleep(&mut self, level: u32) -> anyhow::Result<()> {
        ensure!(level == 1 || level == 2, "unsupported sleep level {}", level);
        self.sleep_level = Some(level);
        Ok(())
    }

    fn wake_up(&mut self) -> anyhow::Result<()> {
        self.sleep_level = None;
        Ok(())
    }

    fn execute_dummy_batch(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn add_lora(&mut self, lora: LoraRequest) -> anyhow::Result<bool> {
        Ok(self.loras.insert(lora.lora_int_id))
    }

    fn remove_lora(&mut self, lora_id: u64) -> anyhow::Result<bool> {
        self.pinned.remove(&lora_id);
        Ok(self.loras.remove(&lora_id))
    }

    fn list_loras(&self) -> anyhow::Result<BTreeSet<u64>> {
        Ok(self.loras.clone())
    }

    fn pin_lora(&mut self, lora_id: u64) -> anyhow::Result<bool> {
        ensure!(self.loras.contains(&lora_id), "LoRA {} is not loaded", lora_id);
        Ok(self.pinned.insert(lora_id))
    }
}
