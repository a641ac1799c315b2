//! Wire protocol types for client-worker communication.
//!
//! Two channels:
//! - **Request channel** (client → worker): Add, Abort, Utility
//! - **Response channel** (worker → client): generation batches, utility results,
//!   and the dead sentinel
//!
//! Worker processes additionally report startup status on stdout (`StartupReport`).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Discriminator byte at the start of every request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EngineCoreRequestType {
    Add = 0x00,
    Abort = 0x01,
    Utility = 0x02,
}

impl EngineCoreRequestType {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Add),
            0x01 => Some(Self::Abort),
            0x02 => Some(Self::Utility),
            _ => None,
        }
    }
}

/// Sampling knobs forwarded to the engine untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_tokens: 16,
            temperature: 1.0,
            top_p: 1.0,
            stop: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoraRequest {
    pub lora_name: String,
    pub lora_int_id: u64,
    pub lora_path: String,
}

impl LoraRequest {
    pub fn new(lora_name: impl Into<String>, lora_int_id: u64, lora_path: impl Into<String>) -> Self {
        Self {
            lora_name: lora_name.into(),
            lora_int_id,
            lora_path: lora_path.into(),
        }
    }
}

/// A unit of work submitted to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineCoreRequest {
    pub request_id: String,
    /// Original prompt text. Multiprocess clients drop it before sending; the
    /// engine only consumes token ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub prompt_token_ids: Vec<u32>,
    #[serde(default)]
    pub sampling_params: SamplingParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora_request: Option<LoraRequest>,
}

impl EngineCoreRequest {
    pub fn new(request_id: impl Into<String>, prompt_token_ids: Vec<u32>) -> Self {
        Self {
            request_id: request_id.into(),
            prompt: None,
            prompt_token_ids,
            sampling_params: SamplingParams::default(),
            lora_request: None,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_sampling_params(mut self, params: SamplingParams) -> Self {
        self.sampling_params = params;
        self
    }

    pub fn with_lora(mut self, lora: LoraRequest) -> Self {
        self.lora_request = Some(lora);
        self
    }
}

/// Administrative call multiplexed over the generation channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum UtilityMethod {
    Profile { is_start: bool },
    ResetPrefixCache,
    Sleep { level: u32 },
    WakeUp,
    ExecuteDummyBatch,
    AddLora { lora: LoraRequest },
    RemoveLora { lora_id: u64 },
    ListLoras,
    PinLora { lora_id: u64 },
}

impl UtilityMethod {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Profile { .. } => "profile",
            Self::ResetPrefixCache => "reset_prefix_cache",
            Self::Sleep { .. } => "sleep",
            Self::WakeUp => "wake_up",
            Self::ExecuteDummyBatch => "execute_dummy_batch",
            Self::AddLora { .. } => "add_lora",
            Self::RemoveLora { .. } => "remove_lora",
            Self::ListLoras => "list_loras",
            Self::PinLora { .. } => "pin_lora",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtilityCall {
    pub call_id: u64,
    pub method: UtilityMethod,
}

/// Value returned by a utility method.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum UtilityValue {
    #[default]
    Unit,
    Bool(bool),
    LoraIds(BTreeSet<u64>),
}

impl UtilityValue {
    pub fn into_unit(self) -> Result<(), ClientError> {
        match self {
            Self::Unit => Ok(()),
            other => Err(other.mismatch("unit")),
        }
    }

    pub fn into_bool(self) -> Result<bool, ClientError> {
        match self {
            Self::Bool(b) => Ok(b),
            other => Err(other.mismatch("bool")),
        }
    }

    pub fn into_lora_ids(self) -> Result<BTreeSet<u64>, ClientError> {
        match self {
            Self::LoraIds(ids) => Ok(ids),
            other => Err(other.mismatch("lora id set")),
        }
    }

    fn mismatch(&self, expected: &str) -> ClientError {
        ClientError::Protocol(format!(
            "utility result type mismatch: expected {}, got {:?}",
            expected, self
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtilityOutput {
    pub call_id: u64,
    /// Set when the method failed in the worker; `result` is then meaningless.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    #[serde(default)]
    pub result: UtilityValue,
}

impl UtilityOutput {
    pub fn success(call_id: u64, result: UtilityValue) -> Self {
        Self {
            call_id,
            failure_message: None,
            result,
        }
    }

    pub fn failure(call_id: u64, message: impl Into<String>) -> Self {
        Self {
            call_id,
            failure_message: Some(message.into()),
            result: UtilityValue::Unit,
        }
    }
}

/// Everything the client can put on the request channel.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCoreInput {
    Add(EngineCoreRequest),
    Abort(Vec<String>),
    Utility(UtilityCall),
}

impl EngineCoreInput {
    pub fn request_type(&self) -> EngineCoreRequestType {
        match self {
            Self::Add(_) => EngineCoreRequestType::Add,
            Self::Abort(_) => EngineCoreRequestType::Abort,
            Self::Utility(_) => EngineCoreRequestType::Utility,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    Abort,
}

/// Per-request result produced by one engine step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCoreOutput {
    pub request_id: String,
    #[serde(default)]
    pub new_token_ids: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    /// Request-local failure or stop detail. Never affects other requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

impl EngineCoreOutput {
    pub fn finished(&self) -> bool {
        self.finish_reason.is_some()
    }
}

/// A batch of generation results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineCoreOutputs {
    #[serde(default)]
    pub outputs: Vec<EngineCoreOutput>,
}

impl EngineCoreOutputs {
    pub fn new(outputs: Vec<EngineCoreOutput>) -> Self {
        Self { outputs }
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn request_ids(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|o| o.request_id.as_str())
    }
}

/// One decoded response-channel message: either a utility result or
/// generation outputs, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputBatch {
    Generation(EngineCoreOutputs),
    Utility(UtilityOutput),
}

/// Codec-level response frame. `EngineDead` is the raw sentinel, not JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputFrame {
    Batch(OutputBatch),
    EngineDead,
    /// Well-framed payload that did not decode. Only produced by the decoder,
    /// so a reader can report it and keep going. `call_id` is set when the
    /// payload was a JSON object carrying one, so the waiting caller can be
    /// failed instead of left hanging.
    Malformed { call_id: Option<u64>, error: String },
}

/// Startup status a worker reports before the parent trusts the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StartupReport {
    Ready,
    Failed { error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_type_bytes_are_stable() {
        for ty in [
            EngineCoreRequestType::Add,
            EngineCoreRequestType::Abort,
            EngineCoreRequestType::Utility,
        ] {
            assert_eq!(EngineCoreRequestType::from_byte(ty.as_byte()), Some(ty));
        }
        assert_eq!(EngineCoreRequestType::Add.as_byte(), 0x00);
        assert_eq!(EngineCoreRequestType::Utility.as_byte(), 0x02);
        assert_eq!(EngineCoreRequestType::from_byte(0x7f), None);
    }

    #[test]
    fn utility_call_serializes() {
        let call = UtilityCall {
            call_id: 42,
            method: UtilityMethod::PinLora { lora_id: 7 },
        };
        insta::assert_json_snapshot!(call, @r#"
        {
          "call_id": 42,
          "method": {
            "name": "pin_lora",
            "lora_id": 7
          }
        }
        "#);
    }

    #[test]
    fn unit_utility_method_serializes() {
        let call = UtilityCall {
            call_id: 1,
            method: UtilityMethod::ResetPrefixCache,
        };
        insta::assert_json_snapshot!(call, @r#"
        {
          "call_id": 1,
          "method": {
            "name": "reset_prefix_cache"
          }
        }
        "#);
    }

    #[test]
    fn utility_failure_serializes() {
        let out = UtilityOutput::failure(9, "LoRA 7 is not loaded");
        insta::assert_json_snapshot!(out, @r#"
        {
          "call_id": 9,
          "failure_message": "LoRA 7 is not loaded",
          "result": {
            "type": "unit"
          }
        }
        "#);
    }

    #[test]
    fn generation_batch_serializes() {
        let batch = OutputBatch::Generation(EngineCoreOutputs::new(vec![EngineCoreOutput {
            request_id: "r1".to_string(),
            new_token_ids: vec![1, 2],
            finish_reason: Some(FinishReason::Stop),
            stop_reason: None,
        }]));
        insta::assert_json_snapshot!(batch, @r#"
        {
          "kind": "generation",
          "outputs": [
            {
              "request_id": "r1",
              "new_token_ids": [
                1,
                2
              ],
              "finish_reason": "stop"
            }
          ]
        }
        "#);
    }

    #[test]
    fn startup_report_serializes() {
        let report = StartupReport::Failed {
            error: "no such model".to_string(),
        };
        insta::assert_json_snapshot!(report, @r#"
        {
          "status": "failed",
          "error": "no such model"
        }
        "#);
    }

    #[test]
    fn request_omits_prompt_when_stripped() {
        let req = EngineCoreRequest::new("r1", vec![5]).with_prompt("hello");
        let mut stripped = req.clone();
        stripped.prompt = None;

        let with_prompt = serde_json::to_value(&req).unwrap();
        let without = serde_json::to_value(&stripped).unwrap();
        assert_eq!(with_prompt["prompt"], "hello");
        assert!(without.get("prompt").is_none());
    }

    #[test]
    fn utility_value_accessors_reject_mismatch() {
        assert!(UtilityValue::Bool(true).into_bool().unwrap());
        assert!(UtilityValue::Unit.into_unit().is_ok());
        let err = UtilityValue::Unit.into_bool().unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
    }

    #[test]
    fn utility_output_result_defaults_to_unit() {
        let out: UtilityOutput = serde_json::from_str(r#"{"call_id": 3}"#).unwrap();
        assert_eq!(out.result, UtilityValue::Unit);
        assert!(out.failure_message.is_none());
    }
}
