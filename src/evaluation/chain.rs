//! Prompt chain validation and per-image rendering.
//!
//! A chain is a short, ordered list of prompt steps. Step k may reference
//! earlier raw outputs with `{output<i>}` tokens (i < k); rendering happens
//! per image because every substitution depends on that image's own step
//! outputs.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::config::MAX_PROMPT_STEPS;
use crate::evaluation::{PromptStep, StepResult};

static OUTPUT_TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{output(\d+)\}").unwrap());

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ChainValidationError {
    #[error("prompt chain must have at least one step")]
    Empty,

    #[error("prompt chain has {0} steps, maximum is {MAX_PROMPT_STEPS}")]
    TooLong(usize),

    #[error("step numbers must be contiguous from 1: expected {expected}, found {found}")]
    NonContiguous { expected: u32, found: u32 },

    #[error("step {0} has an empty prompt")]
    EmptyPrompt(u32),
}

/// Checks chain shape at job creation: 1..=MAX_PROMPT_STEPS steps, numbered
/// contiguously from 1, each with a non-empty prompt template.
pub fn validate(chain: &[PromptStep]) -> Result<(), ChainValidationError> {
    if chain.is_empty() {
        return Err(ChainValidationError::Empty);
    }
    if chain.len() > MAX_PROMPT_STEPS {
        return Err(ChainValidationError::TooLong(chain.len()));
    }
    for (idx, step) in chain.iter().enumerate() {
        let expected = idx as u32 + 1;
        if step.step_number != expected {
            return Err(ChainValidationError::NonContiguous {
                expected,
                found: step.step_number,
            });
        }
        if step.prompt.trim().is_empty() {
            return Err(ChainValidationError::EmptyPrompt(step.step_number));
        }
    }
    Ok(())
}

/// Later steps without an explicit system message inherit step 1's. Applied
/// once at job creation so the stored chain is already fully resolved.
pub fn apply_system_message_defaults(chain: &mut [PromptStep]) {
    let default = chain.first().and_then(|s| s.system_message.clone());
    let Some(default) = default else { return };
    for step in chain.iter_mut().skip(1) {
        if step.system_message.is_none() {
            step.system_message = Some(default.clone());
        }
    }
}

/// A `{output<i>}` token that could not be resolved. Non-fatal: the token
/// renders as an empty string so the chain keeps its diagnostic value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderWarning {
    pub step_number: u32,
    pub token: String,
}

impl std::fmt::Display for RenderWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "step {}: unresolved {}", self.step_number, self.token)
    }
}

#[derive(Debug, Clone)]
pub struct RenderedStep {
    pub system_message: Option<String>,
    pub prompt: String,
    pub warnings: Vec<RenderWarning>,
}

/// Renders one step for one image, substituting `{output<i>}` tokens with
/// the raw text of prior steps. A token referencing a failed step, a future
/// step, or a step that does not exist renders empty and is flagged.
pub fn render_step(step: &PromptStep, prior: &[StepResult]) -> RenderedStep {
    let mut prompt = String::with_capacity(step.prompt.len());
    let mut warnings = Vec::new();
    let mut last = 0;

    for caps in OUTPUT_TOKEN.captures_iter(&step.prompt) {
        let m = caps.get(0).unwrap();
        prompt.push_str(&step.prompt[last..m.start()]);
        last = m.end();

        let referenced = caps
            .get(1)
            .and_then(|g| g.as_str().parse::<u32>().ok())
            .filter(|i| *i >= 1 && *i < step.step_number);
        let resolved = referenced.and_then(|i| {
            prior
                .iter()
                .find(|r| r.step_number == i)
                .and_then(|r| r.raw_text.as_deref())
        });

        match resolved {
            Some(text) => prompt.push_str(text),
            None => warnings.push(RenderWarning {
                step_number: step.step_number,
                token: m.as_str().to_string(),
            }),
        }
    }
    prompt.push_str(&step.prompt[last..]);

    RenderedStep {
        system_message: step.system_message.clone(),
        prompt,
        warnings,
    }
}

// ============================================================================
// Tests
// ============================================================================
