// Shared prompt fragments used by more than one hearing chain.
// Stage-specific templates live in hearing::prompts.

/// Instruction appended to every extraction prompt.
pub const GROUNDING_INSTRUCTION: &str = "\
    CRITICAL: Every value you extract must be stated or clearly implied by the candidate \
    in the transcript. Do NOT infer, embellish, or invent details. \
    If the transcript does not cover a field, use an empty string, an empty array, or null \
    as the schema allows.";

/// Instruction used when feeding previous quality-check issues back into extraction.
pub const CORRECTION_INSTRUCTION: &str = "\
    A previous extraction attempt was rejected by a reviewer. \
    Address EVERY issue listed below. Keep values that were not criticised unchanged \
    unless the transcript contradicts them.";
