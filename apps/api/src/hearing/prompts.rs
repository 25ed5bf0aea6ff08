// All LLM prompt constants for the hearing pipeline.
// Reuses cross-cutting fragments from llm_client::prompts.

/// Instruction sent alongside the audio for transcription.
pub const TRANSCRIPTION_INSTRUCTION: &str = "\
Transcribe this job-seeker interview recording verbatim. \
Keep the speaker's original language (usually Japanese). \
Do NOT summarise, translate, or add speaker labels, timestamps, or commentary. \
Return only the transcript text.";

/// System prompt for field extraction — enforces JSON-only output.
pub const EXTRACTION_SYSTEM: &str = "You are an expert career advisor filling in a Japanese-style \
    résumé (rirekisho) from an interview with the candidate. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences.";

/// System prompt for quality review — enforces JSON-only output.
pub const QUALITY_SYSTEM: &str = "You are a strict résumé reviewer. \
    You compare extracted résumé fields against the interview transcript they came from. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences.";

/// Stage 1 extraction prompt template.
/// Replace: {grounding_instruction}, {personal_info}, {transcript}, {feedback}
pub const STAGE1_EXTRACTION_TEMPLATE: &str = r#"{grounding_instruction}

KNOWN CANDIDATE DETAILS (context only — do not copy into the output):
{personal_info}

INTERVIEW TRANSCRIPT:
{transcript}
{feedback}
Extract the following fields and return a JSON object with this EXACT schema:
{
  "motivation": "Why the candidate is applying — the 志望動機 section, 2-5 sentences",
  "self_pr": "The candidate's strengths with concrete episodes — the 自己PR section, 3-6 sentences",
  "preferences": "Requested conditions: role, working hours, location, start date — the 本人希望記入欄",
  "hobbies": "Hobbies and special skills, or null if never mentioned"
}

RULES:
1. Write in the language of the transcript, in polite résumé style (です・ます調)
2. Use the candidate's own episodes and numbers; never add achievements they did not mention
3. If the candidate stated no preferences, use "貴社の規定に従います。"
4. Return ONLY the JSON object"#;

/// Stage 2 extraction prompt template.
/// Replace: {grounding_instruction}, {personal_info}, {transcript}, {feedback}
pub const STAGE2_EXTRACTION_TEMPLATE: &str = r#"{grounding_instruction}

KNOWN CANDIDATE DETAILS (use the age or birth date to place school years in time):
{personal_info}

INTERVIEW TRANSCRIPT:
{transcript}
{feedback}
Extract the candidate's biographical history and return a JSON object with this EXACT schema:
{
  "education": [{"year_month": "YYYY-MM", "description": "○○高等学校 入学"}],
  "work_history": [{"year_month": "YYYY-MM", "description": "株式会社○○ 入社 (role)"}],
  "qualifications": [{"year_month": "YYYY-MM", "description": "普通自動車第一種運転免許 取得"}],
  "commute_time": "e.g. 約40分, or null",
  "dependents": 0,
  "has_spouse": null
}

RULES:
1. List every history line in chronological order, one entry per enrolment, graduation, join or leave
2. year_month must be "YYYY-MM"; derive the year from the candidate's age when only a school grade is mentioned
3. Use empty arrays when a history is not mentioned; use null for unknown scalar fields
4. dependents excludes the spouse
5. Return ONLY the JSON object"#;

/// Block inserted into an extraction prompt on a retry attempt.
/// Replace: {correction_instruction}, {issues}
pub const FEEDBACK_TEMPLATE: &str = r#"
REVIEWER FEEDBACK FROM THE PREVIOUS ATTEMPT:
{correction_instruction}
{issues}
"#;

/// Quality check prompt template, shared by both stages.
/// Replace: {stage_focus}, {personal_info}, {transcript}, {extracted_json}
pub const QUALITY_TEMPLATE: &str = r#"Review the extracted résumé fields below.

FOCUS FOR THIS STAGE:
{stage_focus}

KNOWN CANDIDATE DETAILS:
{personal_info}

INTERVIEW TRANSCRIPT:
{transcript}

EXTRACTED FIELDS:
{extracted_json}

Decide whether the extraction is complete and faithful enough to print on the résumé.
Return a JSON object with this EXACT schema:
{
  "acceptable": true,
  "issues": ["One concrete problem per entry, naming the field"],
  "suggested_fix": "One short instruction for the next extraction attempt"
}

RULES:
1. Set "acceptable" to false if any field contradicts the transcript, invents facts, or is empty although the transcript covers it
2. When "acceptable" is true, "issues" must be an empty array
3. Return ONLY the JSON object"#;

pub const STAGE1_QUALITY_FOCUS: &str = "\
Motivation, self-PR and preferences. Each must be specific to this candidate, written in résumé \
style, and supported by the transcript.";

pub const STAGE2_QUALITY_FOCUS: &str = "\
Education, work history and qualifications. Entries must be chronological, dated as YYYY-MM, \
consistent with the candidate's age, and every enrolment must have a matching graduation or \
leave line where the transcript provides one.";
