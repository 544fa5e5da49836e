/// System prompt for the comparative grading call.
pub fn grader_system_prompt() -> &'static str {
    "You are an exacting reviewer comparing two LLM responses to the same prompt. \
     You judge only relative quality: accuracy, completeness, clarity and fit to the prompt. \
     You never rewrite the responses and you never grade on length alone."
}

/// Per-case grading instructions embedding the prompt and both outputs.
pub fn grader_instructions(input_text: &str, baseline_output: &str, current_output: &str) -> String {
    format!(
        "Compare the NEW response against the BASELINE response for the prompt below.\n\
         \n\
         PROMPT:\n{input_text}\n\
         \n\
         BASELINE RESPONSE:\n{baseline_output}\n\
         \n\
         NEW RESPONSE:\n{current_output}\n\
         \n\
         Grade the NEW response relative to the BASELINE on this scale:\n\
         -2 = much worse\n\
         -1 = worse\n\
          0 = about the same\n\
         +1 = better\n\
         +2 = much better\n\
         \n\
         Reply with the grade on the first line in the form `Grade: <value>`, \
         then a short explanation of the differences on the following lines."
    )
}
