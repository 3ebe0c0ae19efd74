use crate::failure::FailureLog;

/// Output contract every backend is asked to follow.
pub const DIAGNOSIS_SCHEMA: &str = r#"{
  "matcher": "regex string that uniquely identifies this error",
  "test_ok": ["string that matches the regex (e.g., the error line)"],
  "test_fail": ["string that should NOT match"],
  "packages": [
    { "name": "package_name", "manager": "package manager command (e.g., apt, brew, go, pip, apk)" }
  ],
  "install_commands": ["full command to install the dependencies now (e.g., 'apt-get install -y foo', 'go get bar')"]
}"#;

const PROMPT_HEADER: &str = "\
You are an expert software engineer debugging a failed build or install command.
The command's captured output is below (stderr first, then stdout).";

const PROMPT_INSTRUCTIONS: &str = "\
Analyze the error and identify the missing dependencies.
Produce a single JSON object that defines a \"matcher\" for this error and lists what to install.
The JSON must follow this exact structure and contain every key shown:";

const PROMPT_RULES: &str = "\
Rules:
- Respond with the JSON object only, no prose and no markdown.
- The 'matcher' regex must be robust but specific enough to catch only this error type.
- Every 'test_ok' entry must match the regex; no 'test_fail' entry may match it.
- List packages in the order they should be installed. Use an empty list if nothing can be installed.";

/// Build the prompt for `log`. Identical logs always give identical prompts.
pub fn diagnosis_prompt(log: &FailureLog) -> String {
    format!(
        "{header}\n\nError Log:\n{log}\n\n{instructions}\n{schema}\n\n{rules}\n",
        header = PROMPT_HEADER,
        log = log.as_str().trim_end(),
        instructions = PROMPT_INSTRUCTIONS,
        schema = DIAGNOSIS_SCHEMA,
        rules = PROMPT_RULES,
    )
}
