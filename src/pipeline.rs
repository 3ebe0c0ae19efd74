//! Remediation pipeline
//!
//! Runs a command, and when it fails: asks a [`DiagnosisProvider`] what is missing,
//! installs it, and retries once. Tracks progress through:
//! first attempt -> diagnosis -> remediation -> second attempt.
//! A supplied log starts at diagnosis.
//!
//! There is at most one diagnosis and at most one retry per run.

use crate::cache::MatcherStore;
use crate::diagnosis::{Diagnosis, DiagnosisError, DiagnosisProvider, RemedialAction};
use crate::failure::FailureLog;
use crate::matcher::MatcherCheck;
use crate::runner::{CommandSpec, ExecutionError, ExecutionResult, Executor};
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

/// Exit status when a remedial action fails; sub-commands may disagree, so one code is used.
pub const REMEDY_FAILURE_EXIT_CODE: i32 = 1;
/// First-attempt exit status assumed for a log piped in from outside.
pub const PIPED_LOG_EXIT_CODE: i32 = 1;
/// Exit status when the target command cannot be started at all.
pub const LAUNCH_FAILURE_EXIT_CODE: i32 = 1;

/// Where the pipeline is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum State {
    #[default]
    Idle,
    FirstAttempt,
    Diagnosing,
    Remediating,
    SecondAttempt,
    Done,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            State::Idle => "idle",
            State::FirstAttempt => "first attempt",
            State::Diagnosing => "diagnosing",
            State::Remediating => "remediating",
            State::SecondAttempt => "second attempt",
            State::Done => "done",
        };
        f.write_str(text)
    }
}

/// What the pipeline starts from.
#[derive(Debug, Clone)]
pub enum PipelineInput {
    /// Run this command; it is also the retry target.
    Command(CommandSpec),
    /// A failure that already happened. Without `retry` there is nothing to remediate.
    Log {
        log: FailureLog,
        retry: Option<CommandSpec>,
    },
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    FirstAttemptSucceeded,
    /// The diagnosis had no remedial actions.
    NoRemedyAvailable { exit_code: i32 },
    /// A diagnosis was made but there was no command to remediate and retry.
    RemediationSkipped { exit_code: i32 },
    /// Action number `position` (1-based) failed; later actions never ran.
    /// `exit_code` is `None` when the action could not be started.
    RemedyFailed {
        action: RemedialAction,
        position: usize,
        exit_code: Option<i32>,
    },
    RetryFailed { exit_code: i32 },
    /// The retry passed. `record` is where the matcher was saved, if saving worked.
    Remediated { record: Option<PathBuf> },
}

impl Outcome {
    /// Process exit status for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::FirstAttemptSucceeded | Outcome::Remediated { .. } => 0,
            Outcome::NoRemedyAvailable { exit_code }
            | Outcome::RemediationSkipped { exit_code }
            | Outcome::RetryFailed { exit_code } => *exit_code,
            Outcome::RemedyFailed { .. } => REMEDY_FAILURE_EXIT_CODE,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Launch(#[from] ExecutionError),
    /// No diagnosis could be obtained; `exit_code` is the first attempt's.
    #[error("{source}")]
    Diagnosis {
        #[source]
        source: DiagnosisError,
        exit_code: i32,
    },
}

impl PipelineError {
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Launch(_) => LAUNCH_FAILURE_EXIT_CODE,
            PipelineError::Diagnosis { exit_code, .. } => *exit_code,
        }
    }
}

pub struct Pipeline<E, P, W> {
    executor: E,
    provider: P,
    store: MatcherStore,
    console: W,
    model_hint: Option<String>,
    install_command: Option<String>,
    prefix_output: bool,
    state: State,
    visited: Vec<State>,
}

impl<E, P, W> Pipeline<E, P, W>
where
    E: Executor,
    P: DiagnosisProvider,
    W: Write,
{
    pub fn new(executor: E, provider: P, store: MatcherStore, console: W) -> Self {
        Self {
            executor,
            provider,
            store,
            console,
            model_hint: None,
            install_command: None,
            prefix_output: true,
            state: State::Idle,
            visited: Vec::new(),
        }
    }

    pub fn model_hint(mut self, model_hint: Option<String>) -> Self {
        self.model_hint = model_hint;
        self
    }

    /// Program that receives `<manager> <name>` for package remedies. Defaults to the
    /// retry command's program.
    pub fn install_command(mut self, install_command: Option<String>) -> Self {
        self.install_command = install_command;
        self
    }

    pub fn prefix_output(mut self, prefix_output: bool) -> Self {
        self.prefix_output = prefix_output;
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// States entered so far, in order.
    pub fn visited(&self) -> &[State] {
        &self.visited
    }

    pub fn console(&self) -> &W {
        &self.console
    }

    /// Drive one input to a terminal state.
    pub fn run(&mut self, input: PipelineInput) -> Result<Outcome, PipelineError> {
        let result = self.run_inner(input);
        self.transition(State::Done);
        result
    }

    fn run_inner(&mut self, input: PipelineInput) -> Result<Outcome, PipelineError> {
        let (log, first_exit_code, retry) = match input {
            PipelineInput::Command(spec) => {
                self.transition(State::FirstAttempt);
                let spec = spec.prefixed(self.prefix_output);
                self.say(format_args!("--- Attempt 1: Running {} ---", spec.label()));
                let result = self.executor.run(&spec)?;
                self.replay(&result);

                if result.success() {
                    self.say(format_args!("Command executed successfully."));
                    return Ok(Outcome::FirstAttemptSucceeded);
                }

                self.say(format_args!(
                    "Command failed (Exit Code {}). Initiating AI analysis...",
                    result.exit_code
                ));
                (FailureLog::from_result(&result), result.exit_code, Some(spec))
            }
            PipelineInput::Log { log, retry } => {
                self.say(format_args!("--- Analyzing supplied failure log ---"));
                let retry = retry.map(|spec| spec.prefixed(self.prefix_output));
                (log, PIPED_LOG_EXIT_CODE, retry)
            }
        };

        self.transition(State::Diagnosing);
        let diagnosis = self
            .provider
            .diagnose(&log, self.model_hint.as_deref())
            .map_err(|source| PipelineError::Diagnosis {
                source,
                exit_code: first_exit_code,
            })?;
        self.report_diagnosis(&diagnosis);

        if diagnosis.remedies.is_empty() {
            self.say(format_args!("No packages suggested. Exiting."));
            return Ok(Outcome::NoRemedyAvailable {
                exit_code: first_exit_code,
            });
        }

        let Some(retry) = retry else {
            self.say(format_args!("No command to retry; skipping remediation."));
            return Ok(Outcome::RemediationSkipped {
                exit_code: first_exit_code,
            });
        };

        self.transition(State::Remediating);
        if let Some(failed) = self.apply_remedies(&diagnosis.remedies, &retry) {
            return Ok(failed);
        }

        self.transition(State::SecondAttempt);
        self.say(format_args!("--- Attempt 2: Running {} ---", retry.label()));
        let result = self.executor.run(&retry)?;
        self.replay(&result);

        if !result.success() {
            self.say(format_args!(
                "Command still failing (Exit Code {}).",
                result.exit_code
            ));
            return Ok(Outcome::RetryFailed {
                exit_code: result.exit_code,
            });
        }

        self.say(format_args!("Command succeeded after remediation."));
        let record = match self.store.save(&log, &diagnosis) {
            Ok(path) => {
                self.say(format_args!("Matcher saved to {}", path.display()));
                Some(path)
            }
            Err(err) => {
                warn!(error = %err, "failed to save matcher");
                self.say(format_args!("Warning: Failed to save matcher: {}", err));
                None
            }
        };
        Ok(Outcome::Remediated { record })
    }

    /// Run every action in order. Returns the failing outcome, if any.
    fn apply_remedies(
        &mut self,
        remedies: &[RemedialAction],
        retry: &CommandSpec,
    ) -> Option<Outcome> {
        let total = remedies.len();
        for (index, action) in remedies.iter().enumerate() {
            let position = index + 1;
            let spec = self.remedy_spec(action, retry);
            self.say(format_args!(
                "--- Remedy {}/{}: Running {} ---",
                position,
                total,
                spec.label()
            ));

            let exit_code = match self.executor.run(&spec) {
                Ok(result) => {
                    self.replay(&result);
                    if result.success() {
                        continue;
                    }
                    Some(result.exit_code)
                }
                Err(err) => {
                    warn!(error = %err, "remedy could not be started");
                    self.say(format_args!("{}", err));
                    None
                }
            };

            self.say(format_args!(
                "Remedy {} failed; skipping the remaining {}.",
                action,
                total - position
            ));
            return Some(Outcome::RemedyFailed {
                action: action.clone(),
                position,
                exit_code,
            });
        }
        None
    }

    fn remedy_spec(&self, action: &RemedialAction, retry: &CommandSpec) -> CommandSpec {
        let spec = match action {
            RemedialAction::Package { manager, name } => {
                let program = self
                    .install_command
                    .clone()
                    .unwrap_or_else(|| retry.program.clone());
                CommandSpec::new(program)
                    .args([manager.as_str(), name.as_str()])
                    .with_env_overrides(&retry.env)
            }
            RemedialAction::Shell { command } => {
                CommandSpec::shell(command).with_env_overrides(&retry.env)
            }
        };
        spec.prefixed(self.prefix_output)
    }

    fn report_diagnosis(&mut self, diagnosis: &Diagnosis) {
        self.say(format_args!("--- Diagnosis ---"));
        self.say(format_args!("Matcher: {}", diagnosis.matcher));
        for problem in MatcherCheck::run(diagnosis).problems {
            warn!(%problem, "matcher self-check");
            self.say(format_args!("Warning: {}", problem));
        }
        if !diagnosis.remedies.is_empty() {
            self.say(format_args!("Suggested remedies:"));
            for (index, action) in diagnosis.remedies.iter().enumerate() {
                self.say(format_args!("  {}. {}", index + 1, action));
            }
        }
    }

    fn replay(&mut self, result: &ExecutionResult) {
        for stream in [&result.stdout, &result.stderr] {
            if stream.is_empty() {
                continue;
            }
            let _ = self.console.write_all(stream.as_bytes());
            if !stream.ends_with('\n') {
                let _ = self.console.write_all(b"\n");
            }
        }
    }

    fn say(&mut self, line: fmt::Arguments<'_>) {
        let _ = writeln!(self.console, "{}", line);
    }

    fn transition(&mut self, next: State) {
        if self.state != next {
            info!(from = %self.state, to = %next, "pipeline");
            self.state = next;
            self.visited.push(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnosis::testing::{diagnosis_with, package, StubProvider};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::io;
    use tempfile::tempdir;

    /// Answers runs from a script and records what was asked.
    #[derive(Default)]
    struct ScriptedExecutor {
        replies: RefCell<VecDeque<Result<ExecutionResult, ExecutionError>>>,
        ran: RefCell<Vec<CommandSpec>>,
    }

    impl ScriptedExecutor {
        fn new(exits: Vec<ExecutionResult>) -> Self {
            Self {
                replies: RefCell::new(exits.into_iter().map(Ok).collect()),
                ran: RefCell::new(Vec::new()),
            }
        }

        fn launch_failure(command: &str) -> Self {
            let err = ExecutionError::Launch {
                command: command.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
            };
            Self {
                replies: RefCell::new(VecDeque::from([Err(err)])),
                ran: RefCell::new(Vec::new()),
            }
        }

        fn labels(&self) -> Vec<String> {
            self.ran.borrow().iter().map(CommandSpec::label).collect()
        }
    }

    impl Executor for ScriptedExecutor {
        fn run(&self, spec: &CommandSpec) -> Result<ExecutionResult, ExecutionError> {
            self.ran.borrow_mut().push(spec.clone());
            self.replies
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| panic!("unexpected run of {}", spec.label()))
        }
    }

    fn exited(code: i32, stdout: &str, stderr: &str) -> ExecutionResult {
        ExecutionResult {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code: code,
        }
    }

    fn target() -> PipelineInput {
        PipelineInput::Command(CommandSpec::new("python3").args(["app.py"]))
    }

    fn console_text<E: Executor, P: DiagnosisProvider>(
        pipeline: &Pipeline<E, P, Vec<u8>>,
    ) -> String {
        String::from_utf8_lossy(pipeline.console()).into_owned()
    }

    #[test]
    fn test_first_attempt_success_skips_diagnosis() {
        let tmp = tempdir().unwrap();
        let executor = ScriptedExecutor::new(vec![exited(0, "hello\n", "")]);
        let provider = StubProvider::returning(diagnosis_with(vec![]));
        let mut pipeline =
            Pipeline::new(&executor, &provider, MatcherStore::new(tmp.path()), Vec::new());

        let outcome = pipeline.run(target()).unwrap();

        assert_eq!(outcome, Outcome::FirstAttemptSucceeded);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(provider.call_count(), 0);
        assert_eq!(pipeline.visited(), &[State::FirstAttempt, State::Done]);
        assert_eq!(pipeline.state(), State::Done);
        assert!(console_text(&pipeline).contains("hello"));
    }

    #[test]
    fn test_successful_remediation_saves_record() {
        let tmp = tempdir().unwrap();
        let first = exited(1, "", "missing module foo\n");
        let executor = ScriptedExecutor::new(vec![
            first.clone(),
            exited(0, "installed foo\n", ""),
            exited(0, "ok\n", ""),
        ]);
        let provider = StubProvider::returning(diagnosis_with(vec![package("pip", "foo")]));
        let store = MatcherStore::new(tmp.path().join("matchers"));
        let expected_path = store.record_path(&FailureLog::from_result(&first));
        let mut pipeline = Pipeline::new(&executor, &provider, store.clone(), Vec::new());

        let outcome = pipeline.run(target()).unwrap();

        assert_eq!(
            outcome,
            Outcome::Remediated {
                record: Some(expected_path.clone())
            }
        );
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(
            executor.labels(),
            vec!["python3 app.py", "python3 pip foo", "python3 app.py"]
        );
        assert_eq!(
            provider.calls.borrow()[0].as_str(),
            "missing module foo\n\n"
        );

        let record = store.load(&expected_path).unwrap();
        assert_eq!(record.packages[0].name, "foo");
        let console = console_text(&pipeline);
        assert!(console.contains("Matcher: missing module (\\w+)"));
        assert!(console.contains("1. foo (pip)"));
    }

    #[test]
    fn test_install_command_override() {
        let tmp = tempdir().unwrap();
        let executor = ScriptedExecutor::new(vec![
            exited(2, "", "boom"),
            exited(0, "", ""),
            exited(0, "", ""),
        ]);
        let provider = StubProvider::returning(diagnosis_with(vec![package("apt", "libfoo")]));
        let mut pipeline =
            Pipeline::new(&executor, &provider, MatcherStore::new(tmp.path()), Vec::new())
                .install_command(Some("pkg-helper".to_string()))
                .prefix_output(false);

        pipeline.run(target()).unwrap();

        let ran = executor.ran.borrow();
        assert_eq!(ran[1].label(), "pkg-helper apt libfoo");
        assert!(ran.iter().all(|spec| !spec.prefix_output));
    }

    #[test]
    fn test_retry_failure_propagates_retry_code() {
        let tmp = tempdir().unwrap();
        let executor = ScriptedExecutor::new(vec![
            exited(1, "", "missing module foo"),
            exited(0, "", ""),
            exited(2, "", "still broken"),
        ]);
        let provider = StubProvider::returning(diagnosis_with(vec![package("pip", "foo")]));
        let mut pipeline =
            Pipeline::new(&executor, &provider, MatcherStore::new(tmp.path()), Vec::new());

        let outcome = pipeline.run(target()).unwrap();

        assert_eq!(outcome, Outcome::RetryFailed { exit_code: 2 });
        assert_eq!(outcome.exit_code(), 2);
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
        assert!(console_text(&pipeline).contains("still broken"));
    }

    #[test]
    fn test_no_remedies_keeps_first_exit_code() {
        let tmp = tempdir().unwrap();
        let executor = ScriptedExecutor::new(vec![exited(7, "", "segfault")]);
        let provider = StubProvider::returning(diagnosis_with(vec![]));
        let mut pipeline =
            Pipeline::new(&executor, &provider, MatcherStore::new(tmp.path()), Vec::new());

        let outcome = pipeline.run(target()).unwrap();

        assert_eq!(outcome, Outcome::NoRemedyAvailable { exit_code: 7 });
        assert_eq!(outcome.exit_code(), 7);
        assert_eq!(executor.ran.borrow().len(), 1);
        assert!(console_text(&pipeline).contains("No packages suggested"));
    }

    #[test]
    fn test_remedies_stop_at_first_failure() {
        let tmp = tempdir().unwrap();
        let executor = ScriptedExecutor::new(vec![
            exited(1, "", "missing deps"),
            exited(0, "", ""),
            exited(100, "", "E: Unable to locate package b"),
        ]);
        let provider = StubProvider::returning(diagnosis_with(vec![
            package("apt", "a"),
            package("apt", "b"),
            package("apt", "c"),
            package("apt", "d"),
        ]));
        let mut pipeline =
            Pipeline::new(&executor, &provider, MatcherStore::new(tmp.path()), Vec::new());

        let outcome = pipeline.run(target()).unwrap();

        assert_eq!(
            outcome,
            Outcome::RemedyFailed {
                action: package("apt", "b"),
                position: 2,
                exit_code: Some(100),
            }
        );
        assert_eq!(outcome.exit_code(), REMEDY_FAILURE_EXIT_CODE);
        assert_eq!(
            executor.labels(),
            vec!["python3 app.py", "python3 apt a", "python3 apt b"]
        );
    }

    #[test]
    fn test_diagnosis_error_reports_first_exit_code() {
        let tmp = tempdir().unwrap();
        let executor = ScriptedExecutor::new(vec![exited(3, "", "boom")]);
        let provider = StubProvider::failing(DiagnosisError::NoCredentials);
        let mut pipeline =
            Pipeline::new(&executor, &provider, MatcherStore::new(tmp.path()), Vec::new());

        let err = pipeline.run(target()).unwrap_err();

        assert_eq!(err.exit_code(), 3);
        assert!(err.to_string().contains("no API key found"));
        assert_eq!(pipeline.state(), State::Done);
    }

    #[test]
    fn test_launch_failure_is_fatal_without_diagnosis() {
        let tmp = tempdir().unwrap();
        let executor = ScriptedExecutor::launch_failure("python3 app.py");
        let provider = StubProvider::returning(diagnosis_with(vec![]));
        let mut pipeline =
            Pipeline::new(&executor, &provider, MatcherStore::new(tmp.path()), Vec::new());

        let err = pipeline.run(target()).unwrap_err();

        assert!(matches!(err, PipelineError::Launch(_)));
        assert_eq!(err.exit_code(), LAUNCH_FAILURE_EXIT_CODE);
        assert_eq!(provider.call_count(), 0);
    }

    #[test]
    fn test_cache_failure_is_only_a_warning() {
        let tmp = tempdir().unwrap();
        let blocker = tmp.path().join("matchers");
        std::fs::write(&blocker, "not a directory").unwrap();
        let executor = ScriptedExecutor::new(vec![
            exited(1, "", "missing module foo"),
            exited(0, "", ""),
            exited(0, "", ""),
        ]);
        let provider = StubProvider::returning(diagnosis_with(vec![package("pip", "foo")]));
        let mut pipeline =
            Pipeline::new(&executor, &provider, MatcherStore::new(&blocker), Vec::new());

        let outcome = pipeline.run(target()).unwrap();

        assert_eq!(outcome, Outcome::Remediated { record: None });
        assert_eq!(outcome.exit_code(), 0);
        assert!(console_text(&pipeline).contains("Warning: Failed to save matcher"));
    }

    #[test]
    fn test_log_without_command_skips_remediation() {
        let tmp = tempdir().unwrap();
        let executor = ScriptedExecutor::default();
        let provider = StubProvider::returning(diagnosis_with(vec![package("pip", "foo")]));
        let mut pipeline =
            Pipeline::new(&executor, &provider, MatcherStore::new(tmp.path()), Vec::new());

        let outcome = pipeline
            .run(PipelineInput::Log {
                log: FailureLog::from_text("missing module foo"),
                retry: None,
            })
            .unwrap();

        assert_eq!(
            outcome,
            Outcome::RemediationSkipped {
                exit_code: PIPED_LOG_EXIT_CODE
            }
        );
        assert!(executor.ran.borrow().is_empty());
        assert_eq!(provider.calls.borrow()[0].as_str(), "missing module foo");
        assert_eq!(pipeline.visited(), &[State::Diagnosing, State::Done]);
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_log_with_retry_command_is_fingerprinted_by_the_log() {
        let tmp = tempdir().unwrap();
        let executor = ScriptedExecutor::new(vec![exited(0, "", ""), exited(0, "", "")]);
        let provider = StubProvider::returning(diagnosis_with(vec![RemedialAction::Shell {
            command: "pip install foo".to_string(),
        }]));
        let store = MatcherStore::new(tmp.path());
        let log = FailureLog::from_text("missing module foo");
        let expected = store.record_path(&log);
        let mut pipeline = Pipeline::new(&executor, &provider, store, Vec::new());

        let outcome = pipeline
            .run(PipelineInput::Log {
                log,
                retry: Some(CommandSpec::new("make")),
            })
            .unwrap();

        assert_eq!(
            outcome,
            Outcome::Remediated {
                record: Some(expected)
            }
        );
        assert_eq!(
            pipeline.visited(),
            &[
                State::Diagnosing,
                State::Remediating,
                State::SecondAttempt,
                State::Done
            ]
        );
        let ran = executor.ran.borrow();
        assert_eq!(ran[0], CommandSpec::shell("pip install foo"));
        assert_eq!(ran[1].label(), "make");
    }
}
