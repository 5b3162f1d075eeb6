// Script Runner
// Executes recipe and plugin files as child processes and collects their outputs

use crate::parser::models::{OutputMap, Value};
use crate::runners::{ExecutorError, Invocation, StepExecutor};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// Environment variable carrying the step name
pub const ENV_STEP_NAME: &str = "STEPFLOW_STEP";
/// Environment variable carrying the argument file path
pub const ENV_ARGUMENT_FILE: &str = "STEPFLOW_ARGFILE";
/// Environment variable listing implicit artifact inputs (comma separated)
pub const ENV_IMPLICIT_INPUTS: &str = "STEPFLOW_IMPLICIT_INPUTS";

/// Configuration for script execution
#[derive(Debug, Clone, Default)]
pub struct ScriptConfig {
    /// Kill the process after this long (None = no timeout)
    pub timeout: Option<Duration>,
    /// Treat output on stderr as failure
    pub fail_on_stderr: bool,
}

/// Output collected during script execution
#[derive(Debug, Clone, Default)]
pub struct ScriptOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Exit code (if available)
    pub exit_code: Option<i32>,
    /// Outputs extracted from logging commands
    pub outputs: OutputMap,
    /// Set when the process was killed by the timeout
    pub timed_out: bool,
}

/// Runs executable files with positional and `--key=value` arguments
#[derive(Debug, Clone, Default)]
pub struct ScriptRunner {
    config: ScriptConfig,
}

impl ScriptRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ScriptConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScriptConfig {
        &self.config
    }

    /// Run `program` and collect its output
    pub async fn run(
        &self,
        program: &Path,
        args: &[String],
        env: &HashMap<String, String>,
        working_dir: &Path,
    ) -> Result<ScriptOutput, ExecutorError> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.current_dir(working_dir);
        cmd.envs(env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ExecutorError::Spawn {
            program: program.display().to_string(),
            source,
        })?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        // Read output streams concurrently
        let stdout_handle = tokio::spawn(collect_lines(BufReader::new(stdout)));
        let stderr_handle = tokio::spawn(collect_lines(BufReader::new(stderr)));

        let (wait_result, timed_out) = match self.config.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, child.wait()).await {
                Ok(result) => (result, false),
                Err(_) => {
                    let _ = child.kill().await;
                    (child.wait().await, true)
                }
            },
            None => (child.wait().await, false),
        };

        let exit_code = wait_result.ok().and_then(|s| s.code());
        let stdout = stdout_handle.await.unwrap_or_default();
        let stderr = stderr_handle.await.unwrap_or_default();

        let outputs = parse_logging_commands(&stdout);

        Ok(ScriptOutput {
            stdout,
            stderr,
            exit_code,
            outputs,
            timed_out,
        })
    }
}

/// Drain a stream to the end. Lines that are not valid UTF-8 are decoded
/// lossily so the child never sees its pipe closed early.
async fn collect_lines<R>(mut reader: BufReader<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut output = String::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                if !output.is_empty() {
                    output.push('\n');
                }
                output.push_str(line);
            }
            Err(e) => {
                warn!(error = %e, "stopped reading child output");
                break;
            }
        }
    }
    output
}

/// Recipe or plugin backed by an executable file
#[derive(Debug, Clone)]
pub struct ScriptExecutor {
    path: PathBuf,
    runner: ScriptRunner,
}

impl ScriptExecutor {
    pub fn new(path: impl Into<PathBuf>, runner: ScriptRunner) -> Self {
        Self {
            path: path.into(),
            runner,
        }
    }

    /// Positional arguments followed by one `--key=value` per named argument
    pub fn command_args(invocation: &Invocation) -> Vec<String> {
        let mut args = invocation.cmdline.clone();
        args.extend(
            invocation
                .arguments
                .iter()
                .map(|(k, v)| format!("--{}={}", k, v)),
        );
        args
    }

    fn command_env(invocation: &Invocation) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = invocation
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        env.insert(ENV_STEP_NAME.to_string(), invocation.step_name.clone());
        if let Some(file) = &invocation.argument_file {
            env.insert(ENV_ARGUMENT_FILE.to_string(), file.display().to_string());
        }
        if !invocation.implicit_inputs.is_empty() {
            let inputs: Vec<&str> = invocation
                .implicit_inputs
                .iter()
                .map(|input| input.value.as_str())
                .collect();
            env.insert(ENV_IMPLICIT_INPUTS.to_string(), inputs.join(","));
        }
        env
    }
}

#[async_trait::async_trait]
impl StepExecutor for ScriptExecutor {
    async fn execute(&self, invocation: &Invocation) -> Result<Option<OutputMap>, ExecutorError> {
        let args = Self::command_args(invocation);
        let env = Self::command_env(invocation);
        let program = self.path.display().to_string();

        debug!(step = %invocation.step_name, %program, ?args, "spawning script");

        let output = self
            .runner
            .run(&self.path, &args, &env, &invocation.working_dir)
            .await?;

        if output.timed_out {
            return Err(ExecutorError::Timeout {
                program,
                timeout: self.runner.config().timeout.unwrap_or_default(),
            });
        }

        let failed = output.exit_code.map(|c| c != 0).unwrap_or(true)
            || (self.runner.config().fail_on_stderr && !output.stderr.is_empty());
        if failed {
            return Err(ExecutorError::ExitStatus {
                program,
                code: output.exit_code,
                stderr: output.stderr,
            });
        }

        if !output.stderr.is_empty() {
            warn!(step = %invocation.step_name, "{}", output.stderr);
        }

        Ok(Some(output.outputs))
    }
}

/// Parse logging commands from output:
///
/// * `##stepflow[output name=<key>]<value>` records an output
/// * `##stepflow[break]` asks the enclosing loop to stop
fn parse_logging_commands(output: &str) -> OutputMap {
    let mut outputs = OutputMap::new();

    for line in output.lines() {
        let Some(rest) = line.trim_start().strip_prefix("##stepflow[") else {
            continue;
        };
        let Some((props, value)) = rest.split_once(']') else {
            continue;
        };

        let mut parts = props.split_whitespace();
        match parts.next() {
            Some("output") => {
                let name = parts.find_map(|prop| prop.strip_prefix("name="));
                if let Some(name) = name {
                    outputs.insert(name.to_string(), Value::String(value.to_string()));
                }
            }
            Some("break") => {
                outputs.insert("break".to_string(), Value::Bool(true));
            }
            _ => {}
        }
    }

    outputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::models::{ArgumentMap, KindTag};

    fn invocation(working_dir: &Path) -> Invocation {
        let mut arguments = ArgumentMap::new();
        arguments.insert("msin".to_string(), "/tmp/x.map".to_string());
        Invocation {
            kind: KindTag::Recipe,
            type_id: "echo".to_string(),
            step_name: "prep".to_string(),
            cmdline: vec!["first".to_string()],
            arguments,
            argument_file: None,
            environment: Default::default(),
            implicit_inputs: Vec::new(),
            working_dir: working_dir.to_path_buf(),
        }
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_parse_logging_commands() {
        let output = r#"
Starting
##stepflow[output name=mapfile]/data/out.map
##stepflow[output name=count]3
##stepflow[unknown]ignored
done
"#;
        let outputs = parse_logging_commands(output);
        assert_eq!(outputs.get("mapfile"), Some(&Value::from("/data/out.map")));
        assert_eq!(outputs.get("count"), Some(&Value::from("3")));
        assert_eq!(outputs.len(), 2);
    }

    #[test]
    fn test_parse_break_command() {
        let outputs = parse_logging_commands("##stepflow[break]");
        assert_eq!(outputs.get("break"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_command_args() {
        let dir = std::env::temp_dir();
        let args = ScriptExecutor::command_args(&invocation(&dir));
        assert_eq!(args, vec!["first", "--msin=/tmp/x.map"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_executor_collects_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "echo",
            "echo \"##stepflow[output name=first]$1\"\n\
             echo \"##stepflow[output name=step]$STEPFLOW_STEP\"",
        );

        let executor = ScriptExecutor::new(&script, ScriptRunner::new());
        let outputs = executor
            .execute(&invocation(dir.path()))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outputs.get("first"), Some(&Value::from("first")));
        assert_eq!(outputs.get("step"), Some(&Value::from("prep")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_executor_survives_non_utf8_output() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "prep",
            "printf 'caf\\351\\n'\n\
             echo '##stepflow[output name=mapfile]/tmp/out.map'",
        );

        let executor = ScriptExecutor::new(&script, ScriptRunner::new());
        let outputs = executor
            .execute(&invocation(dir.path()))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outputs.get("mapfile"), Some(&Value::from("/tmp/out.map")));
    }

    #[tokio::test]
    async fn test_collect_lines_decodes_lossily() {
        let input: &[u8] = b"caf\xe9\r\n##stepflow[break]\nlast";
        let collected = collect_lines(BufReader::new(input)).await;
        let lines: Vec<&str> = collected.lines().collect();

        assert_eq!(lines, vec!["caf\u{fffd}", "##stepflow[break]", "last"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_executor_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "fail", "echo broken >&2\nexit 3");

        let executor = ScriptExecutor::new(&script, ScriptRunner::new());
        let err = executor.execute(&invocation(dir.path())).await.unwrap_err();

        match err {
            ExecutorError::ExitStatus { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert!(stderr.contains("broken"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_script_executor_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "slow", "exec sleep 5");

        let runner = ScriptRunner::with_config(ScriptConfig {
            timeout: Some(Duration::from_millis(100)),
            fail_on_stderr: false,
        });
        let executor = ScriptExecutor::new(&script, runner);
        let err = executor.execute(&invocation(dir.path())).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ScriptExecutor::new(dir.path().join("missing"), ScriptRunner::new());
        let err = executor.execute(&invocation(dir.path())).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Spawn { .. }));
    }
}
