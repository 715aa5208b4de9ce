use crate::orchestrator::Section;
use crate::{HealthCheck, SohError};
use regex::Regex;
use soh_c2::{
    C2Command, C2Error, Coordinator, Expectation, OutputChannel, Outcome, ResultGroup, Verdict,
};
use soh_core::CustomHostTest;
use soh_probes::ProbeMeta;
use std::io::Write as _;
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Where the guest agent drops files it receives.
const GUEST_FILES_DIR: &str = "/tmp/miniccc/files";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn label(self) -> &'static str {
        match self {
            Stream::Stdout => "STDOUT",
            Stream::Stderr => "STDERR",
        }
    }

    fn channel(self) -> OutputChannel {
        match self {
            Stream::Stdout => OutputChannel::Stdout,
            Stream::Stderr => OutputChannel::Stderr,
        }
    }
}

/// How one output stream of a test script is judged.
#[derive(Debug, Clone)]
enum OutputCheck {
    Contains { stream: Stream, needle: String },
    /// Bash script fed the output on stdin; exit status 0 means valid.
    Validate { stream: Stream, script: String },
}

impl OutputCheck {
    /// Validators win over substring checks for the same stream.
    fn for_stream(
        stream: Stream,
        contains: Option<&str>,
        validate: Option<&str>,
    ) -> Option<Self> {
        let non_empty = |s: Option<&str>| s.filter(|s| !s.is_empty()).map(str::to_string);

        if let Some(script) = non_empty(validate) {
            return Some(OutputCheck::Validate { stream, script });
        }
        non_empty(contains).map(|needle| OutputCheck::Contains { stream, needle })
    }

    fn stream(&self) -> Stream {
        match self {
            OutputCheck::Contains { stream, .. } | OutputCheck::Validate { stream, .. } => *stream,
        }
    }

    async fn evaluate(&self, output: &str) -> Result<String, C2Error> {
        match self {
            OutputCheck::Contains { stream, needle } => {
                if output.contains(needle.as_str()) {
                    Ok(format!("{} contained {}", stream.label(), needle))
                } else {
                    Err(C2Error::ValidationFailed(format!(
                        "script {} did not contain test output",
                        stream.label()
                    )))
                }
            }
            OutputCheck::Validate { stream, script } => run_validator(*stream, script, output).await,
        }
    }
}

async fn run_validator(stream: Stream, script: &str, output: &str) -> Result<String, C2Error> {
    let label = stream.label();
    let create_failed =
        || C2Error::ValidationFailed(format!("unable to create {label} validator script"));

    let mut file = tempfile::Builder::new()
        .prefix("soh-validator-")
        .tempfile()
        .map_err(|_| create_failed())?;
    file.write_all(script.as_bytes())
        .and_then(|()| file.flush())
        .map_err(|_| create_failed())?;

    let mut child = Command::new("bash")
        .arg(file.path())
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => C2Error::ValidationFailed(format!(
                "bash command is not available for {label} validation"
            )),
            _ => create_failed(),
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        // Validators are free to ignore their input.
        if let Err(e) = stdin.write_all(output.as_bytes()).await {
            debug!(error = %e, "validator closed stdin early");
        }
    }

    let status = child.wait().await?;
    if !status.success() {
        return Err(C2Error::ValidationFailed(format!(
            "script {label} was not valid"
        )));
    }

    Ok(format!("{label} validated"))
}

fn whitespace() -> Option<&'static Regex> {
    static WHITESPACE: OnceLock<Option<Regex>> = OnceLock::new();
    WHITESPACE.get_or_init(|| Regex::new(r"\s+").ok()).as_ref()
}

/// Script file name for a test: `<host>-<name>` with whitespace runs as `_`.
#[must_use]
pub(crate) fn script_name(host: &str, test: &str) -> String {
    let name = match whitespace() {
        Some(re) => re.replace_all(test, "_").into_owned(),
        None => test.split_whitespace().collect::<Vec<_>>().join("_"),
    };
    format!("{host}-{name}")
}

/// A custom test ready to dispatch.
struct PreparedTest {
    cmd: C2Command,
    checks: Vec<OutputCheck>,
    meta: ProbeMeta,
}

impl PreparedTest {
    async fn run(self, coordinator: Coordinator, group: ResultGroup<ProbeMeta>) {
        let expectations = self
            .checks
            .iter()
            .map(|check| {
                Expectation::new(check.stream().channel(), |resp| {
                    Verdict::Done(resp.to_string())
                })
            })
            .collect();

        let Outcome::Finished(results) = coordinator.execute(&self.cmd, expectations).await
        else {
            return;
        };

        // A dispatch failure comes back as a single error for the whole test.
        if results.len() != self.checks.len() {
            for result in results {
                group.add(result, self.meta.clone());
            }
            return;
        }

        for (check, result) in self.checks.iter().zip(results) {
            let outcome = match result {
                Ok(output) => check.evaluate(&output).await,
                Err(e) => Err(e),
            };
            group.add(outcome, self.meta.clone());
        }
    }
}

impl HealthCheck {
    pub(crate) async fn check_custom_tests(&mut self) -> Result<(), SohError> {
        let mut work: Vec<(String, CustomHostTest, Duration)> = Vec::new();

        for (host, tests) in &self.experiment.soh.custom_host_tests {
            if !self.index.is_active(host) {
                info!("Skipping host {} per config", host);
                continue;
            }

            for test in tests {
                work.push((host.clone(), test.clone(), self.experiment.soh.c2_timeout));
            }
        }

        for profile in self.active_profiles() {
            for test in &profile.profile.custom_tests {
                work.push((profile.host.clone(), test.clone(), profile.timeout));
            }
        }

        let group = ResultGroup::new();

        for (host, test, timeout) in work {
            let meta = ProbeMeta::Custom {
                host: host.clone(),
                test: test.name.clone(),
            };

            match self.prepare_custom_test(&host, &test, timeout).await {
                Ok(prepared) => {
                    info!("Running custom test {} on host {}", test.name, host);
                    group.spawn(prepared.run(self.coordinator.clone(), group.clone()));
                }
                Err(e) => group.add_error(e, meta),
            }
        }

        let records = self
            .join_phase(&group, "custom tests to complete")
            .await?;
        self.fold_records(Section::CustomTests, records);

        Ok(())
    }

    async fn prepare_custom_test(
        &self,
        host: &str,
        test: &CustomHostTest,
        timeout: Duration,
    ) -> Result<PreparedTest, C2Error> {
        if test.test_script.is_empty() {
            return Err(C2Error::ValidationFailed("no test script provided".into()));
        }

        if !test.has_checks() {
            return Err(C2Error::ValidationFailed(
                "no output test strings or validators provided".into(),
            ));
        }

        let probe = self.index.probe(&self.experiment, host)?;
        let namespace = &self.experiment.namespace;
        let script = script_name(host, &test.name);

        write_script(&self.files_dir.join(namespace).join(&script), &test.test_script)
            .await
            .map_err(|e| {
                C2Error::ValidationFailed(format!("unable to write test script to file: {e}"))
            })?;

        let executor = test
            .executor
            .as_deref()
            .filter(|e| !e.is_empty())
            .unwrap_or(probe.strategy.default_executor());

        let command = format!("{executor} {GUEST_FILES_DIR}/{namespace}/{script}");
        let cmd = C2Command::exec(probe.target, command, timeout).with_send_file(script);

        let checks = [
            OutputCheck::for_stream(
                Stream::Stdout,
                test.test_stdout.as_deref(),
                test.validate_stdout.as_deref(),
            ),
            OutputCheck::for_stream(
                Stream::Stderr,
                test.test_stderr.as_deref(),
                test.validate_stderr.as_deref(),
            ),
        ]
        .into_iter()
        .flatten()
        .collect();

        Ok(PreparedTest {
            cmd,
            checks,
            meta: ProbeMeta::Custom {
                host: host.to_string(),
                test: test.name.clone(),
            },
        })
    }
}

async fn write_script(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await
}
