use crate::{C2Command, C2Error, Dispatcher, OutputChannel, ResultGroup};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What a validator decided about one response.
#[derive(Debug)]
pub enum Verdict {
    Done(String),
    Fatal(C2Error),
    /// Re-dispatch the command after the delay.
    Retry(Duration),
}

type Validator = Box<dyn FnMut(&str) -> Verdict + Send>;

/// A validator bound to the output channel it reads.
pub struct Expectation {
    pub channel: OutputChannel,
    validator: Validator,
}

impl Expectation {
    pub fn new(
        channel: OutputChannel,
        validator: impl FnMut(&str) -> Verdict + Send + 'static,
    ) -> Self {
        Self {
            channel,
            validator: Box::new(validator),
        }
    }

    pub fn both(validator: impl FnMut(&str) -> Verdict + Send + 'static) -> Self {
        Self::new(OutputChannel::Both, validator)
    }

    fn validate(&mut self, response: &str) -> Verdict {
        (self.validator)(response)
    }
}

impl std::fmt::Debug for Expectation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Expectation")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum Outcome {
    /// One result per expectation, or a single error when dispatch itself failed.
    Finished(Vec<Result<String, C2Error>>),
    /// Cancelled mid-flight; nothing should be recorded.
    Cancelled,
}

/// Re-issues commands until every validator settles.
#[derive(Clone)]
pub struct Coordinator {
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
}

impl Coordinator {
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>, cancel: CancellationToken) -> Self {
        Self { dispatcher, cancel }
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Dispatch, wait, and validate until no expectation asks for a retry.
    ///
    /// Expectations that settle keep their result; only the ones returning
    /// `Verdict::Retry` are validated against the next dispatch.
    pub async fn execute(&self, cmd: &C2Command, expectations: Vec<Expectation>) -> Outcome {
        let mut pending = expectations;
        let mut settled = Vec::new();

        loop {
            if self.cancel.is_cancelled() {
                return Outcome::Cancelled;
            }

            let id = match self.dispatch_and_wait(cmd).await {
                Ok(id) => id,
                Err(e) if e.is_cancelled() => return Outcome::Cancelled,
                Err(e) => {
                    settled.push(Err(e.context("executing C2 command")));
                    return Outcome::Finished(settled);
                }
            };

            if pending.is_empty() {
                return Outcome::Finished(settled);
            }

            let mut delay: Option<Duration> = None;
            let mut retrying = Vec::new();

            for mut expectation in pending {
                let response = match self
                    .dispatcher
                    .poll(&cmd.target, &id, expectation.channel)
                    .await
                {
                    Ok(response) => response,
                    Err(e) => {
                        settled.push(Err(e.context("getting response for C2 command")));
                        continue;
                    }
                };

                match expectation.validate(&response) {
                    Verdict::Done(msg) => settled.push(Ok(msg)),
                    Verdict::Fatal(err) => settled.push(Err(err)),
                    Verdict::Retry(d) => {
                        delay = Some(delay.map_or(d, |current| current.max(d)));
                        retrying.push(expectation);
                    }
                }
            }

            let Some(delay) = delay else {
                return Outcome::Finished(settled);
            };

            debug!(vm = %cmd.target.vm, action = %cmd.action, ?delay, "retrying C2 command");
            pending = retrying;

            tokio::select! {
                () = self.cancel.cancelled() => return Outcome::Cancelled,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn dispatch_and_wait(&self, cmd: &C2Command) -> Result<crate::CommandId, C2Error> {
        let id = self.dispatcher.dispatch(cmd, &self.cancel).await?;
        if !cmd.wait {
            self.dispatcher
                .wait_for_response(&cmd.target, &id, cmd.timeout, &self.cancel)
                .await?;
        }
        Ok(id)
    }

    /// Run `execute` as a task of `group`, recording each result with `meta`.
    pub fn schedule<M>(
        &self,
        group: &ResultGroup<M>,
        cmd: C2Command,
        expectations: Vec<Expectation>,
        meta: M,
    ) where
        M: Clone + Send + 'static,
    {
        let coordinator = self.clone();
        let sink = group.clone();

        group.spawn(async move {
            if let Outcome::Finished(results) = coordinator.execute(&cmd, expectations).await {
                for result in results {
                    sink.add(result, meta.clone());
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FakeSubstrate, Reply, Target};
    use soh_core::OsFamily;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn coordinator(fake: &Arc<FakeSubstrate>, cancel: CancellationToken) -> Coordinator {
        let dispatcher = Dispatcher::new(fake.clone())
            .with_intervals(Duration::from_millis(5), Duration::from_millis(5));
        Coordinator::new(Arc::new(dispatcher), cancel)
    }

    fn cmd(vm: &str, command: &str) -> C2Command {
        C2Command::exec(
            Target::new("demo", vm, OsFamily::Linux),
            command,
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_retry_then_done_waits_for_delays() {
        let fake = Arc::new(FakeSubstrate::new());
        fake.add_active_vm("h1", "u-1", &[]);
        fake.script(
            "h1",
            "cc exec ip route",
            vec![
                Reply::output(""),
                Reply::output(""),
                Reply::output("default via 10.0.0.254"),
            ],
        );
        let coordinator = coordinator(&fake, CancellationToken::new());

        let expectation = Expectation::both(|resp| {
            if resp.contains("default via") {
                Verdict::Done("route configured".into())
            } else {
                Verdict::Retry(Duration::from_millis(30))
            }
        });

        let start = Instant::now();
        let outcome = coordinator
            .execute(&cmd("h1", "ip route"), vec![expectation])
            .await;

        let Outcome::Finished(results) = outcome else {
            panic!("expected a finished outcome");
        };
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap(), "route configured");
        assert!(start.elapsed() >= Duration::from_millis(60));
        assert_eq!(fake.issue_count("h1"), 3);
    }

    #[tokio::test]
    async fn test_validator_budget_turns_fatal() {
        let fake = Arc::new(FakeSubstrate::new());
        fake.add_active_vm("h1", "u-1", &[]);
        let coordinator = coordinator(&fake, CancellationToken::new());

        let mut retries = 3;
        let expectation = Expectation::both(move |_| {
            if retries > 0 {
                retries -= 1;
                return Verdict::Retry(Duration::from_millis(1));
            }
            Verdict::Fatal(C2Error::ValidationFailed("process not running".into()))
        });

        let group: ResultGroup<&'static str> = ResultGroup::new();
        coordinator.schedule(&group, cmd("h1", "pgrep -f x"), vec![expectation], "h1");
        group.join().await;

        assert_eq!(group.error_count(), 1);
        assert_eq!(fake.issue_count("h1"), 4);
        let records = group.take_records();
        assert_eq!(records[0].meta, "h1");
    }

    #[tokio::test]
    async fn test_cancel_during_sleep_records_nothing() {
        let fake = Arc::new(FakeSubstrate::new());
        fake.add_active_vm("h1", "u-1", &[]);
        let cancel = CancellationToken::new();
        let coordinator = coordinator(&fake, cancel.clone());

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let expectation = Expectation::both(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Verdict::Retry(Duration::from_secs(60))
        });

        let group: ResultGroup<()> = ResultGroup::new();
        coordinator.schedule(&group, cmd("h1", "ip addr"), vec![expectation], ());

        while calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), group.join())
            .await
            .unwrap();
        assert!(group.is_empty());
        assert_eq!(group.error_count(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_failure_is_single_error() {
        let fake = Arc::new(FakeSubstrate::new());
        fake.add_vm("h1", "u-1", &[]);
        let coordinator = coordinator(&fake, CancellationToken::new());

        let mut command = cmd("h1", "ip addr");
        command.timeout = Duration::from_millis(20);

        let expectations = vec![
            Expectation::new(OutputChannel::Stdout, |_| Verdict::Done("out".into())),
            Expectation::new(OutputChannel::Stderr, |_| Verdict::Done("err".into())),
        ];
        let Outcome::Finished(results) = coordinator.execute(&command, expectations).await else {
            panic!("expected a finished outcome");
        };

        assert_eq!(results.len(), 1);
        assert!(results[0].as_ref().unwrap_err().is_client_not_active());
    }

    #[tokio::test]
    async fn test_settled_expectations_are_not_revalidated() {
        let fake = Arc::new(FakeSubstrate::new());
        fake.add_active_vm("h1", "u-1", &[]);
        let coordinator = coordinator(&fake, CancellationToken::new());

        let stdout_calls = Arc::new(AtomicUsize::new(0));
        let counted = stdout_calls.clone();
        let mut stderr_left = 1;

        let expectations = vec![
            Expectation::new(OutputChannel::Stdout, move |_| {
                counted.fetch_add(1, Ordering::SeqCst);
                Verdict::Done("stdout ok".into())
            }),
            Expectation::new(OutputChannel::Stderr, move |_| {
                if stderr_left > 0 {
                    stderr_left -= 1;
                    return Verdict::Retry(Duration::from_millis(1));
                }
                Verdict::Done("stderr ok".into())
            }),
        ];

        let Outcome::Finished(results) = coordinator.execute(&cmd("h1", "t"), expectations).await
        else {
            panic!("expected a finished outcome");
        };

        assert_eq!(results.len(), 2);
        assert_eq!(stdout_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_and_pending_commands_yield_one_error() {
        let fake = Arc::new(FakeSubstrate::new());
        fake.add_active_vm("h1", "u-1", &[]);
        fake.script("h1", "cc exec ip addr", vec![Reply::reject("bad filter")]);
        fake.script("h1", "cc exec ip route", vec![Reply::pending()]);
        let coordinator = coordinator(&fake, CancellationToken::new());

        let group: ResultGroup<&'static str> = ResultGroup::new();
        for (command, meta) in [("ip addr", "rejected"), ("ip route", "pending")] {
            let mut command = cmd("h1", command);
            command.timeout = Duration::from_millis(30);
            let expectations = vec![
                Expectation::new(OutputChannel::Stdout, |_| Verdict::Done("out".into())),
                Expectation::new(OutputChannel::Stderr, |_| Verdict::Done("err".into())),
            ];
            coordinator.schedule(&group, command, expectations, meta);
        }
        group.join().await;

        assert_eq!(group.error_count(), 2);
        let records = group.take_records();
        assert_eq!(records.len(), 2);

        let rejected = records.iter().find(|r| r.meta == "rejected").unwrap();
        let err = rejected.outcome.as_ref().unwrap_err();
        assert!(matches!(err.root(), C2Error::DispatchFailed(_)));
        assert!(err.to_string().starts_with("executing C2 command: "));

        let pending = records.iter().find(|r| r.meta == "pending").unwrap();
        let err = pending.outcome.as_ref().unwrap_err();
        assert!(matches!(err.root(), C2Error::Timeout(_)));
        assert!(err.to_string().starts_with("executing C2 command: "));

        // Neither failure is retried.
        assert_eq!(fake.issue_count("h1"), 2);
    }

    #[tokio::test]
    async fn test_no_expectations_records_nothing() {
        let fake = Arc::new(FakeSubstrate::new());
        fake.add_active_vm("h1", "u-1", &[]);
        let coordinator = coordinator(&fake, CancellationToken::new());

        let group: ResultGroup<()> = ResultGroup::new();
        coordinator.schedule(&group, cmd("h1", "touch /tmp/ready"), Vec::new(), ());
        group.join().await;

        assert_eq!(fake.issue_count("h1"), 1);
        assert!(group.is_empty());
    }
}
