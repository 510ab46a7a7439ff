//! `fire(event, input)`: the single entry point that runs every matching
//! matcher's callbacks then shell commands, in registration order, and
//! returns the list of normalized results. Short-circuits the whole fire
//! call the moment any invocation returns `continue: false`.

use std::sync::Arc;
use std::time::Duration;

use sa_domain::events::{Event, HookOutcome, ProgressStream};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::matcher::Matcher;
use crate::registry::HookRegistry;
use crate::shell::{run_shell_hook, OutputMode, ProgressLine};
use crate::types::{HookInput, HookResult, RawOutcome};

/// Fires hook matchers against the shared registry and emits `hook_started`
/// / `hook_progress` / `hook_response` events onto an optional output
/// channel. Emission is a no-op (the dispatcher still runs) if no channel
/// has been configured, matching the teacher's "best-effort sink" pattern
/// used elsewhere for SSE/event broadcast.
pub struct Dispatcher {
    registry: Arc<HookRegistry>,
    output: Option<UnboundedSender<Event>>,
    default_async_timeout: Duration,
    shell_output_mode: OutputMode,
}

impl Dispatcher {
    pub fn new(registry: Arc<HookRegistry>) -> Self {
        Self {
            registry,
            output: None,
            default_async_timeout: Duration::from_secs(30),
            shell_output_mode: OutputMode::Plain,
        }
    }

    pub fn with_output(mut self, output: UnboundedSender<Event>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_default_async_timeout(mut self, timeout: Duration) -> Self {
        self.default_async_timeout = timeout;
        self
    }

    pub fn with_shell_output_mode(mut self, mode: OutputMode) -> Self {
        self.shell_output_mode = mode;
        self
    }

    fn emit(&self, event: Event) {
        if let Some(tx) = &self.output {
            let _ = tx.send(event);
        }
    }

    /// Run every matcher registered for `event_name` whose tool-name pattern
    /// matches `input.tool_name`, in merged base-then-scope order, callbacks
    /// before shell commands within each matcher. Returns the results that
    /// contributed to the list (erroring invocations contribute nothing).
    pub async fn fire(&self, event_name: &str, input: HookInput) -> Vec<HookResult> {
        let session_id = input.session_id.clone();
        let matchers: Vec<Matcher> = self
            .registry
            .merged_matchers(event_name)
            .into_iter()
            .filter(|m| m.matches(input.tool_name.as_deref()))
            .collect();

        let mut results = Vec::new();

        for matcher in matchers {
            let correlation_id = Uuid::new_v4().to_string();
            self.emit(Event::HookStarted {
                id: Uuid::new_v4(),
                session_id: session_id.clone(),
                correlation_id: correlation_id.clone(),
                hook_event: event_name.to_string(),
                tool_name: input.tool_name.clone(),
            });

            for callback in &matcher.callbacks {
                let (outcome, err) = callback(input.clone(), correlation_id.clone()).await;
                let Some(result) = self
                    .resolve_outcome(outcome, callback.clone(), &input, &correlation_id, err)
                    .await
                else {
                    continue;
                };
                self.emit_response(&session_id, &correlation_id, &result);
                let should_stop = !result.cont;
                results.push(result);
                if should_stop {
                    return results;
                }
            }

            for command in &matcher.commands {
                let tx_session = session_id.clone();
                let tx_correlation = correlation_id.clone();
                let output = self.output.clone();
                let progress_sink = move |line: ProgressLine| {
                    if let Some(tx) = &output {
                        let _ = tx.send(Event::HookProgress {
                            id: Uuid::new_v4(),
                            session_id: tx_session.clone(),
                            correlation_id: tx_correlation.clone(),
                            stream: if line.is_stderr {
                                ProgressStream::Stderr
                            } else {
                                ProgressStream::Stdout
                            },
                            chunk: line.line,
                        });
                    }
                };

                let outcome = run_shell_hook(
                    command,
                    &input,
                    matcher.timeout,
                    self.shell_output_mode,
                    progress_sink,
                )
                .await;

                let result = match outcome {
                    Ok(RawOutcome::Async { timeout_sec }) => {
                        let deadline = timeout_sec
                            .map(Duration::from_secs)
                            .unwrap_or(self.default_async_timeout);
                        match run_shell_hook(
                            command,
                            &input,
                            Some(deadline),
                            OutputMode::Plain,
                            |_| {},
                        )
                        .await
                        {
                            Ok(RawOutcome::Sync(sync)) => Some(HookResult::from(sync)),
                            Ok(RawOutcome::Async { .. }) => Some(HookResult::noop()),
                            Err(e) => {
                                self.emit_error(&session_id, &correlation_id, &e.to_string());
                                None
                            }
                        }
                    }
                    Ok(RawOutcome::Sync(sync)) => Some(HookResult::from(sync)),
                    Err(e) => {
                        self.emit_error(&session_id, &correlation_id, &e.to_string());
                        None
                    }
                };

                let Some(result) = result else { continue };
                self.emit_response(&session_id, &correlation_id, &result);
                let should_stop = !result.cont;
                results.push(result);
                if should_stop {
                    return results;
                }
            }
        }

        results
    }

    /// Resolve a callback's first-invocation outcome: sync results pass
    /// through, async results trigger the blocking second invocation under
    /// the async deadline (the first invocation's output is discarded).
    async fn resolve_outcome(
        &self,
        outcome: RawOutcome,
        callback: crate::matcher::Callback,
        input: &HookInput,
        correlation_id: &str,
        err: Option<String>,
    ) -> Option<HookResult> {
        if let Some(message) = err {
            self.emit_error(&input.session_id, correlation_id, &message);
            return None;
        }
        match outcome {
            RawOutcome::Sync(sync) => Some(HookResult::from(sync)),
            RawOutcome::Async { timeout_sec } => {
                let deadline = timeout_sec
                    .map(Duration::from_secs)
                    .unwrap_or(self.default_async_timeout);
                match tokio::time::timeout(
                    deadline,
                    callback(input.clone(), correlation_id.to_string()),
                )
                .await
                {
                    Ok((RawOutcome::Sync(sync), None)) => Some(HookResult::from(sync)),
                    Ok((RawOutcome::Async { .. }, None)) => Some(HookResult::noop()),
                    Ok((_, Some(message))) => {
                        self.emit_error(&input.session_id, correlation_id, &message);
                        None
                    }
                    Err(_) => {
                        self.emit_error(
                            &input.session_id,
                            correlation_id,
                            &format!("async hook timed out after {deadline:?}"),
                        );
                        None
                    }
                }
            }
        }
    }

    fn emit_response(&self, session_id: &str, correlation_id: &str, result: &HookResult) {
        self.emit(Event::HookResponse {
            id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            correlation_id: correlation_id.to_string(),
            outcome: HookOutcome::Success,
            decision: result.decision.clone().map(|d| match d {
                crate::types::Decision::Allow => "allow".to_string(),
                crate::types::Decision::Deny => "deny".to_string(),
                crate::types::Decision::Other(raw) => raw,
            }),
            message: result.system_message.clone().or_else(|| result.reason.clone()),
        });
    }

    fn emit_error(&self, session_id: &str, correlation_id: &str, message: &str) {
        self.emit(Event::HookResponse {
            id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            correlation_id: correlation_id.to_string(),
            outcome: HookOutcome::Error,
            decision: None,
            message: Some(message.to_string()),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::types::RawSyncOutput;

    fn callback_ok(
        outcome_fn: impl Fn() -> RawOutcome + Send + Sync + 'static,
    ) -> crate::matcher::Callback {
        Arc::new(move |_input, _correlation_id| {
            let outcome = outcome_fn();
            Box::pin(async move { (outcome, None) })
        })
    }

    #[tokio::test]
    async fn fire_runs_matching_callback_and_reports_decision() {
        let registry = Arc::new(HookRegistry::new());
        registry.register(
            "pre_tool_use",
            Matcher::new("Bash").with_callback(callback_ok(|| {
                RawOutcome::Sync(RawSyncOutput {
                    decision: Some("approve".into()),
                    ..Default::default()
                })
            })),
        );
        let dispatcher = Dispatcher::new(registry);
        let input = HookInput::new("pre_tool_use", "s1").with_tool_name("Bash");
        let results = dispatcher.fire("pre_tool_use", input).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].decision, Some(crate::types::Decision::Allow));
    }

    #[tokio::test]
    async fn fire_skips_matchers_for_other_tools() {
        let registry = Arc::new(HookRegistry::new());
        registry.register(
            "pre_tool_use",
            Matcher::new("Read").with_callback(callback_ok(|| RawOutcome::Sync(Default::default()))),
        );
        let dispatcher = Dispatcher::new(registry);
        let input = HookInput::new("pre_tool_use", "s1").with_tool_name("Bash");
        let results = dispatcher.fire("pre_tool_use", input).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn fire_short_circuits_on_continue_false() {
        let registry = Arc::new(HookRegistry::new());
        let second_ran = Arc::new(AtomicUsize::new(0));
        let second_ran_clone = second_ran.clone();

        let first: crate::matcher::Callback = Arc::new(move |_input, _cid| {
            Box::pin(async move {
                (
                    RawOutcome::Sync(RawSyncOutput {
                        continue_: Some(false),
                        ..Default::default()
                    }),
                    None,
                )
            })
        });
        let second: crate::matcher::Callback = Arc::new(move |_input, _cid| {
            second_ran_clone.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { (RawOutcome::Sync(Default::default()), None) })
        });

        registry.register(
            "pre_tool_use",
            Matcher::new("").with_callback(first).with_callback(second),
        );
        let dispatcher = Dispatcher::new(registry);
        let input = HookInput::new("pre_tool_use", "s1");
        let results = dispatcher.fire("pre_tool_use", input).await;

        assert_eq!(results.len(), 1);
        assert_eq!(second_ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fire_with_no_output_channel_still_runs() {
        let registry = Arc::new(HookRegistry::new());
        registry.register(
            "stop",
            Matcher::new("").with_callback(callback_ok(|| RawOutcome::Sync(Default::default()))),
        );
        let dispatcher = Dispatcher::new(registry);
        let input = HookInput::new("stop", "s1");
        let results = dispatcher.fire("stop", input).await;
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn erroring_callback_contributes_nothing_and_does_not_stop_siblings() {
        let registry = Arc::new(HookRegistry::new());
        let erroring: crate::matcher::Callback = Arc::new(|_input, _cid| {
            Box::pin(async move { (RawOutcome::Sync(Default::default()), Some("boom".to_string())) })
        });
        registry.register(
            "stop",
            Matcher::new("")
                .with_callback(erroring)
                .with_callback(callback_ok(|| RawOutcome::Sync(Default::default()))),
        );
        let dispatcher = Dispatcher::new(registry);
        let input = HookInput::new("stop", "s1");
        let results = dispatcher.fire("stop", input).await;
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn shell_command_hook_contributes_a_result() {
        let registry = Arc::new(HookRegistry::new());
        registry.register(
            "pre_tool_use",
            Matcher::new("").with_command(r#"echo '{"decision":"allow"}'"#.to_string()),
        );
        let dispatcher = Dispatcher::new(registry);
        let input = HookInput::new("pre_tool_use", "s1");
        let results = dispatcher.fire("pre_tool_use", input).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].decision, Some(crate::types::Decision::Allow));
    }
}
