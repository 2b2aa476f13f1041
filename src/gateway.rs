use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::executor::EvalOutcome;
use crate::security::{is_authorized, AllowList, Invoker};
use crate::session::{Outbox, Session};

/// Sent to callers that are not allowed to evaluate code.
pub const DENIED_MESSAGE: &str = "You fail the permission test.";

/// Sent instead of a diagnostic dump when traces are hidden.
pub const HIDDEN_TRACE_MESSAGE: &str = "Internal error during evaluation.";

/// Authenticates callers and forwards their code to the shared session.
pub struct CommandGateway {
    session: Mutex<Session>,
    allow_list: AllowList,
    show_traces: bool,
}

impl CommandGateway {
    pub fn new(session: Session, allow_list: AllowList, show_traces: bool) -> Self {
        Self {
            session: Mutex::new(session),
            allow_list,
            show_traces,
        }
    }

    #[cfg(test)]
    pub fn allow_list(&self) -> &AllowList {
        &self.allow_list
    }

    /// Run one invocation. The caller binding and the evaluation happen
    /// under the same lock, so concurrent callers never see each other as `me`.
    pub fn execute(&self, invoker: &Invoker, text: &str) -> String {
        let session = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let outbox = session.bind_caller(invoker).unwrap_or_else(|e| {
            warn!("Failed to bind caller {}: {e}", invoker.display_name());
            Outbox::default()
        });

        if !is_authorized(&self.allow_list, invoker) {
            info!(caller = %invoker.display_name(), "Denied evaluation");
            return DENIED_MESSAGE.to_string();
        }

        info!(caller = %invoker.display_name(), "Evaluating {} bytes", text.len());
        let outcome = EvalOutcome::from_result(session.eval(text));
        let line = match outcome {
            EvalOutcome::Unexpected(trace) if !self.show_traces => {
                error!("Unexpected failure during evaluation:\n{trace}");
                HIDDEN_TRACE_MESSAGE.to_string()
            }
            outcome => outcome.into_string(),
        };

        let mut lines = outbox.drain();
        lines.push(line);
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::host::Host;
    use crate::registry::BindingRegistry;
    use crate::standalone::StandaloneHost;
    use std::fs;
    use tempfile::TempDir;
    use uuid::Uuid;

    const ALLOWED: &str = "11111111-1111-1111-1111-111111111111";
    const OTHER: &str = "22222222-2222-2222-2222-222222222222";

    fn player(id: &str) -> Invoker {
        Invoker::Player {
            id: Uuid::parse_str(id).unwrap(),
            name: None,
        }
    }

    fn setup(allowed: &str) -> (TempDir, StandaloneHost, CommandGateway) {
        setup_with(allowed, &Config::default())
    }

    fn setup_with(allowed: &str, config: &Config) -> (TempDir, StandaloneHost, CommandGateway) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("allowedPlayers.txt");
        fs::write(&path, allowed).unwrap();

        let host = StandaloneHost::from_config(config);
        let session = Session::new(
            &BindingRegistry::from_host(&host),
            &host.namespaces(),
            &config.console,
        )
        .unwrap();
        let gateway = CommandGateway::new(
            session,
            AllowList::new(path),
            config.console.show_traces,
        );
        (temp_dir, host, gateway)
    }

    fn memory_limited(show_traces: bool) -> Config {
        let mut config = Config::default();
        config.console.memory_limit = Some(4 * 1024 * 1024);
        config.console.show_traces = show_traces;
        config
    }

    fn assert_message_only(response: &str) {
        assert!(!response.starts_with("Result:"), "got: {response}");
        assert!(!response.contains("stack traceback"), "got: {response}");
        assert!(!response.contains("CallbackError"), "got: {response}");
    }

    #[test]
    fn test_console_evaluates() {
        let (_dir, _host, gateway) = setup("");
        assert_eq!(gateway.execute(&Invoker::Console, "2+2"), "Result: 4");
    }

    #[test]
    fn test_listed_player_evaluates() {
        let (_dir, _host, gateway) = setup(&format!("{ALLOWED}\n"));
        let response = gateway.execute(&player(ALLOWED), "2+2");
        assert!(response.contains('4'));
    }

    #[test]
    fn test_unlisted_player_denied_without_side_effects() {
        let (_dir, host, gateway) = setup(&format!("{ALLOWED}\n"));
        let response = gateway.execute(&player(OTHER), r#"server:broadcast("pwned")"#);
        assert_eq!(response, DENIED_MESSAGE);
        assert!(host.server_handle().snapshot().broadcasts.is_empty());
    }

    #[test]
    fn test_automated_sources_denied() {
        let (_dir, host, gateway) = setup("");
        for invoker in [Invoker::CommandBlock, Invoker::Rcon] {
            let response = gateway.execute(&invoker, r#"server:broadcast("x")"#);
            assert_eq!(response, DENIED_MESSAGE);
        }
        assert!(host.server_handle().snapshot().broadcasts.is_empty());
    }

    #[test]
    fn test_allow_list_edit_applies_to_next_invocation() {
        let (_dir, _host, gateway) = setup("");
        assert_eq!(gateway.execute(&player(ALLOWED), "1"), DENIED_MESSAGE);

        fs::write(gateway.allow_list().path(), format!("{ALLOWED}\n")).unwrap();
        assert_eq!(gateway.execute(&player(ALLOWED), "1"), "Result: 1");
    }

    #[test]
    fn test_runtime_error_reports_message_only() {
        let (_dir, _host, gateway) = setup("");
        assert_eq!(gateway.execute(&Invoker::Console, "error('boom', 0)"), "boom");
    }

    #[test]
    fn test_bad_host_method_argument_reports_message_only() {
        let (_dir, host, gateway) = setup("");
        let response = gateway.execute(&Invoker::Console, "server:broadcast({})");
        assert_message_only(&response);
        assert!(!response.is_empty());
        assert!(host.server_handle().snapshot().broadcasts.is_empty());

        assert_message_only(&gateway.execute(&Invoker::Console, "server.name()"));
        assert_message_only(&gateway.execute(&Invoker::Console, "me:send()"));
    }

    #[test]
    fn test_unconvertible_extension_value_reports_message_only() {
        let config = Config::parse("[[extensions]]\nid = \"shop\"\nname = \"Shop\"").unwrap();
        let (_dir, _host, gateway) = setup_with("", &config);
        let response = gateway.execute(&Invoker::Console, "Shop:set('k', function() end)");
        assert_message_only(&response);
        assert!(response.contains("function"), "got: {response}");
    }

    #[test]
    fn test_unexpected_failure_returns_full_dump() {
        let (_dir, _host, gateway) = setup_with("", &memory_limited(true));
        let response = gateway.execute(&Invoker::Console, "string.rep('x', 64 * 1024 * 1024)");
        assert!(response.contains("MemoryError"), "got: {response}");
        assert_ne!(response, HIDDEN_TRACE_MESSAGE);
    }

    #[test]
    fn test_unexpected_failure_hidden_when_traces_disabled() {
        let (_dir, _host, gateway) = setup_with("", &memory_limited(false));
        let response = gateway.execute(&Invoker::Console, "string.rep('x', 64 * 1024 * 1024)");
        assert_eq!(response, HIDDEN_TRACE_MESSAGE);
        assert_eq!(gateway.execute(&Invoker::Console, "2+2"), "Result: 4");
    }

    #[test]
    fn test_syntax_error_reports_evaluator_message() {
        let (_dir, _host, gateway) = setup("");
        let response = gateway.execute(&Invoker::Console, "local = = 1");
        assert!(!response.starts_with("Result:"));
        assert!(response.contains("eval:1:"));
    }

    #[test]
    fn test_messages_precede_result() {
        let (_dir, _host, gateway) = setup("");
        let response = gateway.execute(&Invoker::Console, "print('hello'); return 'done'");
        assert_eq!(response, "hello\nResult: done");
    }

    #[test]
    fn test_me_is_the_current_caller() {
        let (_dir, _host, gateway) = setup(&format!("{ALLOWED}\n"));
        assert_eq!(gateway.execute(&Invoker::Console, "me:kind()"), "Result: console");
        assert_eq!(
            gateway.execute(&player(ALLOWED), "me:id()"),
            format!("Result: {ALLOWED}")
        );
    }

    #[test]
    fn test_host_state_is_live() {
        let (_dir, host, gateway) = setup("");
        gateway.execute(&Invoker::Console, r#"server:broadcast("hello")"#);
        assert_eq!(
            host.server_handle().snapshot().broadcasts,
            vec!["hello".to_string()]
        );
    }

    #[test]
    fn test_concurrent_callers_keep_their_own_binding() {
        let (_dir, _host, gateway) = setup(&format!("{ALLOWED}\n"));
        let gateway = std::sync::Arc::new(gateway);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let gateway = gateway.clone();
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        gateway.execute(&Invoker::Console, "me:kind()")
                    } else {
                        gateway.execute(&player(ALLOWED), "me:kind()")
                    }
                })
            })
            .collect();
        for (i, handle) in handles.into_iter().enumerate() {
            let expected = if i % 2 == 0 { "console" } else { "player" };
            assert_eq!(handle.join().unwrap(), format!("Result: {expected}"));
        }
    }
}
