// Console sinks for connector output

use crate::protocol::LogLevel;
use serde_json::Value;

/// Receives `console.*` output and scoped logger calls from connector code
///
/// `logger` is the method path for `ctx.logger` calls and `None` for plain
/// `console` output. Closures with the same signature implement this trait.
pub trait ConsoleSink: Send + Sync {
    fn emit(&self, level: LogLevel, args: &[Value], logger: Option<&str>);
}

impl<F> ConsoleSink for F
where
    F: Fn(LogLevel, &[Value], Option<&str>) + Send + Sync,
{
    fn emit(&self, level: LogLevel, args: &[Value], logger: Option<&str>) {
        self(level, args, logger)
    }
}

/// Default sink: writes to `tracing` under the `connector` target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingConsole;

impl ConsoleSink for TracingConsole {
    fn emit(&self, level: LogLevel, args: &[Value], logger: Option<&str>) {
        let text = format_args_line(args);
        let logger = logger.unwrap_or("console");
        match level {
            LogLevel::Debug => tracing::debug!(target: "connector", logger, "{}", text),
            LogLevel::Info => tracing::info!(target: "connector", logger, "{}", text),
            LogLevel::Warn => tracing::warn!(target: "connector", logger, "{}", text),
            LogLevel::Error => tracing::error!(target: "connector", logger, "{}", text),
        }
    }
}

/// Join console arguments the way a browser console prints them
pub fn format_args_line(args: &[Value]) -> String {
    args.iter()
        .map(|arg| match arg {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn args_are_joined_with_spaces() {
        assert_eq!(
            format_args_line(&[json!("count:"), json!(3), json!({"a": 1})]),
            r#"count: 3 {"a":1}"#
        );
    }

    #[test]
    fn closures_are_sinks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let captured = seen.clone();
        let sink = move |level: LogLevel, args: &[Value], logger: Option<&str>| {
            captured
                .lock()
                .push((level, args.to_vec(), logger.map(str::to_string)));
        };
        sink.emit(LogLevel::Warn, &[json!("x")], Some("actions.a.execute"));
        let seen = seen.lock();
        assert_eq!(seen[0].0, LogLevel::Warn);
        assert_eq!(seen[0].2.as_deref(), Some("actions.a.execute"));
    }
}
