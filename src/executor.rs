use mlua::Error as LuaError;

/// Marker placed before a successful result
pub const RESULT_MARKER: &str = "Result: ";

/// Result of evaluating caller code
#[derive(Debug, PartialEq)]
pub enum EvalOutcome {
    /// The code ran; carries the rendered value
    Success(String),
    /// The code (or a host method it called) raised an error
    TargetFailure(String),
    /// The code could not be compiled
    EvalFailure(String),
    /// Anything else; carries a full diagnostic dump
    Unexpected(String),
}

impl EvalOutcome {
    pub fn from_result(result: Result<String, LuaError>) -> Self {
        match result {
            Ok(value) => EvalOutcome::Success(value),
            Err(err) => Self::classify(&err),
        }
    }

    pub fn classify(err: &LuaError) -> Self {
        match target_message(err) {
            Some(message) => EvalOutcome::TargetFailure(message),
            None => match err {
                LuaError::SyntaxError { message, .. } => EvalOutcome::EvalFailure(message.clone()),
                _ => EvalOutcome::Unexpected(format!("{err}\n\n{err:#?}")),
            },
        }
    }

    /// Convert to the text sent back to the caller
    pub fn into_string(self) -> String {
        match self {
            EvalOutcome::Success(value) => format!("{RESULT_MARKER}{value}"),
            EvalOutcome::TargetFailure(message) => message,
            EvalOutcome::EvalFailure(message) => message,
            EvalOutcome::Unexpected(trace) => trace,
        }
    }
}

/// The message of an error raised by evaluated code, unwrapping the
/// callback and context layers the interpreter adds around it.
fn target_message(err: &LuaError) -> Option<String> {
    match err {
        LuaError::RuntimeError(message) => Some(strip_traceback(message).to_string()),
        LuaError::ExternalError(inner) => Some(inner.to_string()),
        LuaError::CallbackError { cause, .. } | LuaError::WithContext { cause, .. } => {
            target_message(cause).or_else(|| host_method_message(cause))
        }
        _ => None,
    }
}

/// Any error a host method raised while called from evaluated code
/// (bad arguments, failed conversions) is the caller's failure, except
/// for the interpreter running out of memory.
fn host_method_message(cause: &LuaError) -> Option<String> {
    match cause {
        LuaError::MemoryError(_)
        | LuaError::CallbackError { .. }
        | LuaError::WithContext { .. } => None,
        other => Some(strip_traceback(&other.to_string()).to_string()),
    }
}

fn strip_traceback(message: &str) -> &str {
    message
        .split_once("\nstack traceback:")
        .map_or(message, |(head, _)| head)
        .trim_end()
}
