use log::Level;
use serde_json::Value;

/// Emit a structured diagnostic through the `log` facade.
///
/// Lines read `[code] module: message {data}` so they can be grepped by event
/// code regardless of the backend the host installs.
pub fn log_event(level: Level, code: &str, module: &str, message: &str, data: Option<Value>) {
    match data {
        Some(data) => log::log!(target: "lexis", level, "[{code}] {module}: {message} {data}"),
        None => log::log!(target: "lexis", level, "[{code}] {module}: {message}"),
    }
}
