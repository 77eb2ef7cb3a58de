use libmstore_core::RepoError;
use serde::Serialize;

use crate::cli::Cli;

/// Version of the `--json` envelope layout
const SCHEMA_VERSION: u32 = 1;

/// Every `--json` response: `data` on success, `error` on failure
#[derive(Serialize)]
pub struct Envelope<T: Serialize> {
    pub schema_version: u32,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// A failed command, with the class that decides how to recover
#[derive(Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub class: &'static str,
    pub exit_code: i32,
    /// Re-reading the head and running the command again can succeed
    pub retryable: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<&'static str>,
}

impl ErrorBody {
    fn from_error(err: &RepoError) -> Self {
        Self {
            code: err.error_code(),
            class: err.error_class().as_str(),
            exit_code: err.exit_code(),
            retryable: err.is_retryable(),
            message: err.to_string(),
            suggestions: err.suggestions(),
        }
    }
}

fn render<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value)
        .unwrap_or_else(|e| format!("{{\"ok\":false,\"error\":{:?}}}", e.to_string()))
}

/// Output a successful result (JSON mode only; human output goes through `print_human`)
pub fn output_success<T: Serialize>(cli: &Cli, data: T) {
    if cli.json {
        let envelope = Envelope {
            schema_version: SCHEMA_VERSION,
            ok: true,
            data: Some(data),
            error: None,
        };
        println!("{}", render(&envelope));
    }
}

/// Report a failed command on stderr
pub fn output_error(cli: &Cli, err: &RepoError) {
    let body = ErrorBody::from_error(err);
    if cli.json {
        let envelope: Envelope<()> = Envelope {
            schema_version: SCHEMA_VERSION,
            ok: false,
            data: None,
            error: Some(body),
        };
        eprintln!("{}", render(&envelope));
        return;
    }

    eprintln!("error[{}]: {}", body.class, body.message);
    if body.retryable {
        eprintln!("  the head moved while the command ran; running it again may succeed");
    }
    for suggestion in &body.suggestions {
        eprintln!("  hint: {}", suggestion);
    }
}

/// Print human-readable output (ignored in quiet and JSON modes)
pub fn print_human(cli: &Cli, msg: &str) {
    if !cli.json && !cli.quiet {
        println!("{}", msg);
    }
}
