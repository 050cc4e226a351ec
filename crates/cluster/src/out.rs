//! User-facing output.
//!
//! Diagnostics go through `tracing`; this module prints what the user is
//! meant to read: progress steps, notices, warnings and classified failures.
//! With `--output=json` every line is a JSON event record instead.

use std::fmt;
use std::io::Write;
use std::str::FromStr;

use serde_json::json;

use crate::reason::{self, Kind};

/// Output format selected by `--output`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Text,
    Json,
}

impl Default for Format {
    fn default() -> Self {
        Format::Text
    }
}

impl FromStr for Format {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" | "" => Ok(Format::Text),
            "json" => Ok(Format::Json),
            other => Err(crate::reason::usage(format!(
                "invalid output format {:?}: valid values are 'text' and 'json'",
                other
            ))),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Text => f.write_str("text"),
            Format::Json => f.write_str("json"),
        }
    }
}

const EVENT_PREFIX: &str = "io.k8s.sigs.minikube.";

/// Icons used in front of text output when stdout is a terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Icon {
    Happy,
    Sparkle,
    Check,
    Running,
    Waiting,
    Stopping,
    Deleting,
    Pause,
    Unpause,
    Notice,
    Warning,
    Tip,
    Documentation,
    Issue,
    Container,
    Verify,
    Enabling,
    Tunnel,
    Mount,
    Celebrate,
}

impl Icon {
    fn glyph(self) -> &'static str {
        match self {
            Icon::Happy => "😄",
            Icon::Sparkle => "✨",
            Icon::Check => "✅",
            Icon::Running => "🏃",
            Icon::Waiting => "⌛",
            Icon::Stopping => "✋",
            Icon::Deleting => "🔥",
            Icon::Pause => "⏸️",
            Icon::Unpause => "⏯️",
            Icon::Notice => "📌",
            Icon::Warning => "❗",
            Icon::Tip => "💡",
            Icon::Documentation => "📘",
            Icon::Issue => "⁉️",
            Icon::Container => "🐳",
            Icon::Verify => "🔎",
            Icon::Enabling => "🌟",
            Icon::Tunnel => "🏃",
            Icon::Mount => "📁",
            Icon::Celebrate => "🏄",
        }
    }

    fn ascii(self) -> &'static str {
        match self {
            Icon::Warning => "! ",
            Icon::Tip | Icon::Documentation | Icon::Issue | Icon::Notice => "* ",
            _ => "* ",
        }
    }
}

/// Prints user-facing output in the selected format.
#[derive(Clone, Debug)]
pub struct Out {
    format: Format,
    fancy: bool,
}

impl Default for Out {
    fn default() -> Self {
        Out::new(Format::Text)
    }
}

impl Out {
    pub fn new(format: Format) -> Self {
        Out {
            format,
            fancy: stdout_is_tty() && std::env::var_os("MINIKUBE_IN_STYLE").map_or(true, |v| v != "false"),
        }
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn is_json(&self) -> bool {
        self.format == Format::Json
    }

    /// A progress step.
    pub fn step(&self, icon: Icon, msg: impl fmt::Display) {
        match self.format {
            Format::Text => self.line(&mut std::io::stdout(), icon, &msg.to_string()),
            Format::Json => emit_json(
                &mut std::io::stdout(),
                "step",
                json!({ "name": "", "message": msg.to_string() }),
            ),
        }
    }

    /// A notice that does not belong to a step.
    pub fn info(&self, icon: Icon, msg: impl fmt::Display) {
        match self.format {
            Format::Text => self.line(&mut std::io::stdout(), icon, &msg.to_string()),
            Format::Json => emit_json(
                &mut std::io::stdout(),
                "info",
                json!({ "message": msg.to_string() }),
            ),
        }
    }

    /// A warning. Never changes the exit code.
    pub fn warning(&self, msg: impl fmt::Display) {
        match self.format {
            Format::Text => self.line(&mut std::io::stderr(), Icon::Warning, &msg.to_string()),
            Format::Json => emit_json(
                &mut std::io::stderr(),
                "warning",
                json!({ "message": msg.to_string() }),
            ),
        }
    }

    /// Raw text written to stdout as is, e.g. an env script or a table.
    pub fn raw(&self, text: &str) {
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    }

    /// Reports a classified failure on stderr.
    pub fn failure(&self, kind: &Kind, err: &anyhow::Error, advice_vars: &[(&str, &str)]) {
        let advice = kind.render_advice(advice_vars);
        let mut stderr = std::io::stderr();
        match self.format {
            Format::Json => emit_json(
                &mut stderr,
                "error",
                json!({
                    "name": kind.id,
                    "exitcode": kind.exit_code.to_string(),
                    "message": reason::message(err),
                    "advice": advice,
                    "url": kind.url,
                    "issues": kind.issue_urls().join(","),
                }),
            ),
            Format::Text => {
                let prefix = if self.fancy {
                    format!("{}  ", kind.style.icon())
                } else {
                    "X ".to_string()
                };
                let _ = writeln!(stderr, "\n{}Exiting due to {}: {}", prefix, kind.id, reason::message(err));
                if !advice.is_empty() {
                    self.line(&mut stderr, Icon::Tip, &format!("Suggestion: {}", advice));
                }
                if !kind.url.is_empty() {
                    self.line(&mut stderr, Icon::Documentation, &format!("Documentation: {}", kind.url));
                }
                let issues = kind.issue_urls();
                if !issues.is_empty() {
                    self.line(&mut stderr, Icon::Issue, "Related issues:");
                    for url in issues.iter().take(3) {
                        let _ = writeln!(stderr, "    - {}", url);
                    }
                }
                if kind.new_issue_link {
                    let _ = writeln!(
                        stderr,
                        "\n    If the above advice does not help, please let us know:\n    https://github.com/kubernetes/minikube/issues/new/choose"
                    );
                }
            }
        }
    }

    fn line(&self, w: &mut dyn Write, icon: Icon, msg: &str) {
        let prefix = if self.fancy {
            format!("{}  ", icon.glyph())
        } else {
            icon.ascii().to_string()
        };
        let _ = writeln!(w, "{}{}", prefix, msg);
    }
}

fn emit_json(w: &mut dyn Write, kind: &str, data: serde_json::Value) {
    let event = json!({
        "specversion": "1.0",
        "id": uuid::Uuid::new_v4().to_string(),
        "source": "https://minikube.sigs.k8s.io/",
        "type": format!("{}{}", EVENT_PREFIX, kind),
        "datacontenttype": "application/json",
        "data": data,
    });
    let _ = writeln!(w, "{}", event);
}

#[cfg(unix)]
fn stdout_is_tty() -> bool {
    unsafe { libc::isatty(libc::STDOUT_FILENO) == 1 }
}

#[cfg(not(unix))]
fn stdout_is_tty() -> bool {
    false
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn format_parsing() {
        assert_eq!("json".parse::<Format>().expect("json"), Format::Json);
        assert_eq!("text".parse::<Format>().expect("text"), Format::Text);
        assert!("yaml".parse::<Format>().is_err());
    }

    #[test]
    fn json_events_carry_type_and_data() {
        let mut buf = Vec::new();
        emit_json(&mut buf, "warning", json!({"message": "careful"}));
        let v: serde_json::Value = serde_json::from_slice(&buf).expect("valid json");
        assert_eq!(v["type"], "io.k8s.sigs.minikube.warning");
        assert_eq!(v["specversion"], "1.0");
        assert_eq!(v["data"]["message"], "careful");
    }

    #[test]
    fn plain_lines_use_ascii_prefix() {
        let out = Out {
            format: Format::Text,
            fancy: false,
        };
        let mut buf = Vec::new();
        out.line(&mut buf, Icon::Warning, "disk is low");
        assert_eq!(String::from_utf8(buf).expect("utf8"), "! disk is low\n");
    }
}
