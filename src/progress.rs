use colored::{Color, Colorize};
use std::io::{self, IsTerminal, Write};
use tracing::field::Visit;
use tracing::{Event, Subscriber};
use tracing_subscriber::{Layer, layer::Context, registry::LookupSpan};

/// color palette for host output cycling
const HOST_COLORS: &[Color] = &[
    Color::Cyan,
    Color::Magenta,
    Color::Yellow,
    Color::Blue,
    Color::Green,
];

/// get a consistent color for a host name based on hash
pub fn host_color(host: &str) -> Color {
    let hash: usize = host.bytes().map(|b| b as usize).sum();
    HOST_COLORS[hash % HOST_COLORS.len()]
}

/// Renders `progress` events as one line per host state change
pub struct PrettyProgressLayer {
    is_tty: bool,
}

impl Default for PrettyProgressLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl PrettyProgressLayer {
    pub fn new() -> Self {
        Self {
            is_tty: io::stderr().is_terminal(),
        }
    }

    fn line(&self, visitor: &ProgressVisitor) -> Option<String> {
        let progress = visitor.progress.as_deref()?;
        let host = visitor.host.as_deref().unwrap_or("unknown");
        let label = match visitor.service.as_deref() {
            Some(service) => format!("{}@{}", service, host),
            None => host.to_string(),
        };
        let detail = visitor.detail();

        let (symbol, text) = match progress {
            "start" => ("▶", "starting"),
            "ready" => ("✓", "ready"),
            "stopping" => ("■", "stopping"),
            "stopped" => ("○", "stopped"),
            "failed" => ("✗", visitor.message.as_deref().unwrap_or("failed")),
            "exited" => ("✗", "exited unexpectedly"),
            _ => return None,
        };

        if !self.is_tty {
            return Some(format!("{} {} {}{}", symbol, label, text, detail));
        }

        let color = host_color(host);
        let symbol = match progress {
            "ready" => symbol.green(),
            "failed" | "exited" => symbol.red(),
            "stopped" => symbol.dimmed(),
            _ => symbol.color(color),
        };
        Some(format!(
            "{} {} {}{}",
            symbol,
            label.color(color),
            text,
            detail.dimmed()
        ))
    }
}

impl<S> Layer<S> for PrettyProgressLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = ProgressVisitor::default();
        event.record(&mut visitor);

        let Some(line) = self.line(&visitor) else {
            return;
        };

        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "{}", line);
        if let Some(err) = &visitor.error {
            let bar = if self.is_tty { "│".red().to_string() } else { "│".to_string() };
            let _ = writeln!(stderr, "  {} {}", bar, err);
        }
    }
}

#[derive(Default)]
struct ProgressVisitor {
    progress: Option<String>,
    service: Option<String>,
    host: Option<String>,
    message: Option<String>,
    attempts: Option<u64>,
    code: Option<i64>,
    error: Option<String>,
}

impl ProgressVisitor {
    fn detail(&self) -> String {
        match (self.attempts, self.code) {
            (_, Some(code)) => format!(" (exit code {})", code),
            (Some(1), None) => String::new(),
            (Some(n), None) => format!(" ({} attempts)", n),
            (None, None) => String::new(),
        }
    }

    fn set(&mut self, field: &str, value: &str) {
        let value = Some(value.to_string());
        match field {
            "progress" => self.progress = value,
            "service" => self.service = value,
            "host" => self.host = value,
            "message" => self.message = value,
            "error" => self.error = value,
            _ => {}
        }
    }
}

impl Visit for ProgressVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.set(field.name(), value);
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        match field.name() {
            "attempts" => self.attempts = Some(value),
            "code" => self.code = Some(value as i64),
            _ => {}
        }
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        match field.name() {
            "attempts" => self.attempts = Some(value as u64),
            "code" => self.code = Some(value),
            _ => {}
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let s = format!("{:?}", value);
        self.set(field.name(), s.trim_matches('"'));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn visitor(progress: &str, host: &str) -> ProgressVisitor {
        ProgressVisitor {
            progress: Some(progress.to_string()),
            service: Some("mysql".to_string()),
            host: Some(host.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_plain_lines() {
        let layer = PrettyProgressLayer { is_tty: false };

        assert_eq!(
            layer.line(&visitor("start", "db1")).as_deref(),
            Some("▶ mysql@db1 starting")
        );

        let mut ready = visitor("ready", "db1");
        ready.attempts = Some(4);
        assert_eq!(
            layer.line(&ready).as_deref(),
            Some("✓ mysql@db1 ready (4 attempts)")
        );

        let mut exited = visitor("exited", "db2");
        exited.code = Some(1);
        assert_eq!(
            layer.line(&exited).as_deref(),
            Some("✗ mysql@db2 exited unexpectedly (exit code 1)")
        );

        assert!(layer.line(&visitor("polling", "db1")).is_none());
        assert!(layer.line(&ProgressVisitor::default()).is_none());
    }

    #[test]
    fn test_host_color_is_stable() {
        assert_eq!(host_color("db1"), host_color("db1"));
    }
}
