//! Logging setup and the per-domain error log.
//!
//! Console output goes through the `tracing-subscriber` fmt layer. ERROR
//! events that name a domain, directly or through an enclosing span, are
//! also appended to `<log_dir>/PreDMSErrorLog_<Domain>.txt`.

use std::fmt::Write as FmtWrite;
use std::fs::OpenOptions;
use std::io::Write as IoWrite;
use std::path::PathBuf;
use std::sync::Mutex;

use ej_migrate::Domain;
use tracing::span::{Attributes, Id};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer};

pub fn setup_logging(verbosity: &str, format: &str, log_dir: Option<PathBuf>) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => return Err(format!("unknown verbosity '{}'", other)),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let error_log = log_dir.map(ErrorLogLayer::new);
    let registry = tracing_subscriber::registry().with(filter).with(error_log);

    match format {
        "json" => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_target(false),
            )
            .try_init(),
        "text" => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .try_init(),
        other => return Err(format!("unknown log format '{}'", other)),
    }
    .map_err(|e| e.to_string())
}

/// Appends ERROR events to the domain's error log file.
pub struct ErrorLogLayer {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl ErrorLogLayer {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            lock: Mutex::new(()),
        }
    }

    fn append(&self, domain: Domain, line: &str) {
        let _guard = self.lock.lock();
        if std::fs::create_dir_all(&self.dir).is_err() {
            return;
        }
        let path = self.dir.join(domain.error_log_file_name());
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(file, "{}", line);
        }
    }
}

/// The `domain` a span was opened with.
struct SpanDomain(String);

impl<S> Layer<S> for ErrorLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        if let (Some(domain), Some(span)) = (visitor.domain, ctx.span(id)) {
            span.extensions_mut().insert(SpanDomain(domain));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        if *event.metadata().level() != Level::ERROR {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        let named = visitor.domain.clone().or_else(|| {
            ctx.event_scope(event)?.find_map(|span| {
                let extensions = span.extensions();
                extensions.get::<SpanDomain>().map(|d| d.0.clone())
            })
        });
        let Some(domain) = named.as_deref().and_then(|d| d.parse::<Domain>().ok()) else {
            return;
        };

        let mut line = String::new();
        let _ = write!(
            line,
            "{} [ERROR] ",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        if !visitor.fields.is_empty() {
            let _ = write!(line, "{} ", visitor.fields);
        }
        line.push_str(&visitor.message);
        self.append(domain, &line);
    }
}

/// Collects the message, the `domain` field and everything else.
#[derive(Default)]
struct FieldVisitor {
    message: String,
    domain: Option<String>,
    fields: String,
}

impl FieldVisitor {
    fn push_field(&mut self, name: &str, value: &dyn std::fmt::Display) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={}", name, value);
    }
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{:?}", value);
        match field.name() {
            "message" => self.message = rendered,
            "domain" => {
                self.push_field("domain", &rendered);
                self.domain = Some(rendered);
            }
            name => self.push_field(name, &rendered),
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "domain" => {
                self.push_field("domain", &value);
                self.domain = Some(value.to_string());
            }
            name => self.push_field(name, &value),
        }
    }
}
