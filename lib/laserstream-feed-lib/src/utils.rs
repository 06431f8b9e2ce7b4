use std::io::IsTerminal;

use tracing_subscriber::fmt::format::FmtSpan;

pub fn tracing_subscriber_init() {
    let format = tracing_subscriber::fmt::format().with_ansi(std::io::stdout().is_terminal());

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_span_events(FmtSpan::CLOSE)
        .event_format(format)
        .init();
}
