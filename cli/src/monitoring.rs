pub fn init_logger(verbosity: u8) {
  use tracing::metadata::LevelFilter;
  use tracing_subscriber::fmt::format::FmtSpan;
  use tracing_subscriber::{
    filter::Directive, fmt, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
  };

  // directives for debug builds
  #[cfg(debug_assertions)]
  let (default_directive, default_filter) = (
    Directive::from(LevelFilter::TRACE),
    "boardflash_cli=trace,boardflash_core=trace".to_string(),
  );

  // directives for release builds: each repeated `-v` bumps one level
  #[cfg(not(debug_assertions))]
  let (default_directive, default_filter) = match verbosity {
    0 => (Directive::from(LevelFilter::INFO), "boardflash_cli=info,boardflash_core=info".to_string()),
    1 => (Directive::from(LevelFilter::DEBUG), "boardflash_cli=debug,boardflash_core=debug".to_string()),
    _ => (Directive::from(LevelFilter::TRACE), "boardflash_cli=trace,boardflash_core=trace".to_string()),
  };

  #[cfg(debug_assertions)]
  let _ = verbosity;

  let filter_directives = std::env::var("RUST_LOG").unwrap_or(default_filter);

  let filter = EnvFilter::builder()
    .with_default_directive(default_directive)
    .parse_lossy(filter_directives);

  tracing_subscriber::registry()
    .with(fmt::layer().with_span_events(FmtSpan::CLOSE).with_filter(filter))
    .init();

  tracing::debug!("initialized logger");
}
