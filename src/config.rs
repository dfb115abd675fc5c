use std::path::PathBuf;

/// Application-level constants
pub const APP_NAME: &str = "Docburst";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Written into the Creator/Producer of every extracted PDF.
pub fn product_identity() -> String {
    format!("{APP_NAME} {APP_VERSION}")
}

/// Default tracing filter when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "docburst_lib=info,docburst=info"
}

/// Verbose tracing filter for `--verbose`.
pub fn verbose_log_filter() -> &'static str {
    "docburst_lib=debug,docburst=debug"
}

/// Get the application data directory.
/// Falls back to the working directory when no home directory is known.
pub fn app_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME.to_lowercase())
}

/// Job markers, progress checkpoints and spreadsheet templates live here.
pub fn temp_dir() -> PathBuf {
    app_data_dir().join("temp")
}

/// Configuration path segment that marks a second-pass burst.
pub const SPLIT_2ND_TIME: &str = "split2ndtime";
