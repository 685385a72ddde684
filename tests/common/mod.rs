use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};

/// Idempotent so every test can call it first.
pub fn init_logging() {
    let _ = TermLogger::init(
        LevelFilter::Debug,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    );
}
