use std::panic;

/// Initializes the `env_logger` backend for the `log` facade used throughout
/// the workspace. `raft`'s own `slog` logger is bridged separately at the
/// call site that constructs it (`slog_stdlog::StdLog`), so both end up
/// writing through the same sink.
pub fn setup_logger(log_level: &str) {
    let env = env_logger::Env::default().default_filter_or(log_level);
    env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init()
        .ok();
}

/// Replaces the default panic hook with one that logs through `log::error!`
/// before the process aborts, so a panic's location survives whatever
/// happens to stderr (e.g. under a process supervisor that discards it).
pub fn setup_panic_hook() {
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        log::error!("panic: {info}");
        default_hook(info);
    }));
}
