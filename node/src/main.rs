//! CLI entry point. Parses flags, installs a logger, and hands off to
//! [`nakamoto_node::run`].
use nakamoto_node::Options;

fn main() {
    let options: Options = argh::from_env();
    let level = if options.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    if let Err(err) = nakamoto_node::run(options) {
        log::error!("fatal: {}", err);
        std::process::exit(1);
    }
}
