mod cli;
mod collect;
mod driver;
mod elf;
mod error;
mod kernel;
mod output;
mod packet;
mod replay;
mod sched;
mod sideband;
mod timing;

use clap::Parser;

fn main() {
    let opt = cli::Opt::parse();

    let mut builder = env_logger::Builder::from_default_env();
    builder.filter_level(match opt.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    });
    if opt.log_stderr {
        builder.target(env_logger::Target::Stderr);
    }
    builder.init();

    if let Err(err) = driver::run(&opt) {
        log::error!("{err}");
        std::process::exit(1);
    }
}
