// src/logging.rs
//
// Ambient logging init: `env_logger` writing to stderr by default,
// additionally duplicated to `Config.log_file` when set, giving the
// console+file sink pair a daemon needs. Built via `env_logger::Builder`
// directly (rather than `env_logger::init()`) so the tee writer can be
// installed as the target.

use crate::config::Config;
use std::fs::OpenOptions;
use std::io::Write;

struct TeeWriter {
    file: std::fs::File,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        std::io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()?;
        self.file.flush()
    }
}

pub fn init(config: &Config) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(
        config
            .log_level
            .parse()
            .unwrap_or(log::LevelFilter::Info),
    );

    match &config.log_file {
        None => {
            builder.init();
        }
        Some(path) => match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(TeeWriter { file })));
                builder.init();
            }
            Err(err) => {
                builder.init();
                log::warn!("could not open log file {path:?}: {err}, logging to stderr only");
            }
        },
    }
}
