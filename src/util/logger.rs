use time::macros::format_description;

use crate::config;
use crate::error::BResult;

/// a simple wrapper that sets up logging to STDOUT via fern/log
pub fn setup_logger() -> BResult<()> {
    let levelstr: String = config::get(&["loglevel"])?;
    let level = match levelstr.to_lowercase().as_ref() {
        "off" => log::LevelFilter::Off,
        "error" => log::LevelFilter::Error,
        "warn" => log::LevelFilter::Warn,
        "info" => log::LevelFilter::Info,
        "debug" => log::LevelFilter::Debug,
        "trace" => log::LevelFilter::Trace,
        _ => {
            println!("bibsync: config: bad `loglevel` value (\"{}\"), defaulting to \"warn\"", levelstr);
            log::LevelFilter::Warn
        }
    };
    let stamp_format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let res = fern::Dispatch::new()
        .format(move |out, message, record| {
            let stamp = time::OffsetDateTime::now_utc()
                .format(stamp_format)
                .unwrap_or_else(|_| String::from("?"));
            out.finish(format_args!("[{}][{}][{}] {}", stamp, record.level(), record.target(), message))
        })
        .level(level)
        .chain(std::io::stdout())
        .apply();
    match res {
        Ok(_) => {}
        // already set up, most likely by a previous init(). fine.
        Err(e) => {
            debug!("logger::setup_logger() -- logger already set: {}", e);
        }
    }
    Ok(())
}
