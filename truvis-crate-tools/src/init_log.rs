use std::io::Write;

/// 根据字符串解析日志等级，无法识别时退回到 Info
pub fn parse_level(level: &str) -> log::LevelFilter {
    level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("unknown log level `{level}`, fallback to info");
        log::LevelFilter::Info
    })
}

fn build_logger(level: log::LevelFilter) -> env_logger::Builder {
    let mut builder = env_logger::Builder::new();
    builder
        .format(|buf, record| {
            let level_color = match record.level() {
                log::Level::Error => anstyle::AnsiColor::Red,
                log::Level::Warn => anstyle::AnsiColor::Yellow,
                log::Level::Info => anstyle::AnsiColor::Green,
                log::Level::Debug => anstyle::AnsiColor::Blue,
                log::Level::Trace => anstyle::AnsiColor::Magenta,
            };
            let level_style = buf.default_level_style(record.level()).fg_color(Some(anstyle::Color::Ansi(level_color)));
            let grey_style =
                anstyle::Style::new().fg_color(Some(anstyle::Color::Rgb(anstyle::RgbColor(110, 110, 110))));

            // windows 与 unix 的路径分隔符都需要处理
            let file = record.file().unwrap_or("").rsplit(['\\', '/']).next().unwrap_or("");
            let line = record.line().unwrap_or(0);
            let time = chrono::Local::now().format("%H:%M:%S%.3f");

            writeln!(
                buf,
                "{level_style}[{time}] {:<5}{level_style:#} {grey_style}[{}] [{file}:{line}]{grey_style:#} {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .filter(None, level);

    // RUST_LOG 优先级高于配置文件
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }

    builder
}

/// 初始化全局 logger
///
/// 重复调用时只有第一次生效
pub fn init_log(level: log::LevelFilter) {
    if build_logger(level).try_init().is_err() {
        log::debug!("logger already initialized");
    }
}

/// 测试中使用：输出交给 libtest 捕获
pub fn init_test_log() {
    let _ = build_logger(log::LevelFilter::Debug).is_test(true).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), log::LevelFilter::Debug);
        assert_eq!(parse_level("WARN"), log::LevelFilter::Warn);
        assert_eq!(parse_level("nonsense"), log::LevelFilter::Info);
    }

    #[test]
    fn test_init_twice() {
        init_test_log();
        init_test_log();
        log::info!("logger survives double init");
    }
}
