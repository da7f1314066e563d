use chrono::Local;
use std::io::Write;
use std::sync::Once;

static INIT_LOGGER_ONCE: Once = Once::new();

pub fn init() {
    INIT_LOGGER_ONCE.call_once(|| {
        dotenv::dotenv().ok();

        env_logger::builder()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{} {:<5} {}] {}",
                    Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.module_path().unwrap(),
                    record.args()
                )
            })
            .init();
    })
}

/// Number of 64-bit words covering `num` bits.
pub fn word_count(num: usize) -> usize {
    (num >> 6) + if (num & 0x3f) > 0 { 1 } else { 0 }
}

pub fn word_index(num: usize) -> usize {
    num >> 6
}

pub fn bit_offset(num: usize) -> usize {
    num & 0x3f
}
