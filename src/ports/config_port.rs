//! Configuration access port trait.

use rust_decimal::Decimal;

pub trait ConfigPort {
    fn get_string(&self, section: &str, key: &str) -> Option<String>;
    /// `None` when the key is missing or not an integer.
    fn get_int(&self, section: &str, key: &str) -> Option<i64>;
    /// Parsed from the raw string so money values never pass through `f64`.
    fn get_decimal(&self, section: &str, key: &str) -> Option<Decimal>;
}
