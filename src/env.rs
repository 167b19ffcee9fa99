//! Readers for runtime settings passed through environment variables.
//!
//! Sizes accept an optional `k`, `m` or `g` suffix (case insensitive, an
//! additional trailing `b` is ignored), so `RTCORE_MAX_HEAP=512m` reads as
//! `512 * 1024 * 1024`.

fn split_factor(value: &str) -> (&str, usize) {
    let mut value = value.trim();
    if value.len() > 1 && (value.ends_with('b') || value.ends_with('B')) {
        value = &value[..value.len() - 1];
    }

    match value.as_bytes().last() {
        Some(b'g') | Some(b'G') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        Some(b'm') | Some(b'M') => (&value[..value.len() - 1], 1024 * 1024),
        Some(b'k') | Some(b'K') => (&value[..value.len() - 1], 1024),
        _ => (value, 1),
    }
}

pub fn parse_float_and_factor(value: &str) -> Option<(f64, usize)> {
    if value.trim().is_empty() {
        return None;
    }
    let (number, factor) = split_factor(value);
    number.trim().parse::<f64>().ok().map(|x| (x, factor))
}

fn read_float_and_factor_from_env(var: &str) -> Option<(f64, usize)> {
    let value = std::env::var(var).ok()?;
    parse_float_and_factor(&value)
}

pub fn read_uint_from_env(var: &str) -> Option<usize> {
    let (value, factor) = read_float_and_factor_from_env(var)?;
    if value < 0.0 {
        return None;
    }
    Some((value * factor as f64) as usize)
}

pub fn read_float_from_env(var: &str) -> Option<f64> {
    read_float_and_factor_from_env(var).map(|x| x.0)
}

pub fn read_string_from_env(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

pub fn read_bool_from_env(var: &str) -> Option<bool> {
    let value = std::env::var(var).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_suffixes() {
        assert_eq!(parse_float_and_factor("4k"), Some((4.0, 1024)));
        assert_eq!(parse_float_and_factor("512MB"), Some((512.0, 1024 * 1024)));
        assert_eq!(parse_float_and_factor("1g"), Some((1.0, 1024 * 1024 * 1024)));
        assert_eq!(parse_float_and_factor("100"), Some((100.0, 1)));
        assert_eq!(parse_float_and_factor("abc"), None);
        assert_eq!(parse_float_and_factor(""), None);
    }
}
