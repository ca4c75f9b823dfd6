use std::env;
use std::sync::OnceLock;

static DLBRIDGE_SYNC: OnceLock<Option<bool>> = OnceLock::new();
static DLBRIDGE_DEVICE: OnceLock<Option<usize>> = OnceLock::new();

pub(crate) fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

pub(crate) fn parse_index(value: &str) -> Option<usize> {
    value.trim().parse().ok()
}

/// `DLBRIDGE_SYNC`: `Some(true)` forces synchronous execution, `None` when unset.
pub(crate) fn sync_override() -> Option<bool> {
    *DLBRIDGE_SYNC.get_or_init(|| match env::var("DLBRIDGE_SYNC") {
        Ok(value) if !value.trim().is_empty() => Some(parse_bool(&value)),
        _ => None,
    })
}

/// `DLBRIDGE_DEVICE`: default accelerator index.
pub(crate) fn device_override() -> Option<usize> {
    *DLBRIDGE_DEVICE.get_or_init(|| match env::var("DLBRIDGE_DEVICE") {
        Ok(value) => parse_index(&value),
        Err(_) => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        for value in ["1", "true", " YES ", "on"] {
            assert!(parse_bool(value), "{value}");
        }
        for value in ["0", "false", "off", "", "maybe"] {
            assert!(!parse_bool(value), "{value}");
        }
    }

    #[test]
    fn parse_index_trims() {
        assert_eq!(parse_index(" 2 "), Some(2));
        assert_eq!(parse_index("-1"), None);
    }
}
