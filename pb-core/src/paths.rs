//! State path scheme: `gpio.<pin>` channels holding `gpio.<pin>.<suffix>` states

use crate::constants::states::NAMESPACE;

/// Channel id for a pin
pub fn channel_id(pin: u32) -> String {
    format!("{}.{}", NAMESPACE, pin)
}

/// State id for a pin and suffix
pub fn state_id(pin: u32, suffix: &str) -> String {
    format!("{}.{}.{}", NAMESPACE, pin, suffix)
}

/// Prefix matching every object of the adapter
pub fn namespace_prefix() -> String {
    format!("{}.", NAMESPACE)
}

/// Split `gpio.<pin>[.<suffix>]` into pin and optional suffix.
///
/// Anything outside the namespace, or with a non-numeric pin, yields `None`.
pub fn parse_path(path: &str) -> Option<(u32, Option<&str>)> {
    let rest = path.strip_prefix(NAMESPACE)?.strip_prefix('.')?;
    let (pin, suffix) = match rest.split_once('.') {
        Some((pin, suffix)) => (pin, Some(suffix)),
        None => (rest, None),
    };
    let pin = pin.parse().ok()?;
    Some((pin, suffix.filter(|s| !s.is_empty())))
}
