use std::path::PathBuf;

/// Resolve the service state directory (`FOIL_STATE_DIR`, default `./state`).
pub(crate) fn state_dir() -> PathBuf {
    std::env::var("FOIL_STATE_DIR")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("state"))
}

pub(crate) fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

pub(crate) fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .unwrap_or(default)
}

pub(crate) fn env_bool(key: &str) -> bool {
    std::env::var(key)
        .map(|v| {
            let t = v.trim().to_ascii_lowercase();
            matches!(t.as_str(), "1" | "true" | "yes" | "on")
        })
        .unwrap_or(false)
}

pub(crate) fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_u64_falls_back_on_garbage() {
        std::env::set_var("FOIL_TEST_U64", "not-a-number");
        assert_eq!(env_u64("FOIL_TEST_U64", 7), 7);
        std::env::set_var("FOIL_TEST_U64", "42");
        assert_eq!(env_u64("FOIL_TEST_U64", 7), 42);
        std::env::remove_var("FOIL_TEST_U64");
    }
}
