use anyhow::{anyhow, Context, Result};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

pub fn required_env(name: &str) -> Result<String> {
    env::var(name).with_context(|| format!("missing env: {name}"))
}

pub fn socket_addr_from_env(name: &str, default: &str) -> Result<SocketAddr> {
    let value = env::var(name).unwrap_or_else(|_| default.to_string());
    SocketAddr::from_str(&value).map_err(|err| anyhow!("invalid socket addr for {name}: {err}"))
}

/// Reads an optional unsigned integer. Unset yields `None`; a value that does
/// not parse is an error rather than a silent fallback.
pub fn optional_u64_env(name: &str) -> Result<Option<u64>> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|err| anyhow!("invalid integer for {name}: {err}")),
        Err(_) => Ok(None),
    }
}

pub fn optional_bool_env(name: &str) -> Result<Option<bool>> {
    match env::var(name) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            other => Err(anyhow!("invalid boolean for {name}: {other}")),
        },
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EnvGuard {
        key: &'static str,
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            env::remove_var(self.key);
        }
    }

    fn set_env(key: &'static str, value: &str) -> EnvGuard {
        env::set_var(key, value);
        EnvGuard { key }
    }

    #[test]
    fn required_env_reads_value() {
        let _guard = set_env("SF_TEST_REQUIRED_ENV_PRESENT", "value");
        let value = required_env("SF_TEST_REQUIRED_ENV_PRESENT").unwrap();
        assert_eq!(value, "value");
    }

    #[test]
    fn required_env_missing_returns_error() {
        env::remove_var("SF_TEST_REQUIRED_ENV_MISSING");
        assert!(required_env("SF_TEST_REQUIRED_ENV_MISSING").is_err());
    }

    #[test]
    fn socket_addr_from_env_uses_default() {
        env::remove_var("SF_TEST_SOCKET_DEFAULT");
        let addr = socket_addr_from_env("SF_TEST_SOCKET_DEFAULT", "127.0.0.1:1234").unwrap();
        assert_eq!(addr, "127.0.0.1:1234".parse().unwrap());
    }

    #[test]
    fn socket_addr_from_env_invalid_returns_error() {
        let _guard = set_env("SF_TEST_SOCKET_INVALID", "not-a-socket");
        assert!(socket_addr_from_env("SF_TEST_SOCKET_INVALID", "127.0.0.1:1234").is_err());
    }

    #[test]
    fn optional_u64_env_parses_and_rejects() {
        env::remove_var("SF_TEST_U64_UNSET");
        assert_eq!(optional_u64_env("SF_TEST_U64_UNSET").unwrap(), None);

        let _ok = set_env("SF_TEST_U64_OK", " 250 ");
        assert_eq!(optional_u64_env("SF_TEST_U64_OK").unwrap(), Some(250));

        let _bad = set_env("SF_TEST_U64_BAD", "-3");
        assert!(optional_u64_env("SF_TEST_U64_BAD").is_err());
    }

    #[test]
    fn optional_bool_env_accepts_common_spellings() {
        let _on = set_env("SF_TEST_BOOL_ON", "Yes");
        assert_eq!(optional_bool_env("SF_TEST_BOOL_ON").unwrap(), Some(true));

        let _off = set_env("SF_TEST_BOOL_OFF", "0");
        assert_eq!(optional_bool_env("SF_TEST_BOOL_OFF").unwrap(), Some(false));

        let _bad = set_env("SF_TEST_BOOL_BAD", "maybe");
        assert!(optional_bool_env("SF_TEST_BOOL_BAD").is_err());
    }
}
