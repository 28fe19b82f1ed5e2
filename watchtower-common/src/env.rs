// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::ffi::OsString;

/// Always forwarded to children, even if empty in the parent's environment.
pub const REQUIRED_ENV_VARS: &[&str] = &[
    "PATH",
    "PYTHONPATH",
    "LD_LIBRARY_PATH",
    "LD_PRELOAD",
    "DYLD_LIBRARY_PATH",
    "DYLD_INSERT_LIBRARIES",
];

/// Forwarded only when present in the parent's environment.
pub const OPTIONAL_ENV_VARS: &[&str] = &[
    "PYTHONHASHSEED",
    "KRB5_KTNAME",
    "ORACLE_HOME",
    "VERSIONER_PYTHON_PREFER_32_BIT",
];

/// Builds the whitelisted environment a child should inherit from the
/// current process, before any per-process overrides are layered on top.
pub fn inherited_env() -> BTreeMap<OsString, OsString> {
    let mut env = BTreeMap::new();
    for key in REQUIRED_ENV_VARS {
        env.insert(
            OsString::from(key),
            std::env::var_os(key).unwrap_or_default(),
        );
    }
    for key in OPTIONAL_ENV_VARS {
        if let Some(value) = std::env::var_os(key) {
            env.insert(OsString::from(key), value);
        }
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_vars_are_always_present_even_if_empty() {
        std::env::remove_var("LD_PRELOAD");
        let env = inherited_env();
        assert!(env.contains_key(OsString::from("LD_PRELOAD").as_os_str()));
        assert_eq!(
            env.get(OsString::from("LD_PRELOAD").as_os_str()),
            Some(&OsString::new())
        );
    }

    #[test]
    fn optional_vars_are_absent_when_unset() {
        std::env::remove_var("ORACLE_HOME");
        let env = inherited_env();
        assert!(!env.contains_key(OsString::from("ORACLE_HOME").as_os_str()));
    }

    #[test]
    fn no_other_variables_leak() {
        std::env::set_var("WATCHTOWER_TEST_SHOULD_NOT_LEAK", "1");
        let env = inherited_env();
        assert!(!env.contains_key(OsString::from("WATCHTOWER_TEST_SHOULD_NOT_LEAK").as_os_str()));
        std::env::remove_var("WATCHTOWER_TEST_SHOULD_NOT_LEAK");
    }
}
