// SPDX-License-Identifier: Apache-2.0

//! The top-level supervisor's CLI surface: `--config`, repeatable
//! `--option`/`-o key=value` configuration leaf overrides, and `-u`/`-g`
//! user/group selection. The config-file format itself and the general
//! option parser machinery are out of scope; this module only covers the
//! leaf overlay syntax layered on top of an already-resolved
//! [`watchtower_common::ConfigSnapshot`].

use std::path::PathBuf;

use clap::Parser;
use watchtower_common::error::WatchtowerError;
use watchtower_common::ConfigSnapshot;

#[derive(Debug, Parser)]
#[command(name = "watchtower", about = "Process supervisor and connection dispatcher")]
pub struct CliArgs {
    /// Path to the configuration file (parsing is out of scope for this
    /// crate; only the path itself is consumed).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Repeatable `key=value` configuration leaf override.
    #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
    pub option: Vec<String>,

    /// Run as this user (name, resolved via the system user database).
    #[arg(short = 'u')]
    pub user: Option<String>,

    /// Run as this group (name, resolved via the system group database).
    #[arg(short = 'g')]
    pub group: Option<String>,
}

/// One parsed `-o key=value` override, already split but not yet applied.
/// `value` is `None` for the literal `key=None`, meaning "unset".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliOverride {
    pub key: String,
    pub value: Option<String>,
}

/// Parses one raw `-o` argument. Dotted paths (`Foo.Bar=value`) are accepted
/// as configuration leaf names; a path with no `=` at all is rejected as a
/// dict-path override, since this CLI only ever overlays scalar leaves.
pub fn parse_override(raw: &str) -> Result<CliOverride, WatchtowerError> {
    let Some((key, value)) = raw.split_once('=') else {
        return Err(WatchtowerError::ConfigurationError(format!(
            "`-o {raw}` is not a `key=value` override (dict-path overrides are rejected at the CLI)"
        )));
    };
    if key.is_empty() {
        return Err(WatchtowerError::ConfigurationError(format!(
            "`-o {raw}` has an empty key"
        )));
    }
    let value = if value == "None" {
        None
    } else {
        Some(value.to_string())
    };
    Ok(CliOverride {
        key: key.to_string(),
        value,
    })
}

/// Applies every parsed override to `config` in order. Applying the same
/// override twice yields the same result as applying it once, since each
/// key maps to exactly one scalar field in [`ConfigSnapshot`].
pub fn apply_overrides(
    mut config: ConfigSnapshot,
    overrides: &[CliOverride],
) -> Result<ConfigSnapshot, WatchtowerError> {
    for o in overrides {
        let Some(value) = &o.value else {
            return Err(WatchtowerError::ConfigurationError(format!(
                "`{}=None` has no unset target in this configuration shape",
                o.key
            )));
        };
        config = config
            .with_override(&o.key, value)
            .map_err(WatchtowerError::ConfigurationError)?;
    }
    Ok(config)
}

/// Resolves a `-u`/`-g` username or group name to a numeric id.
#[cfg(unix)]
pub fn resolve_user(name: &str) -> Result<u32, WatchtowerError> {
    match nix::unistd::User::from_name(name) {
        Ok(Some(user)) => Ok(user.uid.as_raw()),
        Ok(None) => Err(WatchtowerError::ConfigurationError(format!(
            "no such user `{name}`"
        ))),
        Err(e) => Err(WatchtowerError::ConfigurationError(format!(
            "failed to resolve user `{name}`: {e}"
        ))),
    }
}

#[cfg(unix)]
pub fn resolve_group(name: &str) -> Result<u32, WatchtowerError> {
    match nix::unistd::Group::from_name(name) {
        Ok(Some(group)) => Ok(group.gid.as_raw()),
        Ok(None) => Err(WatchtowerError::ConfigurationError(format!(
            "no such group `{name}`"
        ))),
        Err(e) => Err(WatchtowerError::ConfigurationError(format!(
            "failed to resolve group `{name}`: {e}"
        ))),
    }
}
