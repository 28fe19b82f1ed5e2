// SPDX-License-Identifier: Apache-2.0

//! Parses the handful of `-o key=value` overrides that only make sense on
//! a worker (`ProcessType=Slave`) invocation: its `LogID`, the bound
//! addresses it should report, its own PID file path, and (in classic
//! inherited-accept mode) the plain/TLS listener file descriptors it
//! inherited. These are not [`watchtower_common::ConfigSnapshot`] fields --
//! they describe *this one worker's* identity, not shared configuration --
//! so they are resolved directly from the raw override list instead of
//! going through `ConfigSnapshot::with_override`.

use std::path::PathBuf;

use watchtower_orchestrator::cli::CliOverride;

/// Identity and wiring a `Slave`-mode invocation needs that the shared
/// [`watchtower_common::ConfigSnapshot`] has no slot for.
#[derive(Debug, Clone, Default)]
pub struct WorkerArgs {
    pub log_id: Option<u32>,
    pub pid_file: Option<PathBuf>,
    pub bind_addresses: Vec<String>,
    pub inherit_fds: Vec<i32>,
    pub inherit_ssl_fds: Vec<i32>,
}

impl WorkerArgs {
    pub fn from_overrides(overrides: &[CliOverride]) -> anyhow::Result<Self> {
        let mut args = WorkerArgs::default();
        for o in overrides {
            let Some(value) = &o.value else { continue };
            match o.key.as_str() {
                "LogID" => args.log_id = Some(value.parse()?),
                "PIDFile" => args.pid_file = Some(PathBuf::from(value)),
                "BindAddresses" => {
                    args.bind_addresses = value.split(',').map(str::to_string).collect()
                }
                "InheritFDs" => args.inherit_fds = parse_fd_list(value)?,
                "InheritSSLFDs" => args.inherit_ssl_fds = parse_fd_list(value)?,
                _ => {}
            }
        }
        Ok(args)
    }
}

fn parse_fd_list(value: &str) -> anyhow::Result<Vec<i32>> {
    if value.is_empty() {
        return Ok(Vec::new());
    }
    value
        .split(',')
        .map(|fd| fd.parse::<i32>().map_err(anyhow::Error::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use watchtower_orchestrator::cli::parse_override;

    #[test]
    fn extracts_log_id_and_pid_file_and_ignores_unrelated_keys() {
        let overrides = vec![
            parse_override("ProcessType=Slave").unwrap(),
            parse_override("LogID=3").unwrap(),
            parse_override("PIDFile=/var/run/watchtower/caldav-instance-3.pid").unwrap(),
            parse_override("MaxRequests=600").unwrap(),
        ];
        let args = WorkerArgs::from_overrides(&overrides).unwrap();
        assert_eq!(args.log_id, Some(3));
        assert_eq!(
            args.pid_file,
            Some(PathBuf::from("/var/run/watchtower/caldav-instance-3.pid"))
        );
    }

    #[test]
    fn parses_comma_separated_inherited_fd_lists() {
        let overrides = vec![
            parse_override("InheritFDs=4,5,6").unwrap(),
            parse_override("InheritSSLFDs=7").unwrap(),
        ];
        let args = WorkerArgs::from_overrides(&overrides).unwrap();
        assert_eq!(args.inherit_fds, vec![4, 5, 6]);
        assert_eq!(args.inherit_ssl_fds, vec![7]);
    }

    #[test]
    fn bind_addresses_split_on_commas() {
        let overrides = vec![parse_override("BindAddresses=0.0.0.0:8008,0.0.0.0:8443").unwrap()];
        let args = WorkerArgs::from_overrides(&overrides).unwrap();
        assert_eq!(args.bind_addresses, vec!["0.0.0.0:8008", "0.0.0.0:8443"]);
    }
}
