// SPDX-License-Identifier: Apache-2.0

//! PID file handling. The master's PID file is single-writer (the master
//! writes it once at startup and a SIGHUP re-exec preserves the same pid,
//! so it never needs rewriting); each worker writes its own per-instance
//! file under a distinct name, so this is a many-writer, one-file-per-name
//! scheme at the directory level even though each individual file has
//! exactly one writer.

use std::path::Path;

pub fn write_pid_file(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{}\n", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_the_current_pid_creating_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("caldav.pid");
        write_pid_file(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }
}
