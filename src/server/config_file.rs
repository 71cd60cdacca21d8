//! Server configuration synthesis and error log rotation.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::time::SystemTime;

use super::error::SupervisorError;
use super::layout::ServerLayout;

/// `mysql.err.old` is started over once it grows past this.
pub const MAX_OLD_LOG_SIZE: u64 = 100 * 1024 * 1024;

fn modified(path: &Path) -> SystemTime {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

fn write_config(layout: &ServerLayout, global: &Path) -> io::Result<()> {
    let mut content = fs::read(global)?;

    if let Some(local) = layout.local_config.as_deref().filter(|p| p.is_file()) {
        tracing::debug!("Updating mysql configuration with {}", local.display());
        content.push(b'\n');
        content.extend(fs::read(local)?);
    }

    let mut file = File::create(&layout.actual_config)?;
    file.write_all(&content)?;
    file.sync_all()
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = fs::metadata(path)?.permissions();
    let mode = perms.mode() & 0o7777;
    let allowed = mode & 0o664;

    if mode != allowed {
        perms.set_mode(allowed);
        fs::set_permissions(path, perms)?;
        tracing::debug!("Fixed permissions of mysql configuration file");
    }
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Regenerate `mysql.conf` from the templates when either is newer.
pub fn synthesize_config(layout: &ServerLayout) -> Result<(), SupervisorError> {
    let Some(global) = layout.global_config.as_deref().filter(|p| p.is_file()) else {
        tracing::error!("Cannot find MySQL server default configuration (mysql-global.conf)");
        return Err(SupervisorError::configuration(
            "Cannot find MySQL server default configuration (mysql-global.conf)",
        ));
    };

    let actual_time = modified(&layout.actual_config);
    let global_newer = modified(global) > actual_time;
    let local_newer = layout
        .local_config
        .as_deref()
        .is_some_and(|local| modified(local) > actual_time);

    if global_newer || local_newer {
        tracing::info!(
            "The mysql configuration is outdated, updating {}",
            layout.actual_config.display()
        );

        if let Err(e) = write_config(layout, global) {
            tracing::error!("Unable to create MySQL server configuration file: {}", e);
            return Err(SupervisorError::configuration(format!(
                "Unable to create MySQL server configuration file. Either the default \
                 configuration file {} was not readable or the target file {} could not \
                 be written: {}",
                global.display(),
                layout.actual_config.display(),
                e
            )));
        }
    } else {
        tracing::debug!(
            "The mysql configuration was already up to date: {}",
            layout.actual_config.display()
        );
    }

    restrict_permissions(&layout.actual_config).map_err(|e| {
        SupervisorError::configuration(format!(
            "Cannot set permissions of {}: {}",
            layout.actual_config.display(),
            e
        ))
    })
}

fn append_log(live: &Path, old: &Path) -> io::Result<()> {
    let content = fs::read(live)?;

    let mut old_file = OpenOptions::new().create(true).append(true).open(old)?;
    writeln!(
        old_file,
        "--- rotated {} ---",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    )?;
    old_file.write_all(&content)?;

    fs::remove_file(live)
}

/// Move `mysql.err` onto the end of `mysql.err.old`. Failures are logged only.
pub fn rotate_logs(layout: &ServerLayout) {
    let live = layout.error_log();
    if !live.exists() {
        return;
    }

    let old = layout.old_error_log();
    if fs::metadata(&old).is_ok_and(|m| m.len() > MAX_OLD_LOG_SIZE) {
        if let Err(e) = fs::remove_file(&old) {
            tracing::warn!("Failed to remove {}: {}", old.display(), e);
        }
    }

    if let Err(e) = append_log(&live, &old) {
        tracing::warn!("Failed to rotate MySQL error log {}: {}", live.display(), e);
    }
}
