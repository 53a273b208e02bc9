//! Producing the shared base snapshot.
//!
//! Every test run resumes from the same saved machine state: a VM booted once
//! from the pristine base image, snapshotted the moment the kernel signals
//! bootup complete. Tests then skip the boot entirely and start from a warm,
//! identical machine.

use crate::{
    config::{GriddleConfig, INT_SYSCALL, VMSTATE_TAG},
    errors::BootstrapError,
    vm::{Arch, VmSession, VmSessionOptions, WatchdogStatus, create_overlay},
};
use camino::Utf8PathBuf;
use std::{collections::BTreeMap, time::Duration};
use tracing::{debug, info};

/// File name of the base snapshot image within the scratch directory. Per-run
/// copies of this file carry the saved machine state.
pub const SNAPSHOT_IMAGE: &str = "snapshot.qcow2";

/// Boots the base image once, waits for the bootup signal, saves the machine
/// state, and stores the resulting image as the shared base snapshot.
///
/// Returns the path every run copies its overlay from. Failures here are
/// fatal to the whole run; the caller gets the captured console log for
/// display when the boot signal never arrives.
pub async fn create_base_snapshot(
    config: &GriddleConfig,
    arch: Arch,
) -> Result<Utf8PathBuf, BootstrapError> {
    let work_dir = config.scratch_dir.join("bootstrap");
    reset_dir(&work_dir)
        .await
        .map_err(|error| BootstrapError::Workspace {
            path: work_dir.clone(),
            error,
        })?;

    let overlay = work_dir.join(SNAPSHOT_IMAGE);
    create_overlay(&config.base_image, &overlay).await?;

    info!(target: "griddle::runner", image = %config.base_image, "booting base image");

    let options = VmSessionOptions {
        work_dir: work_dir.clone(),
        overlay: overlay.clone(),
        arch,
        load_state: None,
        watchdog_grace: config.watchdog_grace,
        qemu_binary: None,
    };
    let mut session = VmSession::open(options).await?;

    if !session.is_alive() {
        session.close().await;
        return Err(BootstrapError::Died);
    }

    let expected = BTreeMap::from([(arch.return_register().to_owned(), config.bootup_code)]);
    let status = session
        .watchdog_mut()
        .wait_until(INT_SYSCALL, &expected, config.bootup_timeout)
        .await;

    if status != WatchdogStatus::Found {
        session.close().await;
        let log = session.read_console_log().await.unwrap_or_default();
        return Err(BootstrapError::BootSignal {
            status,
            timeout: config.bootup_timeout,
            log,
        });
    }

    // Give the guest a beat to reach its prompt before freezing it there.
    tokio::time::sleep(Duration::from_millis(100)).await;
    session.monitor_command(&format!("savevm {VMSTATE_TAG}")).await;
    session.close().await;

    let snapshot = config.scratch_dir.join(SNAPSHOT_IMAGE);
    tokio::fs::copy(&overlay, &snapshot)
        .await
        .map_err(|error| BootstrapError::StoreImage {
            path: snapshot.clone(),
            error,
        })?;

    debug!(target: "griddle::runner", %snapshot, "base snapshot stored");
    Ok(snapshot)
}

async fn reset_dir(dir: &camino::Utf8Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => return Err(error),
    }
    tokio::fs::create_dir_all(dir).await
}
