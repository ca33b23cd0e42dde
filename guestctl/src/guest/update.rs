//! Guest Additions update from an installer image.
//!
//! The installer files are taken from the ISO image on the host, copied
//! into an update directory on the guest through an anonymous session and
//! the installer is run there.

use super::iso::IsoImage;
use super::{AdditionsVersion, Guest, GuestOsType, RunLevel};
use crate::fs::file::FileOpenInfo;
use crate::process::{GuestProcess, ProcessStartupInfo, ProcessStatus, ProcessWaitFlags, ProcessWaitResult};
use crate::progress::Progress;
use crate::session::{Session, SessionCredentials};
use bitflags::bitflags;
use guestctl_shared::constants::{properties, timeouts, transfer};
use guestctl_shared::errors::{GuestctlError, GuestctlResult};
use guestctl_shared::flags::{DirectoryCreateFlags, ProcessCreateFlags};
use guestctl_shared::protocol::{FileAccessMode, FileOpenAction};
use std::path::PathBuf;
use std::time::Duration;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AdditionsUpdateFlags: u32 {
        /// Return once the installer runs instead of waiting for it.
        const WAIT_FOR_UPDATE_START_ONLY = 1 << 0;
    }
}

const SESSION_NAME: &str = "Updating Guest Additions";

/// First Additions version that can be updated automatically.
const MIN_UPDATABLE: (u32, u32, u32) = (4, 1, 0);

/// Additions newer than this keep updates below their install directory.
const UPDATE_DIR_MIN: (u32, u32) = (4, 2);
const UPDATE_DIR_MIN_REVISION: u32 = 80329;

const OPERATIONS: &[&str] = &[
    "Checking guest",
    "Reading installer image",
    "Preparing update directory",
    "Copying installer files",
    "Running installer",
];

/// A file taken from the image.
struct InstallerFile {
    iso_path: &'static str,
    guest_name: &'static str,
    optional: bool,
}

const WINDOWS_FILES: &[InstallerFile] = &[
    InstallerFile {
        iso_path: "VBOXWINDOWSADDITIONS.EXE",
        guest_name: "VBoxWindowsAdditions.exe",
        optional: false,
    },
    InstallerFile {
        iso_path: "CERT/VBOXCERTUTIL.EXE",
        guest_name: "VBoxCertUtil.exe",
        optional: true,
    },
    InstallerFile {
        iso_path: "CERT/ORACLE-VBOX.CER",
        guest_name: "oracle-vbox.cer",
        optional: true,
    },
];

const LINUX_FILES: &[InstallerFile] = &[InstallerFile {
    iso_path: "VBOXLINUXADDITIONS.RUN",
    guest_name: "VBoxLinuxAdditions.run",
    optional: false,
}];

fn parse_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Some((major, minor))
}

fn uses_install_dir(version: &AdditionsVersion) -> bool {
    let major_minor = (version.major, version.minor);
    major_minor > UPDATE_DIR_MIN || (major_minor == UPDATE_DIR_MIN && version.revision > UPDATE_DIR_MIN_REVISION)
}

/// Directory the installer files go to, with trailing separator.
fn update_directory(os_type: GuestOsType, version: &AdditionsVersion, install_dir: Option<&str>) -> String {
    let windows = os_type.is_windows();
    match install_dir.map(|d| d.trim_end_matches(['/', '\\'])) {
        Some(dir) if !dir.is_empty() && uses_install_dir(version) => {
            if windows {
                format!("{}\\Update\\", dir)
            } else {
                format!("{}/update/", dir)
            }
        }
        _ if windows => "C:\\Temp\\".to_string(),
        _ => "/tmp/".to_string(),
    }
}

struct UpdateTask {
    guest: Guest,
    progress: Progress,
    source: PathBuf,
    arguments: Vec<String>,
    flags: AdditionsUpdateFlags,
}

impl Guest {
    /// Update the Guest Additions from the installer image at `source`.
    ///
    /// Runs in the background; the returned handle completes when the
    /// installer finished, or started with
    /// [`AdditionsUpdateFlags::WAIT_FOR_UPDATE_START_ONLY`].
    pub fn update_guest_additions(
        &self,
        source: impl Into<PathBuf>,
        arguments: Vec<String>,
        flags: AdditionsUpdateFlags,
    ) -> GuestctlResult<Progress> {
        let source = source.into();
        if source.as_os_str().is_empty() {
            return Err(GuestctlError::InvalidArgument("No installer image specified".into()));
        }

        let progress = Progress::new(
            "Updating Guest Additions",
            OPERATIONS.len() as u32,
            OPERATIONS[0],
        );
        let task = UpdateTask {
            guest: self.clone(),
            progress: progress.clone(),
            source,
            arguments,
            flags,
        };
        progress.run_in_background(task.run());
        Ok(progress)
    }
}

impl UpdateTask {
    fn start_only(&self) -> bool {
        self.flags.contains(AdditionsUpdateFlags::WAIT_FOR_UPDATE_START_ONLY)
    }

    async fn run(self) -> GuestctlResult<()> {
        tracing::info!(source = %self.source.display(), flags = ?self.flags, "Updating Guest Additions");
        let (os_type, version) = self.check_guest()?;

        self.progress.set_next_operation(OPERATIONS[1])?;
        let files = self.read_image(os_type).await?;

        self.progress.set_next_operation(OPERATIONS[2])?;
        let session = self
            .guest
            .create_session(SessionCredentials::new("", ""), SESSION_NAME)?;
        let result = self.update_with_session(&session, os_type, &version, files).await;
        if let Err(e) = session.close().await {
            tracing::debug!(error = %e, "Closing update session failed");
        }

        match &result {
            Ok(()) => tracing::info!("Guest Additions update done"),
            Err(e) => tracing::warn!(error = %e, "Guest Additions update failed"),
        }
        result
    }

    fn check_guest(&self) -> GuestctlResult<(GuestOsType, AdditionsVersion)> {
        let run_level = self.guest.additions_run_level();
        if run_level < RunLevel::Userland {
            return Err(GuestctlError::InvalidState(format!(
                "Guest Additions are not ready for an update (run level {:?})",
                run_level
            )));
        }

        let version = self.guest.additions_version().ok_or_else(|| {
            GuestctlError::Unsupported("Guest Additions version is unknown".into())
        })?;
        if version.triple() < MIN_UPDATABLE {
            return Err(GuestctlError::Unsupported(format!(
                "Guest Additions {} are too old for an automatic update",
                version
            )));
        }

        let os_type = self.guest.os_type();
        match os_type {
            GuestOsType::Windows => {
                let release = self.guest.property(properties::OS_RELEASE).unwrap_or_default();
                match parse_release(&release) {
                    Some(r) if r < (5, 0) => {
                        return Err(GuestctlError::Unsupported(format!(
                            "Windows release {} is not supported",
                            release
                        )));
                    }
                    Some(r) if r < (5, 2) && !self.start_only() => {
                        return Err(GuestctlError::Unsupported(format!(
                            "Windows release {} needs the update to only be started",
                            release
                        )));
                    }
                    Some(_) => {}
                    None => tracing::warn!(release = %release, "Unknown Windows release, trying anyway"),
                }
            }
            GuestOsType::Linux => {}
            other => {
                return Err(GuestctlError::Unsupported(format!(
                    "Updating Guest Additions is not supported on {:?} guests",
                    other
                )));
            }
        }
        Ok((os_type, version))
    }

    /// Installer files present in the image, by guest name.
    async fn read_image(&self, os_type: GuestOsType) -> GuestctlResult<Vec<(&'static str, Vec<u8>)>> {
        let wanted = if os_type.is_windows() {
            WINDOWS_FILES
        } else {
            LINUX_FILES
        };
        let source = self.source.clone();

        tokio::task::spawn_blocking(move || {
            let mut image = IsoImage::open(&source)?;
            let mut files = Vec::new();
            for file in wanted {
                match image.lookup(file.iso_path)? {
                    Some(entry) if !entry.is_dir => {
                        files.push((file.guest_name, image.read_file(&entry)?));
                    }
                    _ if file.optional => {
                        tracing::debug!(file = file.iso_path, "Optional installer file not in image");
                    }
                    _ => {
                        return Err(GuestctlError::NotFound(format!(
                            "\"{}\" not found in installer image \"{}\"",
                            file.iso_path,
                            source.display()
                        )));
                    }
                }
            }
            Ok(files)
        })
        .await
        .map_err(|e| GuestctlError::Internal(e.to_string()))?
    }

    async fn update_with_session(
        &self,
        session: &Session,
        os_type: GuestOsType,
        version: &AdditionsVersion,
        files: Vec<(&'static str, Vec<u8>)>,
    ) -> GuestctlResult<()> {
        session.start().await?;

        let install_dir = self.guest.property(properties::ADDITIONS_INSTALL_DIR);
        let dir = update_directory(os_type, version, install_dir.as_deref());
        tracing::debug!(directory = %dir, "Using update directory");
        session
            .directory_create(&dir, 0o755, DirectoryCreateFlags::PARENTS)
            .await?;

        self.progress.set_next_operation(OPERATIONS[3])?;
        let count = files.len();
        let mut copied = Vec::with_capacity(count);
        for (index, (name, data)) in files.into_iter().enumerate() {
            let path = format!("{}{}", dir, name);
            self.write_file(session, &path, &data).await?;
            copied.push(name);
            self.progress.set_progress(((index + 1) * 100 / count.max(1)) as u32)?;
        }

        self.progress.set_next_operation(OPERATIONS[4])?;
        if os_type.is_windows() {
            self.install_windows(session, &dir, &copied).await
        } else {
            self.install_linux(session, &dir).await
        }
    }

    async fn write_file(&self, session: &Session, path: &str, data: &[u8]) -> GuestctlResult<()> {
        tracing::debug!(path, size = data.len(), "Copying installer file to guest");
        let file = session
            .file_open(
                FileOpenInfo::new(path, FileAccessMode::WriteOnly, FileOpenAction::CreateOrReplace)
                    .creation_mode(0o755),
            )
            .await?;

        let timeout = session.options().request_timeout();
        let mut result = Ok(());
        for chunk in data.chunks(transfer::CHUNK_SIZE) {
            match file.write(chunk, timeout).await {
                Ok(n) if n as usize == chunk.len() => {}
                Ok(n) => {
                    result = Err(GuestctlError::InvalidState(format!(
                        "short write to \"{}\" ({} of {} bytes)",
                        path,
                        n,
                        chunk.len()
                    )));
                    break;
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        if let Err(e) = file.close().await {
            tracing::debug!(path, error = %e, "Closing installer file failed");
        }
        result
    }

    async fn install_windows(&self, session: &Session, dir: &str, copied: &[&str]) -> GuestctlResult<()> {
        if copied.contains(&"VBoxCertUtil.exe") && copied.contains(&"oracle-vbox.cer") {
            let certutil = format!("{}VBoxCertUtil.exe", dir);
            let cert = format!("{}oracle-vbox.cer", dir);
            let startup = ProcessStartupInfo::new(&certutil).args([
                "add-trusted-publisher",
                cert.as_str(),
                "--root",
                cert.as_str(),
            ]);
            self.run_on_guest(session, startup, false).await?;
        }

        let installer = format!("{}VBoxWindowsAdditions.exe", dir);
        let startup = ProcessStartupInfo::new(&installer)
            .args(["/S", "/l", "/no_vboxservice_exit", "/post_installstatus"])
            .args(self.arguments.iter().cloned())
            .timeout(Duration::from_millis(timeouts::ADDITIONS_INSTALLER_MS as u64));
        self.run_on_guest(session, startup, self.start_only()).await
    }

    async fn install_linux(&self, session: &Session, dir: &str) -> GuestctlResult<()> {
        let installer = format!("{}VBoxLinuxAdditions.run", dir);
        let startup = ProcessStartupInfo::new("/bin/sh")
            .args([installer.as_str(), "--nox11", "--", "--force"])
            .args(self.arguments.iter().cloned())
            .timeout(Duration::from_millis(timeouts::ADDITIONS_INSTALLER_MS as u64));
        self.run_on_guest(session, startup, self.start_only()).await?;

        if !self.start_only() {
            for check in ["status-kernel", "status-user"] {
                let startup = ProcessStartupInfo::new("/sbin/rcvboxadd").args([check]);
                if let Err(e) = self.run_on_guest(session, startup, false).await {
                    tracing::warn!(check, error = %e, "Guest Additions status check failed");
                }
            }
        }
        Ok(())
    }

    async fn run_on_guest(
        &self,
        session: &Session,
        startup: ProcessStartupInfo,
        start_only: bool,
    ) -> GuestctlResult<()> {
        let executable = startup.executable.clone();
        let mut flags = startup.flags | ProcessCreateFlags::HIDDEN;
        if start_only {
            flags |= ProcessCreateFlags::WAIT_FOR_START_ONLY;
        }
        let timeout = match startup.timeout_ms {
            0 => session.options().request_timeout(),
            ms => Duration::from_millis(ms as u64),
        };

        tracing::debug!(executable = %executable, args = ?startup.arguments, start_only, "Running update file");
        let process = session.process_create(startup.flags(flags))?;
        let result = Self::drive(&process, &executable, start_only, timeout).await;
        session.process_unregister(process.object_id());
        result
    }

    async fn drive(
        process: &GuestProcess,
        executable: &str,
        start_only: bool,
        timeout: Duration,
    ) -> GuestctlResult<()> {
        process.start().await?;
        if start_only {
            return Ok(());
        }
        match process.wait_for(ProcessWaitFlags::TERMINATE, timeout).await? {
            ProcessWaitResult::Terminate => {}
            ProcessWaitResult::Timeout => {
                return Err(GuestctlError::timeout(format_args!("update file \"{}\"", executable)));
            }
            other => tracing::trace!(?other, "Update file wait"),
        }
        match (process.status(), process.exit_code()) {
            (ProcessStatus::TerminatedNormally, Some(0) | None) => Ok(()),
            (status, exit_code) => {
                tracing::warn!(executable, %status, ?exit_code, "Update file failed");
                Err(GuestctlError::InvalidState(format!(
                    "Running update file \"{}\" on guest failed",
                    executable
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_directory() {
        let new = AdditionsVersion {
            major: 4,
            minor: 3,
            build: 0,
            revision: 90000,
        };
        let old = AdditionsVersion {
            major: 4,
            minor: 2,
            build: 0,
            revision: 80000,
        };
        assert_eq!(
            update_directory(GuestOsType::Windows, &new, Some("C:\\Program Files\\Oracle\\VirtualBox Guest Additions\\")),
            "C:\\Program Files\\Oracle\\VirtualBox Guest Additions\\Update\\"
        );
        assert_eq!(
            update_directory(GuestOsType::Linux, &new, Some("/opt/VBoxGuestAdditions")),
            "/opt/VBoxGuestAdditions/update/"
        );
        assert_eq!(update_directory(GuestOsType::Linux, &old, Some("/opt/x")), "/tmp/");
        assert_eq!(update_directory(GuestOsType::Windows, &new, None), "C:\\Temp\\");
    }

    #[test]
    fn test_parse_release() {
        assert_eq!(parse_release("5.1.2600"), Some((5, 1)));
        assert_eq!(parse_release("10"), Some((10, 0)));
        assert_eq!(parse_release(""), None);
    }
}
