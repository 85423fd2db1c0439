//! Writes the serving identity to the paths the webhook server loads at startup

use std::{
    ffi::OsString,
    fs::Permissions,
    os::unix::prelude::PermissionsExt,
    path::{Path, PathBuf},
};

use snafu::{ResultExt, Snafu};
use tokio::{
    fs::{create_dir_all, remove_file, rename, OpenOptions},
    io::AsyncWriteExt,
};
use tracing::info;

pub const DEFAULT_CERTS_DIR: &str = "/etc/webhook/certs";
pub const FILE_PEM_CERT_CERT: &str = "tls.crt";
pub const FILE_PEM_CERT_KEY: &str = "tls.key";

const CERT_MODE: u32 = 0o644;
// Only the serving process may read its private key
const KEY_MODE: u32 = 0o600;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to create certificate directory {}", path.display()))]
    CreateDir {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to create file {}", path.display()))]
    CreateFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to write file {}", path.display()))]
    WriteFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to move staged file into place at {}", path.display()))]
    Rename {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to set permissions for {}", path.display()))]
    SetPermissions {
        source: std::io::Error,
        path: PathBuf,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedIdentity {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Writes `cert_pem` and `key_pem` to `tls.crt` and `tls.key` inside `dir`.
///
/// Both files are staged next to their targets and only then renamed into place, so a failed
/// write leaves the previous pair untouched. Only a failure of the second rename can leave the
/// new key next to the old certificate. Existing files are replaced, so re-running needs no
/// cleanup.
pub async fn publish_identity(
    dir: &Path,
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<PublishedIdentity> {
    create_dir_all(dir)
        .await
        .context(CreateDirSnafu { path: dir })?;
    let identity = PublishedIdentity {
        cert_path: dir.join(FILE_PEM_CERT_CERT),
        key_path: dir.join(FILE_PEM_CERT_KEY),
    };
    let staged_key = staging_path(&identity.key_path);
    let staged_cert = staging_path(&identity.cert_path);
    let staged = match write_file(&staged_key, key_pem, KEY_MODE).await {
        Ok(()) => write_file(&staged_cert, cert_pem, CERT_MODE).await,
        Err(err) => Err(err),
    };
    if let Err(err) = staged {
        for path in [&staged_key, &staged_cert] {
            let _ = remove_file(path).await;
        }
        return Err(err);
    }

    // Never pair a new certificate with a stale key
    rename(&staged_key, &identity.key_path)
        .await
        .context(RenameSnafu {
            path: &identity.key_path,
        })?;
    rename(&staged_cert, &identity.cert_path)
        .await
        .context(RenameSnafu {
            path: &identity.cert_path,
        })?;
    info!(
        cert.path = %identity.cert_path.display(),
        key.path = %identity.key_path.display(),
        "Published webhook serving certificate"
    );
    Ok(identity)
}

/// `<dir>/.<name>.tmp`, on the same filesystem as `path` so that renaming it is atomic.
fn staging_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(path.file_name().unwrap_or_default());
    name.push(".tmp");
    path.with_file_name(name)
}

async fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .await
        .context(CreateFileSnafu { path })?;
    // `mode` only applies to newly created files
    file.set_permissions(Permissions::from_mode(mode))
        .await
        .context(SetPermissionsSnafu { path })?;
    file.write_all(contents)
        .await
        .context(WriteFileSnafu { path })?;
    file.sync_all().await.context(WriteFileSnafu { path })?;
    Ok(())
}
