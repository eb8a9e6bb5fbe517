//! File helpers: atomic rename-on-write and random token generation.

use std::path::Path;

use rand::Rng;
use tracing::debug;

/// Write `data` to `path` atomically: write to `{path}.tmp`, set the mode,
/// then rename over the destination. Readers never observe a partial file.
pub async fn write_file_atomic(path: &Path, data: &[u8], mode: u32) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);

    tokio::fs::write(&tmp, data).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(mode)).await?;
    }

    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    debug!(path = %path.display(), bytes = data.len(), "wrote file");
    Ok(())
}

const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Random alphanumeric string, optionally prefixed. Used for the panel
/// identifier, firewall comment tokens and generated passwords.
pub fn random_string(prefix: &str, len: usize) -> String {
    let mut rng = rand::thread_rng();
    let mut out = String::with_capacity(prefix.len() + len);
    out.push_str(prefix);
    for _ in 0..len {
        out.push(CHARSET[rng.gen_range(0..CHARSET.len())] as char);
    }
    out
}
