use std::{io, path::Path};

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::AsyncWriteExt;

/// Loads a JSON record store, treating a missing file as empty.
pub async fn load_json<T: DeserializeOwned + Default>(path: &Path) -> io::Result<T> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.iter().all(|b| b.is_ascii_whitespace()) => Ok(T::default()),
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("parse {}: {e}", path.display()),
            )
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e),
    }
}

/// Rewrites the whole store.
pub async fn save_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let data = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    write_atomic(path, &data).await
}

/// Writes through `<path>.tmp` + rename so a crash mid-write leaves the
/// previous version in place.
pub async fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp_name);

    let mut f = tokio::fs::File::create(&tmp).await?;
    f.write_all(data).await?;
    f.flush().await?;
    f.sync_all().await.ok();
    drop(f);
    tokio::fs::rename(&tmp, path).await
}
