use std::path::{Component, Path, PathBuf};

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::fs;

use crate::cli::UploadArgs;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn object_uri(&self, key: &str) -> String;
    async fn put_file(&self, key: &str, local_path: &Path) -> anyhow::Result<()>;
}

/// Object store backed by a directory; keys map to relative paths under it.
#[derive(Debug, Clone)]
pub struct LocalFsObjectStore {
    base_dir: PathBuf,
}

impl LocalFsObjectStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn object_path(&self, key: &str) -> anyhow::Result<PathBuf> {
        let rel = Path::new(key);
        if key.is_empty() || !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            anyhow::bail!("invalid object key: {key:?}");
        }
        Ok(self.base_dir.join(rel))
    }
}

#[async_trait]
impl ObjectStore for LocalFsObjectStore {
    fn object_uri(&self, key: &str) -> String {
        format!("file://{}", self.base_dir.join(key).display())
    }

    async fn put_file(&self, key: &str, local_path: &Path) -> anyhow::Result<()> {
        let dst = self.object_path(key)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create object dir: {}", parent.display()))?;
        }

        // Copied beside the destination, then renamed into place.
        let tmp = dst.with_extension("upload-tmp");
        fs::copy(local_path, &tmp)
            .await
            .with_context(|| format!("copy {} to {}", local_path.display(), tmp.display()))?;
        fs::rename(&tmp, &dst)
            .await
            .with_context(|| format!("rename {} to {}", tmp.display(), dst.display()))?;
        Ok(())
    }
}

/// Joins a relative path onto a key prefix with `/` separators. Surrounding
/// slashes on the prefix are ignored; parent or absolute components are rejected.
pub fn object_key(prefix: &str, rel: &Path) -> anyhow::Result<String> {
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => anyhow::bail!("path cannot be used as an object key: {}", rel.display()),
        }
    }
    if parts.is_empty() {
        anyhow::bail!("empty object key for {}", rel.display());
    }

    let prefix = prefix.trim_matches('/');
    let key = parts.join("/");
    if prefix.is_empty() {
        Ok(key)
    } else {
        Ok(format!("{prefix}/{key}"))
    }
}

/// Every regular file under `root`, sorted.
pub fn list_files(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        for entry in
            std::fs::read_dir(&dir).with_context(|| format!("read dir: {}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_dir() {
                dirs.push(path);
            } else if path.is_file() {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub uploaded: usize,
    pub failed: usize,
}

/// Puts every file under `input` into `store`. A failed file is logged and
/// counted; the rest are still uploaded.
pub async fn upload_dir(
    store: &dyn ObjectStore,
    input: &Path,
    prefix: &str,
) -> anyhow::Result<UploadSummary> {
    let mut summary = UploadSummary::default();
    for path in list_files(input)? {
        let rel = path
            .strip_prefix(input)
            .with_context(|| format!("{} is outside {}", path.display(), input.display()))?;
        let result = match object_key(prefix, rel) {
            Ok(key) => store.put_file(&key, &path).await.map(|()| key),
            Err(err) => Err(err),
        };
        match result {
            Ok(key) => {
                summary.uploaded += 1;
                tracing::info!(uri = %store.object_uri(&key), "uploaded");
            }
            Err(err) => {
                summary.failed += 1;
                tracing::warn!(path = %path.display(), error = %format!("{err:#}"), "upload failed");
            }
        }
    }
    Ok(summary)
}

pub async fn run(args: UploadArgs) -> anyhow::Result<()> {
    let input = PathBuf::from(&args.input);
    if !input.is_dir() {
        anyhow::bail!("input directory not found: {}", input.display());
    }

    let store = LocalFsObjectStore::new(&args.dest);
    let summary = upload_dir(&store, &input, &args.prefix).await?;
    let prefix = if args.prefix.is_empty() {
        "(root)"
    } else {
        args.prefix.as_str()
    };
    tracing::info!(
        uploaded = summary.uploaded,
        failed = summary.failed,
        dest = %args.dest,
        prefix,
        "upload complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn object_key_joins_prefix_and_rejects_escapes() -> anyhow::Result<()> {
        assert_eq!(object_key("", Path::new("forums/a/b.txt"))?, "forums/a/b.txt");
        assert_eq!(object_key("/trustmed/", Path::new("manifest.json"))?, "trustmed/manifest.json");
        assert!(object_key("p", Path::new("../x.txt")).is_err());
        assert!(object_key("p", Path::new("/etc/passwd")).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn local_store_mirrors_the_tree_under_prefix() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let input = temp.path().join("prepared");
        std::fs::create_dir_all(input.join("forums/diabetes"))?;
        std::fs::write(input.join("manifest.json"), "[]")?;
        std::fs::write(input.join("forums/diabetes/t1.txt"), "thread")?;

        let dest = temp.path().join("bucket");
        let store = LocalFsObjectStore::new(&dest);
        let summary = upload_dir(&store, &input, "kb/").await?;

        assert_eq!(summary, UploadSummary { uploaded: 2, failed: 0 });
        assert_eq!(std::fs::read_to_string(dest.join("kb/forums/diabetes/t1.txt"))?, "thread");
        assert!(dest.join("kb/manifest.json").is_file());
        assert!(store.object_uri("kb/manifest.json").starts_with("file://"));
        Ok(())
    }

    struct FlakyStore {
        puts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        fn object_uri(&self, key: &str) -> String {
            format!("mem://{key}")
        }

        async fn put_file(&self, key: &str, _local_path: &Path) -> anyhow::Result<()> {
            if key.ends_with("bad.txt") {
                anyhow::bail!("rejected");
            }
            self.puts.lock().expect("lock puts").push(key.to_owned());
            Ok(())
        }
    }

    #[tokio::test]
    async fn a_failed_file_does_not_stop_the_rest() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        std::fs::write(temp.path().join("a.txt"), "a")?;
        std::fs::write(temp.path().join("bad.txt"), "b")?;
        std::fs::write(temp.path().join("c.txt"), "c")?;

        let store = FlakyStore {
            puts: Mutex::new(Vec::new()),
        };
        let summary = upload_dir(&store, temp.path(), "").await?;

        assert_eq!(summary, UploadSummary { uploaded: 2, failed: 1 });
        assert_eq!(*store.puts.lock().expect("lock puts"), vec!["a.txt", "c.txt"]);
        Ok(())
    }
}
