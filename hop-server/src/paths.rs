use std::path::{Path, PathBuf};

/// Layout of the data directory.
///
/// ```text
/// {data}/hop.sqlite3
/// {data}/secret.key
/// {data}/lego/                  ACME client state
/// {data}/nginx/nginx.conf       live gateway tree
/// {data}/nginx/stream.conf
/// {data}/nginx/conf.d/<id>.conf
/// {data}/nginx/ssl/             installed certificate material
/// {data}/nginx-staging/         candidate trees under test
/// ```
#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn database(&self) -> PathBuf {
        self.root.join("hop.sqlite3")
    }

    pub fn secret_key(&self) -> PathBuf {
        self.root.join("secret.key")
    }

    pub fn lego_dir(&self) -> PathBuf {
        self.root.join("lego")
    }

    pub fn nginx_dir(&self) -> PathBuf {
        self.root.join("nginx")
    }

    pub fn ssl_dir(&self) -> PathBuf {
        self.nginx_dir().join("ssl")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("nginx-staging")
    }

    /// Create every directory the server writes into.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [
            self.root.clone(),
            self.lego_dir(),
            self.nginx_dir(),
            self.nginx_dir().join("conf.d"),
            self.ssl_dir(),
            self.staging_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Replace `path` with `contents` through a temporary sibling and a rename, so
/// readers see either the old file or the new one.
pub fn write_atomic(path: &Path, contents: &[u8], mode: Option<u32>) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{file_name}.tmp-{}", std::process::id()));

    std::fs::write(&tmp, contents)?;
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    std::fs::rename(&tmp, path).inspect_err(|_| {
        let _ = std::fs::remove_file(&tmp);
    })
}

/// If `hop-server` is being run from a path under a `target/` directory, return that
/// `target/` directory path.
pub fn target_dir_from_exe(exe_path: &Path) -> Option<PathBuf> {
    let mut cur = exe_path;
    loop {
        if cur.file_name().is_some_and(|n| n == "target") {
            return Some(cur.to_path_buf());
        }
        cur = cur.parent()?;
    }
}

/// Default data dir for debug builds when running from a source checkout.
///
/// Example: `{repo}/local-dev/hop/data`
pub fn debug_default_data_dir_from_exe(exe_path: &Path) -> Option<PathBuf> {
    let root = target_dir_from_exe(exe_path)?.parent()?.to_path_buf();
    Some(root.join("local-dev").join("hop").join("data"))
}

/// Default socket path for debug builds when running from a source checkout.
///
/// Example: `{repo}/local-dev/hop/hop.sock`
pub fn debug_default_socket_from_exe(exe_path: &Path) -> Option<PathBuf> {
    let root = target_dir_from_exe(exe_path)?.parent()?.to_path_buf();
    Some(root.join("local-dev").join("hop").join("hop.sock"))
}
